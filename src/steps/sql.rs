//! SQL against the local PostgreSQL server
//!
//! `check` is a query that returns a row once the statements' effect is in
//! place, e.g. `SELECT 1 FROM pg_roles WHERE rolname = 'registry'`.

use anyhow::{Context, Result};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use hostkit::Postgres;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::{Host, host_error};

const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlSpec {
    #[serde(default)]
    pub database: Option<String>,

    /// OS user `psql` runs as; empty runs as the current user
    #[serde(default = "default_os_user")]
    pub os_user: String,

    pub check: String,

    pub statements: Vec<String>,
}

fn default_os_user() -> String {
    "postgres".to_string()
}

impl SqlSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.check.trim().is_empty() {
            return Err("check query is empty".to_string());
        }
        if self.statements.iter().all(|s| s.trim().is_empty()) {
            return Err("no statements".to_string());
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct SqlStep {
    header: StepHeader,
    spec: SqlSpec,
    host: Arc<Host>,
}

impl SqlStep {
    pub fn new(header: StepHeader, spec: SqlSpec, host: Arc<Host>) -> Self {
        Self { header, spec, host }
    }

    fn postgres(&self, timeout: Duration) -> Postgres<'_> {
        let os_user = Some(self.spec.os_user.as_str()).filter(|u| !u.is_empty());
        Postgres::new(self.host.runner.as_ref())
            .os_user(os_user)
            .database(self.spec.database.as_deref())
            .timeout(Some(timeout))
    }

    /// Statements joined into one script, each terminated
    fn script(&self) -> Result<String> {
        let statements = self.host.templates.render_all(&self.spec.statements)?;
        Ok(statements
            .iter()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| if s.ends_with(';') { format!("{}\n", s) } else { format!("{};\n", s) })
            .collect())
    }
}

impl Step for SqlStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "sql"
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::builder(self.kind())
            .json("params", &self.spec)?
            .field("check", &self.host.templates.render(&self.spec.check)?)
            .field("script", &self.script()?)
            .finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        let check = self.host.templates.render(&self.spec.check)?;
        let found = self.postgres(PROBE_TIMEOUT).exists(&check).map_err(host_error)?;
        Ok(ProbeOutcome::from_bool(found))
    }

    fn apply(&self, ctx: &ApplyContext) -> Result<()> {
        if matches!(self.probe(), Ok(ProbeOutcome::Satisfied)) {
            log::info!("{}: check query already returns a row", self.header.name);
            return Ok(());
        }
        self.postgres(ctx.remaining())
            .execute(&self.script()?)
            .map_err(host_error)
            .with_context(|| format!("SQL of '{}' failed", self.header.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing;
    use hostkit::{CommandOutput, ScriptedRunner};
    use keystore::Generator;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn step(runner: &Arc<ScriptedRunner>, dir: &TempDir) -> SqlStep {
        let vars = BTreeMap::from([("db_user".to_string(), "registry".to_string())]);
        let host = testing::host_with_vars(runner, dir.path(), vars);
        host.secrets
            .get_or_create("db_password", &Generator::Password { length: 24 })
            .unwrap();
        SqlStep::new(
            StepHeader::new("db-user"),
            SqlSpec {
                database: None,
                os_user: default_os_user(),
                check: "SELECT 1 FROM pg_roles WHERE rolname = '{{ db_user }}'".to_string(),
                statements: vec![
                    "CREATE ROLE {{ db_user }} LOGIN PASSWORD '{{ secret.db_password }}'".to_string(),
                    "GRANT pg_read_all_data TO {{ db_user }};".to_string(),
                ],
            },
            host,
        )
    }

    #[test]
    fn test_probe_uses_check_query() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let step = step(&runner, &dir);
        assert_eq!(step.probe().unwrap(), ProbeOutcome::Unsatisfied);

        runner.respond("runuser -u postgres -- psql", CommandOutput::ok("1\n"));
        assert_eq!(step.probe().unwrap(), ProbeOutcome::Satisfied);

        let spec = &runner.specs()[0];
        assert_eq!(
            spec.stdin.as_deref(),
            Some("SELECT 1 FROM pg_roles WHERE rolname = 'registry'".as_bytes())
        );
    }

    #[test]
    fn test_apply_keeps_password_off_argv() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let step = step(&runner, &dir);
        step.apply(&testing::ctx("db-user")).unwrap();

        let password = step.host.secrets.get("db_password").unwrap().unwrap().value;
        let specs = runner.specs();
        let spec = specs.last().unwrap();
        assert!(!spec.display().contains(&password));
        let script = String::from_utf8(spec.stdin.clone().unwrap()).unwrap();
        assert!(script.contains(&format!("PASSWORD '{}';\n", password)));
        assert!(script.ends_with("GRANT pg_read_all_data TO registry;\n"));
    }

    #[test]
    fn test_apply_is_noop_when_check_passes() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on("runuser -u postgres -- psql", CommandOutput::ok("1\n")));
        step(&runner, &dir).apply(&testing::ctx("db-user")).unwrap();
        assert_eq!(runner.specs().len(), 1);
    }

    #[test]
    fn test_failure_carries_psql_exit_code() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new().on(
            "runuser",
            CommandOutput::failed(3, "ERROR:  role \"registry\" already exists"),
        ));
        let err = step(&runner, &dir).apply(&testing::ctx("db-user")).unwrap_err();
        assert_eq!(converge::ApplyError::find(&err).unwrap().exit_code, Some(3));
    }
}
