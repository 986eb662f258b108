//! PostgreSQL access through `psql`.
//!
//! SQL is always fed on stdin so that rendered secrets (role passwords)
//! never show up in the process list or in logs.

use std::time::Duration;

use crate::error::Result;
use crate::runner::{CommandRunner, CommandSpec};

/// A `psql` connection target
pub struct Postgres<'a> {
    runner: &'a dyn CommandRunner,
    /// OS user to run `psql` as (through `runuser`); `None` runs as self
    os_user: Option<String>,
    database: Option<String>,
    timeout: Option<Duration>,
}

impl<'a> Postgres<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        Self {
            runner,
            os_user: Some("postgres".to_string()),
            database: None,
            timeout: None,
        }
    }

    pub fn os_user(mut self, user: Option<&str>) -> Self {
        self.os_user = user.map(str::to_string);
        self
    }

    pub fn database(mut self, database: Option<&str>) -> Self {
        self.database = database.map(str::to_string);
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn psql(&self, sql: &str) -> CommandSpec {
        let base = match &self.os_user {
            Some(user) => CommandSpec::new("runuser").args(["-u", user.as_str(), "--", "psql"]),
            None => CommandSpec::new("psql"),
        };
        let mut spec = base.args(["-X", "-q", "-A", "-t", "-v", "ON_ERROR_STOP=1"]);
        if let Some(db) = &self.database {
            spec = spec.args(["-d", db.as_str()]);
        }
        spec.stdin(sql.as_bytes().to_vec()).timeout(self.timeout)
    }

    /// First column of the first row, or `None` for an empty result
    pub fn query_scalar(&self, sql: &str) -> Result<Option<String>> {
        let output = self.runner.run_checked(&self.psql(sql))?;
        Ok(output
            .stdout
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .map(|l| l.split('|').next().unwrap_or(l).to_string()))
    }

    /// Whether a query returns at least one row
    pub fn exists(&self, sql: &str) -> Result<bool> {
        Ok(self.query_scalar(sql)?.is_some())
    }

    /// Run statements in one session; stops at the first error
    pub fn execute(&self, sql: &str) -> Result<()> {
        self.runner.run_checked(&self.psql(sql))?;
        Ok(())
    }
}
