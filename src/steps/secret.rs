//! Generate-once secrets

use anyhow::{Context, Result};
use converge::{ApplyContext, Fingerprint, ProbeOutcome, Step, StepHeader};
use keystore::Generator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::Host;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    /// Secret name; defaults to the step name
    #[serde(default)]
    pub secret: Option<String>,

    pub generator: Generator,
}

impl SecretSpec {
    pub fn secret_name(&self, step: &str) -> String {
        self.secret.clone().unwrap_or_else(|| step.to_string())
    }
}

#[derive(Debug)]
pub struct SecretStep {
    header: StepHeader,
    spec: SecretSpec,
    host: Arc<Host>,
}

impl SecretStep {
    pub fn new(header: StepHeader, spec: SecretSpec, host: Arc<Host>) -> Self {
        Self { header, spec, host }
    }

    fn secret_name(&self) -> String {
        self.spec.secret_name(&self.header.name)
    }
}

impl Step for SecretStep {
    fn header(&self) -> &StepHeader {
        &self.header
    }

    fn kind(&self) -> &'static str {
        "secret"
    }

    fn description(&self) -> String {
        self.header
            .description
            .clone()
            .unwrap_or_else(|| format!("Generate secret {}", self.secret_name()))
    }

    fn fingerprint(&self) -> Result<Fingerprint> {
        Ok(Fingerprint::builder(self.kind())
            .field("secret", &self.secret_name())
            .json("generator", &self.spec.generator)?
            .finish())
    }

    fn probe(&self) -> Result<ProbeOutcome> {
        Ok(ProbeOutcome::from_bool(self.host.secrets.exists(&self.secret_name())?))
    }

    fn apply(&self, _ctx: &ApplyContext) -> Result<()> {
        let name = self.secret_name();
        self.host
            .secrets
            .get_or_create(&name, &self.spec.generator)
            .with_context(|| format!("Failed to generate secret '{}'", name))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing;
    use hostkit::ScriptedRunner;
    use keystore::Encoding;
    use tempfile::TempDir;

    #[test]
    fn test_generates_once() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let host = testing::host(&runner, dir.path());
        let step = SecretStep::new(
            StepHeader::new("secret-key"),
            SecretSpec {
                secret: None,
                generator: Generator::Random {
                    bytes: 32,
                    encoding: Encoding::Hex,
                },
            },
            Arc::clone(&host),
        );

        assert_eq!(step.probe().unwrap(), ProbeOutcome::Unsatisfied);
        step.apply(&testing::ctx("secret-key")).unwrap();
        assert_eq!(step.probe().unwrap(), ProbeOutcome::Satisfied);

        let first = host.secrets.get("secret-key").unwrap().unwrap().value;
        step.apply(&testing::ctx("secret-key")).unwrap();
        let second = host.secrets.get("secret-key").unwrap().unwrap().value;
        assert_eq!(first, second);
    }

    #[test]
    fn test_named_secret() {
        let spec = SecretSpec {
            secret: Some("db_password".to_string()),
            generator: Generator::Password { length: 32 },
        };
        assert_eq!(spec.secret_name("db-password-step"), "db_password");
    }
}
