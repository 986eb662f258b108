//! Step manifest: the TOML file that declares a host's provisioning steps
//!
//! ```toml
//! [settings]
//! default_timeout_secs = 3600
//!
//! [vars]
//! db_name = "registry"
//!
//! [[step]]
//! name = "packages"
//! kind = "packages"
//! packages = ["postgresql", "redis-server"]
//!
//! [[step]]
//! name = "db-user"
//! kind = "sql"
//! depends_on = ["packages"]
//! check = "SELECT 1 FROM pg_roles WHERE rolname = '{{ db_name }}'"
//! statements = ["CREATE ROLE {{ db_name }} LOGIN"]
//! on_failure = { retry = { max = 3, backoff_secs = 2 } }
//! ```

use converge::{FailurePolicy, StepHeader};
use hostkit::PackageManager;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::paths;
use crate::steps::alternatives::AlternativesSpec;
use crate::steps::archive::ArchiveSpec;
use crate::steps::command::ExecSpec;
use crate::steps::file::FileSpec;
use crate::steps::http_check::HttpCheckSpec;
use crate::steps::overlay::OverlaySpec;
use crate::steps::packages::PackagesSpec;
use crate::steps::secret::SecretSpec;
use crate::steps::service::ServiceSpec;
use crate::steps::sql::SqlSpec;
use crate::template;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read manifest {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("step '{step}': {message}")]
    Invalid { step: String, message: String },
}

// ============================================================================
// Manifest
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub settings: Settings,

    /// Template variables
    #[serde(default)]
    pub vars: BTreeMap<String, String>,

    #[serde(default, rename = "step")]
    pub steps: Vec<StepDecl>,

    /// Directory relative `source` paths resolve against
    #[serde(skip)]
    pub base_dir: PathBuf,
}

impl Manifest {
    /// Load, apply `RIGGER_VAR_*` overrides and validate
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        let content = fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let manifest = Self::parse(&content, &base_dir).map_err(|e| match e {
            ManifestError::Parse { message, .. } => ManifestError::Parse {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;
        log::debug!(
            "Loaded {} steps from {}",
            manifest.steps.len(),
            path.display()
        );
        Ok(manifest)
    }

    pub fn parse(content: &str, base_dir: &Path) -> Result<Self, ManifestError> {
        Self::parse_with_env(content, base_dir, &paths::process_env)
    }

    /// Parse with `RIGGER_VAR_*` overrides looked up through `env`
    fn parse_with_env(
        content: &str,
        base_dir: &Path,
        env: paths::EnvLookup<'_>,
    ) -> Result<Self, ManifestError> {
        let mut manifest: Self = toml::from_str(content).map_err(|e| ManifestError::Parse {
            path: PathBuf::from("<manifest>"),
            message: e.to_string(),
        })?;
        manifest.base_dir = base_dir.to_path_buf();

        for (name, value) in &mut manifest.vars {
            if let Some(overridden) = paths::var_override(name, env) {
                log::debug!("Variable '{}' overridden from environment", name);
                *value = overridden;
            }
        }

        manifest.validate()?;
        Ok(manifest)
    }

    /// Check everything that can be checked without touching the host
    ///
    /// Graph errors (unknown dependencies, cycles, duplicates) are left to
    /// the planner.
    pub fn validate(&self) -> Result<(), ManifestError> {
        for decl in &self.steps {
            let invalid = |message: String| ManifestError::Invalid {
                step: decl.name.clone(),
                message,
            };

            validate_name(&decl.name).map_err(|m| invalid(m.to_string()))?;
            decl.kind.validate().map_err(invalid)?;
            if let StepKind::Secret(spec) = &decl.kind {
                keystore::validate_name(&spec.secret_name(&decl.name))
                    .map_err(|e| invalid(e.to_string()))?;
            }

            for text in decl.kind.strings() {
                for placeholder in template::placeholders(&text) {
                    if let template::Placeholder::Var(var) = placeholder
                        && !self.vars.contains_key(var)
                    {
                        return Err(invalid(format!("unknown variable '{}'", var)));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn step(&self, name: &str) -> Option<&StepDecl> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.default_timeout_secs)
    }

    /// Engine header for a declared step
    ///
    /// Hard dependencies include the steps generating every secret the step
    /// refers to.
    pub fn header(&self, decl: &StepDecl) -> StepHeader {
        let mut depends_on = decl.depends_on.clone();
        for producer in self.secret_producers_for(decl) {
            if !depends_on.contains(&producer) && !decl.after.contains(&producer) {
                log::debug!("'{}' depends on secret step '{}'", decl.name, producer);
                depends_on.push(producer);
            }
        }

        StepHeader {
            name: decl.name.clone(),
            description: decl.description.clone(),
            depends_on,
            after: decl.after.clone(),
            policy: decl.on_failure.policy(),
            timeout: decl.timeout_secs.map(Duration::from_secs),
        }
    }

    fn secret_producers_for(&self, decl: &StepDecl) -> Vec<String> {
        let producers: HashMap<String, &str> = self
            .steps
            .iter()
            .filter_map(|s| match &s.kind {
                StepKind::Secret(spec) => Some((spec.secret_name(&s.name), s.name.as_str())),
                _ => None,
            })
            .collect();

        let mut names: Vec<String> = Vec::new();
        for text in decl.kind.strings() {
            names.extend(template::secret_refs(&text).into_iter().map(str::to_string));
        }
        if let StepKind::File(spec) = &decl.kind
            && let Some(source) = spec.template_source(&self.base_dir)
        {
            names.extend(template::secret_refs(&source).into_iter().map(str::to_string));
        }
        if let StepKind::Secret(spec) = &decl.kind
            && let Some(from) = spec.generator.source()
        {
            names.push(from.to_string());
        }

        let mut deps = Vec::new();
        for name in names {
            if let Some(&producer) = producers.get(&name)
                && producer != decl.name
                && !deps.iter().any(|d| d == producer)
            {
                deps.push(producer.to_string());
            }
        }
        deps
    }
}

fn validate_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("step name is empty");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        return Err("step names may only contain letters, digits, '-', '_' and '.'");
    }
    Ok(())
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Timeout for steps without their own `timeout_secs`
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    #[serde(default)]
    pub state_dir: Option<String>,

    #[serde(default)]
    pub secrets_dir: Option<String>,

    /// Detected from /etc/os-release when unset
    #[serde(default)]
    pub package_manager: Option<PackageManager>,

    /// Parallel steps per wave; `--jobs` wins
    #[serde(default = "default_jobs")]
    pub jobs: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_timeout_secs(),
            state_dir: None,
            secrets_dir: None,
            package_manager: None,
            jobs: default_jobs(),
        }
    }
}

fn default_timeout_secs() -> u64 {
    60 * 60
}

fn default_jobs() -> usize {
    1
}

// ============================================================================
// Step Declarations
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDecl {
    pub name: String,

    #[serde(default)]
    pub description: Option<String>,

    /// Hard dependencies
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Ordering-only dependencies
    #[serde(default)]
    pub after: Vec<String>,

    #[serde(default)]
    pub on_failure: OnFailure,

    #[serde(default)]
    pub timeout_secs: Option<u64>,

    #[serde(flatten)]
    pub kind: StepKind,
}

/// `on_failure = "abort" | "skip_on_error"` or `{ retry = { max, backoff_secs } }`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OnFailure {
    Named(PolicyName),
    Retry { retry: RetrySpec },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyName {
    Abort,
    #[serde(alias = "skip")]
    SkipOnError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrySpec {
    /// Total attempts, including the first
    pub max: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
}

fn default_backoff_secs() -> u64 {
    1
}

impl Default for OnFailure {
    fn default() -> Self {
        Self::Named(PolicyName::Abort)
    }
}

impl OnFailure {
    pub fn policy(&self) -> FailurePolicy {
        match self {
            Self::Named(PolicyName::Abort) => FailurePolicy::Abort,
            Self::Named(PolicyName::SkipOnError) => FailurePolicy::SkipOnError,
            Self::Retry { retry } => FailurePolicy::RetryThenAbort {
                max: retry.max,
                backoff: Duration::from_secs(retry.backoff_secs),
            },
        }
    }
}

/// What a step does, selected by its `kind` key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Packages(PackagesSpec),
    Service(ServiceSpec),
    File(FileSpec),
    Overlay(OverlaySpec),
    Sql(SqlSpec),
    Command(ExecSpec),
    Secret(SecretSpec),
    Archive(ArchiveSpec),
    HttpCheck(HttpCheckSpec),
    Alternatives(AlternativesSpec),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Packages(_) => "packages",
            Self::Service(_) => "service",
            Self::File(_) => "file",
            Self::Overlay(_) => "overlay",
            Self::Sql(_) => "sql",
            Self::Command(_) => "command",
            Self::Secret(_) => "secret",
            Self::Archive(_) => "archive",
            Self::HttpCheck(_) => "http_check",
            Self::Alternatives(_) => "alternatives",
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            Self::Packages(spec) => spec.validate(),
            Self::Service(spec) => spec.validate(),
            Self::File(spec) => spec.validate(),
            Self::Overlay(spec) => spec.validate(),
            Self::Sql(spec) => spec.validate(),
            Self::Command(spec) => spec.validate(),
            Self::Secret(_) => Ok(()),
            Self::Archive(spec) => spec.validate(),
            Self::HttpCheck(spec) => spec.validate(),
            Self::Alternatives(spec) => spec.validate(),
        }
    }

    /// Every string parameter, for placeholder analysis
    pub fn strings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if let Ok(value) = serde_json::to_value(self) {
            collect_strings(&value, &mut out);
        }
        out
    }
}

fn collect_strings(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => out.push(s.clone()),
        serde_json::Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        serde_json::Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use keystore::Generator;

    const SAMPLE: &str = r#"
[settings]
default_timeout_secs = 600

[vars]
db_name = "registry"
db_user = "registry"

[[step]]
name = "packages"
kind = "packages"
packages = ["postgresql", "redis-server"]

[[step]]
name = "db-password"
kind = "secret"
generator = { type = "password", length = 32 }

[[step]]
name = "db-user"
kind = "sql"
depends_on = ["packages"]
check = "SELECT 1 FROM pg_roles WHERE rolname = '{{ db_user }}'"
statements = ["CREATE ROLE {{ db_user }} LOGIN PASSWORD '{{ secret.db-password }}'"]
on_failure = { retry = { max = 3, backoff_secs = 2 } }

[[step]]
name = "nginx-site"
kind = "file"
path = "/etc/nginx/sites-enabled/registry"
content = "server { listen 80; }"
mode = "0644"
reload = "nginx"
after = ["packages"]
on_failure = "skip_on_error"
timeout_secs = 30
"#;

    fn sample() -> Manifest {
        Manifest::parse(SAMPLE, Path::new("/etc/rigger")).unwrap()
    }

    #[test]
    fn test_parse_sample() {
        let m = sample();
        assert_eq!(m.settings.default_timeout_secs, 600);
        assert_eq!(m.settings.jobs, 1);
        assert_eq!(m.steps.len(), 4);
        assert_eq!(m.steps[0].kind.name(), "packages");
        assert!(matches!(
            &m.steps[1].kind,
            StepKind::Secret(spec) if spec.generator == Generator::Password { length: 32 }
        ));
        assert_eq!(m.base_dir, PathBuf::from("/etc/rigger"));
    }

    #[test]
    fn test_policies() {
        let m = sample();
        assert_eq!(m.steps[0].on_failure.policy(), FailurePolicy::Abort);
        assert_eq!(
            m.steps[2].on_failure.policy(),
            FailurePolicy::RetryThenAbort {
                max: 3,
                backoff: Duration::from_secs(2)
            }
        );
        assert_eq!(m.steps[3].on_failure.policy(), FailurePolicy::SkipOnError);
    }

    #[test]
    fn test_header_adds_secret_producer() {
        let m = sample();
        let header = m.header(m.step("db-user").unwrap());
        assert_eq!(header.depends_on, vec!["packages", "db-password"]);

        let header = m.header(m.step("nginx-site").unwrap());
        assert!(header.depends_on.is_empty());
        assert_eq!(header.after, vec!["packages"]);
        assert_eq!(header.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_key_id_depends_on_source_secret() {
        let m = Manifest::parse(
            r#"
[[step]]
name = "jwt"
kind = "secret"
generator = { type = "rsa_key_pair" }

[[step]]
name = "jwt-kid"
kind = "secret"
generator = { type = "key_id", from = "jwt" }
"#,
            Path::new("."),
        )
        .unwrap();
        assert_eq!(m.header(&m.steps[1]).depends_on, vec!["jwt"]);
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let err = Manifest::parse(
            r#"
[[step]]
name = "bad"
kind = "command"
argv = ["echo", "{{ missing }}"]
"#,
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { ref step, .. } if step == "bad"));
        assert!(err.to_string().contains("unknown variable 'missing'"));
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let err = Manifest::parse(
            r#"
[[step]]
name = "x"
kind = "teleport"
"#,
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
    }

    #[test]
    fn test_invalid_step_name() {
        let err = Manifest::parse(
            r#"
[[step]]
name = "has space"
kind = "command"
argv = ["true"]
"#,
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { .. }));
    }

    #[test]
    fn test_var_override_from_env() {
        let env = |key: &str| (key == "RIGGER_VAR_DB_NAME").then(|| "from-env".to_string());
        let m = Manifest::parse_with_env(
            r#"
[vars]
db_name = "from-file"
db_user = "registry"
"#,
            Path::new("."),
            &env,
        )
        .unwrap();
        assert_eq!(m.vars["db_name"], "from-env");
        assert_eq!(m.vars["db_user"], "registry");
    }

    #[test]
    fn test_secret_name_checked_at_load() {
        let err = Manifest::parse(
            r#"
[[step]]
name = "jwt.key"
kind = "secret"
generator = { type = "random", bytes = 32 }
"#,
            Path::new("."),
        )
        .unwrap_err();
        assert!(matches!(err, ManifestError::Invalid { ref step, .. } if step == "jwt.key"));

        Manifest::parse(
            r#"
[[step]]
name = "jwt.key"
kind = "secret"
secret = "jwt_key"
generator = { type = "random", bytes = 32 }
"#,
            Path::new("."),
        )
        .unwrap();
    }

    #[test]
    fn test_load_missing_file() {
        let err = Manifest::load(Path::new("/nonexistent/rigger/manifest.toml")).unwrap_err();
        assert!(matches!(err, ManifestError::Read { .. }));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("manifest.toml");
        fs::write(&path, SAMPLE).unwrap();
        let m = Manifest::load(&path).unwrap();
        assert_eq!(m.base_dir, dir.path());
    }

    #[test]
    fn test_demo_manifest() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("demos/registry.toml");
        let m = Manifest::load(&path).unwrap();
        assert_eq!(m.settings.package_manager, Some(PackageManager::Apt));

        let config = m.header(m.step("config").unwrap());
        assert!(config.depends_on.contains(&"secret-key".to_string()));
        assert!(config.depends_on.contains(&"db-password".to_string()));

        let key_id = m.header(m.step("service-key-id").unwrap());
        assert_eq!(key_id.depends_on, vec!["service-key"]);
    }
}
