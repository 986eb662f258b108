//! `{{ placeholder }}` rendering for manifest strings
//!
//! Placeholders:
//! - `{{ name }}` - manifest variable (after `RIGGER_VAR_<NAME>` overrides)
//! - `{{ secret.NAME }}` - secret value (the private part of a key pair)
//! - `{{ secret.NAME.public }}` - public part of a key pair
//! - `{{ env.NAME }}` - process environment
//!
//! Anything else is an error, so a typo never renders as an empty string.

use keystore::SecretStore;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*([A-Za-z0-9_.\-]+)\s*\}\}").expect("Invalid placeholder pattern")
});

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown placeholder '{{{{ {0} }}}}'")]
    Unknown(String),

    #[error("secret '{0}' has not been generated")]
    MissingSecret(String),

    #[error("secret '{0}' has no public part")]
    NoPublicPart(String),

    #[error("environment variable '{0}' is not set")]
    MissingEnv(String),

    #[error(transparent)]
    Secret(#[from] keystore::Error),
}

/// What a placeholder refers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placeholder<'a> {
    Var(&'a str),
    Secret { name: &'a str, public: bool },
    Env(&'a str),
}

impl<'a> Placeholder<'a> {
    fn parse(token: &'a str) -> Self {
        if let Some(rest) = token.strip_prefix("secret.") {
            return match rest.strip_suffix(".public") {
                Some(name) => Self::Secret { name, public: true },
                None => Self::Secret {
                    name: rest,
                    public: false,
                },
            };
        }
        if let Some(name) = token.strip_prefix("env.") {
            return Self::Env(name);
        }
        Self::Var(token)
    }
}

/// Every placeholder in `input`, in order of appearance
pub fn placeholders(input: &str) -> Vec<Placeholder<'_>> {
    PLACEHOLDER
        .captures_iter(input)
        .filter_map(|c| c.get(1))
        .map(|m| Placeholder::parse(m.as_str()))
        .collect()
}

/// Names of the secrets `input` refers to
pub fn secret_refs(input: &str) -> Vec<&str> {
    placeholders(input)
        .into_iter()
        .filter_map(|p| match p {
            Placeholder::Secret { name, .. } => Some(name),
            _ => None,
        })
        .collect()
}

/// Renders templates against variables, secrets and the environment
pub struct Templates {
    vars: BTreeMap<String, String>,
    secrets: Arc<SecretStore>,
    lenient: bool,
}

impl Templates {
    pub fn new(vars: BTreeMap<String, String>, secrets: Arc<SecretStore>) -> Self {
        Self {
            vars,
            secrets,
            lenient: false,
        }
    }

    /// Render missing secrets as a marker instead of failing
    ///
    /// Dry runs use this: secrets are generated by steps that have not run.
    pub fn lenient(mut self, lenient: bool) -> Self {
        self.lenient = lenient;
        self
    }

    pub fn render(&self, input: &str) -> Result<String, TemplateError> {
        let mut failure = None;
        let rendered = PLACEHOLDER.replace_all(input, |caps: &Captures<'_>| {
            let token = caps.get(1).map_or("", |m| m.as_str());
            match self.resolve(Placeholder::parse(token)) {
                Ok(value) => value,
                Err(e) => {
                    failure.get_or_insert(e);
                    String::new()
                }
            }
        });
        match failure {
            Some(e) => Err(e),
            None => Ok(rendered.into_owned()),
        }
    }

    /// Render every element of a list
    pub fn render_all(&self, inputs: &[String]) -> Result<Vec<String>, TemplateError> {
        inputs.iter().map(|s| self.render(s)).collect()
    }

    /// Check that every variable placeholder in `input` resolves
    ///
    /// Secrets and environment variables are resolved at render time only.
    pub fn check_vars(&self, input: &str) -> Result<(), TemplateError> {
        for placeholder in placeholders(input) {
            if let Placeholder::Var(name) = placeholder
                && !self.vars.contains_key(name)
            {
                return Err(TemplateError::Unknown(name.to_string()));
            }
        }
        Ok(())
    }

    fn resolve(&self, placeholder: Placeholder<'_>) -> Result<String, TemplateError> {
        match placeholder {
            Placeholder::Var(name) => self
                .vars
                .get(name)
                .cloned()
                .ok_or_else(|| TemplateError::Unknown(name.to_string())),
            Placeholder::Env(name) => {
                std::env::var(name).map_err(|_| TemplateError::MissingEnv(name.to_string()))
            }
            Placeholder::Secret { name, public } => {
                let Some(secret) = self.secrets.get(name)? else {
                    if self.lenient {
                        return Ok(format!("<secret {} pending>", name));
                    }
                    return Err(TemplateError::MissingSecret(name.to_string()));
                };
                if public {
                    secret
                        .public
                        .ok_or_else(|| TemplateError::NoPublicPart(name.to_string()))
                } else {
                    Ok(secret.value)
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
