//! Credential providers.
//!
//! Step actions ask for secrets by name, synchronously, at the moment they
//! need them. Storage and encryption of those secrets belong to whatever
//! backs the provider.

use crate::models::CredentialError;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;

/// Supplies secrets to step actions on demand.
pub trait CredentialProvider: Send + Sync {
    fn get_credential(&self, name: &str) -> Result<SecretString, CredentialError>;
}

/// Reads credential `name` from the environment variable `<prefix><NAME>`,
/// where `NAME` is upper-cased with non-alphanumerics replaced by `_`.
#[derive(Debug, Clone)]
pub struct EnvCredentialProvider {
    prefix: String,
}

impl EnvCredentialProvider {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn var_name(&self, name: &str) -> String {
        let suffix: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}{}", self.prefix, suffix)
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn get_credential(&self, name: &str) -> Result<SecretString, CredentialError> {
        let var = self.var_name(name);
        match std::env::var(&var) {
            Ok(value) if !value.is_empty() => Ok(SecretString::from(value)),
            Ok(_) | Err(std::env::VarError::NotPresent) => {
                Err(CredentialError::NotFound(name.to_string()))
            }
            Err(std::env::VarError::NotUnicode(_)) => Err(CredentialError::Unavailable {
                name: name.to_string(),
                reason: format!("{var} is not valid unicode"),
            }),
        }
    }
}

/// Fixed set of secrets, for tests and embedding.
#[derive(Default)]
pub struct StaticCredentialProvider {
    secrets: HashMap<String, SecretString>,
}

impl StaticCredentialProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets
            .insert(name.into(), SecretString::from(value.into()));
        self
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn get_credential(&self, name: &str) -> Result<SecretString, CredentialError> {
        self.secrets
            .get(name)
            .map(|s| SecretString::from(s.expose_secret().to_owned()))
            .ok_or_else(|| CredentialError::NotFound(name.to_string()))
    }
}

/// Provider with no secrets at all.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn get_credential(&self, name: &str) -> Result<SecretString, CredentialError> {
        Err(CredentialError::NotFound(name.to_string()))
    }
}
