//! Engine configuration.
//!
//! Everything an operator tunes per fleet lives here: where checkpoints go,
//! default step policy, how resumption is registered with the OS, and where
//! credentials come from. Plan files carry the per-step overrides.

use super::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration for handover.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub store: StoreConfig,

    /// Defaults for steps that do not set their own policy
    #[serde(default)]
    pub defaults: StepDefaults,

    #[serde(default)]
    pub resume: ResumeConfig,

    #[serde(default)]
    pub credentials: CredentialsConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Checkpoint store location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory holding checkpoints, receipts and lock files.
    /// Supports ${ENV_VAR} expansion.
    #[serde(default = "default_store_dir")]
    pub dir: String,
}

fn default_store_dir() -> String {
    ".handover".to_string()
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_dir(&self) -> PathBuf {
        PathBuf::from(expand_env_vars(&self.dir))
    }
}

/// Step defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefaults {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub max_retries: u32,

    /// First retry delay; doubles per failure
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    #[serde(default = "default_verify_timeout_secs")]
    pub verify_timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_backoff_base_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    60_000
}

fn default_verify_timeout_secs() -> u64 {
    300
}

impl Default for StepDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: 0,
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            verify_timeout_secs: default_verify_timeout_secs(),
        }
    }
}

impl StepDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_secs(self.verify_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::with_retries(self.max_retries).backoff(
            Duration::from_millis(self.backoff_base_ms),
            Duration::from_millis(self.backoff_max_ms),
        )
    }
}

/// How the engine registers itself to be re-invoked after a restart.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Nothing is registered; an operator resumes by hand
    None,
    /// A JSON marker file is written for an OS hook to pick up
    #[default]
    Marker,
    /// Configured shell commands register and remove the deferred action
    Command,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResumeConfig {
    #[serde(default)]
    pub kind: TriggerKind,

    /// Marker directory (default: `<store.dir>/resume`)
    #[serde(default)]
    pub marker_dir: Option<String>,

    /// Command registering the deferred action.
    /// Placeholders: {plan_id}, {condition}, {exe}, {config}
    #[serde(default)]
    pub arm_command: Option<String>,

    /// Command removing the deferred action. Placeholders: {plan_id}
    #[serde(default)]
    pub disarm_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Credential `name` is read from env var `<prefix><NAME>`
    #[serde(default = "default_env_prefix")]
    pub env_prefix: String,
}

fn default_env_prefix() -> String {
    "HANDOVER_SECRET_".to_string()
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            env_prefix: default_env_prefix(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Show a progress bar on the terminal
    #[serde(default = "default_true")]
    pub progress_bar: bool,
}

fn default_true() -> bool {
    true
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { progress_bar: true }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        let config: Config = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Like [`Config::from_file`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check cross-field requirements serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.resume.kind == TriggerKind::Command {
            if self.resume.arm_command.is_none() {
                return Err(ConfigError::MissingTriggerCommand("arm_command"));
            }
            if self.resume.disarm_command.is_none() {
                return Err(ConfigError::MissingTriggerCommand("disarm_command"));
            }
        }
        Ok(())
    }

    pub fn marker_dir(&self) -> PathBuf {
        match &self.resume.marker_dir {
            Some(dir) => PathBuf::from(expand_env_vars(dir)),
            None => self.store.resolved_dir().join("resume"),
        }
    }
}

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");

    for cap in re.captures_iter(s) {
        let var_name = &cap[1];
        if let Ok(value) = std::env::var(var_name) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("resume.kind = \"command\" requires resume.{0}")]
    MissingTriggerCommand(&'static str),
}
