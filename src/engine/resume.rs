//! Resumption triggers: how the engine gets re-invoked after a restart.
//!
//! Registering the OS-level deferred action itself (a scheduled task, a
//! systemd unit, a run-once key) is left to whatever consumes the trigger.

use crate::models::{ResumeCondition, TriggerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Registers and removes a one-shot "resume this plan" action.
///
/// Both calls must be idempotent: the engine disarms on every terminal
/// outcome whether or not anything was armed.
#[async_trait]
pub trait ResumptionTrigger: Send + Sync {
    async fn arm(&self, plan_id: &str, condition: ResumeCondition) -> Result<(), TriggerError>;

    async fn disarm(&self, plan_id: &str) -> Result<(), TriggerError>;
}

/// Registers nothing. Resumes are started by hand.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTrigger;

#[async_trait]
impl ResumptionTrigger for NoopTrigger {
    async fn arm(&self, plan_id: &str, condition: ResumeCondition) -> Result<(), TriggerError> {
        debug!(plan_id, condition = %condition, "No resumption trigger configured");
        Ok(())
    }

    async fn disarm(&self, _plan_id: &str) -> Result<(), TriggerError> {
        Ok(())
    }
}

/// Contents of a resume marker file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeMarker {
    pub plan_id: String,
    pub condition: ResumeCondition,
    /// argv that resumes the plan
    pub command: Vec<String>,
    pub armed_at: DateTime<Utc>,
}

/// Writes `<dir>/<plan_id>.resume.json` for an OS hook to pick up.
#[derive(Debug, Clone)]
pub struct MarkerFileTrigger {
    dir: PathBuf,
    command: Vec<String>,
}

impl MarkerFileTrigger {
    /// `command` is the argv prefix; the plan id is appended.
    pub fn new(dir: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            dir: dir.into(),
            command,
        }
    }

    pub fn marker_path(&self, plan_id: &str) -> PathBuf {
        self.dir.join(format!("{plan_id}.resume.json"))
    }

    /// Read the marker for a plan, if armed.
    pub async fn load(&self, plan_id: &str) -> Result<Option<ResumeMarker>, TriggerError> {
        read_marker(&self.marker_path(plan_id)).await
    }
}

async fn read_marker(path: &Path) -> Result<Option<ResumeMarker>, TriggerError> {
    match tokio::fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| TriggerError::Serialize(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(TriggerError::io(format!("reading {}", path.display()), e)),
    }
}

#[async_trait]
impl ResumptionTrigger for MarkerFileTrigger {
    async fn arm(&self, plan_id: &str, condition: ResumeCondition) -> Result<(), TriggerError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| TriggerError::io(format!("creating {}", self.dir.display()), e))?;

        let mut command = self.command.clone();
        command.push(plan_id.to_string());
        let marker = ResumeMarker {
            plan_id: plan_id.to_string(),
            condition,
            command,
            armed_at: Utc::now(),
        };
        let json = serde_json::to_vec_pretty(&marker)
            .map_err(|e| TriggerError::Serialize(e.to_string()))?;

        let path = self.marker_path(plan_id);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .map_err(|e| TriggerError::io(format!("writing {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| TriggerError::io(format!("renaming to {}", path.display()), e))?;

        info!(plan_id, condition = %condition, path = %path.display(), "Resume marker written");
        Ok(())
    }

    async fn disarm(&self, plan_id: &str) -> Result<(), TriggerError> {
        let path = self.marker_path(plan_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(plan_id, "Resume marker removed");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(TriggerError::io(format!("removing {}", path.display()), e)),
        }
    }
}

/// Runs configured shell commands to register and remove the action.
///
/// Placeholders: `{plan_id}`, `{condition}`, `{exe}`, `{config}`.
#[derive(Debug, Clone)]
pub struct CommandTrigger {
    arm_command: String,
    disarm_command: String,
    exe: String,
    config: String,
}

impl CommandTrigger {
    pub fn new(
        arm_command: impl Into<String>,
        disarm_command: impl Into<String>,
        exe: impl Into<String>,
        config: impl Into<String>,
    ) -> Self {
        Self {
            arm_command: arm_command.into(),
            disarm_command: disarm_command.into(),
            exe: exe.into(),
            config: config.into(),
        }
    }

    pub fn render(
        &self,
        template: &str,
        plan_id: &str,
        condition: Option<ResumeCondition>,
    ) -> String {
        template
            .replace("{plan_id}", plan_id)
            .replace(
                "{condition}",
                &condition.map(|c| c.to_string()).unwrap_or_default(),
            )
            .replace("{exe}", &self.exe)
            .replace("{config}", &self.config)
    }

    async fn run(&self, command: String) -> Result<(), TriggerError> {
        debug!(command = %command, "Running trigger command");
        let mut cmd = shell(&command);
        cmd.stdin(std::process::Stdio::null()).kill_on_drop(true);
        let output = cmd
            .output()
            .await
            .map_err(|e| TriggerError::io(format!("spawning `{command}`"), e))?;
        if output.status.success() {
            Ok(())
        } else {
            Err(TriggerError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[cfg(windows)]
fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

#[cfg(not(windows))]
fn shell(command: &str) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[async_trait]
impl ResumptionTrigger for CommandTrigger {
    async fn arm(&self, plan_id: &str, condition: ResumeCondition) -> Result<(), TriggerError> {
        self.run(self.render(&self.arm_command, plan_id, Some(condition)))
            .await?;
        info!(plan_id, condition = %condition, "Resumption trigger armed");
        Ok(())
    }

    async fn disarm(&self, plan_id: &str) -> Result<(), TriggerError> {
        self.run(self.render(&self.disarm_command, plan_id, None)).await
    }
}
