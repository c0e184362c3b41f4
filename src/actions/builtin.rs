//! Built-in action and verification kinds available to plan files.

use super::{expand, expand_facts, StepAction, StepContext, VerificationPredicate};
use crate::models::{FactTable, StepActionError, VerificationResult};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tracing::debug;

/// How a command's stdout becomes facts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureMode {
    /// Output is discarded
    None,
    /// Trimmed stdout stored under one key
    Text(String),
    /// Stdout parsed as a JSON object whose members become facts
    JsonObject,
}

/// Spawns a process. A non-zero exit is a step failure.
///
/// Program, arguments and environment values are expanded with
/// [`expand`] before spawning.
#[derive(Debug, Clone)]
pub struct CommandAction {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub capture: CaptureMode,
}

impl CommandAction {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            capture: CaptureMode::None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn capture(mut self, capture: CaptureMode) -> Self {
        self.capture = capture;
        self
    }
}

#[async_trait]
impl StepAction for CommandAction {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<FactTable, StepActionError> {
        let program = expand(&self.program, ctx)?;
        let mut cmd = tokio::process::Command::new(&program);
        for arg in &self.args {
            cmd.arg(expand(arg, ctx)?);
        }
        for (key, value) in &self.env {
            cmd.env(key, expand(value, ctx)?);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        debug!(step_id = ctx.step_id, program = %program, "Spawning command");
        let output = cmd
            .output()
            .await
            .map_err(|e| StepActionError::io(format!("failed to spawn `{program}`"), e))?;

        if !output.status.success() {
            return Err(StepActionError::failed(format!(
                "`{program}` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        parse_capture(&self.capture, &output.stdout)
    }

    fn describe(&self) -> String {
        format!("command `{}`", self.program)
    }
}

fn parse_capture(mode: &CaptureMode, stdout: &[u8]) -> Result<FactTable, StepActionError> {
    match mode {
        CaptureMode::None => Ok(FactTable::new()),
        CaptureMode::Text(key) => {
            let text = String::from_utf8_lossy(stdout).trim().to_string();
            Ok(FactTable::new().with(key.clone(), text))
        }
        CaptureMode::JsonObject => match serde_json::from_slice::<Value>(stdout) {
            Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
            Ok(other) => Err(StepActionError::failed(format!(
                "expected a JSON object on stdout, got {}",
                json_kind(&other)
            ))),
            Err(e) => Err(StepActionError::failed(format!(
                "stdout is not valid JSON: {e}"
            ))),
        },
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Produces a fixed set of facts.
#[derive(Debug, Clone, Default)]
pub struct SetFactsAction {
    pub facts: FactTable,
}

#[async_trait]
impl StepAction for SetFactsAction {
    async fn execute(&self, _ctx: &StepContext<'_>) -> Result<FactTable, StepActionError> {
        Ok(self.facts.clone())
    }

    fn describe(&self) -> String {
        let keys: Vec<&str> = self.facts.keys().collect();
        format!("set facts [{}]", keys.join(", "))
    }
}

/// Always fails. Useful for rehearsing rollback paths.
#[derive(Debug, Clone)]
pub struct FailAction {
    pub message: String,
}

#[async_trait]
impl StepAction for FailAction {
    async fn execute(&self, _ctx: &StepContext<'_>) -> Result<FactTable, StepActionError> {
        Err(StepActionError::failed(self.message.clone()))
    }

    fn describe(&self) -> String {
        format!("fail ({})", self.message)
    }
}

/// Passes when a fact equals the expected value.
#[derive(Debug, Clone)]
pub struct FactEquals {
    pub key: String,
    pub expected: Value,
}

#[async_trait]
impl VerificationPredicate for FactEquals {
    async fn verify(&self, _phase: &str, facts: &FactTable) -> VerificationResult {
        match facts.get(&self.key) {
            Some(actual) if *actual == self.expected => {
                VerificationResult::passed(format!("{} = {}", self.key, actual))
            }
            Some(actual) => VerificationResult::failed(format!(
                "{} is {}, expected {}",
                self.key, actual, self.expected
            )),
            None => VerificationResult::failed(format!("fact '{}' is missing", self.key)),
        }
    }
}

/// Passes when every listed fact is present.
#[derive(Debug, Clone)]
pub struct FactPresent {
    pub keys: Vec<String>,
}

#[async_trait]
impl VerificationPredicate for FactPresent {
    async fn verify(&self, _phase: &str, facts: &FactTable) -> VerificationResult {
        let missing: Vec<&str> = self
            .keys
            .iter()
            .filter(|k| !facts.contains(k))
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            VerificationResult::passed(format!("{} fact(s) present", self.keys.len()))
        } else {
            VerificationResult::failed(format!("missing facts: {}", missing.join(", ")))
        }
    }
}

/// Passes when the command exits 0. Arguments may reference facts.
#[derive(Debug, Clone)]
pub struct CommandPredicate {
    pub program: String,
    pub args: Vec<String>,
}

#[async_trait]
impl VerificationPredicate for CommandPredicate {
    async fn verify(&self, _phase: &str, facts: &FactTable) -> VerificationResult {
        let program = match expand_facts(&self.program, facts) {
            Ok(p) => p,
            Err(e) => return VerificationResult::failed(e.to_string()),
        };
        let mut cmd = tokio::process::Command::new(&program);
        for arg in &self.args {
            match expand_facts(arg, facts) {
                Ok(a) => {
                    cmd.arg(a);
                }
                Err(e) => return VerificationResult::failed(e.to_string()),
            }
        }
        cmd.stdin(Stdio::null()).kill_on_drop(true);

        match cmd.output().await {
            Ok(output) if output.status.success() => VerificationResult::passed(
                String::from_utf8_lossy(&output.stdout).trim().to_string(),
            ),
            Ok(output) => VerificationResult::failed(format!(
                "`{program}` exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )),
            Err(e) => VerificationResult::failed(format!("failed to spawn `{program}`: {e}")),
        }
    }
}
