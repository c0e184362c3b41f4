//! Transaction log: the append-only record of every step transition.
//!
//! The log is the audit trail of a plan run. Rollback appends
//! `RolledBack`/`RollbackFailed` records instead of rewriting history, and the
//! executor derives everything it needs on resume (current status, attempt
//! counts, facts to prune) from it.

use crate::models::{EngineError, Verdict, VerificationResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Status of a step, as recorded in the transaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet attempted (never written; implied by absence)
    Pending,
    Running,
    Completed,
    Failed,
    RolledBack,
    RollbackFailed,
}

impl StepStatus {
    /// Allowed status transitions.
    ///
    /// `Running -> Running` only happens when an idempotent step is re-run
    /// after a crash; `Failed -> Running` is a retry.
    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Failed, Running)
                | (Completed, RolledBack)
                | (Completed, RollbackFailed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Completed => "completed",
            StepStatus::Failed => "failed",
            StepStatus::RolledBack => "rolled_back",
            StepStatus::RollbackFailed => "rollback_failed",
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Position in the log, starting at 1
    pub seq: u64,
    pub step_id: String,
    pub phase_index: usize,
    pub status: StepStatus,
    /// Attempt number this record belongs to, starting at 1
    pub attempt: u32,
    pub at: DateTime<Utc>,
    /// Fact keys the step produced (only on `Completed`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fact_keys: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Engine invocation that wrote the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Outcome of a verification gate, kept in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub phase_index: usize,
    pub phase: String,
    pub verdict: Verdict,
    pub details: String,
    pub advisory: bool,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl VerificationRecord {
    pub fn result(&self) -> VerificationResult {
        VerificationResult {
            verdict: self.verdict,
            details: self.details.clone(),
        }
    }
}

/// Append-only audit trail of a plan run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionLog {
    #[serde(default)]
    pub records: Vec<ExecutionRecord>,
    #[serde(default)]
    pub verifications: Vec<VerificationRecord>,
}

impl TransactionLog {
    /// Latest record for a step.
    pub fn latest(&self, step_id: &str) -> Option<&ExecutionRecord> {
        self.records.iter().rev().find(|r| r.step_id == step_id)
    }

    /// Current status of a step; `Pending` if it never ran.
    pub fn status_of(&self, step_id: &str) -> StepStatus {
        self.latest(step_id)
            .map(|r| r.status)
            .unwrap_or(StepStatus::Pending)
    }

    /// Number of attempts started for a step.
    pub fn attempts_of(&self, step_id: &str) -> u32 {
        self.count(step_id, StepStatus::Running)
    }

    /// Number of failed attempts for a step.
    pub fn failures_of(&self, step_id: &str) -> u32 {
        self.count(step_id, StepStatus::Failed)
    }

    fn count(&self, step_id: &str, status: StepStatus) -> u32 {
        self.records
            .iter()
            .filter(|r| r.step_id == step_id && r.status == status)
            .count() as u32
    }

    /// Append a transition after validating it against the step's current
    /// status. Returns the new record so the caller can attach details.
    pub fn append(
        &mut self,
        step_id: &str,
        phase_index: usize,
        status: StepStatus,
        attempt: u32,
    ) -> Result<&mut ExecutionRecord, EngineError> {
        let current = self.status_of(step_id);
        if !current.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                step_id: step_id.to_string(),
                from: current,
                to: status,
            });
        }

        let seq = self.records.last().map(|r| r.seq + 1).unwrap_or(1);
        self.records.push(ExecutionRecord {
            seq,
            step_id: step_id.to_string(),
            phase_index,
            status,
            attempt,
            at: Utc::now(),
            fact_keys: Vec::new(),
            message: None,
            run_id: None,
            extra: BTreeMap::new(),
        });
        let last = self.records.len() - 1;
        Ok(&mut self.records[last])
    }

    /// Steps of a phase still awaiting compensation, most recently
    /// completed first.
    pub fn completed_in_phase(&self, phase_index: usize) -> Vec<&ExecutionRecord> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .rev()
            .filter(|r| r.phase_index == phase_index && r.status == StepStatus::Completed)
            .filter(|r| seen.insert(r.step_id.as_str()))
            .filter(|r| self.status_of(&r.step_id) == StepStatus::Completed)
            .collect()
    }

    /// Steps of a phase whose compensation already failed.
    pub fn rollback_failed_in_phase(&self, phase_index: usize) -> Vec<String> {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|r| r.phase_index == phase_index && r.status == StepStatus::RollbackFailed)
            .filter(|r| seen.insert(r.step_id.as_str()))
            .map(|r| r.step_id.clone())
            .collect()
    }

    /// Fact keys recorded with the step's latest completion.
    pub fn produced_keys(&self, step_id: &str) -> Vec<String> {
        self.records
            .iter()
            .rev()
            .find(|r| r.step_id == step_id && r.status == StepStatus::Completed)
            .map(|r| r.fact_keys.clone())
            .unwrap_or_default()
    }

    /// Step whose live completion produced a fact key.
    pub fn fact_owner(&self, key: &str) -> Option<&str> {
        self.records
            .iter()
            .rev()
            .filter(|r| r.status == StepStatus::Completed)
            .find(|r| r.fact_keys.iter().any(|k| k == key))
            .map(|r| r.step_id.as_str())
    }

    pub fn verification_for(&self, phase_index: usize) -> Option<&VerificationRecord> {
        self.verifications
            .iter()
            .rev()
            .find(|v| v.phase_index == phase_index)
    }

    pub fn record_verification(
        &mut self,
        phase_index: usize,
        phase: &str,
        result: &VerificationResult,
        advisory: bool,
    ) {
        self.verifications.push(VerificationRecord {
            phase_index,
            phase: phase.to_string(),
            verdict: result.verdict,
            details: result.details.clone(),
            advisory,
            at: Utc::now(),
            extra: BTreeMap::new(),
        });
    }
}
