//! Results reported by the engine: plan outcomes, rollback and verification
//! results.

use super::{FactTable, ResumeCondition, VerificationFailure};
use crate::checkpoint::ExecutionRecord;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Outcome of a plan run.
///
/// Everything except `Suspended` is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PlanOutcome {
    Succeeded,
    FailedFullyRolledBack,
    FailedPartiallyRolledBack { manual_steps: Vec<String> },
    FailedResumeAmbiguous { step_id: String },
    /// A restart-requiring step completed; the engine waits to be resumed
    Suspended {
        step_id: String,
        condition: ResumeCondition,
    },
}

impl PlanOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, PlanOutcome::Succeeded)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PlanOutcome::Suspended { .. })
    }

    /// Process exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            PlanOutcome::Succeeded => 0,
            PlanOutcome::FailedFullyRolledBack => 10,
            PlanOutcome::FailedPartiallyRolledBack { .. } => 11,
            PlanOutcome::FailedResumeAmbiguous { .. } => 12,
            PlanOutcome::Suspended { .. } => 20,
        }
    }
}

impl From<RollbackResult> for PlanOutcome {
    fn from(result: RollbackResult) -> Self {
        match result {
            RollbackResult::FullyRolledBack => PlanOutcome::FailedFullyRolledBack,
            RollbackResult::PartiallyRolledBack { manual_steps } => {
                PlanOutcome::FailedPartiallyRolledBack { manual_steps }
            }
        }
    }
}

impl fmt::Display for PlanOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlanOutcome::Succeeded => write!(f, "Succeeded"),
            PlanOutcome::FailedFullyRolledBack => write!(f, "Failed-FullyRolledBack"),
            PlanOutcome::FailedPartiallyRolledBack { manual_steps } => {
                write!(f, "Failed-PartiallyRolledBack([{}])", manual_steps.join(", "))
            }
            PlanOutcome::FailedResumeAmbiguous { step_id } => {
                write!(f, "Failed-ResumeAmbiguous({step_id})")
            }
            PlanOutcome::Suspended { step_id, condition } => {
                write!(f, "Suspended({step_id}, resume {condition})")
            }
        }
    }
}

/// Why a plan failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    StepFailed { step_id: String, error: String },
    VerificationFailed { phase: String, details: String },
    Aborted {
        phase: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        step_id: Option<String>,
    },
}

impl From<VerificationFailure> for FailureCause {
    fn from(failure: VerificationFailure) -> Self {
        FailureCause::VerificationFailed {
            phase: failure.phase,
            details: failure.details,
        }
    }
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::StepFailed { step_id, error } => {
                write!(f, "step '{step_id}' failed: {error}")
            }
            FailureCause::VerificationFailed { phase, details } => {
                write!(f, "verification of phase '{phase}' failed: {details}")
            }
            FailureCause::Aborted { phase, step_id: Some(step) } => {
                write!(f, "aborted during step '{step}' of phase '{phase}'")
            }
            FailureCause::Aborted { phase, step_id: None } => {
                write!(f, "aborted in phase '{phase}'")
            }
        }
    }
}

/// Result of unwinding one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum RollbackResult {
    FullyRolledBack,
    /// Steps whose compensation failed and need manual remediation
    PartiallyRolledBack { manual_steps: Vec<String> },
}

impl RollbackResult {
    pub fn from_manual_steps(manual_steps: Vec<String>) -> Self {
        if manual_steps.is_empty() {
            RollbackResult::FullyRolledBack
        } else {
            RollbackResult::PartiallyRolledBack { manual_steps }
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, RollbackResult::FullyRolledBack)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Passed,
    Failed,
}

/// Output of a verification predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub verdict: Verdict,
    pub details: String,
}

impl VerificationResult {
    pub fn passed(details: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Passed,
            details: details.into(),
        }
    }

    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            verdict: Verdict::Failed,
            details: details.into(),
        }
    }

    pub fn is_passed(&self) -> bool {
        self.verdict == Verdict::Passed
    }
}

/// What a call to the engine produced.
#[derive(Debug, Clone)]
pub struct PlanResult {
    pub plan_id: String,
    pub outcome: PlanOutcome,
    pub cause: Option<FailureCause>,
    /// Facts at the point the engine stopped
    pub facts: FactTable,
    /// Transaction log at the point the engine stopped
    pub records: Vec<ExecutionRecord>,
}

impl PlanResult {
    /// Step ids and statuses in log order, e.g. `["A:completed", ...]`,
    /// skipping the running markers.
    pub fn transitions(&self) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.status != crate::checkpoint::StepStatus::Running)
            .map(|r| format!("{}:{}", r.step_id, r.status))
            .collect()
    }
}
