//! Error types for handover.
//!
//! Taxonomy:
//! - Step level: an action failed, timed out, or was aborted
//! - Phase level: a verification gate rejected a phase, a compensation failed
//! - Engine level: checkpoint store failures (always fatal), ambiguous resumes,
//!   invalid plans and configuration

use crate::checkpoint::StepStatus;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level error type for the engine.
///
/// Only conditions that stop the engine from producing a [`PlanResult`]
/// surface here. Step failures, rejected phases and failed compensations are
/// reported through the result's outcome instead.
///
/// [`PlanResult`]: crate::models::PlanResult
#[derive(Debug, Error)]
pub enum EngineError {
    // ═══════════════════════════════════════════════════════════════════
    // INPUT — the caller handed us something unusable
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error("Plan '{plan_id}' does not match its checkpoint: {reason}")]
    PlanMismatch { plan_id: String, reason: String },

    #[error("An active checkpoint already exists for plan '{0}' (use resume or abandon)")]
    CheckpointExists(String),

    #[error("No checkpoint found for plan '{0}'")]
    NoCheckpoint(String),

    #[error("Step '{step_id}' is {status}, only a running step can be resolved manually")]
    NotResolvable { step_id: String, status: StepStatus },

    // ═══════════════════════════════════════════════════════════════════
    // FATAL — durability can no longer be guaranteed
    // ═══════════════════════════════════════════════════════════════════
    #[error("Checkpoint store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    ResumeAmbiguous(#[from] ResumeAmbiguous),

    // ═══════════════════════════════════════════════════════════════════
    // BUG — an engine invariant was broken
    // ═══════════════════════════════════════════════════════════════════
    #[error("Invalid transition for step '{step_id}': {from} -> {to}")]
    InvalidTransition {
        step_id: String,
        from: StepStatus,
        to: StepStatus,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Failure of a single step action (or of a compensation/predicate run
/// through the same machinery).
#[derive(Debug, Error)]
pub enum StepActionError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("aborted by operator")]
    Aborted,

    #[error("credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("missing fact '{0}'")]
    MissingFact(String),

    #[error("fact '{key}' was already produced by step '{owner}'")]
    FactConflict { key: String, owner: String },

    #[error("resumption trigger: {0}")]
    Trigger(#[from] TriggerError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl StepActionError {
    /// Create a plain failure with a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}

/// A verification gate rejected the output of a phase.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Verification of phase '{phase}' failed: {details}")]
pub struct VerificationFailure {
    pub phase: String,
    pub details: String,
}

/// A compensating action failed during rollback.
#[derive(Debug, Error)]
#[error("Compensation for step '{step_id}' failed: {source}")]
pub struct CompensationError {
    pub step_id: String,
    #[source]
    pub source: StepActionError,
}

/// A non-idempotent step was found running after a crash.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Step '{step_id}' was interrupted mid-flight and is not idempotent; manual intervention required")]
pub struct ResumeAmbiguous {
    pub step_id: String,
}

/// Checkpoint store failures. Always fatal.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{context} ({path}): {source}")]
    Io {
        context: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("Serializing record: {0}")]
    Serialize(String),

    #[error("Plan '{plan_id}' is locked by another engine instance ({holder})")]
    Locked { plan_id: String, holder: String },

    #[error("Invalid plan id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidPlanId(String),
}

impl StoreError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            path: path.into(),
            source,
        }
    }
}

/// Plan definition errors.
#[derive(Debug, Error)]
pub enum PlanError {
    #[error("Plan has no phases")]
    NoPhases,

    #[error("Invalid plan id '{0}': use letters, digits, '.', '_' or '-'")]
    InvalidPlanId(String),

    #[error("Phase '{0}' has no steps")]
    EmptyPhase(String),

    #[error("Duplicate phase name '{0}'")]
    DuplicatePhase(String),

    #[error("Duplicate step id '{0}'")]
    DuplicateStepId(String),

    #[error("Unknown action kind '{0}'")]
    UnknownActionKind(String),

    #[error("Unknown verification kind '{0}'")]
    UnknownVerificationKind(String),

    #[error("Invalid action for '{owner}': {reason}")]
    InvalidAction { owner: String, reason: String },

    #[error("Failed to read plan file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse plan file {path}: {reason}")]
    Parse { path: PathBuf, reason: String },
}

/// Credential lookup failures.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("credential '{0}' not found")]
    NotFound(String),

    #[error("credential '{name}' unavailable: {reason}")]
    Unavailable { name: String, reason: String },
}

/// Resumption trigger failures.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("trigger command `{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("serializing trigger marker: {0}")]
    Serialize(String),
}

impl TriggerError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Notification sink failure. Logged, never propagated.
#[derive(Debug, Error)]
#[error("notification sink: {0}")]
pub struct SinkError(pub String);

/// Result type alias for handover.
pub type Result<T> = std::result::Result<T, EngineError>;
