//! Checkpoint state: the snapshot persisted after every step transition.
//!
//! Persistence format is JSON. Every persisted struct carries a flattened
//! `extra` map so fields written by a newer engine build survive a re-save
//! by an older one.

use super::{StepStatus, TransactionLog};
use crate::models::{
    DeviceIdentity, FactTable, FailureCause, MigrationPlan, PhaseLayout, PlanOutcome,
    ResumeCondition,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

pub(crate) fn default_schema_version() -> u32 {
    CHECKPOINT_SCHEMA_VERSION
}

/// Where the engine is in a plan's lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ExecutionMode {
    Forward,
    /// Unwinding a phase; a resume continues the unwind
    RollingBack {
        phase_index: usize,
        cause: FailureCause,
    },
    /// Finished unsuccessfully; kept for inspection
    Terminal {
        outcome: PlanOutcome,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cause: Option<FailureCause>,
    },
}

/// Set after a restart-requiring step completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Suspension {
    pub step_id: String,
    pub condition: ResumeCondition,
    pub at: DateTime<Utc>,
}

/// Durable snapshot of plan progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub plan_id: String,
    #[serde(default)]
    pub device: DeviceIdentity,
    pub plan_created_at: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Incremented on every save
    #[serde(default)]
    pub revision: u64,
    /// Phase the pointer is in
    pub phase_index: usize,
    /// Next step to run within the phase; equal to the phase's step count
    /// once all steps completed and only the gate remains
    pub step_index: usize,
    pub mode: ExecutionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended: Option<Suspension>,
    #[serde(default)]
    pub layout: Vec<PhaseLayout>,
    /// Steps completed by an earlier successful run of the same plan id
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub carried_over: Vec<String>,
    #[serde(default)]
    pub facts: FactTable,
    #[serde(default)]
    pub log: TransactionLog,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Checkpoint {
    /// Fresh checkpoint at phase 0 / step 0.
    pub fn new(plan: &MigrationPlan) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            plan_id: plan.id.clone(),
            device: plan.device.clone(),
            plan_created_at: plan.created_at,
            started_at: now,
            updated_at: now,
            revision: 0,
            phase_index: 0,
            step_index: 0,
            mode: ExecutionMode::Forward,
            suspended: None,
            layout: plan.layout(),
            carried_over: Vec::new(),
            facts: FactTable::new(),
            log: TransactionLog::default(),
            extra: BTreeMap::new(),
        }
    }

    /// Fresh checkpoint seeded from an earlier successful run.
    pub fn from_receipt(plan: &MigrationPlan, receipt: &CompletionReceipt) -> Self {
        let mut checkpoint = Self::new(plan);
        let known: HashSet<&str> = receipt.completed_steps.iter().map(String::as_str).collect();
        checkpoint.carried_over = plan
            .layout()
            .into_iter()
            .flat_map(|p| p.steps)
            .filter(|s| known.contains(s.as_str()))
            .collect();
        checkpoint.facts = receipt.facts.clone();
        checkpoint
    }

    /// Bump revision and timestamp before a save.
    pub fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    /// Move the pointer to the next step of the current phase.
    pub fn advance_step(&mut self) {
        self.step_index += 1;
    }

    /// Move the pointer to the first step of the next phase.
    pub fn advance_phase(&mut self) {
        self.phase_index += 1;
        self.step_index = 0;
    }

    pub fn is_carried_over(&self, step_id: &str) -> bool {
        self.carried_over.iter().any(|s| s == step_id)
    }

    /// Steps whose current status is `Completed`, plus carried-over steps.
    pub fn completed_steps(&self) -> Vec<String> {
        self.layout
            .iter()
            .flat_map(|p| p.steps.iter())
            .filter(|s| {
                self.is_carried_over(s) || self.log.status_of(s) == StepStatus::Completed
            })
            .cloned()
            .collect()
    }

    pub fn progress_percent(&self) -> f64 {
        let total: usize = self.layout.iter().map(|p| p.steps.len()).sum();
        if total == 0 {
            return 100.0;
        }
        (self.completed_steps().len() as f64 / total as f64) * 100.0
    }

    pub fn current_phase_name(&self) -> Option<&str> {
        self.layout.get(self.phase_index).map(|p| p.name.as_str())
    }

    /// Step at the pointer, if the pointer is on a step.
    pub fn current_step_id(&self) -> Option<&str> {
        self.layout
            .get(self.phase_index)
            .and_then(|p| p.steps.get(self.step_index))
            .map(String::as_str)
    }

    /// Count of steps per current status, for status displays.
    pub fn summary(&self) -> BTreeMap<StepStatus, usize> {
        let mut counts = BTreeMap::new();
        for step in self.layout.iter().flat_map(|p| p.steps.iter()) {
            let status = if self.is_carried_over(step) {
                StepStatus::Completed
            } else {
                self.log.status_of(step)
            };
            *counts.entry(status).or_insert(0) += 1;
        }
        counts
    }
}

/// Left behind when a plan succeeds and its checkpoint is cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionReceipt {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub plan_id: String,
    #[serde(default)]
    pub device: DeviceIdentity,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub completed_steps: Vec<String>,
    #[serde(default)]
    pub facts: FactTable,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl CompletionReceipt {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            plan_id: checkpoint.plan_id.clone(),
            device: checkpoint.device.clone(),
            started_at: checkpoint.started_at,
            completed_at: Utc::now(),
            completed_steps: checkpoint.completed_steps(),
            facts: checkpoint.facts.clone(),
            extra: BTreeMap::new(),
        }
    }
}
