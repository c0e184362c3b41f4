//! Migration plan model: phases of steps with their retry, timeout and
//! compensation settings.

use super::PlanError;
use crate::actions::{StepAction, VerificationPredicate};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Identity of the device being migrated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Device name as known to the source provider
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    /// Management provider the device is leaving
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_provider: Option<String>,

    /// Management provider the device is joining
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_provider: Option<String>,
}

impl DeviceIdentity {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

/// When the OS should re-invoke the engine after a restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeCondition {
    /// Once, at the next system start
    OnBoot,
    /// At the next interactive logon
    OnLogon,
}

impl fmt::Display for ResumeCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResumeCondition::OnBoot => write!(f, "on_boot"),
            ResumeCondition::OnLogon => write!(f, "on_logon"),
        }
    }
}

/// Retry policy applied uniformly by the executor.
///
/// A step runs at most `1 + max_retries` times. Delays grow exponentially
/// from `backoff_base`, capped at `backoff_max`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    pub fn backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 || self.backoff_base.is_zero() {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }

    /// Whether another attempt is allowed after `failures` failures.
    pub fn allows_attempt_after(&self, failures: u32) -> bool {
        failures <= self.max_retries
    }
}

/// One side-effecting unit of work.
#[derive(Clone)]
pub struct Step {
    /// Unique within the plan; the idempotency key across resumes
    pub id: String,
    pub description: Option<String>,
    pub action: Arc<dyn StepAction>,
    pub compensate: Option<Arc<dyn StepAction>>,
    /// Safe to re-run from the start if a crash interrupts it
    pub idempotent: bool,
    pub retry: RetryPolicy,
    pub timeout: Duration,
    /// Set when the step's action triggers a restart
    pub restart: Option<ResumeCondition>,
}

impl Step {
    pub fn new(id: impl Into<String>, action: Arc<dyn StepAction>) -> Self {
        Self {
            id: id.into(),
            description: None,
            action,
            compensate: None,
            idempotent: false,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(600),
            restart: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn compensate(mut self, action: Arc<dyn StepAction>) -> Self {
        self.compensate = Some(action);
        self
    }

    pub fn idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn restart(mut self, condition: ResumeCondition) -> Self {
        self.restart = Some(condition);
        self
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("action", &self.action.describe())
            .field("compensate", &self.compensate.as_ref().map(|c| c.describe()))
            .field("idempotent", &self.idempotent)
            .field("retry", &self.retry)
            .field("timeout", &self.timeout)
            .field("restart", &self.restart)
            .finish()
    }
}

/// Named, ordered group of steps with an optional verification gate.
#[derive(Clone)]
pub struct Phase {
    pub name: String,
    pub steps: Vec<Step>,
    pub verification: Option<Arc<dyn VerificationPredicate>>,
    /// Verification failures are reported but do not fail the plan
    pub advisory_only: bool,
    pub verification_timeout: Duration,
}

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            verification: None,
            advisory_only: false,
            verification_timeout: Duration::from_secs(300),
        }
    }

    pub fn step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn verify(mut self, predicate: Arc<dyn VerificationPredicate>) -> Self {
        self.verification = Some(predicate);
        self
    }

    pub fn advisory(mut self, advisory_only: bool) -> Self {
        self.advisory_only = advisory_only;
        self
    }

    pub fn verification_timeout(mut self, timeout: Duration) -> Self {
        self.verification_timeout = timeout;
        self
    }

    pub fn find_step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }
}

impl fmt::Debug for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Phase")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .field("verification", &self.verification.is_some())
            .field("advisory_only", &self.advisory_only)
            .finish()
    }
}

/// Phase names and step ids, persisted in the checkpoint so a resume can
/// detect that the plan changed underneath it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseLayout {
    pub name: String,
    pub steps: Vec<String>,
}

/// Immutable ordered sequence of phases for one device.
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    /// Stable across restarts; also the checkpoint key
    pub id: String,
    pub device: DeviceIdentity,
    pub created_at: DateTime<Utc>,
    pub phases: Vec<Phase>,
}

impl MigrationPlan {
    pub fn new(id: impl Into<String>, device: DeviceIdentity) -> Self {
        Self {
            id: id.into(),
            device,
            created_at: Utc::now(),
            phases: Vec::new(),
        }
    }

    pub fn phase(mut self, phase: Phase) -> Self {
        self.phases.push(phase);
        self
    }

    /// Check structural invariants: valid id, at least one phase, no empty
    /// phases, unique phase names and unique step ids.
    pub fn validate(&self) -> Result<(), PlanError> {
        if !is_valid_plan_id(&self.id) {
            return Err(PlanError::InvalidPlanId(self.id.clone()));
        }
        if self.phases.is_empty() {
            return Err(PlanError::NoPhases);
        }

        let mut phase_names = HashSet::new();
        let mut step_ids = HashSet::new();
        for phase in &self.phases {
            if !phase_names.insert(phase.name.as_str()) {
                return Err(PlanError::DuplicatePhase(phase.name.clone()));
            }
            if phase.steps.is_empty() {
                return Err(PlanError::EmptyPhase(phase.name.clone()));
            }
            for step in &phase.steps {
                if !step_ids.insert(step.id.as_str()) {
                    return Err(PlanError::DuplicateStepId(step.id.clone()));
                }
            }
        }
        Ok(())
    }

    pub fn layout(&self) -> Vec<PhaseLayout> {
        self.phases
            .iter()
            .map(|p| PhaseLayout {
                name: p.name.clone(),
                steps: p.steps.iter().map(|s| s.id.clone()).collect(),
            })
            .collect()
    }

    pub fn total_steps(&self) -> usize {
        self.phases.iter().map(|p| p.steps.len()).sum()
    }

    /// Locate a step by id: (phase index, step).
    pub fn find_step(&self, step_id: &str) -> Option<(usize, &Step)> {
        self.phases.iter().enumerate().find_map(|(i, p)| {
            p.find_step(step_id).map(|s| (i, s))
        })
    }
}

/// Plan ids double as file names in the checkpoint store.
pub fn is_valid_plan_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::action_fn;
    use crate::models::FactTable;

    fn noop() -> Arc<dyn StepAction> {
        action_fn(|_| Ok(FactTable::new()))
    }

    #[test]
    fn test_validate_rejects_duplicate_step_ids_across_phases() {
        let plan = MigrationPlan::new("plan-1", DeviceIdentity::named("LT-1"))
            .phase(Phase::new("leave").step(Step::new("a", noop())))
            .phase(Phase::new("join").step(Step::new("a", noop())));

        assert!(matches!(plan.validate(), Err(PlanError::DuplicateStepId(id)) if id == "a"));
    }

    #[test]
    fn test_validate_rejects_empty_phase_and_bad_id() {
        let plan = MigrationPlan::new("plan-1", DeviceIdentity::default()).phase(Phase::new("empty"));
        assert!(matches!(plan.validate(), Err(PlanError::EmptyPhase(_))));

        let plan = MigrationPlan::new("../etc", DeviceIdentity::default())
            .phase(Phase::new("p").step(Step::new("a", noop())));
        assert!(matches!(plan.validate(), Err(PlanError::InvalidPlanId(_))));
    }

    #[test]
    fn test_layout_and_lookup() {
        let plan = MigrationPlan::new("plan-1", DeviceIdentity::default())
            .phase(Phase::new("leave").step(Step::new("a", noop())).step(Step::new("b", noop())))
            .phase(Phase::new("join").step(Step::new("c", noop())));

        assert_eq!(plan.total_steps(), 3);
        assert_eq!(plan.layout()[1].steps, vec!["c".to_string()]);
        assert_eq!(plan.find_step("c").map(|(i, _)| i), Some(1));
        assert!(plan.find_step("z").is_none());
    }

    #[test]
    fn test_retry_backoff_is_exponential_and_capped() {
        let policy = RetryPolicy::with_retries(5)
            .backoff(Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert!(policy.allows_attempt_after(5));
        assert!(!policy.allows_attempt_after(6));
    }
}
