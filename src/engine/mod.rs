//! Migration workflow engine.
//!
//! ## Flow
//!
//! - **Forward**: steps run in order; a checkpoint is saved after every
//!   transition and before the next action starts
//! - **Gate**: after a phase's last step its verification predicate runs
//!   once and is recorded
//! - **Rollback**: a step out of attempts, a failed gate or an abort unwinds
//!   the current phase's completed steps, newest first
//! - **Resume**: the last saved checkpoint is authoritative; a step found
//!   running was interrupted and is re-run only if idempotent

mod compensation;
mod executor;
mod resume;
mod verification;

pub use resume::*;

use crate::checkpoint::{
    Checkpoint, CheckpointStore, CompletionReceipt, ExecutionMode, PlanArchive, StepStatus,
};
use crate::external::{
    CredentialProvider, NoCredentials, NotificationSink, Notifier, TracingSink,
};
use crate::models::{EngineError, FailureCause, MigrationPlan, PlanOutcome, PlanResult, Result};
use executor::Run;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// What the store knows about a plan id.
#[derive(Debug, Clone)]
pub enum PlanStatus {
    /// In progress, suspended, or failed and kept for inspection
    Active(Box<Checkpoint>),
    Completed(CompletionReceipt),
    Unknown,
}

/// Operator verdict for a step left mid-flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The side effect happened; continue after the step
    Completed,
    /// The side effect did not happen; roll back the phase
    Failed,
}

/// Runs migration plans against a checkpoint store.
///
/// # Example
///
/// ```ignore
/// let engine = Engine::new(Arc::new(FileCheckpointStore::new(dir)?))
///     .with_trigger(Arc::new(MarkerFileTrigger::new(marker_dir, argv)));
///
/// let result = engine.run(&plan).await?;
/// if let PlanOutcome::Suspended { .. } = result.outcome {
///     // after the restart:
///     let result = engine.resume(&plan).await?;
/// }
/// ```
pub struct Engine {
    store: Arc<dyn CheckpointStore>,
    notifier: Notifier,
    credentials: Arc<dyn CredentialProvider>,
    trigger: Arc<dyn ResumptionTrigger>,
    cancel: CancellationToken,
}

impl Engine {
    pub fn new(store: Arc<dyn CheckpointStore>) -> Self {
        Self {
            store,
            notifier: Notifier::new(Arc::new(TracingSink)),
            credentials: Arc::new(NoCredentials),
            trigger: Arc::new(NoopTrigger),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.notifier = Notifier::new(sink);
        self
    }

    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_trigger(mut self, trigger: Arc<dyn ResumptionTrigger>) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that aborts the running plan when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Start `plan` from its first step.
    pub async fn run(&self, plan: &MigrationPlan) -> Result<PlanResult> {
        self.execute(plan, None).await
    }

    /// Continue `plan` from its last checkpoint.
    pub async fn resume(&self, plan: &MigrationPlan) -> Result<PlanResult> {
        self.execute(plan, Some(&plan.id)).await
    }

    /// Start `plan` and keep `source`, the file it was built from, in
    /// `archive`.
    ///
    /// The archive is written only once the run is accepted, under the plan
    /// lock and before the first checkpoint. A refused run leaves the
    /// archived file of an in-flight plan untouched.
    pub async fn run_archived(
        &self,
        plan: &MigrationPlan,
        source: &Path,
        archive: &PlanArchive,
    ) -> Result<PlanResult> {
        self.start(plan, None, Some((source, archive))).await
    }

    /// Run a plan fresh (`resume_from = None`) or continue the checkpoint
    /// stored under `resume_from`, which must be the plan's id.
    pub async fn execute(
        &self,
        plan: &MigrationPlan,
        resume_from: Option<&str>,
    ) -> Result<PlanResult> {
        self.start(plan, resume_from, None).await
    }

    async fn start(
        &self,
        plan: &MigrationPlan,
        resume_from: Option<&str>,
        archive: Option<(&Path, &PlanArchive)>,
    ) -> Result<PlanResult> {
        plan.validate()?;
        if let Some(id) = resume_from {
            if id != plan.id {
                return Err(EngineError::PlanMismatch {
                    plan_id: plan.id.clone(),
                    reason: format!("resume was requested for '{id}'"),
                });
            }
        }

        let _lease = self.store.lock(&plan.id)?;

        let checkpoint = match resume_from {
            None => {
                let checkpoint = self.fresh_checkpoint(plan)?;
                if let Some((source, archive)) = archive {
                    archive.store(&plan.id, source)?;
                }
                checkpoint
            }
            Some(_) => match self.store.load(&plan.id)? {
                Some(checkpoint) => {
                    if checkpoint.layout != plan.layout() {
                        return Err(EngineError::PlanMismatch {
                            plan_id: plan.id.clone(),
                            reason: "phases or steps differ from the checkpoint".to_string(),
                        });
                    }
                    checkpoint
                }
                None => {
                    let receipt = self
                        .store
                        .load_receipt(&plan.id)?
                        .ok_or_else(|| EngineError::NoCheckpoint(plan.id.clone()))?;
                    info!(plan_id = %plan.id, completed_at = %receipt.completed_at, "Plan already completed");
                    return Ok(PlanResult {
                        plan_id: plan.id.clone(),
                        outcome: PlanOutcome::Succeeded,
                        cause: None,
                        facts: receipt.facts,
                        records: Vec::new(),
                    });
                }
            },
        };

        let mut run = Run {
            plan,
            checkpoint,
            store: self.store.as_ref(),
            notifier: &self.notifier,
            credentials: self.credentials.as_ref(),
            trigger: self.trigger.as_ref(),
            cancel: &self.cancel,
            run_id: Uuid::new_v4(),
        };
        info!(
            plan_id = %plan.id,
            run_id = %run.run_id,
            device = %plan.device.name,
            resume = resume_from.is_some(),
            steps = plan.total_steps(),
            "Executing plan"
        );

        if resume_from.is_none() {
            run.save()?;
        } else if let Some(suspension) = run.checkpoint.suspended.take() {
            info!(plan_id = %plan.id, step = %suspension.step_id, "Resuming after restart");
            run.disarm_quietly().await;
            run.save()?;
        }

        let (outcome, cause) = run.drive().await?;
        Ok(PlanResult {
            plan_id: plan.id.clone(),
            outcome,
            cause,
            facts: run.checkpoint.facts,
            records: run.checkpoint.log.records,
        })
    }

    fn fresh_checkpoint(&self, plan: &MigrationPlan) -> Result<Checkpoint> {
        if self.store.load(&plan.id)?.is_some() {
            return Err(EngineError::CheckpointExists(plan.id.clone()));
        }
        match self.store.load_receipt(&plan.id)? {
            Some(receipt) => {
                let checkpoint = Checkpoint::from_receipt(plan, &receipt);
                info!(
                    plan_id = %plan.id,
                    carried_over = checkpoint.carried_over.len(),
                    "Plan completed before, skipping completed steps"
                );
                Ok(checkpoint)
            }
            None => Ok(Checkpoint::new(plan)),
        }
    }

    pub fn status(&self, plan_id: &str) -> Result<PlanStatus> {
        if let Some(checkpoint) = self.store.load(plan_id)? {
            return Ok(PlanStatus::Active(Box::new(checkpoint)));
        }
        Ok(match self.store.load_receipt(plan_id)? {
            Some(receipt) => PlanStatus::Completed(receipt),
            None => PlanStatus::Unknown,
        })
    }

    /// Plan ids with an active checkpoint.
    pub fn list(&self) -> Result<Vec<String>> {
        Ok(self.store.list()?)
    }

    /// Forget a plan: drop its checkpoint and receipt and disarm its
    /// trigger. Returns whether anything was stored.
    pub async fn abandon(&self, plan_id: &str) -> Result<bool> {
        let _lease = self.store.lock(plan_id)?;
        let existed = self.store.load(plan_id)?.is_some()
            || self.store.load_receipt(plan_id)?.is_some();
        self.store.clear(plan_id)?;
        self.store.clear_receipt(plan_id)?;
        if let Err(e) = self.trigger.disarm(plan_id).await {
            warn!(plan_id, error = %e, "Failed to disarm resumption trigger");
        }
        warn!(plan_id, existed, "Plan abandoned");
        Ok(existed)
    }

    /// Record an operator's verdict for a step left running by a crash.
    ///
    /// Only a step whose latest status is `Running` can be resolved. The next
    /// resume continues after the step or rolls its phase back.
    pub fn resolve(
        &self,
        plan_id: &str,
        step_id: &str,
        resolution: Resolution,
    ) -> Result<Checkpoint> {
        let _lease = self.store.lock(plan_id)?;
        let mut checkpoint = self
            .store
            .load(plan_id)?
            .ok_or_else(|| EngineError::NoCheckpoint(plan_id.to_string()))?;

        let phase_index = checkpoint
            .layout
            .iter()
            .position(|p| p.steps.iter().any(|s| s == step_id))
            .ok_or_else(|| EngineError::PlanMismatch {
                plan_id: plan_id.to_string(),
                reason: format!("step '{step_id}' is not part of the plan"),
            })?;

        let status = checkpoint.log.status_of(step_id);
        if status != StepStatus::Running {
            return Err(EngineError::NotResolvable {
                step_id: step_id.to_string(),
                status,
            });
        }

        let attempt = checkpoint.log.attempts_of(step_id);
        match resolution {
            Resolution::Completed => {
                checkpoint
                    .log
                    .append(step_id, phase_index, StepStatus::Completed, attempt)?
                    .message = Some("resolved as completed by operator".to_string());
                if checkpoint.current_step_id() == Some(step_id) {
                    checkpoint.advance_step();
                }
            }
            Resolution::Failed => {
                let message = "resolved as failed by operator".to_string();
                checkpoint
                    .log
                    .append(step_id, phase_index, StepStatus::Failed, attempt)?
                    .message = Some(message.clone());
                checkpoint.mode = ExecutionMode::RollingBack {
                    phase_index,
                    cause: FailureCause::StepFailed {
                        step_id: step_id.to_string(),
                        error: message,
                    },
                };
            }
        }

        checkpoint.touch();
        self.store.save(plan_id, &checkpoint)?;
        info!(plan_id, step = step_id, resolution = ?resolution, "Step resolved manually");
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{action_fn, predicate_fn, StepAction, StepContext, VerificationPredicate};
    use crate::checkpoint::MemoryCheckpointStore;
    use crate::models::{
        DeviceIdentity, FactTable, Phase, ResumeCondition, RetryPolicy, SinkError, Step,
        StepActionError, StoreError, TriggerError, VerificationResult,
    };
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    type Calls = Arc<Mutex<Vec<String>>>;

    fn calls() -> Calls {
        Arc::new(Mutex::new(Vec::new()))
    }

    fn taken(calls: &Calls) -> Vec<String> {
        calls.lock().unwrap().clone()
    }

    /// Records `exec:<name>` and produces fact `<name>_done`.
    fn ok_action(calls: &Calls, name: &'static str) -> Arc<dyn StepAction> {
        let calls = calls.clone();
        action_fn(move |_| {
            calls.lock().unwrap().push(format!("exec:{name}"));
            Ok(FactTable::new().with(format!("{name}_done"), true))
        })
    }

    fn failing_action(calls: &Calls, name: &'static str) -> Arc<dyn StepAction> {
        let calls = calls.clone();
        action_fn(move |_| {
            calls.lock().unwrap().push(format!("exec:{name}"));
            Err(StepActionError::failed(format!("{name} exploded")))
        })
    }

    fn compensation(calls: &Calls, name: &'static str) -> Arc<dyn StepAction> {
        let calls = calls.clone();
        action_fn(move |_| {
            calls.lock().unwrap().push(format!("comp:{name}"));
            Ok(FactTable::new())
        })
    }

    fn failing_compensation(calls: &Calls, name: &'static str) -> Arc<dyn StepAction> {
        let calls = calls.clone();
        action_fn(move |_| {
            calls.lock().unwrap().push(format!("comp:{name}"));
            Err(StepActionError::failed("escrow service unreachable"))
        })
    }

    fn step(calls: &Calls, name: &'static str) -> Step {
        Step::new(name, ok_action(calls, name)).compensate(compensation(calls, name))
    }

    fn plan(phases: Vec<Phase>) -> MigrationPlan {
        phases.into_iter().fold(
            MigrationPlan::new("plan-1", DeviceIdentity::named("LT-1")),
            MigrationPlan::phase,
        )
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl NotificationSink for RecordingSink {
        fn on_progress(&self, phase: &str, percent: f64, _: &str) -> std::result::Result<(), SinkError> {
            self.events.lock().unwrap().push(format!("progress:{phase}:{percent:.0}"));
            Ok(())
        }

        fn on_verification(
            &self,
            phase: &str,
            result: &VerificationResult,
        ) -> std::result::Result<(), SinkError> {
            let verdict = if result.is_passed() { "passed" } else { "failed" };
            self.events.lock().unwrap().push(format!("verification:{phase}:{verdict}"));
            Ok(())
        }

        fn on_rollback(&self, step_id: &str, _: &str) -> std::result::Result<(), SinkError> {
            self.events.lock().unwrap().push(format!("rollback:{step_id}"));
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingTrigger {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ResumptionTrigger for RecordingTrigger {
        async fn arm(
            &self,
            plan_id: &str,
            condition: ResumeCondition,
        ) -> std::result::Result<(), TriggerError> {
            self.calls.lock().unwrap().push(format!("arm:{plan_id}:{condition}"));
            Ok(())
        }

        async fn disarm(&self, plan_id: &str) -> std::result::Result<(), TriggerError> {
            self.calls.lock().unwrap().push(format!("disarm:{plan_id}"));
            Ok(())
        }
    }

    /// Lets `saves_left` saves through, then fails every save without
    /// writing: the process "dies" right after the last durable write.
    struct CrashingStore {
        inner: MemoryCheckpointStore,
        saves_left: AtomicUsize,
    }

    impl CrashingStore {
        fn new(inner: &MemoryCheckpointStore, saves_left: usize) -> Self {
            Self {
                inner: inner.clone(),
                saves_left: AtomicUsize::new(saves_left),
            }
        }
    }

    impl CheckpointStore for CrashingStore {
        fn lock(&self, plan_id: &str) -> std::result::Result<crate::checkpoint::StoreLease, StoreError> {
            self.inner.lock(plan_id)
        }

        fn save(&self, plan_id: &str, checkpoint: &Checkpoint) -> std::result::Result<(), StoreError> {
            if self
                .saves_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_err()
            {
                return Err(StoreError::io(
                    "simulated crash",
                    PathBuf::from("memory://"),
                    std::io::Error::other("power loss"),
                ));
            }
            self.inner.save(plan_id, checkpoint)
        }

        fn load(&self, plan_id: &str) -> std::result::Result<Option<Checkpoint>, StoreError> {
            self.inner.load(plan_id)
        }

        fn clear(&self, plan_id: &str) -> std::result::Result<(), StoreError> {
            self.inner.clear(plan_id)
        }

        fn save_receipt(&self, receipt: &CompletionReceipt) -> std::result::Result<(), StoreError> {
            self.inner.save_receipt(receipt)
        }

        fn load_receipt(
            &self,
            plan_id: &str,
        ) -> std::result::Result<Option<CompletionReceipt>, StoreError> {
            self.inner.load_receipt(plan_id)
        }

        fn clear_receipt(&self, plan_id: &str) -> std::result::Result<(), StoreError> {
            self.inner.clear_receipt(plan_id)
        }

        fn list(&self) -> std::result::Result<Vec<String>, StoreError> {
            self.inner.list()
        }
    }

    /// Fails every event.
    struct BrokenSink;

    impl NotificationSink for BrokenSink {
        fn on_progress(&self, _: &str, _: f64, _: &str) -> std::result::Result<(), SinkError> {
            Err(SinkError("webhook unreachable".into()))
        }

        fn on_verification(
            &self,
            _: &str,
            _: &VerificationResult,
        ) -> std::result::Result<(), SinkError> {
            Err(SinkError("webhook unreachable".into()))
        }

        fn on_rollback(&self, _: &str, _: &str) -> std::result::Result<(), SinkError> {
            Err(SinkError("webhook unreachable".into()))
        }
    }

    struct HangingPredicate;

    #[async_trait]
    impl VerificationPredicate for HangingPredicate {
        async fn verify(&self, _phase: &str, _facts: &FactTable) -> VerificationResult {
            tokio::time::sleep(Duration::from_secs(30)).await;
            VerificationResult::passed("too late")
        }
    }

    /// Gate that counts its invocations.
    fn counting_gate(count: &Arc<AtomicUsize>, passes: bool) -> Arc<dyn VerificationPredicate> {
        let count = count.clone();
        predicate_fn(move |_, _| {
            count.fetch_add(1, Ordering::SeqCst);
            if passes {
                VerificationResult::passed("enrollment removed")
            } else {
                VerificationResult::failed("device still enrolled")
            }
        })
    }

    /// Sleeps far longer than any test timeout.
    struct HangingAction;

    #[async_trait]
    impl StepAction for HangingAction {
        async fn execute(
            &self,
            _ctx: &StepContext<'_>,
        ) -> std::result::Result<FactTable, StepActionError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(FactTable::new())
        }
    }

    fn engine(store: &MemoryCheckpointStore) -> Engine {
        Engine::new(Arc::new(store.clone()))
    }

    #[tokio::test]
    async fn test_failing_step_rolls_back_earlier_steps_in_reverse() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let sink = Arc::new(RecordingSink::default());
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "a"))
            .step(step(&calls, "b"))
            .step(step(&calls, "c"))
            .step(Step::new("d", failing_action(&calls, "d")).compensate(compensation(&calls, "d")))]);

        let result = engine(&store).with_sink(sink.clone()).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(
            taken(&calls),
            vec!["exec:a", "exec:b", "exec:c", "exec:d", "comp:c", "comp:b", "comp:a"]
        );
        assert!(result.facts.is_empty());
        assert!(matches!(
            result.cause,
            Some(FailureCause::StepFailed { ref step_id, .. }) if step_id == "d"
        ));
        let rollbacks: Vec<String> = sink
            .events()
            .into_iter()
            .filter(|e| e.starts_with("rollback:"))
            .collect();
        assert_eq!(rollbacks, vec!["rollback:c", "rollback:b", "rollback:a"]);

        // Failed plans keep their checkpoint for inspection
        assert!(matches!(
            engine(&store).status("plan-1").unwrap(),
            PlanStatus::Active(cp) if matches!(cp.mode, ExecutionMode::Terminal { .. })
        ));
    }

    #[tokio::test]
    async fn test_middle_step_failure_never_attempts_later_steps() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A"))
            .step(Step::new("B", failing_action(&calls, "B")))
            .step(step(&calls, "C"))]);

        let result = engine(&store).run(&plan).await.unwrap();

        assert_eq!(result.transitions(), vec!["A:completed", "B:failed", "A:rolled_back"]);
        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert!(!taken(&calls).contains(&"exec:C".to_string()));
    }

    #[tokio::test]
    async fn test_failed_verification_rolls_back_whole_phase() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let sink = Arc::new(RecordingSink::default());
        let plan = plan(vec![
            Phase::new("leave")
                .step(step(&calls, "A"))
                .step(step(&calls, "B"))
                .verify(predicate_fn(|_, _| VerificationResult::failed("device still enrolled"))),
            Phase::new("join").step(step(&calls, "C")),
        ]);

        let result = engine(&store).with_sink(sink.clone()).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B", "comp:B", "comp:A"]);
        assert!(matches!(result.cause, Some(FailureCause::VerificationFailed { .. })));
        assert!(sink.events().contains(&"verification:leave:failed".to_string()));
    }

    #[tokio::test]
    async fn test_advisory_verification_failure_does_not_roll_back() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let sink = Arc::new(RecordingSink::default());
        let plan = plan(vec![
            Phase::new("leave")
                .step(step(&calls, "A"))
                .verify(predicate_fn(|_, _| VerificationResult::failed("slow replication")))
                .advisory(true),
            Phase::new("join").step(step(&calls, "B")),
        ]);

        let result = engine(&store).with_sink(sink.clone()).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::Succeeded);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B"]);
        assert!(sink.events().contains(&"verification:leave:failed".to_string()));
        assert!(sink.events().contains(&"progress:join:100".to_string()));
    }

    #[tokio::test]
    async fn test_failed_compensation_is_partial_rollback() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(Step::new("A", ok_action(&calls, "A")).compensate(failing_compensation(&calls, "A")))
            .step(Step::new("B", failing_action(&calls, "B")))]);

        let result = engine(&store).run(&plan).await.unwrap();

        assert_eq!(
            result.outcome,
            PlanOutcome::FailedPartiallyRolledBack {
                manual_steps: vec!["A".to_string()]
            }
        );
        assert_eq!(result.transitions(), vec!["A:completed", "B:failed", "A:rollback_failed"]);
        // Nothing was undone, so A's facts stay
        assert!(result.facts.contains("A_done"));
    }

    #[tokio::test]
    async fn test_step_without_compensation_is_marked_rolled_back() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(Step::new("A", ok_action(&calls, "A")))
            .step(Step::new("B", failing_action(&calls, "B")))]);

        let result = engine(&store).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        let last = result.records.last().unwrap();
        assert_eq!(last.status, StepStatus::RolledBack);
        assert_eq!(last.message.as_deref(), Some("no compensation defined"));
        assert!(!result.facts.contains("A_done"));
    }

    #[tokio::test]
    async fn test_rerunning_completed_plan_skips_completed_steps() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![
            Phase::new("leave").step(step(&calls, "A")),
            Phase::new("join").step(step(&calls, "B")),
        ]);

        let first = engine(&store).run(&plan).await.unwrap();
        assert_eq!(first.outcome, PlanOutcome::Succeeded);
        assert!(store.load("plan-1").unwrap().is_none());
        assert!(matches!(engine(&store).status("plan-1").unwrap(), PlanStatus::Completed(_)));

        let second = engine(&store).run(&plan).await.unwrap();
        assert_eq!(second.outcome, PlanOutcome::Succeeded);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B"]);
        assert!(second.facts.contains("B_done"));

        // A repeated resume firing is a no-op too
        let resumed = engine(&store).resume(&plan).await.unwrap();
        assert_eq!(resumed.outcome, PlanOutcome::Succeeded);
        assert_eq!(taken(&calls).len(), 2);
    }

    #[tokio::test]
    async fn test_crash_after_checkpoint_resumes_at_next_step() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A"))
            .step(step(&calls, "B"))]);

        // Saves: initial, A running, A completed; the fourth is lost
        let crashing = Engine::new(Arc::new(CrashingStore::new(&store, 3)));
        let err = crashing.run(&plan).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(_)));
        assert_eq!(taken(&calls), vec!["exec:A"]);

        let result = engine(&store).resume(&plan).await.unwrap();
        assert_eq!(result.outcome, PlanOutcome::Succeeded);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B"]);
        assert!(result.facts.contains("A_done"));
    }

    #[tokio::test]
    async fn test_interrupted_non_idempotent_step_is_ambiguous_until_resolved() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A"))
            .step(step(&calls, "B"))]);

        // Saves: initial, A running; A's completion is lost
        let crashing = Engine::new(Arc::new(CrashingStore::new(&store, 2)));
        assert!(crashing.run(&plan).await.is_err());

        for _ in 0..2 {
            let result = engine(&store).resume(&plan).await.unwrap();
            assert_eq!(
                result.outcome,
                PlanOutcome::FailedResumeAmbiguous {
                    step_id: "A".to_string()
                }
            );
        }
        assert_eq!(taken(&calls), vec!["exec:A"]);

        assert!(matches!(
            engine(&store).resolve("plan-1", "B", Resolution::Completed),
            Err(EngineError::NotResolvable { .. })
        ));
        engine(&store)
            .resolve("plan-1", "A", Resolution::Completed)
            .unwrap();
        let result = engine(&store).resume(&plan).await.unwrap();
        assert_eq!(result.outcome, PlanOutcome::Succeeded);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B"]);
    }

    #[tokio::test]
    async fn test_resolving_as_failed_rolls_back_phase() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A"))
            .step(step(&calls, "B"))]);

        // Saves: initial, A running, A completed, B running; B's completion is lost
        let crashing = Engine::new(Arc::new(CrashingStore::new(&store, 4)));
        assert!(crashing.run(&plan).await.is_err());

        engine(&store)
            .resolve("plan-1", "B", Resolution::Failed)
            .unwrap();
        let result = engine(&store).resume(&plan).await.unwrap();
        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B", "comp:A"]);
    }

    #[tokio::test]
    async fn test_interrupted_idempotent_step_is_rerun() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A").idempotent(true))
            .step(step(&calls, "B"))]);

        let crashing = Engine::new(Arc::new(CrashingStore::new(&store, 2)));
        assert!(crashing.run(&plan).await.is_err());

        let result = engine(&store).resume(&plan).await.unwrap();
        assert_eq!(result.outcome, PlanOutcome::Succeeded);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:A", "exec:B"]);
        let a: Vec<(StepStatus, u32)> = result
            .records
            .iter()
            .filter(|r| r.step_id == "A")
            .map(|r| (r.status, r.attempt))
            .collect();
        assert_eq!(
            a,
            vec![
                (StepStatus::Running, 1),
                (StepStatus::Running, 2),
                (StepStatus::Completed, 2)
            ]
        );
    }

    #[tokio::test]
    async fn test_crash_during_rollback_resumes_unwind() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A"))
            .step(step(&calls, "B"))
            .step(Step::new("C", failing_action(&calls, "C")))]);

        // 7 forward saves, rolling-back marker, B rolled back; A's record is lost
        let crashing = Engine::new(Arc::new(CrashingStore::new(&store, 9)));
        assert!(crashing.run(&plan).await.is_err());
        assert_eq!(
            taken(&calls),
            vec!["exec:A", "exec:B", "exec:C", "comp:B", "comp:A"]
        );

        let result = engine(&store).resume(&plan).await.unwrap();
        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(taken(&calls).last().map(String::as_str), Some("comp:A"));
        assert_eq!(taken(&calls).iter().filter(|c| *c == "comp:B").count(), 1);
        assert_eq!(
            result.transitions(),
            vec!["A:completed", "B:completed", "C:failed", "B:rolled_back", "A:rolled_back"]
        );

        // Terminal outcomes are returned unchanged on later resumes
        let again = engine(&store).resume(&plan).await.unwrap();
        assert_eq!(again.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(taken(&calls).len(), 6);
    }

    #[tokio::test]
    async fn test_retries_are_recorded_per_attempt() {
        let store = MemoryCheckpointStore::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let flaky = action_fn(move |ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(ctx.attempt as usize, n);
            if n < 3 {
                Err(StepActionError::failed("directory busy"))
            } else {
                Ok(FactTable::new().with("joined", true))
            }
        });
        let retry = RetryPolicy::with_retries(2).backoff(Duration::ZERO, Duration::ZERO);
        let plan = plan(vec![Phase::new("join").step(Step::new("join", flaky).retry(retry))]);

        let result = engine(&store).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::Succeeded);
        assert_eq!(result.transitions(), vec!["join:failed", "join:failed", "join:completed"]);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_the_step() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let retry = RetryPolicy::with_retries(1).backoff(Duration::from_millis(1), Duration::from_millis(5));
        let plan = plan(vec![Phase::new("join")
            .step(step(&calls, "A"))
            .step(Step::new("B", failing_action(&calls, "B")).retry(retry))]);

        let result = engine(&store).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B", "exec:B", "comp:A"]);
        assert!(matches!(
            result.cause,
            Some(FailureCause::StepFailed { ref error, .. }) if error == "B exploded"
        ));
    }

    #[tokio::test]
    async fn test_timeout_is_a_failure() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("join")
            .step(step(&calls, "A"))
            .step(Step::new("slow", Arc::new(HangingAction)).timeout(Duration::from_millis(20)))]);

        let result = engine(&store).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        let failed = result
            .records
            .iter()
            .find(|r| r.status == StepStatus::Failed)
            .unwrap();
        assert!(failed.message.as_deref().unwrap_or_default().contains("timed out"));
        assert_eq!(taken(&calls), vec!["exec:A", "comp:A"]);
    }

    #[tokio::test]
    async fn test_abort_rolls_back_current_phase() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![
            Phase::new("leave")
                .step(step(&calls, "A"))
                .step(Step::new("hang", Arc::new(HangingAction))),
            Phase::new("join").step(step(&calls, "B")),
        ]);
        let engine = engine(&store);
        let token = engine.cancellation_token();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });

        let result = engine.run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(
            result.cause,
            Some(FailureCause::Aborted {
                phase: "leave".to_string(),
                step_id: Some("hang".to_string()),
            })
        );
        assert_eq!(taken(&calls), vec!["exec:A", "comp:A"]);
        let hang = result.records.iter().rev().find(|r| r.step_id == "hang").unwrap();
        assert_eq!(hang.message.as_deref(), Some("aborted by operator"));
    }

    #[tokio::test]
    async fn test_restart_step_suspends_and_resumes() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let trigger = Arc::new(RecordingTrigger::default());
        let plan = plan(vec![
            Phase::new("leave").step(step(&calls, "reboot").restart(ResumeCondition::OnBoot)),
            Phase::new("join").step(step(&calls, "B")),
        ]);

        let result = engine(&store)
            .with_trigger(trigger.clone())
            .run(&plan)
            .await
            .unwrap();
        assert_eq!(
            result.outcome,
            PlanOutcome::Suspended {
                step_id: "reboot".to_string(),
                condition: ResumeCondition::OnBoot
            }
        );
        assert_eq!(result.outcome.exit_code(), 20);
        assert_eq!(taken(&calls), vec!["exec:reboot"]);
        assert_eq!(*trigger.calls.lock().unwrap(), vec!["arm:plan-1:on_boot"]);
        let stored = store.load("plan-1").unwrap().unwrap();
        assert!(stored.suspended.is_some());

        let result = engine(&store)
            .with_trigger(trigger.clone())
            .resume(&plan)
            .await
            .unwrap();
        assert_eq!(result.outcome, PlanOutcome::Succeeded);
        assert_eq!(taken(&calls), vec!["exec:reboot", "exec:B"]);
        assert_eq!(trigger.calls.lock().unwrap()[1], "disarm:plan-1");
    }

    #[tokio::test]
    async fn test_fact_conflict_fails_the_step() {
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("join")
            .step(Step::new("a", action_fn(|_| Ok(FactTable::new().with("device_id", "x")))))
            .step(Step::new("b", action_fn(|_| Ok(FactTable::new().with("device_id", "y")))))]);

        let result = engine(&store).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        let failed = result.records.iter().find(|r| r.step_id == "b" && r.status == StepStatus::Failed).unwrap();
        assert_eq!(
            failed.message.as_deref(),
            Some("fact 'device_id' was already produced by step 'a'")
        );
        assert!(result.facts.is_empty());
    }

    #[tokio::test]
    async fn test_steps_read_earlier_facts() {
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("join")
            .step(Step::new("a", action_fn(|_| Ok(FactTable::new().with("tenant", "contoso")))))
            .step(Step::new(
                "b",
                action_fn(|ctx| {
                    let tenant = ctx.fact("tenant")?.clone();
                    Ok(FactTable::new().with("joined_tenant", tenant))
                }),
            ))]);

        let result = engine(&store).run(&plan).await.unwrap();
        assert_eq!(result.facts.get_text("joined_tenant").as_deref(), Some("contoso"));
    }

    #[tokio::test]
    async fn test_lock_rejects_second_engine() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave").step(step(&calls, "A"))]);

        let _held = store.lock("plan-1").unwrap();
        let err = engine(&store).run(&plan).await.unwrap_err();
        assert!(matches!(err, EngineError::Store(StoreError::Locked { .. })));
        assert!(taken(&calls).is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_lifecycle_errors() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A"))
            .step(Step::new("B", failing_action(&calls, "B")))]);

        assert!(matches!(
            engine(&store).resume(&plan).await,
            Err(EngineError::NoCheckpoint(_))
        ));
        assert!(matches!(engine(&store).status("plan-1").unwrap(), PlanStatus::Unknown));

        engine(&store).run(&plan).await.unwrap();
        assert!(matches!(
            engine(&store).run(&plan).await,
            Err(EngineError::CheckpointExists(_))
        ));
        assert!(matches!(
            engine(&store).execute(&plan, Some("other-plan")).await,
            Err(EngineError::PlanMismatch { .. })
        ));

        assert!(engine(&store).abandon("plan-1").await.unwrap());
        assert!(matches!(engine(&store).status("plan-1").unwrap(), PlanStatus::Unknown));
        assert!(!engine(&store).abandon("plan-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_resume_rejects_changed_plan() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let original = plan(vec![Phase::new("leave")
            .step(step(&calls, "A").restart(ResumeCondition::OnLogon))
            .step(step(&calls, "B"))]);
        let changed = plan(vec![Phase::new("leave")
            .step(step(&calls, "A").restart(ResumeCondition::OnLogon))
            .step(step(&calls, "B2"))]);

        engine(&store).run(&original).await.unwrap();
        assert!(matches!(
            engine(&store).resume(&changed).await,
            Err(EngineError::PlanMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_verification_timeout_is_a_failed_gate() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![
            Phase::new("leave")
                .step(step(&calls, "A"))
                .verify(Arc::new(HangingPredicate))
                .verification_timeout(Duration::from_millis(20)),
            Phase::new("join").step(step(&calls, "B")),
        ]);

        let result = engine(&store).run(&plan).await.unwrap();

        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(taken(&calls), vec!["exec:A", "comp:A"]);
        match result.cause {
            Some(FailureCause::VerificationFailed { phase, details }) => {
                assert_eq!(phase, "leave");
                assert!(details.contains("timed out"));
            }
            other => panic!("unexpected cause: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_recorded_verdict_is_not_rerun_after_crash() {
        for passes in [true, false] {
            let calls = calls();
            let gate_calls = Arc::new(AtomicUsize::new(0));
            let store = MemoryCheckpointStore::new();
            let plan = plan(vec![
                Phase::new("leave")
                    .step(step(&calls, "A"))
                    .verify(counting_gate(&gate_calls, passes)),
                Phase::new("join").step(step(&calls, "B")),
            ]);

            // Saves: initial, A running, A completed, verdict; the next is lost
            let crashing = Engine::new(Arc::new(CrashingStore::new(&store, 4)));
            assert!(crashing.run(&plan).await.is_err());
            assert_eq!(gate_calls.load(Ordering::SeqCst), 1);
            let saved = store.load("plan-1").unwrap().unwrap();
            assert!(saved.log.verification_for(0).is_some());

            let result = engine(&store).resume(&plan).await.unwrap();

            assert_eq!(gate_calls.load(Ordering::SeqCst), 1);
            if passes {
                assert_eq!(result.outcome, PlanOutcome::Succeeded);
                assert!(taken(&calls).contains(&"exec:B".to_string()));
            } else {
                assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
                assert!(!taken(&calls).contains(&"exec:B".to_string()));
            }
        }
    }

    #[tokio::test]
    async fn test_broken_sink_never_stops_a_plan() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let gate_calls = Arc::new(AtomicUsize::new(0));
        let plan = plan(vec![
            Phase::new("leave")
                .step(step(&calls, "A"))
                .verify(counting_gate(&gate_calls, true)),
            Phase::new("join").step(step(&calls, "B")),
        ]);

        let result = engine(&store)
            .with_sink(Arc::new(BrokenSink))
            .run(&plan)
            .await
            .unwrap();
        assert_eq!(result.outcome, PlanOutcome::Succeeded);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B"]);
    }

    #[tokio::test]
    async fn test_broken_sink_never_stops_a_rollback() {
        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A"))
            .step(Step::new("B", failing_action(&calls, "B")))]);

        let result = engine(&store)
            .with_sink(Arc::new(BrokenSink))
            .run(&plan)
            .await
            .unwrap();
        assert_eq!(result.outcome, PlanOutcome::FailedFullyRolledBack);
        assert_eq!(taken(&calls), vec!["exec:A", "exec:B", "comp:A"]);
    }

    #[tokio::test]
    async fn test_refused_run_leaves_archived_plan_untouched() {
        let temp_dir = TempDir::new().unwrap();
        let archive = PlanArchive::new(&temp_dir.path().join("store")).unwrap();
        let original = temp_dir.path().join("original.toml");
        let edited = temp_dir.path().join("edited.toml");
        std::fs::write(&original, "id = \"plan-1\"\n# b = \"original\"\n").unwrap();
        std::fs::write(&edited, "id = \"plan-1\"\n# b = \"edited\"\n").unwrap();

        let calls = calls();
        let store = MemoryCheckpointStore::new();
        let plan = plan(vec![Phase::new("leave")
            .step(step(&calls, "A").restart(ResumeCondition::OnBoot))
            .step(step(&calls, "B"))]);

        let result = engine(&store).run_archived(&plan, &original, &archive).await.unwrap();
        assert!(matches!(result.outcome, PlanOutcome::Suspended { .. }));
        let archived = archive.find("plan-1").unwrap().unwrap();

        let err = engine(&store)
            .run_archived(&plan, &edited, &archive)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::CheckpointExists(_)));
        assert_eq!(
            std::fs::read_to_string(&archived).unwrap(),
            "id = \"plan-1\"\n# b = \"original\"\n"
        );

        // An unreadable source refuses the run before any checkpoint exists
        let other = MemoryCheckpointStore::new();
        let missing = temp_dir.path().join("missing.toml");
        assert!(matches!(
            engine(&other).run_archived(&plan, &missing, &archive).await,
            Err(EngineError::Store(StoreError::Io { .. }))
        ));
        assert!(other.load("plan-1").unwrap().is_none());
    }
}
