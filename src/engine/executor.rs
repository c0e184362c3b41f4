//! Step executor: drives a checkpoint through the plan one transition at a
//! time, saving after every transition.

use super::ResumptionTrigger;
use crate::actions::StepContext;
use crate::checkpoint::{
    Checkpoint, CheckpointStore, CompletionReceipt, ExecutionMode, StepStatus, Suspension,
};
use crate::external::{CredentialProvider, Notifier};
use crate::models::{
    EngineError, FactTable, FailureCause, MigrationPlan, PlanOutcome, ResumeAmbiguous,
    ResumeCondition, Step, StepActionError,
};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What happened to the step at the pointer.
pub(super) enum StepOutcome {
    /// Completed (or skipped); the pointer moved on
    Advanced,
    /// Completed and now waiting for a restart
    Suspended(ResumeCondition),
    /// Out of attempts, or aborted
    Failed(FailureCause),
    /// Found mid-flight after a crash and not safe to re-run
    Ambiguous,
}

/// One engine invocation over one plan.
pub(super) struct Run<'a> {
    pub(super) plan: &'a MigrationPlan,
    pub(super) checkpoint: Checkpoint,
    pub(super) store: &'a dyn CheckpointStore,
    pub(super) notifier: &'a Notifier,
    pub(super) credentials: &'a dyn CredentialProvider,
    pub(super) trigger: &'a dyn ResumptionTrigger,
    pub(super) cancel: &'a CancellationToken,
    pub(super) run_id: Uuid,
}

impl Run<'_> {
    pub(super) fn save(&mut self) -> Result<(), EngineError> {
        self.checkpoint.touch();
        self.store.save(&self.plan.id, &self.checkpoint)?;
        Ok(())
    }

    /// Advance until the plan reaches an outcome.
    pub(super) async fn drive(
        &mut self,
    ) -> Result<(PlanOutcome, Option<FailureCause>), EngineError> {
        loop {
            match self.checkpoint.mode.clone() {
                ExecutionMode::Terminal { outcome, cause } => return Ok((outcome, cause)),
                ExecutionMode::RollingBack { phase_index, cause } => {
                    let outcome = self.rollback_phase(phase_index, &cause).await?;
                    return Ok((outcome, Some(cause)));
                }
                ExecutionMode::Forward => {}
            }

            let plan = self.plan;
            let phase_index = self.checkpoint.phase_index;
            let Some(phase) = plan.phases.get(phase_index) else {
                return self.finish_success().await.map(|outcome| (outcome, None));
            };

            if self.cancel.is_cancelled() {
                let cause = FailureCause::Aborted {
                    phase: phase.name.clone(),
                    step_id: None,
                };
                self.begin_rollback(phase_index, cause)?;
                continue;
            }

            let step_index = self.checkpoint.step_index;
            if step_index >= phase.steps.len() {
                self.verify_phase(phase_index).await?;
                continue;
            }

            let step = &phase.steps[step_index];
            match self.run_step(phase_index, step).await? {
                StepOutcome::Advanced => {}
                StepOutcome::Suspended(condition) => {
                    info!(
                        plan_id = %self.plan.id,
                        step = %step.id,
                        condition = %condition,
                        "Suspended until restart"
                    );
                    return Ok((
                        PlanOutcome::Suspended {
                            step_id: step.id.clone(),
                            condition,
                        },
                        None,
                    ));
                }
                StepOutcome::Failed(cause) => self.begin_rollback(phase_index, cause)?,
                StepOutcome::Ambiguous => {
                    let err = ResumeAmbiguous {
                        step_id: step.id.clone(),
                    };
                    error!(plan_id = %self.plan.id, step = %step.id, "{err}");
                    self.disarm_quietly().await;
                    return Ok((
                        PlanOutcome::FailedResumeAmbiguous {
                            step_id: step.id.clone(),
                        },
                        Some(FailureCause::StepFailed {
                            step_id: step.id.clone(),
                            error: err.to_string(),
                        }),
                    ));
                }
            }
        }
    }

    /// Run the step at the pointer, honoring whatever the log already says
    /// about it.
    async fn run_step(
        &mut self,
        phase_index: usize,
        step: &Step,
    ) -> Result<StepOutcome, EngineError> {
        if self.checkpoint.is_carried_over(&step.id) {
            debug!(step = %step.id, "Completed by an earlier run, skipping");
            self.checkpoint.advance_step();
            self.save()?;
            return Ok(StepOutcome::Advanced);
        }

        match self.checkpoint.log.status_of(&step.id) {
            StepStatus::Pending | StepStatus::Failed => {}
            StepStatus::Running if step.idempotent => {
                warn!(step = %step.id, "Step was interrupted mid-flight, re-running");
            }
            StepStatus::Running => return Ok(StepOutcome::Ambiguous),
            StepStatus::Completed => {
                self.checkpoint.advance_step();
                self.save()?;
                return Ok(StepOutcome::Advanced);
            }
            status @ (StepStatus::RolledBack | StepStatus::RollbackFailed) => {
                return Err(EngineError::Internal(format!(
                    "step '{}' is {status} while the plan runs forward",
                    step.id
                )));
            }
        }

        let plan = self.plan;
        let phase_name = plan.phases[phase_index].name.as_str();
        loop {
            let failures = self.checkpoint.log.failures_of(&step.id);
            if failures > 0 {
                if !step.retry.allows_attempt_after(failures) {
                    let error = self
                        .checkpoint
                        .log
                        .latest(&step.id)
                        .and_then(|r| r.message.clone())
                        .unwrap_or_else(|| "failed".to_string());
                    return Ok(StepOutcome::Failed(FailureCause::StepFailed {
                        step_id: step.id.clone(),
                        error,
                    }));
                }
                let delay = step.retry.delay_for(failures);
                if !delay.is_zero() {
                    debug!(
                        step = %step.id,
                        delay_ms = delay.as_millis() as u64,
                        "Backing off before retry"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            let attempt = self.checkpoint.log.attempts_of(&step.id) + 1;

            let armed = match step.restart {
                Some(condition) => self.trigger.arm(&self.plan.id, condition).await,
                None => Ok(()),
            };

            self.checkpoint
                .log
                .append(&step.id, phase_index, StepStatus::Running, attempt)?
                .run_id = Some(self.run_id);

            let result = match armed {
                Err(e) => Err(StepActionError::from(e)),
                Ok(()) => {
                    self.save()?;
                    info!(plan_id = %self.plan.id, phase = phase_name, step = %step.id, attempt, "Step started");
                    self.invoke(phase_name, step, attempt).await
                }
            };

            let error = match result {
                Ok(outputs) => match self.checkpoint.facts.merge(outputs) {
                    Ok(keys) => return self.complete_step(phase_index, step, attempt, keys),
                    Err(key) => {
                        let owner = self
                            .checkpoint
                            .log
                            .fact_owner(&key)
                            .unwrap_or("an earlier run")
                            .to_string();
                        StepActionError::FactConflict { key, owner }
                    }
                },
                Err(e) => e,
            };

            let aborted = error.is_abort();
            warn!(plan_id = %self.plan.id, step = %step.id, attempt, error = %error, "Step failed");
            let record = self
                .checkpoint
                .log
                .append(&step.id, phase_index, StepStatus::Failed, attempt)?;
            record.message = Some(error.to_string());
            record.run_id = Some(self.run_id);
            self.save()?;

            if step.restart.is_some() {
                self.disarm_quietly().await;
            }
            if aborted {
                return Ok(StepOutcome::Failed(FailureCause::Aborted {
                    phase: phase_name.to_string(),
                    step_id: Some(step.id.clone()),
                }));
            }
        }
    }

    /// Run the action with the step timeout, racing the abort token.
    async fn invoke(
        &self,
        phase: &str,
        step: &Step,
        attempt: u32,
    ) -> Result<FactTable, StepActionError> {
        let ctx = StepContext {
            plan_id: &self.plan.id,
            device: &self.plan.device,
            phase,
            step_id: &step.id,
            attempt,
            facts: &self.checkpoint.facts,
            credentials: self.credentials,
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(StepActionError::Aborted),
            result = tokio::time::timeout(step.timeout, step.action.execute(&ctx)) => {
                result.unwrap_or(Err(StepActionError::Timeout(step.timeout)))
            }
        }
    }

    fn complete_step(
        &mut self,
        phase_index: usize,
        step: &Step,
        attempt: u32,
        keys: Vec<String>,
    ) -> Result<StepOutcome, EngineError> {
        let record = self
            .checkpoint
            .log
            .append(&step.id, phase_index, StepStatus::Completed, attempt)?;
        record.fact_keys = keys;
        record.run_id = Some(self.run_id);
        self.checkpoint.advance_step();
        if let Some(condition) = step.restart {
            self.checkpoint.suspended = Some(Suspension {
                step_id: step.id.clone(),
                condition,
                at: Utc::now(),
            });
        }
        self.save()?;

        info!(plan_id = %self.plan.id, step = %step.id, attempt, "Step completed");
        let phase = &self.plan.phases[phase_index].name;
        self.notifier.progress(
            phase,
            self.checkpoint.progress_percent(),
            &format!("step '{}' completed", step.id),
        );

        Ok(match step.restart {
            Some(condition) => StepOutcome::Suspended(condition),
            None => StepOutcome::Advanced,
        })
    }

    pub(super) fn begin_rollback(
        &mut self,
        phase_index: usize,
        cause: FailureCause,
    ) -> Result<(), EngineError> {
        warn!(plan_id = %self.plan.id, phase_index, cause = %cause, "Rolling back phase");
        self.checkpoint.mode = ExecutionMode::RollingBack { phase_index, cause };
        self.save()
    }

    /// Replace the checkpoint with a completion receipt.
    async fn finish_success(&mut self) -> Result<PlanOutcome, EngineError> {
        let receipt = CompletionReceipt::from_checkpoint(&self.checkpoint);
        self.store.save_receipt(&receipt)?;
        self.store.clear(&self.plan.id)?;
        info!(
            plan_id = %self.plan.id,
            steps = receipt.completed_steps.len(),
            "Plan succeeded"
        );
        let last_phase = self
            .plan
            .phases
            .last()
            .map(|p| p.name.as_str())
            .unwrap_or_default();
        self.notifier.progress(last_phase, 100.0, "plan succeeded");
        self.disarm_quietly().await;
        Ok(PlanOutcome::Succeeded)
    }

    pub(super) async fn disarm_quietly(&self) {
        if let Err(e) = self.trigger.disarm(&self.plan.id).await {
            warn!(plan_id = %self.plan.id, error = %e, "Failed to disarm resumption trigger");
        }
    }
}
