//! Compensation engine: unwinds the completed steps of one phase, newest
//! first.
//!
//! Every compensated step is checkpointed before the next compensation
//! starts, so a crash resumes the unwind where it stopped. A compensation
//! interrupted mid-flight has no record yet and runs again on resume.

use super::executor::Run;
use crate::actions::StepContext;
use crate::checkpoint::{ExecutionMode, StepStatus};
use crate::models::{
    CompensationError, EngineError, FailureCause, PlanOutcome, RollbackResult, Step,
    StepActionError,
};
use tracing::{info, warn};

impl Run<'_> {
    pub(super) async fn rollback_phase(
        &mut self,
        phase_index: usize,
        cause: &FailureCause,
    ) -> Result<PlanOutcome, EngineError> {
        let plan = self.plan;
        let phase = plan.phases.get(phase_index).ok_or_else(|| {
            EngineError::Internal(format!("rollback of unknown phase index {phase_index}"))
        })?;
        let reason = cause.to_string();

        let mut manual = self.checkpoint.log.rollback_failed_in_phase(phase_index);
        let pending: Vec<(String, u32)> = self
            .checkpoint
            .log
            .completed_in_phase(phase_index)
            .into_iter()
            .map(|r| (r.step_id.clone(), r.attempt))
            .collect();

        for (step_id, attempt) in pending {
            let step = phase.find_step(&step_id).ok_or_else(|| {
                EngineError::Internal(format!("step '{step_id}' is not in phase '{}'", phase.name))
            })?;
            let produced = self.checkpoint.log.produced_keys(&step_id);

            let (status, message) = match &step.compensate {
                None => (StepStatus::RolledBack, "no compensation defined".to_string()),
                Some(_) => match self.compensate(&phase.name, step, attempt).await {
                    Ok(()) => (StepStatus::RolledBack, "compensated".to_string()),
                    Err(e) => {
                        let err = CompensationError {
                            step_id: step_id.clone(),
                            source: e,
                        };
                        warn!(
                            plan_id = %plan.id,
                            step = %step_id,
                            error = %err,
                            "Compensation failed"
                        );
                        manual.push(step_id.clone());
                        (StepStatus::RollbackFailed, err.to_string())
                    }
                },
            };

            let record = self
                .checkpoint
                .log
                .append(&step_id, phase_index, status, attempt)?;
            record.message = Some(message);
            record.run_id = Some(self.run_id);
            if status == StepStatus::RolledBack {
                self.checkpoint.facts.prune(&produced);
            }
            self.save()?;

            info!(plan_id = %plan.id, step = %step_id, status = %status, "Step unwound");
            self.notifier.rollback(&step_id, &reason);
        }

        let result = RollbackResult::from_manual_steps(manual);
        let outcome = PlanOutcome::from(result);
        self.checkpoint.mode = ExecutionMode::Terminal {
            outcome: outcome.clone(),
            cause: Some(cause.clone()),
        };
        self.save()?;
        self.disarm_quietly().await;

        warn!(plan_id = %plan.id, outcome = %outcome, "Plan failed");
        Ok(outcome)
    }

    /// Run one compensation under the step's timeout. Cancellation is not
    /// observed here: an abort still unwinds fully.
    async fn compensate(
        &self,
        phase: &str,
        step: &Step,
        attempt: u32,
    ) -> Result<(), StepActionError> {
        let Some(action) = &step.compensate else {
            return Ok(());
        };
        let ctx = StepContext {
            plan_id: &self.plan.id,
            device: &self.plan.device,
            phase,
            step_id: &step.id,
            attempt,
            facts: &self.checkpoint.facts,
            credentials: self.credentials,
        };
        match tokio::time::timeout(step.timeout, action.execute(&ctx)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(StepActionError::Timeout(step.timeout)),
        }
    }
}
