//! Verification gate run at each phase boundary.

use super::executor::Run;
use crate::checkpoint::ExecutionMode;
use crate::models::{EngineError, FailureCause, VerificationFailure, VerificationResult};
use tracing::{info, warn};

impl Run<'_> {
    /// Gate the phase at the pointer. On return the checkpoint either points
    /// at the next phase or is rolling this one back; both in the same save
    /// as the recorded verdict.
    pub(super) async fn verify_phase(&mut self, phase_index: usize) -> Result<(), EngineError> {
        let plan = self.plan;
        let phase = &plan.phases[phase_index];

        let Some(predicate) = &phase.verification else {
            self.checkpoint.advance_phase();
            return self.save();
        };

        let result = match self.checkpoint.log.verification_for(phase_index) {
            Some(recorded) => {
                info!(phase = %phase.name, "Reusing recorded verification");
                recorded.result()
            }
            None => {
                let verdict = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => None,
                    r = tokio::time::timeout(
                        phase.verification_timeout,
                        predicate.verify(&phase.name, &self.checkpoint.facts),
                    ) => Some(r.unwrap_or_else(|_| VerificationResult::failed(format!(
                        "verification timed out after {:?}",
                        phase.verification_timeout
                    )))),
                };
                let Some(result) = verdict else {
                    let cause = FailureCause::Aborted {
                        phase: phase.name.clone(),
                        step_id: None,
                    };
                    return self.begin_rollback(phase_index, cause);
                };
                self.checkpoint.log.record_verification(
                    phase_index,
                    &phase.name,
                    &result,
                    phase.advisory_only,
                );
                self.notifier.verification(&phase.name, &result);
                result
            }
        };

        if result.is_passed() {
            info!(plan_id = %plan.id, phase = %phase.name, details = %result.details, "Phase verified");
            self.checkpoint.advance_phase();
        } else if phase.advisory_only {
            warn!(
                plan_id = %plan.id,
                phase = %phase.name,
                details = %result.details,
                "Advisory verification failed, continuing"
            );
            self.checkpoint.advance_phase();
        } else {
            let failure = VerificationFailure {
                phase: phase.name.clone(),
                details: result.details,
            };
            warn!(plan_id = %plan.id, error = %failure, "Rolling back phase");
            self.checkpoint.mode = ExecutionMode::RollingBack {
                phase_index,
                cause: failure.into(),
            };
        }
        self.save()
    }
}
