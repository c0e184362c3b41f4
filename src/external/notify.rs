//! Notification sinks.
//!
//! The engine reports progress, verification results and rollbacks here.
//! Delivery is best-effort: a failing sink is logged and otherwise ignored.

use crate::models::{SinkError, VerificationResult};
use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Arc;
use tracing::{info, warn};

/// Receives engine events.
pub trait NotificationSink: Send + Sync {
    fn on_progress(&self, phase: &str, percent: f64, message: &str) -> Result<(), SinkError>;

    fn on_verification(&self, phase: &str, result: &VerificationResult) -> Result<(), SinkError>;

    fn on_rollback(&self, step_id: &str, reason: &str) -> Result<(), SinkError>;
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl NotificationSink for NullSink {
    fn on_progress(&self, _phase: &str, _percent: f64, _message: &str) -> Result<(), SinkError> {
        Ok(())
    }

    fn on_verification(&self, _phase: &str, _result: &VerificationResult) -> Result<(), SinkError> {
        Ok(())
    }

    fn on_rollback(&self, _step_id: &str, _reason: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Forwards events to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn on_progress(&self, phase: &str, percent: f64, message: &str) -> Result<(), SinkError> {
        info!(phase, percent = format!("{percent:.0}"), "{message}");
        Ok(())
    }

    fn on_verification(&self, phase: &str, result: &VerificationResult) -> Result<(), SinkError> {
        if result.is_passed() {
            info!(phase, details = %result.details, "Verification passed");
        } else {
            warn!(phase, details = %result.details, "Verification failed");
        }
        Ok(())
    }

    fn on_rollback(&self, step_id: &str, reason: &str) -> Result<(), SinkError> {
        warn!(step_id, reason, "Step rolled back");
        Ok(())
    }
}

/// Terminal progress bar.
pub struct ProgressSink {
    bar: ProgressBar,
}

impl ProgressSink {
    pub fn new() -> Self {
        let bar = ProgressBar::new(100);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos:>3}% {msg}")
        {
            bar.set_style(style.progress_chars("##-"));
        }
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish();
    }
}

impl Default for ProgressSink {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationSink for ProgressSink {
    fn on_progress(&self, phase: &str, percent: f64, message: &str) -> Result<(), SinkError> {
        self.bar.set_position(percent.clamp(0.0, 100.0).round() as u64);
        self.bar.set_message(format!("{phase}: {message}"));
        Ok(())
    }

    fn on_verification(&self, phase: &str, result: &VerificationResult) -> Result<(), SinkError> {
        let mark = if result.is_passed() { "passed" } else { "FAILED" };
        self.bar
            .println(format!("verification {mark} for {phase}: {}", result.details));
        Ok(())
    }

    fn on_rollback(&self, step_id: &str, reason: &str) -> Result<(), SinkError> {
        self.bar.println(format!("rolled back {step_id}: {reason}"));
        Ok(())
    }
}

/// Delivers every event to each inner sink, even if one of them fails.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn each(
        &self,
        f: impl Fn(&dyn NotificationSink) -> Result<(), SinkError>,
    ) -> Result<(), SinkError> {
        let errors: Vec<String> = self
            .sinks
            .iter()
            .filter_map(|s| f(s.as_ref()).err())
            .map(|e| e.0)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(SinkError(errors.join("; ")))
        }
    }
}

impl NotificationSink for FanoutSink {
    fn on_progress(&self, phase: &str, percent: f64, message: &str) -> Result<(), SinkError> {
        self.each(|s| s.on_progress(phase, percent, message))
    }

    fn on_verification(&self, phase: &str, result: &VerificationResult) -> Result<(), SinkError> {
        self.each(|s| s.on_verification(phase, result))
    }

    fn on_rollback(&self, step_id: &str, reason: &str) -> Result<(), SinkError> {
        self.each(|s| s.on_rollback(step_id, reason))
    }
}

/// Engine-side wrapper that turns sink failures into warnings.
#[derive(Clone)]
pub(crate) struct Notifier {
    sink: Arc<dyn NotificationSink>,
}

impl Notifier {
    pub(crate) fn new(sink: Arc<dyn NotificationSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn progress(&self, phase: &str, percent: f64, message: &str) {
        if let Err(e) = self.sink.on_progress(phase, percent, message) {
            warn!(error = %e, "Progress notification failed");
        }
    }

    pub(crate) fn verification(&self, phase: &str, result: &VerificationResult) {
        if let Err(e) = self.sink.on_verification(phase, result) {
            warn!(error = %e, "Verification notification failed");
        }
    }

    pub(crate) fn rollback(&self, step_id: &str, reason: &str) {
        if let Err(e) = self.sink.on_rollback(step_id, reason) {
            warn!(error = %e, "Rollback notification failed");
        }
    }
}
