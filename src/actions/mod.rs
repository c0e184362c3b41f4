//! Step actions and verification predicates.
//!
//! The engine treats both as opaque: an action reads the fact table and
//! returns new facts, a predicate inspects the fact table after a phase and
//! passes or fails it. Plan files build them through the [`ActionRegistry`].

mod builtin;
mod registry;
mod template;

pub use builtin::*;
pub use registry::*;
pub use template::*;

use crate::external::CredentialProvider;
use crate::models::{DeviceIdentity, FactTable, StepActionError, VerificationResult};
use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value;
use std::sync::Arc;

/// What an action can see while it runs.
pub struct StepContext<'a> {
    pub plan_id: &'a str,
    pub device: &'a DeviceIdentity,
    pub phase: &'a str,
    pub step_id: &'a str,
    /// 1-based attempt number
    pub attempt: u32,
    pub facts: &'a FactTable,
    pub credentials: &'a dyn CredentialProvider,
}

impl StepContext<'_> {
    pub fn credential(&self, name: &str) -> Result<SecretString, StepActionError> {
        Ok(self.credentials.get_credential(name)?)
    }

    pub fn fact(&self, key: &str) -> Result<&Value, StepActionError> {
        self.facts.require(key)
    }
}

/// A side-effecting unit of work, or the compensation undoing one.
///
/// Returns the facts it produced. Compensations return an empty table; the
/// engine removes the original step's facts itself.
#[async_trait]
pub trait StepAction: Send + Sync {
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<FactTable, StepActionError>;

    /// Short label for logs and status output.
    fn describe(&self) -> String {
        "custom action".to_string()
    }
}

/// Independent check run after every step of a phase completed.
#[async_trait]
pub trait VerificationPredicate: Send + Sync {
    async fn verify(&self, phase: &str, facts: &FactTable) -> VerificationResult;
}

/// Adapter turning a synchronous closure into a [`StepAction`].
pub struct FnAction<F> {
    label: String,
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&StepContext<'_>) -> Result<FactTable, StepActionError> + Send + Sync,
{
    pub fn new(label: impl Into<String>, f: F) -> Self {
        Self {
            label: label.into(),
            f,
        }
    }
}

#[async_trait]
impl<F> StepAction for FnAction<F>
where
    F: Fn(&StepContext<'_>) -> Result<FactTable, StepActionError> + Send + Sync,
{
    async fn execute(&self, ctx: &StepContext<'_>) -> Result<FactTable, StepActionError> {
        (self.f)(ctx)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

pub fn action_fn<F>(f: F) -> Arc<dyn StepAction>
where
    F: Fn(&StepContext<'_>) -> Result<FactTable, StepActionError> + Send + Sync + 'static,
{
    Arc::new(FnAction::new("closure", f))
}

/// Adapter turning a synchronous closure into a [`VerificationPredicate`].
pub struct FnPredicate<F> {
    f: F,
}

#[async_trait]
impl<F> VerificationPredicate for FnPredicate<F>
where
    F: Fn(&str, &FactTable) -> VerificationResult + Send + Sync,
{
    async fn verify(&self, phase: &str, facts: &FactTable) -> VerificationResult {
        (self.f)(phase, facts)
    }
}

pub fn predicate_fn<F>(f: F) -> Arc<dyn VerificationPredicate>
where
    F: Fn(&str, &FactTable) -> VerificationResult + Send + Sync + 'static,
{
    Arc::new(FnPredicate { f })
}
