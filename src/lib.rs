//! handover - resumable, compensating workflow engine for migrating managed
//! devices between device-management providers.
//!
//! ## Architecture
//!
//! - **Checkpoint store**: durable per-plan state, saved after every step
//!   transition
//! - **Step executor**: runs steps in order with retries and timeouts,
//!   merging their outputs into the fact table
//! - **Compensation engine**: unwinds a failed phase newest-first
//! - **Verification gate**: independent check at each phase boundary
//! - **Resumption trigger**: gets the engine re-invoked after a restart
//!
//! Device-management operations themselves are opaque [`StepAction`]s,
//! built in code or from plan files through the [`ActionRegistry`].

pub mod actions;
pub mod checkpoint;
pub mod engine;
pub mod external;
pub mod models;

// Re-exports for convenience
pub use actions::{
    action_fn, predicate_fn, ActionRegistry, PlanDefinition, StepAction, StepContext,
    VerificationPredicate,
};
pub use checkpoint::{
    Checkpoint, CheckpointStore, CompletionReceipt, FileCheckpointStore, MemoryCheckpointStore,
    PlanArchive, StepStatus,
};
pub use engine::{
    CommandTrigger, Engine, MarkerFileTrigger, NoopTrigger, PlanStatus, Resolution,
    ResumptionTrigger,
};
pub use external::{
    CredentialProvider, EnvCredentialProvider, NotificationSink, ProgressSink, TracingSink,
};
pub use models::{
    Config, EngineError, FactTable, MigrationPlan, Phase, PlanOutcome, PlanResult, Result, Step,
};
