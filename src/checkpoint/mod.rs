//! Checkpointing for resumable plan execution.
//!
//! Provides:
//! - `TransactionLog`: Append-only record of every step transition
//! - `Checkpoint`: Snapshot of plan progress persisted after each transition
//! - `CheckpointStore`: Atomic, lock-protected persistence of checkpoints
//! - `PlanArchive`: The plan file each run started from

mod archive;
mod state;
mod store;
mod transaction;

pub use archive::*;
pub use state::*;
pub use store::*;
pub use transaction::*;
