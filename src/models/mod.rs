//! Core data models for handover.
//!
//! - `plan`: phases, steps and their policies
//! - `facts`: the table steps use to hand values forward
//! - `outcome`: what a run reports back
//! - `config` / `error`: ambient configuration and the error taxonomy

mod config;
mod error;
mod facts;
mod outcome;
mod plan;

pub use config::*;
pub use error::*;
pub use facts::*;
pub use outcome::*;
pub use plan::*;
