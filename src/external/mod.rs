//! Collaborators outside the engine: credential providers and
//! notification sinks.

mod credentials;
mod notify;

pub use credentials::*;
pub use notify::*;
