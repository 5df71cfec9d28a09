//! Session management module.
//!
//! In-memory registry mapping public session ids to live assistant handles,
//! plus the lazy start/retry logic for the upstream process.

mod models;
mod registry;

pub use models::{Session, SessionInfo};
pub use registry::{RegistryConfig, SessionRegistry};
