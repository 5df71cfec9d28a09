//! Session/event bridge.
//!
//! Turns the assistant's raw event stream into clean output: classification
//! over drifting event schemas, prompt-echo suppression, artifact
//! announcements, and exactly-once completion per turn.

mod artifacts;
mod classify;
mod completion;
mod echo;
mod error;
mod service;

pub use artifacts::{ArtifactNotice, ArtifactWatcher, DOWNLOAD_ROUTE};
pub use classify::{EventKind, classify};
pub use completion::{CompletionGate, TurnState};
pub use echo::EchoFilter;
pub use error::{BridgeError, BridgeResult};
pub use service::{BridgeConfig, BridgeService, ChatReply, TurnUpdate};
