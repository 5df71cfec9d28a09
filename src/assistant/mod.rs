//! Assistant client adapter.
//!
//! Boundary to the external assistant runtime. Everything upstream of this
//! module treats the assistant as an opaque service: start/ping lifecycle,
//! session creation, and per-turn raw event streams.

mod client;
mod types;

pub use client::{AssistantClient, AssistantSession, ProcessAssistant, ProcessAssistantConfig};
pub use types::{
    AssistantCommand, AssistantMessage, AssistantResponse, RawEvent, SessionSpec, event_session,
};
