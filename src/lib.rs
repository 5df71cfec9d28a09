//! Parley Backend Library
//!
//! HTTP relay in front of a local conversational assistant: session
//! management, event bridging, and artifact delivery.

pub mod api;
pub mod assistant;
pub mod bridge;
pub mod session;
