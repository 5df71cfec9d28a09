//! HTTP API module.
//!
//! REST endpoints for chat, session management, and artifact downloads.

mod error;
mod handlers;
mod routes;
mod state;

#[allow(unused_imports)]
pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
