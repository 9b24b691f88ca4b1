//! HTTP API module.
//!
//! Thin REST and WebSocket surface over the engine control channel.

mod error;
pub mod handlers;
mod routes;
mod state;
pub mod ws;

pub use error::{ApiError, ApiResult, ErrorResponse};
pub use routes::create_router;
pub use state::AppState;
