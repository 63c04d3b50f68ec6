//! Deputy API crate - axum HTTP server, route handlers, SSE event stream.
//!
//! Exposes the action engine to collaborators: submitting and cancelling
//! actions, the pause switch, audit export and verification, trust level
//! changes, policy management, and trigger ingestion.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod routes;
pub mod state;

pub use error::ApiError;
pub use routes::{create_router, start_server};
pub use state::AppState;
