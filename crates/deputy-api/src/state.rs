//! Application state shared across all route handlers.

use std::sync::Arc;
use std::time::Instant;

use deputy_action::Engine;

/// Shared application state, cloned into every handler.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    /// Bearer token required on every route except `/health`.
    pub api_token: String,
    /// Server start time for uptime calculation.
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, api_token: String) -> Self {
        Self {
            engine,
            api_token,
            start_time: Instant::now(),
        }
    }
}
