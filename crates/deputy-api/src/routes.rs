//! Router setup with all API routes and middleware.
//!
//! Configures the axum Router with CORS, tracing, compression,
//! and all endpoint handlers.

use std::future::Future;

use axum::extract::DefaultBodyLimit;
use axum::http::{header, HeaderValue, Method};
use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use deputy_core::config::ApiConfig;
use deputy_core::error::DeputyError;

use crate::handlers;
use crate::state::AppState;

/// Create the axum Router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // Local dashboards only: the configured port on both loopback names.
    let port = state.engine.config().api.port;
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", port),
        format!("http://localhost:{}", port),
    ]
    .iter()
    .filter_map(|origin| origin.parse::<HeaderValue>().ok())
    .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]);

    // Routes that do NOT require authentication.
    let public_routes = Router::new().route("/health", get(handlers::health));

    let protected_routes = Router::new()
        .route(
            "/actions",
            get(handlers::list_actions).post(handlers::submit_action),
        )
        .route("/actions/{id}", get(handlers::get_action))
        .route("/actions/{id}/cancel", post(handlers::cancel_action))
        .route("/actions/{id}/amend", post(handlers::amend_action))
        .route("/actions/{id}/verify", get(handlers::verify_action))
        .route(
            "/pause",
            get(handlers::pause_status).post(handlers::pause),
        )
        .route("/resume", post(handlers::resume))
        .route("/audit", get(handlers::list_audit))
        .route("/audit/verify", get(handlers::verify_audit))
        .route("/trust/{account_id}", get(handlers::trust_status))
        .route("/trust/{account_id}/advance", post(handlers::advance_trust))
        .route("/trust/{account_id}/downgrade", post(handlers::downgrade_trust))
        .route(
            "/trust/{account_id}/eligibility",
            get(handlers::trust_eligibility),
        )
        .route("/trust/{account_id}/history", get(handlers::trust_history))
        .route("/triggers", post(handlers::handle_trigger))
        .route(
            "/policies",
            get(handlers::list_policies).post(handlers::add_policy),
        )
        .route("/policies/{id}/enabled", post(handlers::set_policy_enabled))
        .route("/events", get(handlers::events))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            crate::auth::require_auth,
        ));

    public_routes
        .merge(protected_routes)
        .layer(DefaultBodyLimit::max(256 * 1024))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Start the HTTP server on the configured address.
///
/// Returns once `shutdown` resolves and in-flight requests have finished.
pub async fn start_server(
    config: &ApiConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), DeputyError> {
    let addr = format!("{}:{}", config.bind, config.port);
    let router = create_router(state);

    tracing::info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
        DeputyError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to bind {}: {}", addr, e),
        ))
    })?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
