//! Route handler functions for all API endpoints.
//!
//! Each handler extracts query/path parameters via axum extractors,
//! calls into the engine, and returns JSON responses. Engine calls hit
//! SQLite synchronously; they are short single-row operations.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

use deputy_action::{
    Confirmation, Eligibility, NewPolicy, PolicyMatch, SubmitRequest, TrailVerification,
    TrustStatus,
};
use deputy_core::audit::{AuditRecord, ChainVerification};
use deputy_core::events::EngineEvent;
use deputy_core::policy::{Policy, TriggerEvent};
use deputy_core::types::{Action, ActionState, Actor, Origin, PauseScope, PauseState, Timestamp};
use deputy_storage::{ActionFilter, AuditQuery, TrustChange};

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_LIST_LIMIT: u32 = 100;
const MAX_LIST_LIMIT: u32 = 1000;

// =============================================================================
// Query parameter types
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ListActionsParams {
    pub account_id: Option<String>,
    pub state: Option<String>,
    pub limit: Option<u32>,
}

/// `since`/`until` are epoch milliseconds.
#[derive(Debug, Deserialize)]
pub struct AuditParams {
    pub account_id: Option<String>,
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub action_id: Option<Uuid>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub struct AccountParams {
    pub account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TriggerParams {
    /// Evaluate without submitting anything.
    #[serde(default)]
    pub dry_run: bool,
}

// =============================================================================
// Request bodies
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct SubmitActionRequest {
    pub account_id: String,
    pub action_type: String,
    pub payload: serde_json::Value,
    pub undo_window_secs: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct AmendRequest {
    pub payload: serde_json::Value,
}

/// Body for `/pause` and `/resume`. `scope` is `global` or `account`.
#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub scope: String,
    pub account_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    pub paused_by: Option<String>,
}

impl PauseRequest {
    fn to_scope(&self) -> Result<PauseScope, ApiError> {
        match (self.scope.as_str(), &self.account_id) {
            ("global", _) => Ok(PauseScope::Global),
            ("account", Some(id)) if !id.trim().is_empty() => Ok(PauseScope::Account(id.clone())),
            ("account", _) => Err(ApiError::BadRequest(
                "account_id is required for an account pause".to_string(),
            )),
            (other, _) => Err(ApiError::BadRequest(format!(
                "Unknown pause scope '{}'. Valid values: global, account",
                other
            ))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DowngradeRequest {
    pub level: u8,
}

#[derive(Debug, Deserialize)]
pub struct SetEnabledRequest {
    pub enabled: bool,
}

// =============================================================================
// Response types
// =============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub paused_scopes: usize,
}

#[derive(Debug, Serialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub count: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        Self {
            count: items.len(),
            items,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub action_id: Uuid,
    /// False when the undo window had already closed.
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
pub struct AmendResponse {
    pub action_id: Uuid,
    pub amended: bool,
    pub replacement: Option<Action>,
}

#[derive(Debug, Serialize)]
pub struct ResumeResponse {
    pub scope: PauseScope,
    /// False when the scope was not paused.
    pub resumed: bool,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum TriggerResponse {
    Submitted { actions: Vec<Action> },
    DryRun { matches: Vec<PolicyMatch> },
}

fn clamp_limit(limit: Option<u32>) -> u32 {
    limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT)
}

fn require_account(account_id: Option<String>) -> Result<String, ApiError> {
    match account_id {
        Some(id) if !id.trim().is_empty() => Ok(id),
        _ => Err(ApiError::BadRequest(
            "account_id query parameter is required".to_string(),
        )),
    }
}

// =============================================================================
// Health
// =============================================================================

/// GET /health - liveness plus a count of active pause switches.
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let paused_scopes = state
        .engine
        .pause_status()
        .iter()
        .filter(|s| s.paused)
        .count();

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        paused_scopes,
    })
}

// =============================================================================
// Actions
// =============================================================================

/// POST /actions - submit a human-originated action.
pub async fn submit_action(
    State(state): State<AppState>,
    Json(body): Json<SubmitActionRequest>,
) -> Result<(StatusCode, Json<Action>), ApiError> {
    let mut request =
        SubmitRequest::new(body.account_id, body.action_type, body.payload, Origin::Human);
    if let Some(secs) = body.undo_window_secs {
        request = request.with_undo_window(Duration::from_secs(secs));
    }
    let action = state.engine.submit_action(request)?;
    Ok((StatusCode::CREATED, Json(action)))
}

/// GET /actions - list actions, newest first.
pub async fn list_actions(
    State(state): State<AppState>,
    Query(params): Query<ListActionsParams>,
) -> Result<Json<ListResponse<Action>>, ApiError> {
    let action_state = match params.state.as_deref() {
        Some(s) => Some(s.parse::<ActionState>().map_err(ApiError::BadRequest)?),
        None => None,
    };
    let filter = ActionFilter {
        account_id: params.account_id,
        state: action_state,
        limit: Some(clamp_limit(params.limit)),
    };
    let actions = state.engine.list_actions(&filter)?;
    Ok(Json(actions.into()))
}

/// GET /actions/{id}
pub async fn get_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Action>, ApiError> {
    Ok(Json(state.engine.get_action(id)?))
}

/// POST /actions/{id}/cancel - undo within the window.
pub async fn cancel_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<CancelResponse>, ApiError> {
    let cancelled = state.engine.cancel_action(id, Actor::User)?;
    Ok(Json(CancelResponse {
        action_id: id,
        cancelled,
    }))
}

/// POST /actions/{id}/amend - supersede a pending action with a new payload.
pub async fn amend_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<AmendRequest>,
) -> Result<Json<AmendResponse>, ApiError> {
    let replacement = state.engine.amend_action(id, body.payload)?;
    Ok(Json(AmendResponse {
        action_id: id,
        amended: replacement.is_some(),
        replacement,
    }))
}

/// GET /actions/{id}/verify - check the action's audit trail is complete.
pub async fn verify_action(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TrailVerification>, ApiError> {
    Ok(Json(state.engine.verify_action_trail(id)?))
}

// =============================================================================
// Pause
// =============================================================================

/// POST /pause - engage the emergency switch.
pub async fn pause(
    State(state): State<AppState>,
    Json(body): Json<PauseRequest>,
) -> Result<Json<PauseState>, ApiError> {
    let scope = body.to_scope()?;
    let reason = body.reason.as_deref().unwrap_or("emergency pause");
    let paused = state.engine.pause(scope, reason, body.paused_by)?;
    Ok(Json(paused))
}

/// POST /resume
pub async fn resume(
    State(state): State<AppState>,
    Json(body): Json<PauseRequest>,
) -> Result<Json<ResumeResponse>, ApiError> {
    let scope = body.to_scope()?;
    let resumed = state.engine.resume(scope.clone())?;
    Ok(Json(ResumeResponse { scope, resumed }))
}

/// GET /pause - every persisted switch.
pub async fn pause_status(State(state): State<AppState>) -> Json<ListResponse<PauseState>> {
    Json(state.engine.pause_status().into())
}

// =============================================================================
// Audit
// =============================================================================

/// GET /audit - an account's audit records in chain order.
pub async fn list_audit(
    State(state): State<AppState>,
    Query(params): Query<AuditParams>,
) -> Result<Json<ListResponse<AuditRecord>>, ApiError> {
    let account_id = require_account(params.account_id)?;
    if let (Some(since), Some(until)) = (params.since, params.until) {
        if since > until {
            return Err(ApiError::BadRequest("since must not be after until".to_string()));
        }
    }
    let query = AuditQuery {
        account_id,
        since: params.since.map(Timestamp),
        until: params.until.map(Timestamp),
        action_id: params.action_id,
        limit: params.limit,
    };
    let records = state.engine.list_audit(&query)?;
    Ok(Json(records.into()))
}

/// GET /audit/verify - recompute the account's hash chain.
pub async fn verify_audit(
    State(state): State<AppState>,
    Query(params): Query<AccountParams>,
) -> Result<Json<ChainVerification>, ApiError> {
    let account_id = require_account(params.account_id)?;
    Ok(Json(state.engine.verify_audit(&account_id)?))
}

// =============================================================================
// Trust
// =============================================================================

/// GET /trust/{account_id} - level plus upgrade eligibility.
pub async fn trust_status(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<TrustStatus>, ApiError> {
    Ok(Json(state.engine.trust_status(&account_id)?))
}

/// POST /trust/{account_id}/advance - requires `{"confirmed": true}`.
pub async fn advance_trust(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(confirmation): Json<Confirmation>,
) -> Result<Json<TrustChange>, ApiError> {
    let change = state
        .engine
        .advance_trust_level(&account_id, &confirmation)?;
    Ok(Json(change))
}

/// POST /trust/{account_id}/downgrade
pub async fn downgrade_trust(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
    Json(body): Json<DowngradeRequest>,
) -> Result<Json<TrustChange>, ApiError> {
    let change = state
        .engine
        .downgrade_trust_level(&account_id, body.level)?;
    Ok(Json(change))
}

/// GET /trust/{account_id}/eligibility
pub async fn trust_eligibility(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<Eligibility>, ApiError> {
    Ok(Json(state.engine.check_upgrade_eligibility(&account_id)?))
}

/// GET /trust/{account_id}/history
pub async fn trust_history(
    State(state): State<AppState>,
    Path(account_id): Path<String>,
) -> Result<Json<ListResponse<TrustChange>>, ApiError> {
    Ok(Json(state.engine.trust_history(&account_id)?.into()))
}

// =============================================================================
// Policies and triggers
// =============================================================================

/// POST /triggers - feed an event to the policy engine.
pub async fn handle_trigger(
    State(state): State<AppState>,
    Query(params): Query<TriggerParams>,
    Json(event): Json<TriggerEvent>,
) -> Result<Json<TriggerResponse>, ApiError> {
    if params.dry_run {
        let matches = state.engine.evaluate_trigger(&event)?;
        return Ok(Json(TriggerResponse::DryRun { matches }));
    }
    let actions = state.engine.handle_trigger(&event)?;
    Ok(Json(TriggerResponse::Submitted { actions }))
}

/// GET /policies
pub async fn list_policies(
    State(state): State<AppState>,
    Query(params): Query<AccountParams>,
) -> Result<Json<ListResponse<Policy>>, ApiError> {
    let account_id = require_account(params.account_id)?;
    Ok(Json(state.engine.list_policies(&account_id)?.into()))
}

/// POST /policies
pub async fn add_policy(
    State(state): State<AppState>,
    Json(policy): Json<NewPolicy>,
) -> Result<(StatusCode, Json<Policy>), ApiError> {
    let policy = state.engine.add_policy(policy)?;
    Ok((StatusCode::CREATED, Json(policy)))
}

/// POST /policies/{id}/enabled
pub async fn set_policy_enabled(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SetEnabledRequest>,
) -> Result<Json<Policy>, ApiError> {
    Ok(Json(state.engine.set_policy_enabled(id, body.enabled)?))
}

// =============================================================================
// Event stream
// =============================================================================

/// SSE event name: the `event` tag serde writes for the variant.
fn event_name(value: &serde_json::Value) -> String {
    value
        .get("event")
        .and_then(|v| v.as_str())
        .unwrap_or("message")
        .to_string()
}

/// GET /events - engine events as server-sent events.
///
/// Lagged receivers skip the events they missed.
pub async fn events(
    State(state): State<AppState>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>> + Send> {
    let rx = state.engine.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result: Result<EngineEvent, _>| {
        let event = result.ok()?;
        let value = serde_json::to_value(&event).ok()?;
        Some(Ok(Event::default()
            .event(event_name(&value))
            .data(value.to_string())))
    });

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}
