//! HTTP adapter over the guard.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::error::GuardError;
use crate::guard::{
    Guard, InboundEvent, UrgentAnchor, UrgentFollowupInput, classify_intent,
    should_forward_urgent_followup,
};

/// Shared state for guard routes.
#[derive(Clone)]
pub struct GuardRouteState {
    pub guard: Arc<Guard>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventRequest {
    user_id: String,
    event: InboundEvent,
    #[serde(default)]
    anchor: Option<UrgentAnchor>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndDeflectionRequest {
    user_id: String,
    contact_phone: String,
    rule_id: String,
}

#[derive(Debug, Deserialize)]
struct IntentRequest {
    text: String,
}

/// Build the guard REST routes.
pub fn guard_routes(state: GuardRouteState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/events", post(handle_event))
        .route("/api/deflections", delete(end_deflection))
        .route("/api/intent", post(intent))
        .route("/api/urgent-followup", post(urgent_followup))
        .with_state(state)
        .layer(ServiceBuilder::new().layer(CorsLayer::permissive()))
}

// ── Health ──────────────────────────────────────────────────────────

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "call-guard"
    }))
}

// ── Guard ───────────────────────────────────────────────────────────

/// POST /api/events
///
/// Match one inbound call or message and return the dispatch outcome.
async fn handle_event(
    State(state): State<GuardRouteState>,
    Json(req): Json<EventRequest>,
) -> Response {
    match state
        .guard
        .handle_event(&req.user_id, &req.event, req.anchor.as_ref())
        .await
    {
        Ok(outcome) => (StatusCode::OK, Json(outcome)).into_response(),
        Err(e) => error_response(e),
    }
}

/// DELETE /api/deflections
///
/// End a running deflection early.
async fn end_deflection(
    State(state): State<GuardRouteState>,
    Json(req): Json<EndDeflectionRequest>,
) -> Response {
    match state
        .guard
        .end_deflection(&req.user_id, &req.contact_phone, &req.rule_id)
        .await
    {
        Ok(ended) => Json(serde_json::json!({ "ended": ended })).into_response(),
        Err(e) => error_response(e),
    }
}

/// POST /api/intent
async fn intent(Json(req): Json<IntentRequest>) -> impl IntoResponse {
    Json(serde_json::json!({ "intent": classify_intent(&req.text) }))
}

/// POST /api/urgent-followup
async fn urgent_followup(Json(input): Json<UrgentFollowupInput>) -> impl IntoResponse {
    Json(serde_json::json!({ "forward": should_forward_urgent_followup(&input) }))
}

fn error_response(err: GuardError) -> Response {
    let status = if err.is_storage_unavailable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::UNPROCESSABLE_ENTITY
    };
    warn!(status = status.as_u16(), "Event rejected: {err}");
    (status, Json(serde_json::json!({ "error": err.to_string() }))).into_response()
}
