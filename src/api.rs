//! HTTP surface: message ingress plus rule/record/settings administration.
//!
//! Thin by design — handlers validate ids and shapes, call into the stores
//! or the gateway, and translate errors to status codes. No forwarding
//! logic lives here.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::jobs::JobQueue;
use crate::pipeline::RelayGateway;
use crate::pipeline::rules::{FilterKind, NewRule};
use crate::store::{RecordStore, RuleStore, SettingsStore};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<RelayGateway>,
    pub rules: Arc<RuleStore>,
    pub records: Arc<RecordStore>,
    pub settings: Arc<SettingsStore>,
    pub queue: Arc<JobQueue>,
}

/// Build the Axum router with all relay routes.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/messages", post(receive_message))
        .route("/api/rules", get(list_rules).post(create_rule))
        .route("/api/rules/{id}", delete(delete_rule))
        .route(
            "/api/rules/{id}/addresses",
            post(add_address).delete(remove_address),
        )
        .route("/api/rules/{id}/filters", post(add_filter))
        .route("/api/filters/{id}", delete(remove_filter))
        .route("/api/records", get(list_records))
        .route("/api/records/{id}", delete(delete_record))
        .route("/api/settings", get(get_settings).put(update_settings))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn internal_error(context: &str, e: impl std::fmt::Display) -> (StatusCode, Json<serde_json::Value>) {
    error!(error = %e, "{context}");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "internal error"})),
    )
}

// ── Health ──────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let queued = state.queue.queued_count().await.unwrap_or(-1);
    Json(serde_json::json!({
        "status": "ok",
        "service": "sms-relay",
        "queued_jobs": queued,
    }))
}

// ── Message ingress ─────────────────────────────────────────────────

#[derive(Deserialize)]
struct ReceivedMessage {
    address: String,
    body: String,
}

/// POST /api/messages — the forwarding entry point.
///
/// 202 means "durably accepted", not "forwarded": matching and the backend
/// call happen later, on the job runner.
async fn receive_message(
    State(state): State<AppState>,
    Json(message): Json<ReceivedMessage>,
) -> impl IntoResponse {
    match state
        .gateway
        .handle_received_message(&message.address, &message.body)
        .await
    {
        Ok(()) => (
            StatusCode::ACCEPTED,
            Json(serde_json::json!({"status": "accepted"})),
        ),
        Err(e) => internal_error("Failed to accept message", e),
    }
}

// ── Rules ───────────────────────────────────────────────────────────

async fn list_rules(State(state): State<AppState>) -> impl IntoResponse {
    match state.rules.get_all().await {
        Ok(rules) => (StatusCode::OK, Json(serde_json::json!(rules))),
        Err(e) => internal_error("Failed to list rules", e),
    }
}

async fn create_rule(
    State(state): State<AppState>,
    Json(body): Json<NewRule>,
) -> impl IntoResponse {
    if body.name.trim().is_empty() || body.type_key.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "name and type_key are required"})),
        );
    }

    match state.rules.add(body).await {
        Ok(rule) => {
            info!(rule_id = %rule.id, name = %rule.name, "Rule created via API");
            (StatusCode::CREATED, Json(serde_json::json!(rule)))
        }
        Err(e) => internal_error("Failed to create rule", e),
    }
}

async fn delete_rule(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let rule_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid rule ID"})),
            );
        }
    };

    match state.rules.delete(rule_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "deleted"})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Rule not found"})),
        ),
        Err(e) => internal_error("Failed to delete rule", e),
    }
}

#[derive(Deserialize)]
struct AddressRequest {
    address: String,
}

async fn add_address(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddressRequest>,
) -> impl IntoResponse {
    let rule_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid rule ID"})),
            );
        }
    };

    match state.rules.apply_address(rule_id, &body.address).await {
        Ok(()) => (StatusCode::OK, Json(serde_json::json!({"status": "added"}))),
        Err(DatabaseError::NotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Rule not found"})),
        ),
        Err(e) => internal_error("Failed to add address", e),
    }
}

async fn remove_address(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<AddressRequest>,
) -> impl IntoResponse {
    let rule_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid rule ID"})),
            );
        }
    };

    match state.rules.remove_address(rule_id, &body.address).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "removed"})),
        ),
        Err(DatabaseError::NotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Rule not found"})),
        ),
        Err(e) => internal_error("Failed to remove address", e),
    }
}

#[derive(Deserialize)]
struct FilterRequest {
    kind: FilterKind,
    text: String,
    #[serde(default)]
    ignore_case: bool,
}

async fn add_filter(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<FilterRequest>,
) -> impl IntoResponse {
    let rule_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid rule ID"})),
            );
        }
    };

    match state
        .rules
        .add_filter(rule_id, body.kind, &body.text, body.ignore_case)
        .await
    {
        Ok(filter) => (StatusCode::CREATED, Json(serde_json::json!(filter))),
        Err(DatabaseError::NotFound { .. }) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Rule not found"})),
        ),
        Err(e) => internal_error("Failed to add filter", e),
    }
}

async fn remove_filter(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let filter_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid filter ID"})),
            );
        }
    };

    match state.rules.remove_filter(filter_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "removed"})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Filter not found"})),
        ),
        Err(e) => internal_error("Failed to remove filter", e),
    }
}

// ── Records ─────────────────────────────────────────────────────────

/// Served from the in-memory snapshot, not a fresh query — this is the
/// reactive list any UI renders.
async fn list_records(State(state): State<AppState>) -> impl IntoResponse {
    let records = state.records.snapshot();
    (StatusCode::OK, Json(serde_json::json!(&*records)))
}

async fn delete_record(State(state): State<AppState>, Path(id): Path<String>) -> impl IntoResponse {
    let record_id = match Uuid::parse_str(&id) {
        Ok(id) => id,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": "Invalid record ID"})),
            );
        }
    };

    match state.records.delete(record_id).await {
        Ok(true) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "deleted"})),
        ),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "Record not found"})),
        ),
        Err(e) => internal_error("Failed to delete record", e),
    }
}

// ── Settings ────────────────────────────────────────────────────────

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!(state.settings.snapshot()))
}

/// Partial update: absent fields are left untouched, blank strings clear.
#[derive(Deserialize)]
struct SettingsUpdate {
    bot_url: Option<String>,
    sender_key: Option<String>,
}

async fn update_settings(
    State(state): State<AppState>,
    Json(body): Json<SettingsUpdate>,
) -> impl IntoResponse {
    if let Some(url) = body.bot_url.as_deref() {
        if let Err(e) = state.settings.set_bot_url(Some(url)).await {
            return internal_error("Failed to update bot URL", e);
        }
    }
    if let Some(key) = body.sender_key.as_deref() {
        if let Err(e) = state.settings.set_sender_key(Some(key)).await {
            return internal_error("Failed to update sender key", e);
        }
    }

    (
        StatusCode::OK,
        Json(serde_json::json!(state.settings.snapshot())),
    )
}
