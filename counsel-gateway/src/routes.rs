//! Route definitions for Counsel Gateway.
//!
//! Provides HTTP endpoints for chat, session lifecycle, the message log, and
//! health checks. Request and response bodies use camelCase field names.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use counsel_dialogue::{
    DialogueError, InboundMessage, Reply, ReplyOutcome, Role, SafetyVerdict, Session,
    SessionManager, SessionStatus, Turn,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

// ─────────────────────────────────────────────────────────────────────────────
// Request / Response Types
// ─────────────────────────────────────────────────────────────────────────────

/// Chat request body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

/// Chat response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub reply: String,
    pub session_id: String,
    pub status: SessionStatus,
    pub inbound_verdict: SafetyVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outbound_verdict: Option<SafetyVerdict>,
    pub outcome: ReplyOutcome,
}

impl From<Reply> for ChatResponse {
    fn from(reply: Reply) -> Self {
        Self {
            reply: reply.text,
            session_id: reply.session_id,
            status: reply.status,
            inbound_verdict: reply.inbound,
            outbound_verdict: reply.outbound,
            outcome: reply.outcome,
        }
    }
}

/// Error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service: String,
    pub store: String,
    pub generator: String,
}

/// Session record.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub turn_count: u64,
}

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id,
            user_id: session.user_id,
            title: session.title,
            status: session.status,
            created_at: session.created_at,
            last_activity_at: session.last_activity_at,
            turn_count: session.turn_count,
        }
    }
}

/// List sessions response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<SessionResponse>,
    pub total: usize,
}

/// One turn of the message log.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub sequence: u64,
    pub role: Role,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub verdict: SafetyVerdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

impl From<Turn> for TurnResponse {
    fn from(turn: Turn) -> Self {
        Self {
            sequence: turn.sequence,
            role: turn.role,
            text: turn.text,
            timestamp: turn.timestamp,
            verdict: turn.verdict,
            summary: turn.summary,
        }
    }
}

/// Message log response.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnsResponse {
    pub session_id: String,
    pub turns: Vec<TurnResponse>,
}

/// Session status after an explicit lifecycle event.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub session_id: String,
    pub status: SessionStatus,
}

/// Query for listing sessions.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListSessionsQuery {
    pub user_id: Option<String>,
}

/// Query for reading the message log.
#[derive(Debug, Deserialize)]
pub struct TurnsQuery {
    pub limit: Option<usize>,
    pub since: Option<u64>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

/// Build the complete router with all routes.
pub fn build_all_routes(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/chat", post(chat_handler))
        .route("/api/v1/sessions", get(list_sessions_handler))
        .route(
            "/api/v1/sessions/:id",
            get(get_session_handler).delete(delete_session_handler),
        )
        .route("/api/v1/sessions/:id/turns", get(turns_handler))
        .route("/api/v1/sessions/:id/close", post(close_handler))
        .route("/api/v1/sessions/:id/escalate", post(escalate_handler))
        .route("/api/v1/sessions/:id/clear", post(clear_handler))
        .route("/api/v1/sessions/:id/title", post(title_handler))
        .route("/health", get(health_handler))
        .route("/api/v1/health", get(health_handler))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Error Mapping
// ─────────────────────────────────────────────────────────────────────────────

fn error_response(error: impl Into<counsel_common::Error>) -> ApiError {
    let error: counsel_common::Error = error.into();
    let status =
        StatusCode::from_u16(error.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: error.code().to_string(),
        }),
    )
}

/// Error mapping for endpoints that address a session by id: a missing
/// session is the caller's mistake, not a local bug.
fn addressed_error(error: DialogueError) -> ApiError {
    match error {
        DialogueError::UnknownSession(id) => not_found(&id),
        other => error_response(other),
    }
}

fn not_found(session_id: &str) -> ApiError {
    error_response(counsel_common::Error::NotFound(format!(
        "session {session_id}"
    )))
}

// ─────────────────────────────────────────────────────────────────────────────
// Chat
// ─────────────────────────────────────────────────────────────────────────────

async fn chat_handler(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    let mut message = InboundMessage::new(request.session_id, request.text, Utc::now());
    if let Some(user_id) = request.user_id.filter(|u| !u.trim().is_empty()) {
        message = message.with_user(user_id);
    }

    let reply = state.manager.handle(message).await.map_err(error_response)?;
    Ok(Json(reply.into()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

async fn list_sessions_handler(
    State(state): State<AppState>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<Json<ListSessionsResponse>, ApiError> {
    let sessions = state
        .manager
        .list_sessions(query.user_id.as_deref())
        .await
        .map_err(error_response)?;

    let total = sessions.len();
    Ok(Json(ListSessionsResponse {
        sessions: sessions.into_iter().map(Into::into).collect(),
        total,
    }))
}

async fn get_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    match state.manager.get_session(&id, Utc::now()).await {
        Ok(Some(session)) => Ok(Json(session.into())),
        Ok(None) => Err(not_found(&id)),
        Err(e) => Err(error_response(e)),
    }
}

async fn delete_session_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    match state.manager.delete_session(&id).await {
        Ok(true) => Ok(StatusCode::NO_CONTENT),
        Ok(false) => Err(not_found(&id)),
        Err(e) => Err(error_response(e)),
    }
}

async fn turns_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TurnsQuery>,
) -> Result<Json<TurnsResponse>, ApiError> {
    let turns = state
        .manager
        .read_turns(&id, query.limit, query.since)
        .await
        .map_err(addressed_error)?;

    Ok(Json(TurnsResponse {
        session_id: id,
        turns: turns.into_iter().map(Into::into).collect(),
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Lifecycle
// ─────────────────────────────────────────────────────────────────────────────

async fn close_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state
        .manager
        .close(&id, Utc::now())
        .await
        .map_err(addressed_error)?;
    Ok(Json(StatusResponse { session_id: id, status }))
}

async fn escalate_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state
        .manager
        .escalate(&id, Utc::now())
        .await
        .map_err(addressed_error)?;
    Ok(Json(StatusResponse { session_id: id, status }))
}

async fn clear_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let status = state
        .manager
        .clear(&id, Utc::now())
        .await
        .map_err(addressed_error)?;
    Ok(Json(StatusResponse { session_id: id, status }))
}

async fn title_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state.manager.retitle(&id).await.map_err(addressed_error)?;
    Ok(Json(session.into()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let healthy = state.manager.health_check().await;
    let (code, status) = if healthy {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        code,
        Json(HealthResponse {
            status: status.into(),
            version: env!("CARGO_PKG_VERSION").into(),
            service: "counsel-gateway".into(),
            store: state.manager.store_name().into(),
            generator: state.manager.generator_name().into(),
        }),
    )
}
