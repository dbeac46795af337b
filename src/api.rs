//! REST API server for the budget chat agent
//!
//! Exposes one conversation turn per request. Session state lives in a
//! `SessionStore` and is only replaced after a turn succeeds. Requests for
//! the same session are served one at a time.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::Agent;
use crate::memory::SessionStore;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub session_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub session_id: String,
    pub answer: String,
    pub rounds: u32,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<serde_json::Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub agent: Arc<Agent>,
    pub sessions: SessionStore,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint
/// =============================

async fn chat_handler(
    State(state): State<ApiState>,
    Json(req): Json<ChatRequest>,
) -> (StatusCode, Json<ApiResponse>) {
    let message = req.message.trim();
    if message.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("Message must not be empty".into())),
        );
    }

    let session_id = req
        .session_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(session_id = %session_id, "Chat request received");

    // held until the turn's state is written back
    let mut conversation = state.sessions.checkout(&session_id).await;

    match state.agent.run_turn(conversation.clone(), message).await {
        Ok(outcome) => {
            let reply = ChatReply {
                session_id: session_id.clone(),
                answer: outcome.answer,
                rounds: outcome.rounds,
            };
            *conversation = outcome.state;
            (StatusCode::OK, Json(ApiResponse::success(reply)))
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Turn failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::error(format!("Agent failed: {}", e))),
            )
        }
    }
}

/// =============================
/// Session Endpoint
/// =============================

async fn session_handler(
    State(state): State<ApiState>,
    Path(session_id): Path<String>,
) -> (StatusCode, Json<ApiResponse>) {
    match state.sessions.get(&session_id).await {
        Some(conversation) => (StatusCode::OK, Json(ApiResponse::success(conversation))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("Unknown session: {}", session_id))),
        ),
    }
}

/// =============================
/// Router
/// =============================

pub fn create_router(agent: Arc<Agent>, sessions: SessionStore) -> Router {
    let state = ApiState { agent, sessions };

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", post(chat_handler))
        .route("/api/sessions/:session_id", get(session_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    agent: Arc<Agent>,
    port: u16,
    max_sessions: usize,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(agent, SessionStore::with_max_sessions(max_sessions));

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
