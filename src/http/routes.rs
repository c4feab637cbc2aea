//! HTTP route definitions

use axum::{
    extract::{Path, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::app::AppState;
use crate::experiment::sequencer::SessionSnapshot;
use crate::experiment::{Ecu, ParticipantId, SessionError};
use crate::lobby::service::LobbyError;
use crate::util::time::uptime_secs;
use crate::ws::handler::ws_handler;

/// Build the application router
pub fn build_router(state: AppState) -> Router {
    // CORS configuration - support multiple origins (comma-separated in CLIENT_ORIGIN)
    let allowed_origins: Vec<header::HeaderValue> = state
        .config
        .client_origin
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(allowed_origins)
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health_handler))
        .route("/participants/:id", get(participant_handler))
        .route("/ws", get(ws_handler))
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Health endpoint
// ============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    uptime_secs: u64,
    active_sessions: usize,
    seated_participants: usize,
    waiting_participants: usize,
    open_connections: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let waiting_participants = state.lobby.waiting_count().await;

    Json(HealthResponse {
        status: "ok",
        uptime_secs: uptime_secs(),
        active_sessions: state.sessions.active_sessions(),
        seated_participants: state.sessions.total_participants(),
        waiting_participants,
        open_connections: state.hub.len(),
    })
}

// ============================================================================
// Participant status
// ============================================================================

#[derive(Serialize)]
struct ParticipantStatus {
    participant: ParticipantId,
    connected: bool,
    session: Option<SessionSnapshot>,
    /// Final win once the session has ended
    settlement: Option<Ecu>,
    /// Payout recorded at checkout
    bonus: Option<f64>,
}

async fn participant_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ParticipantStatus>, AppError> {
    let participant = ParticipantId::new(id);
    if !state.codes.is_authorized(&participant) {
        return Err(AppError::NotFound(format!("participant {participant}")));
    }

    let session = match state.lobby.session_of(&participant) {
        Some(handle) => match handle.snapshot().await {
            Ok(snapshot) => Some(snapshot),
            Err(SessionError::Closed) => None,
            Err(e) => return Err(AppError::Internal(e.to_string())),
        },
        None => None,
    };

    let settlement = match state.lobby.settle(&participant).await {
        Ok(win) => Some(win),
        Err(LobbyError::NotSeated(_)) | Err(LobbyError::Session(SessionError::Ledger(_))) => None,
        Err(e) => return Err(AppError::Internal(e.to_string())),
    };

    Ok(Json(ParticipantStatus {
        connected: state.hub.is_connected(&participant),
        bonus: state.codes.win(&participant),
        participant,
        session,
        settlement,
    }))
}

// ============================================================================
// Error handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };

        let body = serde_json::json!({
            "error": message
        });

        (status, Json(body)).into_response()
    }
}
