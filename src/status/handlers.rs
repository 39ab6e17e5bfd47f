//! HTTP API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

use super::server::AppState;
use crate::audio::device::{list_devices, AudioDeviceInfo};
use crate::session::{SessionState, SessionStats};

/// API response wrapper
#[derive(serde::Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}

/// Process-wide summary
#[derive(serde::Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub session_count: usize,
    pub listening_count: usize,
}

pub async fn get_status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<SystemStatus>> {
    let sessions = state.registry.list();
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0) as u64;

    Json(ApiResponse::ok(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: uptime,
        session_count: sessions.len(),
        listening_count: sessions
            .iter()
            .filter(|s| s.state == SessionState::Listening)
            .count(),
    }))
}

pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Vec<SessionStats>>> {
    Json(ApiResponse::ok(state.registry.list()))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<SessionStats>>) {
    match state.registry.get(&id) {
        Some(stats) => (StatusCode::OK, Json(ApiResponse::ok(stats))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("session {} not found", id))),
        ),
    }
}

/// Output devices on this machine
pub async fn get_devices() -> Json<ApiResponse<Vec<AudioDeviceInfo>>> {
    Json(ApiResponse::ok(list_devices()))
}
