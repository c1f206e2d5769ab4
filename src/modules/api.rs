//! HTTP surface for viewers.
//!
//! Session lifecycle (start/stop/ping), per-viewer playlist delivery, key
//! retrieval and invoice queries. All request/response bodies are camelCase
//! JSON except the playlist (m3u8 text), segment bytes and the key
//! endpoint, which answers with the raw segment key hex on 200 and a
//! plain-text explanation on 402.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::config::StreamerSettings;

use super::gate::{AccessGate, GateError, KeyDecision};
use super::session::{Invoice, SessionError, SessionRegistry};

/// Shared state for all handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub gate: Arc<AccessGate>,
    pub settings: Arc<StreamerSettings>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/start_viewer_session", post(start_viewer_session))
        .route("/stop_viewer_session", post(stop_viewer_session))
        .route("/ping_viewer_session", post(ping_viewer_session))
        .route("/viewer_playlist", get(viewer_playlist))
        .route("/viewer_key", get(viewer_key))
        .route("/viewer_segment", get(viewer_segment))
        .route("/get_all_invoice", get(get_all_invoice))
        .route("/get_paid_invoice", get(get_paid_invoice))
        .route("/get_unpaid_invoice", get(get_unpaid_invoice))
        .with_state(state)
}

// ==================== Request/Response Types ====================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerRequest {
    pub viewer_name: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSessionResponse {
    pub viewer_name: String,
    pub playlist: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerQuery {
    pub viewer_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerKeyQuery {
    pub viewer_name: String,
    pub env_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerSegmentQuery {
    pub viewer_name: String,
    pub file: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllInvoicesResponse {
    pub all_invoices: Vec<Invoice>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaidInvoicesResponse {
    pub paid_invoices: Vec<Invoice>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnpaidInvoicesResponse {
    pub unpaid_invoices: Vec<Invoice>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: impl Into<String>) -> Self {
        ErrorResponse {
            error: error.to_string(),
            message: message.into(),
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.error.as_str() {
            "session_not_found" => StatusCode::NOT_FOUND,
            "invalid_request" => StatusCode::BAD_REQUEST,
            "segment_not_found" => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

impl From<SessionError> for ErrorResponse {
    fn from(e: SessionError) -> Self {
        ErrorResponse::new("session_not_found", e.to_string())
    }
}

// ==================== Handlers ====================

async fn banner() -> &'static str {
    "satstream backend is running"
}

async fn start_viewer_session(
    State(state): State<AppState>,
    Json(request): Json<ViewerRequest>,
) -> Result<Json<StartSessionResponse>, ErrorResponse> {
    if request.viewer_name.trim().is_empty() {
        return Err(ErrorResponse::new(
            "invalid_request",
            "viewerName must not be empty",
        ));
    }
    let info = state
        .registry
        .start_session(&request.viewer_name, Utc::now())
        .await;
    info!("Viewer session started: {}", info.viewer_name);
    Ok(Json(StartSessionResponse {
        playlist: format!(
            "{}/viewer_playlist?viewerName={}",
            state.settings.public_base_url, info.viewer_name
        ),
        viewer_name: info.viewer_name,
    }))
}

async fn stop_viewer_session(
    State(state): State<AppState>,
    Json(request): Json<ViewerRequest>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    state.registry.stop_session(&request.viewer_name).await?;
    info!("Viewer session stopped: {}", request.viewer_name);
    Ok(Json(StatusResponse {
        status: "stopped".to_string(),
    }))
}

async fn ping_viewer_session(
    State(state): State<AppState>,
    Json(request): Json<ViewerRequest>,
) -> Result<Json<StatusResponse>, ErrorResponse> {
    state.registry.ping(&request.viewer_name, Utc::now()).await?;
    Ok(Json(StatusResponse {
        status: "ok".to_string(),
    }))
}

async fn viewer_playlist(
    State(state): State<AppState>,
    Query(query): Query<ViewerQuery>,
) -> Result<Response, ErrorResponse> {
    if !state.registry.contains(&query.viewer_name).await {
        return Err(SessionError::NotFound(query.viewer_name).into());
    }

    let playlist = tokio::fs::read_to_string(&state.settings.hls_playlist_path)
        .await
        .map_err(|e| {
            warn!("Playlist read failed: {}", e);
            ErrorResponse::new("playlist_unavailable", "stream playlist is not available")
        })?;

    let rewritten = state.gate.rewrite_playlist(&playlist, &query.viewer_name);
    Ok((
        [(header::CONTENT_TYPE, "application/vnd.apple.mpegurl")],
        rewritten,
    )
        .into_response())
}

/// The payment-gated key endpoint: 200 with the raw segment key hex, 402
/// when the session is unhealthy, 400 for a malformed envelope key, 404
/// for an unknown viewer.
async fn viewer_key(
    State(state): State<AppState>,
    Query(query): Query<ViewerKeyQuery>,
) -> Response {
    match state
        .gate
        .release_key(&query.viewer_name, &query.env_key)
        .await
    {
        Ok(KeyDecision::Granted(segment_key)) => {
            (StatusCode::OK, hex::encode(segment_key)).into_response()
        }
        Ok(KeyDecision::PaymentRequired { unpaid }) => (
            StatusCode::PAYMENT_REQUIRED,
            format!(
                "payment required: viewer {} has {} unpaid invoice(s)",
                query.viewer_name, unpaid
            ),
        )
            .into_response(),
        Err(GateError::Key(e)) => {
            ErrorResponse::new("invalid_request", e.to_string()).into_response()
        }
        Err(GateError::Session(e)) => ErrorResponse::from(e).into_response(),
    }
}

async fn viewer_segment(
    State(state): State<AppState>,
    Query(query): Query<ViewerSegmentQuery>,
) -> Result<Response, ErrorResponse> {
    if !state.registry.contains(&query.viewer_name).await {
        return Err(SessionError::NotFound(query.viewer_name).into());
    }
    // the playlist rewrite only ever emits bare file names
    if query.file.contains('/') || query.file.contains("..") {
        return Err(ErrorResponse::new(
            "invalid_request",
            "segment file name must be bare",
        ));
    }

    let path = state.settings.hls_output_dir.join(&query.file);
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|_| ErrorResponse::new("segment_not_found", format!("no segment {}", query.file)))?;
    Ok(([(header::CONTENT_TYPE, "video/mp2t")], bytes).into_response())
}

async fn get_all_invoice(
    State(state): State<AppState>,
    Query(query): Query<ViewerQuery>,
) -> Result<Json<AllInvoicesResponse>, ErrorResponse> {
    let all_invoices = state.registry.all_invoices(&query.viewer_name).await?;
    Ok(Json(AllInvoicesResponse { all_invoices }))
}

async fn get_paid_invoice(
    State(state): State<AppState>,
    Query(query): Query<ViewerQuery>,
) -> Result<Json<PaidInvoicesResponse>, ErrorResponse> {
    let paid_invoices = state.registry.paid_invoices(&query.viewer_name).await?;
    Ok(Json(PaidInvoicesResponse { paid_invoices }))
}

async fn get_unpaid_invoice(
    State(state): State<AppState>,
    Query(query): Query<ViewerQuery>,
) -> Result<Json<UnpaidInvoicesResponse>, ErrorResponse> {
    let unpaid_invoices = state.registry.unpaid_invoices(&query.viewer_name).await?;
    Ok(Json(UnpaidInvoicesResponse { unpaid_invoices }))
}
