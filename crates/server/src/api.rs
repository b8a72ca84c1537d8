//! Request handlers.
//!
//! Errors are returned as `(StatusCode, Json({"error": …}))`.

use std::fmt::Display;
use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{error, info};

use streamload_core::ident::derive_table_name;
use streamload_core::{parse_separator, JobId, JobPayload};
use streamload_queue::QueueError;

use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

fn api_error(status: StatusCode, message: impl Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

fn bad_request(message: impl Display) -> ApiError {
    api_error(StatusCode::BAD_REQUEST, message)
}

fn queue_error(e: QueueError) -> ApiError {
    let status = StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if status.is_server_error() {
        error!(error = %e, "job store request failed");
    }
    api_error(status, e)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

// ── Health ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ── Submission ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFileRequest {
    #[serde(alias = "fileUrl")]
    pub source_url: Option<String>,
    pub separator: Option<String>,
    pub table_name: Option<String>,
}

/// POST /download_file: enqueue a job that loads a remote CSV file into a new table.
///
/// Without `tableName` the table is named after the file plus the current
/// unix time in milliseconds.
pub async fn download_file(
    State(state): State<Arc<AppState>>,
    body: Result<Json<DownloadFileRequest>, JsonRejection>,
) -> ApiResult {
    let Json(req) = body.map_err(|e| bad_request(e.body_text()))?;

    let source_url = non_empty(req.source_url).ok_or_else(|| bad_request("sourceUrl not specified"))?;
    let separator = parse_separator(req.separator.as_deref()).map_err(bad_request)?;
    let table_name = non_empty(req.table_name)
        .unwrap_or_else(|| derive_table_name(&source_url, chrono::Utc::now().timestamp_millis()));

    let payload = JobPayload::new(source_url, separator, table_name).map_err(bad_request)?;
    let table_name = payload.table_name.clone();
    let url = payload.source_url.clone();

    let job_id = state
        .store
        .enqueue(&state.queue, payload)
        .await
        .map_err(queue_error)?;

    info!(job_id = %job_id, table = %table_name, url = %url, "download job enqueued");
    Ok(Json(json!({ "jobId": job_id, "tableName": table_name })))
}

// ── Status & cancellation ───────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobQuery {
    pub job_id: Option<String>,
}

impl JobQuery {
    fn job_id(self) -> Result<JobId, ApiError> {
        let raw = non_empty(self.job_id).ok_or_else(|| bad_request("jobId not specified"))?;
        raw.parse::<JobId>()
            .map_err(|e| bad_request(format!("invalid jobId '{}': {}", raw, e)))
    }
}

/// GET /job_status?jobId=: current state of a job.
pub async fn job_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobQuery>,
) -> ApiResult {
    let id = query.job_id()?;
    let job = state
        .store
        .get(id)
        .await
        .map_err(queue_error)?
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, QueueError::NotFound(id)))?;

    Ok(Json(json!({
        "jobId": job.id,
        "state": job.state,
        "tableName": job.payload.table_name,
        "sourceUrl": job.payload.source_url,
        "retryCount": job.retry_count,
        "lastError": job.last_error,
        "createdAt": job.created_at,
        "startedAt": job.started_at,
        "completedAt": job.completed_at,
    })))
}

/// GET /job_cancel?jobId=: cancel a job that has not finished yet.
///
/// A job already being loaded stops at its next cancellation check.
pub async fn job_cancel(
    State(state): State<Arc<AppState>>,
    Query(query): Query<JobQuery>,
) -> ApiResult {
    let id = query.job_id()?;
    state.store.cancel(id).await.map_err(queue_error)?;

    info!(job_id = %id, "job cancelled");
    Ok(Json(json!({ "jobId": id, "state": "cancelled" })))
}
