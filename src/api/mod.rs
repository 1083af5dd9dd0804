//! Operational HTTP surface: read-only views over the log stream, the job
//! registry and the execution history.

use crate::config::ApiConfig;
use crate::logger::{LogFilter, LogLevel, Logger, LoggerError};
use crate::models::{ExecutionFilter, JobFilter};
use crate::storage::StoragePort;
use anyhow::Context as _;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    pub storage: Arc<dyn StoragePort>,
    pub logger: Logger,
}

#[derive(Debug, Serialize)]
struct HttpResponse<T: Serialize> {
    message: String,
    status: u16,
    data: Option<T>,
}

fn respond<T: Serialize>(
    status: StatusCode,
    data: Option<T>,
    message: impl Into<String>,
) -> Response {
    let body = HttpResponse { message: message.into(), status: status.as_u16(), data };
    (status, Json(body)).into_response()
}

fn bad_request(message: impl Into<String>) -> Response {
    respond::<()>(StatusCode::BAD_REQUEST, None, message)
}

fn internal_error(message: impl Into<String>) -> Response {
    respond::<()>(StatusCode::INTERNAL_SERVER_ERROR, None, message)
}

fn parse_rfc3339(name: &str, value: &Option<String>) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        None => Ok(None),
        Some(raw) => DateTime::parse_from_rfc3339(raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| format!("invalid '{name}' parameter: {e}")),
    }
}

// ── Routes ────────────────────────────────────────────────────────────────────

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/logs", get(get_logs))
        .route("/cron-job", get(get_cron_jobs))
        .route("/cron-job-executions", get(get_cron_executions))
        .with_state(state)
}

/// Bind and serve until cancelled.
pub async fn serve(
    state: ApiState,
    config: &ApiConfig,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind api listener on {addr}"))?;
    info!("operational api listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("api server failed")?;
    Ok(())
}

// ── /logs ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct LogsQuery {
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    skip: Option<usize>,
    source: Option<String>,
    event: Option<String>,
    event_id: Option<String>,
    /// Integer level code (0 = trace .. 5 = fatal).
    level: Option<i16>,
}

impl LogsQuery {
    fn into_filter(self) -> Result<LogFilter, String> {
        let level = match self.level {
            None => None,
            Some(code) => Some(LogLevel::try_from(code).map_err(|e| format!("invalid 'level' parameter: {e}"))?),
        };
        Ok(LogFilter {
            from: parse_rfc3339("from", &self.from)?,
            to: parse_rfc3339("to", &self.to)?,
            source: self.source,
            event: self.event,
            event_id: self.event_id,
            level,
            limit: self.limit,
            skip: self.skip,
        })
    }
}

async fn get_logs(State(state): State<ApiState>, Query(query): Query<LogsQuery>) -> Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(message) => return bad_request(message),
    };

    match state.logger.find_logs(&filter).await {
        Ok(logs) => respond(StatusCode::OK, Some(logs), ""),
        Err(LoggerError::InvalidTimeRange) => bad_request(LoggerError::InvalidTimeRange.to_string()),
        Err(err) => internal_error(err.to_string()),
    }
}

// ── /cron-job ─────────────────────────────────────────────────────────────────

async fn get_cron_jobs(State(state): State<ApiState>) -> Response {
    match state.storage.find_jobs(&JobFilter::default()).await {
        Ok(jobs) => respond(StatusCode::OK, Some(jobs), ""),
        Err(err) => internal_error(err.to_string()),
    }
}

// ── /cron-job-executions ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct ExecutionsQuery {
    from: Option<String>,
    to: Option<String>,
    limit: Option<usize>,
    skip: Option<usize>,
    source: Option<String>,
    name: Option<String>,
}

impl ExecutionsQuery {
    fn into_filter(self) -> Result<ExecutionFilter, String> {
        Ok(ExecutionFilter {
            from: parse_rfc3339("from", &self.from)?,
            to: parse_rfc3339("to", &self.to)?,
            source: self.source,
            name: self.name,
            limit: self.limit,
            skip: self.skip,
        })
    }
}

async fn get_cron_executions(
    State(state): State<ApiState>,
    Query(query): Query<ExecutionsQuery>,
) -> Response {
    let filter = match query.into_filter() {
        Ok(filter) => filter,
        Err(message) => return bad_request(message),
    };

    match state.storage.find_executions(&filter).await {
        Ok(executions) => respond(StatusCode::OK, Some(executions), ""),
        Err(err) => {
            if matches!(err, crate::storage::StorageError::InvalidTimeRange) {
                bad_request(err.to_string())
            } else {
                internal_error(err.to_string())
            }
        }
    }
}
