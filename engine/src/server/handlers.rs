//! HTTP request handlers

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{Stream, StreamExt};
use openapi_server::models::{
    CancelResponse, ControlResponse, EnqueuedResponse, ErrorResponse, HealthResponse,
    JobResponse, LogEventView, VersionResponse,
};
use tracing::error;
use uuid::Uuid;

use crate::deploy::reconciler::ReconcileError;
use crate::errors::EngineError;
use crate::logstream::LogEvent;
use crate::models::job::DeploymentJob;
use crate::orchestrator::ServiceState;
use crate::server::state::ServerState;
use crate::service::DeployRequest;
use crate::utils::version_info;

/// Error returned by handlers, rendered as `{ "error": ... }`
#[derive(Debug)]
pub struct ApiError(EngineError);

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            EngineError::ValidationError(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::ReconcileError(ReconcileError::InvalidSpec(_)) => StatusCode::BAD_REQUEST,
            EngineError::ReconcileError(ReconcileError::NotFound(_)) => StatusCode::NOT_FOUND,
            EngineError::ReconcileError(ReconcileError::VersionConflict { .. }) => {
                StatusCode::CONFLICT
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("Request failed: {}", self.0);
        }
        let body = ErrorResponse {
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

fn parse_job_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError(EngineError::ValidationError(format!("invalid job id '{}'", raw))))
}

fn enqueued(job: &DeploymentJob) -> EnqueuedResponse {
    EnqueuedResponse {
        job_id: job.id,
        service_name: job.target_service_name.clone(),
        status: job.status.as_str().to_string(),
    }
}

fn controlled(action: &str, state: ServiceState) -> ControlResponse {
    ControlResponse {
        service_name: state.name,
        action: action.to_string(),
        replicas: state.desired_replicas,
        version_index: state.version_index,
    }
}

fn log_event_view(event: LogEvent) -> LogEventView {
    LogEventView {
        job_id: event.job_id,
        sequence_number: event.sequence_number,
        timestamp: event.timestamp,
        message: event.message,
        is_terminal: event.is_terminal,
    }
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "empaasd".to_string(),
        version: version.version,
    })
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

/// Queue a deployment
pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    payload: Result<Json<DeployRequest>, JsonRejection>,
) -> Result<impl IntoResponse, ApiError> {
    let Json(request) =
        payload.map_err(|e| ApiError(EngineError::ValidationError(e.body_text())))?;
    let job = state.api.deploy(&name, request).await?;
    Ok((StatusCode::ACCEPTED, Json(enqueued(&job))))
}

/// Queue a redeployment of the last accepted spec
pub async fn redeploy_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.api.redeploy(&name).await?;
    Ok((StatusCode::ACCEPTED, Json(enqueued(&job))))
}

pub async fn start_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.api.start(&name).await?;
    Ok(Json(controlled("start", service)))
}

pub async fn stop_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.api.stop(&name).await?;
    Ok(Json(controlled("stop", service)))
}

pub async fn reload_handler(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let service = state.api.reload(&name).await?;
    Ok(Json(controlled("reload", service)))
}

/// Job record
pub async fn job_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let job = state.api.job(parse_job_id(&id)?).await?;
    Ok(Json(JobResponse {
        id: job.id,
        service_name: job.target_service_name,
        service_kind: job.kind.as_str().to_string(),
        status: job.status.as_str().to_string(),
        stage: job.stage.as_str().to_string(),
        requested_at: job.requested_at,
        failure: job.failure.map(|failure| failure.to_string()),
    }))
}

pub async fn cancel_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = state.api.cancel(parse_job_id(&id)?).await?;
    Ok(Json(CancelResponse {
        job_id: outcome.job_id,
        cancelled: outcome.cancelled,
        message: outcome.message,
    }))
}

/// Server-sent events of a job's log, closing after the terminal event
pub async fn logs_handler(
    State(state): State<Arc<ServerState>>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let subscription = state.api.subscribe_logs(parse_job_id(&id)?).await?;

    let stream = subscription.into_stream().map(|event| {
        let kind = if event.is_terminal { "terminal" } else { "log" };
        let id = event.sequence_number.to_string();
        let fallback = event.message.clone();
        let sse = Event::default()
            .event(kind)
            .id(id)
            .json_data(log_event_view(event))
            .unwrap_or_else(|_| Event::default().event(kind).data(fallback));
        Ok(sse)
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
