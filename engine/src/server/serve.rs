//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::EngineError;
use crate::server::handlers::{
    cancel_handler, deploy_handler, health_handler, job_handler, logs_handler, redeploy_handler,
    reload_handler, start_handler, stop_handler, version_handler,
};
use crate::server::state::ServerState;

/// Routes of the engine API
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Service intents
        .route("/services/{name}/deploy", post(deploy_handler))
        .route("/services/{name}/redeploy", post(redeploy_handler))
        .route("/services/{name}/reload", post(reload_handler))
        .route("/services/{name}/start", post(start_handler))
        .route("/services/{name}/stop", post(stop_handler))
        // Jobs
        .route("/jobs/{id}", get(job_handler))
        .route("/jobs/{id}/cancel", post(cancel_handler))
        .route("/jobs/{id}/logs", get(logs_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let app = router(state);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| EngineError::ServerError(e.to_string()))
    });

    Ok(handle)
}
