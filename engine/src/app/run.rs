//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::EngineError;
use crate::notifications::NotificationEvent;
use crate::queue::QueueError;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::workers::deployer;

/// Run the engine until a shutdown signal or a fatal worker error
pub async fn run(
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    info!("Initializing Empaas engine...");

    let app_state = match AppState::init(&options).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to start engine: {}", e);
            return Err(e);
        }
    };
    run_with_state(app_state, options, shutdown_signal).await
}

/// Run workers and the HTTP server around an assembled state
pub async fn run_with_state(
    app_state: Arc<AppState>,
    options: AppOptions,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), EngineError> {
    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<QueueError>(1);

    if let Err(e) = init(
        &options,
        app_state.clone(),
        shutdown_tx.clone(),
        fatal_tx,
        &mut shutdown_manager,
    )
    .await
    {
        error!("Failed to start engine: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    announce_restart(app_state.clone());

    let result = tokio::select! {
        _ = shutdown_signal => {
            info!("Shutdown signal received, shutting down...");
            Ok(())
        }
        Some(e) = fatal_rx.recv() => {
            error!("Job queue failed, shutting down: {}", e);
            Err(EngineError::QueueError(e))
        }
    };

    // Shutdown
    drop(shutdown_tx);
    shutdown_manager.shutdown().await?;
    result
}

fn announce_restart(app_state: Arc<AppState>) {
    tokio::spawn(async move {
        let summary = app_state
            .dispatcher
            .dispatch(&NotificationEvent::server_restarted())
            .await;
        info!(
            "Restart notification delivered to {} of {} channels",
            summary.delivered, summary.matched
        );
    });
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_tx: broadcast::Sender<()>,
    fatal_tx: mpsc::Sender<QueueError>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), EngineError> {
    init_deployer_workers(options, app_state.clone(), &shutdown_tx, fatal_tx, shutdown_manager)
        .await?;

    if options.enable_server {
        init_server(options, app_state, shutdown_manager, shutdown_tx.subscribe()).await?;
    }
    Ok(())
}

async fn init_deployer_workers(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_tx: &broadcast::Sender<()>,
    fatal_tx: mpsc::Sender<QueueError>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), EngineError> {
    info!("Initializing {} deployer worker(s)...", options.worker_count);

    // Jobs left in processing by a crashed process run again
    app_state.queue.recover().await?;

    for worker_id in 0..options.worker_count {
        let worker_options = deployer::Options {
            worker_id,
            ..options.deployer.clone()
        };
        let queue = app_state.queue.clone();
        let pipeline = app_state.pipeline.clone();
        let dispatcher = app_state.dispatcher.clone();
        let fatal_tx = fatal_tx.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        let handle = tokio::spawn(async move {
            let result = deployer::run(
                &worker_options,
                queue,
                pipeline,
                dispatcher,
                Box::pin(async move {
                    let _ = shutdown_rx.recv().await;
                }),
            )
            .await;
            if let Err(e) = result {
                let _ = fatal_tx.try_send(e);
            }
        });
        shutdown_manager.with_deployer_worker_handle(handle);
    }
    Ok(())
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), EngineError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(app_state.api.clone());
    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)?;
    Ok(())
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    server_handle: Option<JoinHandle<Result<(), EngineError>>>,
    deployer_worker_handles: Vec<JoinHandle<()>>,
}

impl ShutdownManager {
    pub fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            server_handle: None,
            deployer_worker_handles: Vec::new(),
        }
    }

    pub fn with_deployer_worker_handle(&mut self, handle: JoinHandle<()>) {
        self.deployer_worker_handles.push(handle);
    }

    pub fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), EngineError>>,
    ) -> Result<(), EngineError> {
        if self.server_handle.is_some() {
            return Err(EngineError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<(), EngineError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(
            self.lifecycle_options.max_shutdown_delay,
            self.shutdown_impl(),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), EngineError> {
        info!("Shutting down Empaas engine...");

        // 1. Deployer workers, a running job finishes first
        for handle in self.deployer_worker_handles.drain(..) {
            handle.await.map_err(|e| EngineError::ShutdownError(e.to_string()))?;
        }

        // 2. HTTP server
        if let Some(handle) = self.server_handle.take() {
            handle.await.map_err(|e| EngineError::ShutdownError(e.to_string()))??;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
