//! Application state management

use std::sync::Arc;

use tracing::info;

use crate::app::options::AppOptions;
use crate::deploy::control::ServiceControl;
use crate::deploy::pipeline::Pipeline;
use crate::deploy::reconciler::Reconciler;
use crate::errors::EngineError;
use crate::http::client::HttpClient;
use crate::logstream::LogHub;
use crate::notifications::{Dispatcher, FileChannelStore};
use crate::orchestrator::docker::DockerEngine;
use crate::orchestrator::Orchestrator;
use crate::queue::redis::{QueueKeys, RedisJobQueue};
use crate::queue::JobQueue;
use crate::routing::traefik::TraefikFileRouting;
use crate::service::ServiceApi;

/// Main application state
pub struct AppState {
    pub queue: Arc<dyn JobQueue>,

    pub reconciler: Arc<Reconciler>,

    pub logs: Arc<LogHub>,

    pub pipeline: Arc<Pipeline>,

    pub dispatcher: Arc<Dispatcher>,

    /// Intent API served over HTTP
    pub api: Arc<ServiceApi>,
}

impl AppState {
    /// Connect to the Docker Engine and the queue backend, then wire everything
    pub async fn init(options: &AppOptions) -> Result<Self, EngineError> {
        info!("Initializing application state...");

        let orchestrator = Arc::new(DockerEngine::new(
            &options.docker.api_url,
            options.docker.timeout,
        )?);
        let queue = Arc::new(
            RedisJobQueue::connect(&options.queue.url, QueueKeys::new(&options.queue.key_prefix))
                .await?,
        );
        Self::assemble(orchestrator, queue, options)
    }

    /// Wire the engine around an orchestrator and a queue
    pub fn assemble(
        orchestrator: Arc<dyn Orchestrator>,
        queue: Arc<dyn JobQueue>,
        options: &AppOptions,
    ) -> Result<Self, EngineError> {
        let reconciler = Arc::new(Reconciler::new(orchestrator, options.retry.clone()));
        let logs = Arc::new(LogHub::new(options.log_hub.clone()));
        let routing = Arc::new(TraefikFileRouting::new(&options.routing_dir));

        let pipeline = Arc::new(Pipeline::new(
            reconciler.clone(),
            routing,
            queue.clone(),
            logs.clone(),
        ));

        let http = Arc::new(HttpClient::new(options.notification_timeout)?);
        let store = Arc::new(FileChannelStore::new(&options.notifications_file));
        let dispatcher = Arc::new(Dispatcher::with_default_adapters(store, http));

        let control = ServiceControl::new(reconciler.clone(), queue.clone());
        let api = Arc::new(ServiceApi::new(queue.clone(), control, logs.clone()));

        Ok(Self {
            queue,
            reconciler,
            logs,
            pipeline,
            dispatcher,
            api,
        })
    }
}
