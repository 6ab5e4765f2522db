//! Application configuration options

use std::path::PathBuf;
use std::time::Duration;

use crate::deploy::reconciler::RetryPolicy;
use crate::logstream::LogHubOptions;
use crate::queue::redis::DEFAULT_KEY_PREFIX;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::Settings;
use crate::workers::deployer;

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Job queue backend
    pub queue: QueueOptions,

    /// Docker Engine API
    pub docker: DockerOptions,

    /// Per-service Traefik dynamic configuration directory
    pub routing_dir: PathBuf,

    /// Notification channels file
    pub notifications_file: PathBuf,

    /// Timeout of outbound notification requests
    pub notification_timeout: Duration,

    /// Version-conflict retries
    pub retry: RetryPolicy,

    /// Log hub retention
    pub log_hub: LogHubOptions,

    /// Enable local HTTP server
    pub enable_server: bool,

    /// Server configuration
    pub server: ServerOptions,

    /// Number of deployer workers
    pub worker_count: usize,

    /// Deployer worker options, `worker_id` is set per worker
    pub deployer: deployer::Options,
}

impl Default for AppOptions {
    fn default() -> Self {
        let layout = StorageLayout::default();
        Self {
            lifecycle: LifecycleOptions::default(),
            queue: QueueOptions::default(),
            docker: DockerOptions::default(),
            routing_dir: layout.base_dir.join("traefik").join("dynamic"),
            notifications_file: layout.notifications_file().path().to_path_buf(),
            notification_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            log_hub: LogHubOptions::default(),
            enable_server: true,
            server: ServerOptions::default(),
            worker_count: 1,
            deployer: deployer::Options::default(),
        }
    }
}

impl AppOptions {
    /// Options for a settings file loaded from `layout`
    pub fn from_settings(settings: &Settings, layout: &StorageLayout) -> Self {
        let notifications_file = settings
            .notifications_file
            .clone()
            .unwrap_or_else(|| layout.notifications_file().path().to_path_buf());

        Self {
            queue: QueueOptions {
                url: settings.queue_connection().url(),
                key_prefix: settings.queue.key_prefix.clone(),
            },
            docker: DockerOptions {
                api_url: settings.docker.api_url.clone(),
                timeout: settings.docker.timeout(),
            },
            routing_dir: settings.traefik.dynamic_dir(),
            notifications_file,
            retry: settings.reconcile.clone(),
            enable_server: settings.server.enabled,
            server: ServerOptions {
                host: settings.server.host.clone(),
                port: settings.server.port,
            },
            worker_count: settings.worker.concurrency.max(1),
            deployer: deployer::Options {
                consume_timeout: settings.queue.consume_timeout(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

/// Lifecycle options for the engine
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            max_shutdown_delay: Duration::from_secs(30),
        }
    }
}

/// Queue backend options
#[derive(Debug, Clone)]
pub struct QueueOptions {
    pub url: String,
    pub key_prefix: String,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }
}

/// Docker Engine API options
#[derive(Debug, Clone)]
pub struct DockerOptions {
    pub api_url: String,
    pub timeout: Duration,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:2375".to_string(),
            timeout: Duration::from_secs(60),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3030,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::DeploymentMode;

    #[test]
    fn test_options_from_settings() {
        let mut settings = Settings::default();
        settings.mode = DeploymentMode::Production;
        settings.worker.concurrency = 0;
        settings.queue.consume_timeout_secs = 2;
        let layout = StorageLayout::new("/srv/empaas");

        let options = AppOptions::from_settings(&settings, &layout);
        assert_eq!(options.queue.url, "redis://empaas-redis:6379/");
        assert_eq!(options.worker_count, 1);
        assert_eq!(options.deployer.consume_timeout, Duration::from_secs(2));
        assert_eq!(
            options.notifications_file,
            PathBuf::from("/srv/empaas/notifications.json")
        );
        assert_eq!(options.routing_dir, PathBuf::from("/etc/empaas/traefik/dynamic"));
    }
}
