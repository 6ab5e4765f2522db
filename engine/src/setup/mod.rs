//! Managed infrastructure bootstrap (`--setup`)
//!
//! Creates the shared overlay network, writes the default Traefik documents
//! and reconciles the proxy, queue and database services the engine runs on.

use std::path::PathBuf;

use colored::Colorize;
use secrecy::ExposeSecret;
use tracing::{error, info};

use crate::deploy::reconciler::{ReconcileError, ReconcilePath, Reconciler};
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::orchestrator::{Mount, MountType, PortProtocol, PublishMode, PublishedPort, ServiceSpec};
use crate::queue::DeploymentMode;
use crate::routing::traefik::{write_default_config, TraefikDefaults};
use crate::storage::settings::{PostgresSettings, Settings, TraefikSettings};

pub const NETWORK_NAME: &str = "empaas-network";
pub const TRAEFIK_SERVICE: &str = "empaas-traefik";
pub const REDIS_SERVICE: &str = "empaas-redis";
pub const POSTGRES_SERVICE: &str = "empaas-postgres";

const REDIS_IMAGE: &str = "redis:7";
const POSTGRES_IMAGE: &str = "postgres:16";
const MANAGER_CONSTRAINT: &str = "node.role==manager";

/// What the bootstrap did
#[derive(Debug)]
pub struct SetupReport {
    pub network_created: bool,
    pub config_written: Vec<PathBuf>,
    pub services: Vec<ServiceOutcome>,
}

impl SetupReport {
    pub fn succeeded(&self) -> bool {
        self.services.iter().all(|s| s.result.is_ok())
    }
}

#[derive(Debug)]
pub struct ServiceOutcome {
    pub name: String,
    pub result: Result<ReconcilePath, ReconcileError>,
}

fn host_port(port: u16, mode: PublishMode) -> PublishedPort {
    PublishedPort {
        target: port,
        published: port,
        protocol: PortProtocol::Tcp,
        mode,
    }
}

/// Reverse proxy service
pub fn traefik_spec(traefik: &TraefikSettings) -> ServiceSpec {
    let mut spec = ServiceSpec::new(TRAEFIK_SERVICE, &traefik.image);
    spec.mounts = vec![
        Mount {
            mount_type: MountType::Bind,
            source: traefik.config_dir.join("traefik.yml").display().to_string(),
            target: format!("{}/traefik.yml", traefik.container_config_dir),
        },
        Mount {
            mount_type: MountType::Bind,
            source: traefik.dynamic_dir().display().to_string(),
            target: format!("{}/dynamic", traefik.container_config_dir),
        },
        Mount {
            mount_type: MountType::Bind,
            source: "/var/run/docker.sock".to_string(),
            target: "/var/run/docker.sock".to_string(),
        },
    ];
    spec.networks.insert(NETWORK_NAME.to_string());
    spec.placement_constraints
        .insert(MANAGER_CONSTRAINT.to_string());
    spec.published_ports = vec![
        host_port(80, PublishMode::Host),
        host_port(443, PublishMode::Host),
    ];
    spec
}

/// Queue backend service
pub fn redis_spec(mode: DeploymentMode) -> ServiceSpec {
    let mut spec = ServiceSpec::new(REDIS_SERVICE, REDIS_IMAGE);
    spec.mounts = vec![Mount {
        mount_type: MountType::Volume,
        source: "empaas-redis-data".to_string(),
        target: "/data".to_string(),
    }];
    spec.networks.insert(NETWORK_NAME.to_string());
    spec.placement_constraints
        .insert(MANAGER_CONSTRAINT.to_string());
    if !mode.is_production() {
        spec.published_ports = vec![host_port(6379, PublishMode::Host)];
    }
    spec
}

/// Database service. The password comes from settings or
/// `EMPAAS_POSTGRES_PASSWORD`.
pub fn postgres_spec(
    postgres: &PostgresSettings,
    mode: DeploymentMode,
) -> Result<ServiceSpec, EngineError> {
    let password = postgres.password.as_ref().ok_or_else(|| {
        EngineError::ConfigError(
            "postgres password missing: set postgres.password or EMPAAS_POSTGRES_PASSWORD"
                .to_string(),
        )
    })?;

    let mut spec = ServiceSpec::new(POSTGRES_SERVICE, POSTGRES_IMAGE);
    spec.environment_variables = vec![
        format!("POSTGRES_USER={}", postgres.user),
        format!("POSTGRES_DB={}", postgres.database),
        format!("POSTGRES_PASSWORD={}", password.expose_secret()),
    ];
    spec.mounts = vec![Mount {
        mount_type: MountType::Volume,
        source: "empaas-postgres-database".to_string(),
        target: "/var/lib/postgresql/data".to_string(),
    }];
    spec.networks.insert(NETWORK_NAME.to_string());
    spec.placement_constraints
        .insert(MANAGER_CONSTRAINT.to_string());
    spec.replicas = 1;
    if !mode.is_production() {
        spec.published_ports = vec![host_port(5432, PublishMode::Host)];
    }
    Ok(spec)
}

/// Bring up the managed infrastructure. Services are reconciled one by one;
/// a failing service is reported and the rest still run.
pub async fn run_setup(
    reconciler: &Reconciler,
    settings: &Settings,
) -> Result<SetupReport, EngineError> {
    info!("Setting up managed infrastructure...");

    let network_created = reconciler.ensure_network(NETWORK_NAME).await?;

    let config_dir = Dir::new(&settings.traefik.config_dir);
    config_dir.subdir("dynamic").create().await?;
    let config_written = write_default_config(
        &config_dir,
        &TraefikDefaults {
            container_dynamic_dir: format!("{}/dynamic", settings.traefik.container_config_dir),
            acme_email: settings.traefik.acme_email.clone(),
        },
    )
    .await?;

    let specs = [
        traefik_spec(&settings.traefik),
        redis_spec(settings.mode),
        postgres_spec(&settings.postgres, settings.mode)?,
    ];

    let mut services = Vec::with_capacity(specs.len());
    for spec in &specs {
        let result = reconciler
            .reconcile_with(spec, None)
            .await
            .map(|outcome| outcome.path);
        match &result {
            Ok(path) => info!("{} reconciled ({:?})", spec.name, path),
            Err(e) => error!("{} failed to reconcile: {}", spec.name, e),
        }
        services.push(ServiceOutcome {
            name: spec.name.clone(),
            result,
        });
    }

    Ok(SetupReport {
        network_created,
        config_written,
        services,
    })
}

/// Human-readable summary on stdout
pub fn print_report(report: &SetupReport) {
    if report.network_created {
        println!("{} Network {} created", "✓".green(), NETWORK_NAME);
    } else {
        println!("{} Network {} already exists", "✓".green(), NETWORK_NAME);
    }
    for path in &report.config_written {
        println!("{} Wrote {}", "✓".green(), path.display());
    }
    for service in &report.services {
        match &service.result {
            Ok(ReconcilePath::Created) => {
                println!("{} {} not found: started", "✓".green(), service.name)
            }
            Ok(ReconcilePath::Updated) => {
                println!("{} {} updated", "✓".green(), service.name)
            }
            Ok(ReconcilePath::AlreadyExisted) => println!(
                "{} {} already exists, continuing",
                "✓".green(),
                service.name
            ),
            Err(e) => println!("{} {}: {}", "✗".red(), service.name.bold(), e),
        }
    }
}
