//! Empaas engine - Entry Point
//!
//! Runs the deployment workers and the local HTTP API, or bootstraps the
//! managed infrastructure with `--setup`.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use anyhow::{bail, Context};
use empaas_engine::app::options::AppOptions;
use empaas_engine::app::run::run;
use empaas_engine::deploy::reconciler::Reconciler;
use empaas_engine::filesys::file::File;
use empaas_engine::logs::{init_logging, LogOptions};
use empaas_engine::orchestrator::docker::DockerEngine;
use empaas_engine::setup::{print_report, run_setup};
use empaas_engine::storage::layout::StorageLayout;
use empaas_engine::storage::settings::load_settings;
use empaas_engine::utils::version_info;

use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        println!("{}", serde_json::to_string_pretty(&version)?);
        return Ok(());
    }

    // Retrieve the settings file
    let layout = match cli_args.get("config") {
        Some(path) => StorageLayout::for_settings_path(path),
        None => StorageLayout::default(),
    };
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let mut settings = load_settings(&settings_file)
        .await
        .with_context(|| format!("unable to read {}", settings_file.path().display()))?;
    settings.apply_env_overrides(|key| env::var(key).ok());

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings.log_dir.clone(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Bootstrap managed services and exit
    if cli_args.contains_key("setup") {
        layout
            .setup()
            .await
            .with_context(|| format!("unable to create {}", layout.base_dir.display()))?;
        let orchestrator = Arc::new(
            DockerEngine::new(&settings.docker.api_url, settings.docker.timeout())
                .context("invalid Docker Engine API URL")?,
        );
        let reconciler = Reconciler::new(orchestrator, settings.reconcile.clone());
        let report = run_setup(&reconciler, &settings).await.context("setup failed")?;
        print_report(&report);
        if !report.succeeded() {
            bail!("one or more managed services failed to reconcile");
        }
        return Ok(());
    }

    // Run the engine
    let options = AppOptions::from_settings(&settings, &layout);
    info!(
        "Running Empaas engine {} in {:?} mode with options: {:?}",
        version.version, settings.mode, options
    );
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run the engine: {e}");
        return Err(e.into());
    }
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Failed to install signal handlers, waiting for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
        }
        info!("Ctrl+C received, shutting down...");
    }
}
