//! Reconciler scenarios against the in-process orchestrator

use std::sync::atomic::Ordering;
use std::sync::Arc;

use empaas_engine::deploy::reconciler::{ReconcilePath, Reconciler, RetryPolicy};
use empaas_engine::orchestrator::memory::MemoryOrchestrator;
use empaas_engine::orchestrator::{Orchestrator, ServiceSpec};
use empaas_engine::queue::DeploymentMode;
use empaas_engine::setup::{run_setup, NETWORK_NAME, POSTGRES_SERVICE, REDIS_SERVICE, TRAEFIK_SERVICE};
use empaas_engine::storage::settings::Settings;
use secrecy::SecretString;

fn reconciler() -> (Arc<MemoryOrchestrator>, Reconciler) {
    let orchestrator = Arc::new(MemoryOrchestrator::new());
    let reconciler = Reconciler::new(orchestrator.clone(), RetryPolicy::default());
    (orchestrator, reconciler)
}

#[tokio::test]
async fn test_reconcile_is_idempotent() {
    let (orchestrator, reconciler) = reconciler();
    let spec = ServiceSpec::new("web", "nginx:1.27");

    let first = reconciler.reconcile_with(&spec, None).await.unwrap();
    let second = reconciler.reconcile_with(&spec, None).await.unwrap();

    assert_eq!(first.path, ReconcilePath::Created);
    assert_eq!(second.path, ReconcilePath::Updated);
    assert_eq!(orchestrator.calls.creates.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.calls.pulls.load(Ordering::SeqCst), 1);
    assert_eq!(orchestrator.spec("web").unwrap(), spec);
}

#[tokio::test]
async fn test_update_replaces_the_whole_spec() {
    let (orchestrator, reconciler) = reconciler();
    let mut spec = ServiceSpec::new("api", "ghcr.io/acme/api:1");
    spec.environment_variables = vec!["A=1".to_string(), "B=2".to_string()];
    reconciler.reconcile(&spec).await.unwrap();

    let mut next = ServiceSpec::new("api", "ghcr.io/acme/api:2");
    next.environment_variables = vec!["B=3".to_string()];
    let state = reconciler.reconcile(&next).await.unwrap();

    assert_eq!(state.image, "ghcr.io/acme/api:2");
    assert_eq!(
        orchestrator.spec("api").unwrap().environment_variables,
        vec!["B=3".to_string()]
    );
}

#[tokio::test]
async fn test_concurrent_reconciles_converge_on_one_service() {
    let (orchestrator, reconciler) = reconciler();
    let reconciler = Arc::new(reconciler);
    let spec = ServiceSpec::new("worker", "busybox:1.36");

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let reconciler = reconciler.clone();
            let spec = spec.clone();
            tokio::spawn(async move { reconciler.reconcile_with(&spec, None).await })
        })
        .collect();

    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(orchestrator.calls.creates.load(Ordering::SeqCst), 1);
    assert!(orchestrator.get_service("worker").await.unwrap().is_some());
}

#[tokio::test]
async fn test_setup_brings_up_managed_services() {
    let (orchestrator, reconciler) = reconciler();
    let dir = tempfile::tempdir().unwrap();

    let mut settings = Settings::default();
    settings.mode = DeploymentMode::Development;
    settings.traefik.config_dir = dir.path().join("traefik");
    settings.postgres.password = Some(SecretString::from("s3cret".to_string()));

    let report = run_setup(&reconciler, &settings).await.unwrap();
    assert!(report.succeeded());
    assert!(report.network_created);
    assert_eq!(report.config_written.len(), 2);
    assert!(orchestrator.has_network(NETWORK_NAME));

    let postgres = orchestrator.spec(POSTGRES_SERVICE).unwrap();
    assert_eq!(postgres.image, "postgres:16");
    assert_eq!(postgres.replicas, 1);
    assert_eq!(postgres.published_ports[0].published, 5432);
    assert!(orchestrator.spec(REDIS_SERVICE).is_some());
    assert!(orchestrator.spec(TRAEFIK_SERVICE).is_some());

    // Second run updates in place and keeps the written config
    let again = run_setup(&reconciler, &settings).await.unwrap();
    assert!(!again.network_created);
    assert!(again.config_written.is_empty());
    assert!(again
        .services
        .iter()
        .all(|s| matches!(s.result, Ok(ReconcilePath::Updated))));
    assert_eq!(orchestrator.calls.creates.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_setup_in_production_keeps_postgres_private() {
    let (orchestrator, reconciler) = reconciler();
    let dir = tempfile::tempdir().unwrap();

    let mut settings = Settings::default();
    settings.mode = DeploymentMode::Production;
    settings.traefik.config_dir = dir.path().to_path_buf();
    settings.postgres.password = Some(SecretString::from("s3cret".to_string()));

    run_setup(&reconciler, &settings).await.unwrap();
    assert!(orchestrator
        .spec(POSTGRES_SERVICE)
        .unwrap()
        .published_ports
        .is_empty());
}
