//! Docker Engine client against a stand-in Engine API

use std::sync::Arc;
use std::time::Duration;

use empaas_engine::deploy::reconciler::{ReconcileError, ReconcilePath, Reconciler, RetryPolicy};
use empaas_engine::orchestrator::docker::DockerEngine;
use empaas_engine::orchestrator::{Orchestrator, OrchestratorError, ServiceSpec};
use empaas_engine::utils::CooldownOptions;
use serde_json::{json, Value};
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn engine(server: &MockServer) -> DockerEngine {
    DockerEngine::new(&server.uri(), Duration::from_secs(5)).unwrap()
}

fn swarm_service(name: &str, index: u64, image: &str, replicas: u64) -> Value {
    json!({
        "ID": "svc1",
        "Version": { "Index": index },
        "Spec": {
            "Name": name,
            "Mode": { "Replicated": { "Replicas": replicas } },
            "TaskTemplate": { "ContainerSpec": { "Image": image } },
        },
        "ServiceStatus": { "RunningTasks": replicas, "DesiredTasks": replicas },
    })
}

async fn mount_tasks(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            { "UpdatedAt": "2026-01-01T00:00:00Z", "Status": { "State": "shutdown" } },
            { "UpdatedAt": "2026-01-02T00:00:00Z", "Status": { "State": "running" } },
        ])))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_get_service_reads_exact_name() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            swarm_service("web-admin", 3, "nginx:1.25", 1),
            swarm_service("web", 42, "nginx:1.27", 2),
        ])))
        .mount(&server)
        .await;
    mount_tasks(&server).await;

    let state = engine(&server).get_service("web").await.unwrap().unwrap();
    assert_eq!(state.name, "web");
    assert_eq!(state.version_index, 42);
    assert_eq!(state.image, "nginx:1.27");
    assert_eq!(state.desired_replicas, 2);
    assert_eq!(state.current_replicas, 2);
    assert_eq!(state.last_task_status.as_deref(), Some("running"));
}

#[tokio::test]
async fn test_missing_service_is_none() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            swarm_service("web-admin", 3, "nginx:1.25", 1),
        ])))
        .mount(&server)
        .await;

    assert!(engine(&server).get_service("web").await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_listing_is_rejected_not_unreachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy login</html>"))
        .mount(&server)
        .await;

    let err = engine(&server).get_service("web").await.unwrap_err();
    match err {
        OrchestratorError::Rejected { status, message } => {
            assert_eq!(status, 200);
            assert!(message.starts_with("malformed response"));
        }
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let uri = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let engine = DockerEngine::new(&uri, Duration::from_secs(5)).unwrap();
    let err = engine.get_service("web").await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Unreachable(_)));
}

#[tokio::test]
async fn test_out_of_sequence_update_is_a_version_conflict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/services/web/update"))
        .and(query_param("version", "7"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "message": "rpc error: code = Unknown desc = update out of sequence"
        })))
        .mount(&server)
        .await;

    let err = engine(&server)
        .update_service("web", 7, &ServiceSpec::new("web", "nginx:1.27"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::VersionConflict(_)));
}

#[tokio::test]
async fn test_pull_stream_failure_is_image_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/images/create"))
        .and(query_param("fromImage", "ghcr.io/acme/app"))
        .and(query_param("tag", "9"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            "{\"status\":\"Pulling from acme/app\"}\n{\"errorDetail\":{\"message\":\"manifest unknown\"},\"error\":\"manifest unknown\"}\n",
        ))
        .mount(&server)
        .await;

    let err = engine(&server)
        .pull_image("ghcr.io/acme/app:9", None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ImageNotFound(_)));
}

#[tokio::test]
async fn test_reconcile_creates_missing_service() {
    let server = MockServer::start().await;
    // Absent on the first lookup, present once created
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([swarm_service("web", 11, "nginx:1.27", 1)])),
        )
        .mount(&server)
        .await;
    mount_tasks(&server).await;
    Mock::given(method("GET"))
        .and(path("/images/nginx:1.27/json"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "No such image" })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/images/create"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"status\":\"Downloaded\"}\n"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/services/create"))
        .and(body_partial_json(json!({
            "Name": "web",
            "Mode": { "Replicated": { "Replicas": 1 } },
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "ID": "svc1" })))
        .expect(1)
        .mount(&server)
        .await;

    let reconciler = Reconciler::new(Arc::new(engine(&server)), RetryPolicy::default());
    let outcome = reconciler
        .reconcile_with(&ServiceSpec::new("web", "nginx:1.27"), None)
        .await
        .unwrap();
    assert_eq!(outcome.path, ReconcilePath::Created);
    assert_eq!(outcome.state.version_index, 11);
}

#[tokio::test]
async fn test_reconcile_gives_up_after_repeated_conflicts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/images/nginx:1.27/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Id": "sha256:1" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([swarm_service("web", 5, "nginx:1.25", 1)])),
        )
        .mount(&server)
        .await;
    mount_tasks(&server).await;
    Mock::given(method("POST"))
        .and(path("/services/web/update"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "message": "update out of sequence"
        })))
        .expect(3)
        .mount(&server)
        .await;

    let policy = RetryPolicy {
        max_attempts: 3,
        backoff: CooldownOptions {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        },
    };
    let reconciler = Reconciler::new(Arc::new(engine(&server)), policy);
    let err = reconciler
        .reconcile(&ServiceSpec::new("web", "nginx:1.27"))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ReconcileError::VersionConflict { attempts: 3, .. }
    ));
}

#[tokio::test]
async fn test_reconcile_path_reported_on_update() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/images/nginx:1.27/json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Id": "sha256:1" })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/services"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([swarm_service("web", 5, "nginx:1.27", 1)])),
        )
        .mount(&server)
        .await;
    mount_tasks(&server).await;
    Mock::given(method("POST"))
        .and(path("/services/web/update"))
        .and(query_param("version", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "Warnings": null })))
        .expect(1)
        .mount(&server)
        .await;

    let reconciler = Reconciler::new(Arc::new(engine(&server)), RetryPolicy::default());
    let outcome = reconciler
        .reconcile_with(&ServiceSpec::new("web", "nginx:1.27"), None)
        .await
        .unwrap();
    assert_eq!(outcome.path, ReconcilePath::Updated);
}
