//! Notification fan-out against stand-in webhook endpoints

use std::sync::Arc;
use std::time::Duration;

use empaas_engine::deploy::fsm::{FailureCause, PipelineFailure};
use empaas_engine::http::HttpClient;
use empaas_engine::notifications::{
    ChannelConfig, Dispatcher, FileChannelStore, MemoryChannelStore, NotificationEvent,
};
use serde_json::{json, Value};
use uuid::Uuid;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn channel(value: Value) -> ChannelConfig {
    serde_json::from_value(value).unwrap()
}

fn http() -> Arc<HttpClient> {
    Arc::new(HttpClient::new(Duration::from_secs(5)).unwrap())
}

fn failed_event() -> NotificationEvent {
    NotificationEvent::deployment_failed(
        "web",
        Uuid::new_v4(),
        &PipelineFailure::new(FailureCause::ImagePull, "manifest unknown"),
    )
}

#[tokio::test]
async fn test_failing_channel_does_not_block_others() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/discord"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/slack"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/message"))
        .and(header("X-Gotify-Key", "app-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": 1 })))
        .expect(1)
        .mount(&server)
        .await;

    let events = json!(["deployment-failed"]);
    let store = MemoryChannelStore::new(vec![
        channel(json!({
            "id": "discord",
            "kind": "discord",
            "webhookUrl": format!("{}/discord", server.uri()),
            "events": events,
        })),
        channel(json!({
            "id": "slack",
            "kind": "slack",
            "webhookUrl": format!("{}/slack", server.uri()),
            "events": events,
        })),
        channel(json!({
            "id": "gotify",
            "kind": "gotify",
            "serverUrl": server.uri(),
            "appToken": "app-token",
            "events": events,
        })),
    ]);
    let dispatcher = Dispatcher::with_default_adapters(Arc::new(store), http());

    let summary = dispatcher.dispatch(&failed_event()).await;
    assert_eq!(summary.matched, 3);
    assert_eq!(summary.delivered, 2);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn test_discord_without_decoration_has_plain_titles() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hook"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let store = MemoryChannelStore::new(vec![channel(json!({
        "id": "ops",
        "kind": "discord",
        "webhookUrl": format!("{}/hook", server.uri()),
        "decorationEnabled": false,
        "events": ["server-restarted"],
    }))]);
    let dispatcher = Dispatcher::with_default_adapters(Arc::new(store), http());

    let summary = dispatcher.dispatch(&NotificationEvent::server_restarted()).await;
    assert_eq!(summary.delivered, 1);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    let embed = &body["embeds"][0];
    assert_eq!(embed["title"], "Empaas Server Restarted");
    assert_eq!(embed["color"], 0x57F287);
    let names: Vec<&str> = embed["fields"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["Date", "Time", "Type"]);
    assert_eq!(embed["footer"]["text"], "Empaas Restart Notification");
}

#[tokio::test]
async fn test_unsubscribed_and_disabled_channels_are_skipped() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let store = MemoryChannelStore::new(vec![
        channel(json!({
            "id": "muted",
            "kind": "discord",
            "webhookUrl": format!("{}/hook", server.uri()),
            "enabled": false,
            "events": ["deployment-failed"],
        })),
        channel(json!({
            "id": "success-only",
            "kind": "slack",
            "webhookUrl": format!("{}/slack", server.uri()),
            "events": ["deployment-succeeded"],
        })),
    ]);
    let dispatcher = Dispatcher::with_default_adapters(Arc::new(store), http());

    let summary = dispatcher.dispatch(&failed_event()).await;
    assert_eq!(summary.matched, 0);
}

#[tokio::test]
async fn test_channels_file_is_read_per_dispatch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/bottoken/sendMessage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("notifications.json");
    let dispatcher =
        Dispatcher::with_default_adapters(Arc::new(FileChannelStore::new(&file)), http());

    // No file yet
    let summary = dispatcher.dispatch(&failed_event()).await;
    assert_eq!(summary.matched, 0);

    let document = json!({
        "channels": [{
            "id": "tg",
            "kind": "telegram",
            "botToken": "token",
            "chatId": "42",
            "apiUrl": server.uri(),
            "events": ["deployment-failed"],
        }]
    });
    std::fs::write(&file, document.to_string()).unwrap();

    let summary = dispatcher.dispatch(&failed_event()).await;
    assert_eq!(summary.delivered, 1);

    let requests = server.received_requests().await.unwrap();
    let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(body["chat_id"], "42");
    assert_eq!(body["parse_mode"], "HTML");
    assert!(body["text"].as_str().unwrap().contains("Deployment Failed"));
}
