use std::net::SocketAddr;
use std::sync::Arc;

use assert_json_diff::assert_json_eq;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use capture_pubsub::processor::PubsubProcessor;
use capture_pubsub::router::router;
use capture_pubsub::transport::TransportError;

mod common;
use common::*;

async fn start(processor: PubsubProcessor) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind");
    let addr = listener.local_addr().expect("no local address");
    let app = router(Arc::new(processor), false);

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server failed");
    });
    addr
}

async fn ready(transport: Arc<ScriptedTransport>) -> PubsubProcessor {
    let factory = ScriptedFactory::new(transport);
    let mut processor = PubsubProcessor::new();
    processor
        .init(&processor_params(), false, &factory)
        .await
        .expect("failed to init processor");
    processor
}

fn event_body() -> Value {
    json!({
        "server_ts": "2024-03-01T10:15:30.250Z",
        "client_ts": "2024-03-01T10:15:29.001Z",
        "client_addr": "10.0.0.1",
        "visitor_id": "v1",
        "session_id": "s1",
        "page": "https://example.com/pricing",
        "type": "page",
        "visitor_params": "plan=pro",
        "browser_width": 1280,
        "browser_height": 720
    })
}

#[tokio::test]
async fn index_and_readiness() -> anyhow::Result<()> {
    let addr = start(ready(ScriptedTransport::new(vec![])).await).await;
    let client = reqwest::Client::new();

    let res = client.get(format!("http://{}/", addr)).send().await?;
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await?, "capture-pubsub");

    let res = client
        .get(format!("http://{}/_readiness", addr))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("http://{}/_service", addr))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);

    Ok(())
}

#[tokio::test]
async fn uninitialized_processor_is_not_ready() {
    let addr = start(PubsubProcessor::new()).await;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("http://{}/_readiness", addr))
        .send()
        .await
        .expect("request failed");
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);

    let res = client
        .post(format!("http://{}/track", addr))
        .json(&event_body())
        .send()
        .await
        .expect("request failed");
    assert_eq!(res.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn track_publishes_event() {
    let transport = ScriptedTransport::new(vec![Ok(accepted(&["31337"]))]);
    let addr = start(ready(transport.clone()).await).await;

    let res = reqwest::Client::new()
        .post(format!("http://{}/track", addr))
        .json(&event_body())
        .send()
        .await
        .expect("request failed");
    assert_eq!(res.status(), StatusCode::OK);

    let body: Value = res.json().await.expect("invalid response body");
    assert_json_eq!(body, json!({"status": "Ok", "message_ids": ["31337"]}));

    let calls = transport.calls();
    assert_eq!(calls.len(), 1);
    let payload = calls[0].payload();
    assert!(payload.starts_with("{ server_ts:\"2024-03-01T10:15:30.250\", client_ts:\"2024-03-01T10:15:29.001\", "));
    assert!(payload.ends_with("plan=\"pro\", }"));
}

#[tokio::test]
async fn rejected_publish_maps_to_bad_gateway() {
    let transport = ScriptedTransport::new(vec![Err(TransportError::Rejected {
        status: 404,
        message: "topic not found".to_string(),
    })]);
    let addr = start(ready(transport).await).await;

    let res = reqwest::Client::new()
        .post(format!("http://{}/track", addr))
        .json(&event_body())
        .send()
        .await
        .expect("request failed");
    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
}

#[tokio::test]
async fn malformed_event_is_refused() {
    let transport = ScriptedTransport::new(vec![]);
    let addr = start(ready(transport.clone()).await).await;

    let res = reqwest::Client::new()
        .post(format!("http://{}/track", addr))
        .json(&json!({"visitor_id": "v1"}))
        .send()
        .await
        .expect("request failed");
    assert!(res.status().is_client_error());
    assert!(transport.calls().is_empty());
}
