use std::net::SocketAddr;

use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use cloister::http;

use super::test_helpers::Harness;

struct Server {
    base: String,
    ct: CancellationToken,
    handle: JoinHandle<()>,
}

impl Server {
    async fn start(h: &Harness) -> Self {
        let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let ct = CancellationToken::new();
        let state = std::sync::Arc::clone(&h.state);
        let server_ct = ct.clone();
        let handle = tokio::spawn(async move {
            http::serve_on(listener, state, server_ct).await.expect("serve");
        });
        Self {
            base: format!("http://{addr}"),
            ct,
            handle,
        }
    }

    async fn shutdown(self) {
        self.ct.cancel();
        self.handle.await.expect("server task");
    }
}

#[tokio::test]
async fn health_endpoint_answers_ok() {
    let h = Harness::new().await;
    let server = Server::start(&h).await;

    let body = reqwest::get(format!("{}/health", server.base))
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert_eq!(body, "ok");

    server.shutdown().await;
}

#[tokio::test]
async fn status_endpoint_reports_counts() {
    let h = Harness::new().await;
    h.agent("quiet", 20, "").await;
    let server = Server::start(&h).await;

    let status: Value = reqwest::get(format!("{}/status", server.base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(status["counts"]["warning"], json!(1));
    assert_eq!(status["needs_attention"][0]["agent_id"], json!("quiet"));

    server.shutdown().await;
}

#[tokio::test]
async fn request_review_rejects_after_three_requeues() {
    let h = Harness::new().await;
    let server = Server::start(&h).await;
    let client = reqwest::Client::new();
    let url = format!("{}/workspaces/PAN-21/request-review", server.base);

    for expected in [2, 1, 0] {
        let response = client.post(&url).send().await.unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["queued"], json!(true));
        assert_eq!(body["remainingRequeues"], json!(expected));
    }

    let response = client
        .post(&url)
        .json(&json!({ "message": "please look again" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::TOO_MANY_REQUESTS);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["autoRequeueCount"], json!(4));

    let queued = h
        .state
        .specialists
        .peek_queue(cloister::models::specialist::SpecialistType::ReviewAgent)
        .await
        .unwrap();
    assert_eq!(queued.items.len(), 3);

    server.shutdown().await;
}

#[tokio::test]
async fn heartbeat_refreshes_known_agents_only() {
    let h = Harness::new().await;
    h.agent("a1", 20, "").await;
    let server = Server::start(&h).await;
    let client = reqwest::Client::new();

    let missing = client
        .post(format!("{}/agents/ghost/heartbeat", server.base))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
    let body: Value = missing.json().await.unwrap();
    assert_eq!(body["kind"], json!("not_found"));

    let ack = client
        .post(format!("{}/agents/a1/heartbeat", server.base))
        .json(&json!({ "context_tokens": 1200 }))
        .send()
        .await
        .unwrap();
    assert_eq!(ack.status(), reqwest::StatusCode::OK);
    let body: Value = ack.json().await.unwrap();
    assert_eq!(body["agent"]["context_tokens"], json!(1200));
    assert_eq!(body["rotation"]["should_rotate"], json!(false));

    let malformed = client
        .post(format!("{}/agents/a1/heartbeat", server.base))
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(malformed.status(), reqwest::StatusCode::BAD_REQUEST);

    server.shutdown().await;
}
