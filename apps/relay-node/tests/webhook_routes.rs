use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use relay_core::testkit::ScriptedAdapter;
use relay_core::{ConnectionStatus, InMemoryRepository, Instance, InstanceRepository};
use relay_dispatch::WebhookReconciler;
use relay_node::{NodeState, build_router};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn setup() -> (axum::Router, Arc<InMemoryRepository>, Instance) {
    let repo = Arc::new(InMemoryRepository::new());
    let instance = Instance::new("owner-1", "chatA", "store-1");
    repo.save_instance(&instance).await.unwrap();
    let adapters = Arc::new(ScriptedAdapter::new("chatA").into_factory());
    let router = build_router(NodeState {
        reconciler: Arc::new(WebhookReconciler::new(repo.clone(), adapters)),
    });
    (router, repo, instance)
}

fn webhook(path: &str, body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

async fn wait_for_status(repo: &InMemoryRepository, id: &str, status: ConnectionStatus) {
    for _ in 0..100 {
        let current = repo.get_instance_by_id(id).await.unwrap().unwrap().status;
        if current == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("instance never reached {status}");
}

#[tokio::test]
async fn webhook_is_acknowledged_and_reconciled_in_background() {
    let (router, repo, instance) = setup().await;
    let payload = json!({"event": "connection_update", "state": "open"}).to_string();

    let response = router
        .oneshot(webhook("/webhooks/chatA/store-1", &payload))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(json_body(response).await, json!({"ok": true}));
    wait_for_status(&repo, &instance.id, ConnectionStatus::Connected).await;
}

#[tokio::test]
async fn unknown_instances_are_still_acknowledged() {
    let (router, repo, instance) = setup().await;
    let payload = json!({"event": "connection_update", "state": "open"}).to_string();

    let response = router
        .oneshot(webhook("/webhooks/chatA/nobody", &payload))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let stored = repo.get_instance_by_id(&instance.id).await.unwrap().unwrap();
    assert_eq!(stored.status, ConnectionStatus::Pending);
}

#[tokio::test]
async fn malformed_json_is_rejected() {
    let (router, _, _) = setup().await;
    let response = router
        .oneshot(webhook("/webhooks/chatA/store-1", "{not json"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert_eq!(body["ok"], false);
    assert!(body["error"].as_str().unwrap().starts_with("invalid json"));
}

#[tokio::test]
async fn healthz_answers_ok() {
    let (router, _, _) = setup().await;
    let response = router
        .oneshot(
            Request::builder()
                .uri("/healthz")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(json_body(response).await, json!({"ok": true}));
}
