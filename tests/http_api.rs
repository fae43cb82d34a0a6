// tests/http_api.rs

//! HTTP surface tests driven through the router with `oneshot`.

#![cfg(feature = "server")]

mod common;

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use common::{RecordingBackend, controller_with, id};
use futures::StreamExt;
use ondemand::delivery::routes::build_router;
use ondemand::{ConfirmationHandle, DeliveryController, StatusUpdate};
use serde_json::{Value, json};
use std::time::Duration;
use tower::ServiceExt;

async fn call(
    controller: &DeliveryController,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = build_router(controller.clone())
        .oneshot(request)
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, value)
}

#[tokio::test]
async fn test_health() {
    let backend = RecordingBackend::new(&[]);
    let controller = controller_with(&backend);

    let (status, body) = call(&controller, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["backend"], "recording");
}

#[tokio::test]
async fn test_install_open_and_in_progress() {
    let backend = RecordingBackend::new(&["maps"]);
    let controller = controller_with(&backend);

    let (status, body) = call(&controller, "POST", "/v1/modules/maps/install", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"action": "opened", "module": "maps"}));

    let (status, body) = call(&controller, "POST", "/v1/modules/camera/install", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["action"], "started");

    let (status, body) = call(&controller, "POST", "/v1/modules/camera/install", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["action"], "in_progress");
    assert_eq!(backend.start_calls(), 1);
}

#[tokio::test]
async fn test_get_module_and_listings() {
    let backend = RecordingBackend::new(&["maps"]);
    let controller = controller_with(&backend);

    let (status, body) = call(&controller, "GET", "/v1/modules/camera", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:ondemand:error:no_session");

    controller.install_or_open("camera").await.unwrap();
    backend.emit(StatusUpdate::downloading(id("camera"), 25, 100));

    let (status, body) = call(&controller, "GET", "/v1/modules/camera", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "downloading");
    assert_eq!(body["bytes_downloaded"], 25);

    let (_, sessions) = call(&controller, "GET", "/v1/sessions", None).await;
    assert_eq!(sessions.as_array().unwrap().len(), 1);

    let (_, installed) = call(&controller, "GET", "/v1/installed", None).await;
    assert_eq!(installed, json!({"modules": ["maps"]}));
}

#[tokio::test]
async fn test_problem_documents() {
    let backend = RecordingBackend::new(&[]);
    let controller = controller_with(&backend);

    let (status, body) = call(&controller, "POST", "/v1/modules/9bad/install", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["type"], "urn:ondemand:error:invalid_module_id");
    assert_eq!(body["status"], 400);

    let (status, body) = call(
        &controller,
        "POST",
        "/v1/uninstall",
        Some(json!({"modules": ["m1"]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["type"], "urn:ondemand:error:not_installed");

    let (status, body) = call(
        &controller,
        "POST",
        "/v1/modules/m1/confirmation",
        Some(json!({"approve": true})),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["type"], "urn:ondemand:error:no_confirmation_pending");
    assert_eq!(body["module"], "m1");
}

#[tokio::test]
async fn test_backend_failure_maps_to_bad_gateway() {
    let backend = RecordingBackend::new(&[]);
    backend.fail_next_start(-6);
    let controller = controller_with(&backend);

    let (status, body) = call(&controller, "POST", "/v1/modules/m1/install", None).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["type"], "urn:ondemand:error:backend_failure");
}

#[tokio::test]
async fn test_uninstall_confirmation_acknowledge() {
    let backend = RecordingBackend::new(&["m1"]);
    let controller = controller_with(&backend);

    let (status, body) = call(
        &controller,
        "POST",
        "/v1/uninstall",
        Some(json!({"modules": ["m1"]})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");

    controller.install_or_open("m2").await.unwrap();
    backend.emit(StatusUpdate::requires_confirmation(
        id("m2"),
        ConfirmationHandle("gate".to_string()),
    ));
    let (status, body) = call(
        &controller,
        "POST",
        "/v1/modules/m2/confirmation",
        Some(json!({"approve": false})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"module": "m2", "approved": false}));

    controller.install_or_open("m3").await.unwrap();
    backend.emit(StatusUpdate::new(id("m3"), ondemand::BackendStatus::Installed));
    let (status, _) = call(&controller, "POST", "/v1/modules/m3/acknowledge", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(controller.get_session("m3").unwrap().is_none());
}

#[tokio::test]
async fn test_metrics_text() {
    let backend = RecordingBackend::new(&["m1"]);
    let controller = controller_with(&backend);
    controller.install_or_open("m1").await.unwrap();

    let (status, body) = call(&controller, "GET", "/v1/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = body.as_str().unwrap();
    assert!(text.contains("ondemand_install_requests_total 1"));
    assert!(text.contains("ondemand_opens_total 1"));
    assert!(text.contains("# TYPE ondemand_subscribers gauge"));
}

#[tokio::test]
async fn test_event_stream() {
    let backend = RecordingBackend::new(&[]);
    let controller = controller_with(&backend);

    let request = Request::builder()
        .uri("/v1/events")
        .body(Body::empty())
        .unwrap();
    let response = build_router(controller.clone())
        .oneshot(request)
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/event-stream");

    let mut body = response.into_body().into_data_stream();
    let mut received = String::new();

    let first = tokio::time::timeout(Duration::from_secs(5), body.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    received.push_str(&String::from_utf8_lossy(&first));
    assert!(received.contains("event: connected"));

    controller.install_or_open("m1").await.unwrap();

    while !received.contains("\"state\":\"requested\"") {
        let chunk = tokio::time::timeout(Duration::from_secs(5), body.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(received.contains("event: session"));
    assert!(received.contains("\"module_id\":\"m1\""));
}
