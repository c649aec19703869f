//! HTTP service tests, driven at the router level.
//!
//! Each test builds the full router over a fresh engine and fires requests
//! through it directly: status mapping per error kind, 304 semantics on
//! benign idempotencies, the swarm 503 family, and schema differences
//! between the native and Docker-compatible trees.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use caravel::config::EngineConfig;
use caravel::engine::abi::AbiEngine;
use caravel::engine::ContainerEngine;
use caravel::service::{build_router, AppState};
use caravel::specgen::ContainerSpec;
use http_body_util::BodyExt;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    _dir: TempDir,
    engine: Arc<AbiEngine>,
    router: axum::Router,
}

fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::rooted_at(dir.path());
    let engine = AbiEngine::new_for_testing(config).unwrap();
    let router = build_router(AppState {
        engine: Arc::clone(&engine),
    });
    Fixture {
        _dir: dir,
        engine,
        router,
    }
}

async fn send(router: &axum::Router, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
    (status, json)
}

fn get(path: &str) -> Request<Body> {
    Request::builder().uri(path).body(Body::empty()).unwrap()
}

fn post(path: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .body(Body::empty())
        .unwrap()
}

fn post_json(path: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

async fn create_sleeper(engine: &AbiEngine, name: &str) -> String {
    engine
        .container_create(ContainerSpec {
            name: Some(name.to_string()),
            rootfs: Some("/tmp/test-rootfs".into()),
            command: vec!["sleep".to_string(), "9".to_string()],
            ..Default::default()
        })
        .await
        .unwrap()
}

// =============================================================================
// Ping & Version Header
// =============================================================================

#[tokio::test]
async fn ping_carries_api_version_header() {
    let fixture = fixture();
    let response = fixture.router.clone().oneshot(get("/_ping")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get("Libpod-API-Version")
            .and_then(|v| v.to_str().ok()),
        Some(caravel::constants::API_VERSION)
    );
}

#[tokio::test]
async fn versioned_libpod_ping_routes() {
    let fixture = fixture();
    let response = fixture
        .router
        .clone()
        .oneshot(get("/v2.0.0/libpod/_ping"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// =============================================================================
// Error Mapping
// =============================================================================

#[tokio::test]
async fn missing_objects_are_404() {
    let fixture = fixture();
    for path in [
        "/v2.0.0/libpod/containers/ghost/json",
        "/v2.0.0/libpod/pods/ghost/json",
        "/v2.0.0/libpod/images/ghost/json",
        "/v2.0.0/libpod/volumes/ghost/json",
    ] {
        let (status, body) = send(&fixture.router, get(path)).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{path}");
        assert!(body["message"].as_str().unwrap().contains("no such"));
    }
}

#[tokio::test]
async fn invalid_spec_is_400() {
    let fixture = fixture();
    // Neither image nor rootfs.
    let (status, body) = send(
        &fixture.router,
        post_json("/v2.0.0/libpod/containers/create", serde_json::json!({})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"].as_str().unwrap().contains("invalid spec"));
}

#[tokio::test]
async fn state_conflicts_are_409() {
    let fixture = fixture();
    let id = create_sleeper(&fixture.engine, "c1").await;

    // Killing a container that never started is a state conflict.
    let (status, _) = send(
        &fixture.router,
        post(&format!("/v2.0.0/libpod/containers/{id}/kill?signal=9")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

// =============================================================================
// Lifecycle Over HTTP
// =============================================================================

#[tokio::test]
async fn create_start_inspect_over_native_schema() {
    let fixture = fixture();
    let (status, body) = send(
        &fixture.router,
        post_json(
            "/v2.0.0/libpod/containers/create",
            serde_json::json!({
                "name": "web",
                "rootfs": "/tmp/test-rootfs",
                "command": ["sleep", "100"],
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &fixture.router,
        post(&format!("/v2.0.0/libpod/containers/{id}/start")),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(
        &fixture.router,
        get("/v2.0.0/libpod/containers/web/json"),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"]["status"], "running");
    assert!(body["state"]["pid"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn stopping_a_stopped_container_is_304() {
    let fixture = fixture();
    let id = create_sleeper(&fixture.engine, "c1").await;
    fixture
        .engine
        .container_start(&[id.clone()])
        .await
        .unwrap();

    let (status, _) = send(
        &fixture.router,
        post(&format!("/v2.0.0/libpod/containers/{id}/stop?t=0")),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(
        &fixture.router,
        post(&format!("/v2.0.0/libpod/containers/{id}/stop?t=0")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
}

#[tokio::test]
async fn starting_a_started_pod_is_304() {
    let fixture = fixture();
    let (_, body) = send(
        &fixture.router,
        post_json(
            "/v2.0.0/libpod/pods/create",
            serde_json::json!({ "name": "p1" }),
        ),
    )
    .await;
    let pod = body["id"].as_str().unwrap().to_string();
    create_sleeper_in_pod(&fixture.engine, "member", &pod).await;

    let (status, _) = send(
        &fixture.router,
        post(&format!("/v2.0.0/libpod/pods/{pod}/start")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        &fixture.router,
        post(&format!("/v2.0.0/libpod/pods/{pod}/start")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_MODIFIED);
}

async fn create_sleeper_in_pod(engine: &AbiEngine, name: &str, pod: &str) {
    engine
        .container_create(ContainerSpec {
            name: Some(name.to_string()),
            rootfs: Some("/tmp/test-rootfs".into()),
            command: vec!["sleep".to_string(), "9".to_string()],
            pod: Some(pod.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
}

// =============================================================================
// Swarm Family
// =============================================================================

#[tokio::test]
async fn swarm_endpoints_answer_503() {
    let fixture = fixture();
    for path in [
        "/v1.40/swarm",
        "/v1.40/services/anything",
        "/v1.40/nodes/n1",
        "/v1.40/tasks/t1",
        "/v1.40/secrets/s1",
        "/v1.40/configs/c1",
    ] {
        let (status, body) = send(&fixture.router, get(path)).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE, "{path}");
        assert_eq!(body["message"], "node is not part of a swarm");
    }
}

// =============================================================================
// Volume Contracts
// =============================================================================

#[tokio::test]
async fn volume_prune_rejects_filters() {
    let fixture = fixture();
    let filters = serde_json::json!({"label": ["a=b"]}).to_string();
    let encoded: String = filters
        .bytes()
        .map(|b| format!("%{b:02X}"))
        .collect();
    let (status, body) = send(
        &fixture.router,
        post(&format!("/v2.0.0/libpod/volumes/prune?filters={encoded}")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("not applicable"));
}

#[tokio::test]
async fn compat_volume_envelope_shape() {
    let fixture = fixture();
    let (status, _) = send(
        &fixture.router,
        post_json("/v1.40/volumes/create", serde_json::json!({"Name": "v1"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = send(&fixture.router, get("/v1.40/volumes")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["Volumes"].is_array());
    assert!(body["Warnings"].is_array());
    assert_eq!(body["Volumes"][0]["Name"], "v1");
}

// =============================================================================
// Compat Schema
// =============================================================================

#[tokio::test]
async fn compat_list_uses_docker_shapes() {
    let fixture = fixture();
    let id = create_sleeper(&fixture.engine, "web").await;
    fixture.engine.container_start(&[id]).await.unwrap();

    let (status, body) = send(&fixture.router, get("/v1.40/containers/json")).await;
    assert_eq!(status, StatusCode::OK);
    let first = &body[0];
    assert_eq!(first["Names"][0], "/web");
    assert_eq!(first["State"], "running");
    assert!(first["Status"].as_str().unwrap().starts_with("Up"));
}

#[tokio::test]
async fn compat_wait_returns_status_code_envelope() {
    let fixture = fixture();
    let id = create_sleeper(&fixture.engine, "c1").await;
    fixture.engine.container_start(&[id.clone()]).await.unwrap();
    fixture
        .engine
        .container_stop(&[id.clone()], Some(0), false)
        .await
        .unwrap();

    let (status, body) = send(
        &fixture.router,
        post(&format!("/v1.40/containers/{id}/wait")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["StatusCode"].is_number());
}

#[tokio::test]
async fn native_and_compat_version_shapes_differ() {
    let fixture = fixture();
    let (_, native) = send(&fixture.router, get("/v2.0.0/libpod/version")).await;
    assert!(native["api_version"].is_string());

    let (_, compat) = send(&fixture.router, get("/version")).await;
    assert!(compat["ApiVersion"].is_string());
    assert!(compat["Components"].is_array());
}

// =============================================================================
// Exists Endpoints
// =============================================================================

#[tokio::test]
async fn exists_endpoints_use_204_and_404() {
    let fixture = fixture();
    create_sleeper(&fixture.engine, "here").await;

    let response = fixture
        .router
        .clone()
        .oneshot(get("/v2.0.0/libpod/containers/here/exists"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = fixture
        .router
        .clone()
        .oneshot(get("/v2.0.0/libpod/containers/gone/exists"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
