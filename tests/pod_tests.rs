//! Pod integration tests.
//!
//! A pod is an atomically-managed group sharing the infra container's
//! namespaces. These tests verify dependency-ordered start/stop, derived
//! state, aggregate reports, and removal cascades through the engine.

use caravel::config::EngineConfig;
use caravel::container::state::ContainerStatus;
use caravel::engine::abi::AbiEngine;
use caravel::engine::ContainerEngine;
use caravel::error::Error;
use caravel::pod::PodCreateOptions;
use caravel::reports::PodState;
use caravel::specgen::ContainerSpec;
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

fn engine() -> (TempDir, Arc<AbiEngine>) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::rooted_at(dir.path());
    let engine = AbiEngine::new_for_testing(config).unwrap();
    (dir, engine)
}

async fn pod_with_members(engine: &AbiEngine, pod_name: &str, members: &[&str]) -> String {
    let pod = engine
        .pod_create(PodCreateOptions {
            name: Some(pod_name.to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    for member in members {
        engine
            .container_create(ContainerSpec {
                name: Some(member.to_string()),
                rootfs: Some("/tmp/test-rootfs".into()),
                command: vec!["sleep".to_string(), "9".to_string()],
                pod: Some(pod.clone()),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    pod
}

// =============================================================================
// Creation & Membership
// =============================================================================

#[tokio::test]
async fn members_inherit_infra_namespaces() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["web"]).await;

    let inspect = engine.pod_inspect(&pod).await.unwrap();
    let infra = inspect.infra_container.clone().unwrap();

    let web = engine.container_inspect("web").await.unwrap();
    assert_eq!(
        web.config.namespaces.net,
        caravel::container::config::NamespaceMode::FromContainer(infra.clone())
    );
    assert_eq!(
        web.config.namespaces.ipc,
        caravel::container::config::NamespaceMode::FromContainer(infra)
    );
    assert_eq!(web.pod.as_deref(), Some(pod.as_str()));
}

#[tokio::test]
async fn conflicting_namespace_override_fails_validation() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &[]).await;

    let mut spec = ContainerSpec {
        name: Some("rebel".to_string()),
        rootfs: Some("/tmp/test-rootfs".into()),
        command: vec!["true".to_string()],
        pod: Some(pod),
        ..Default::default()
    };
    spec.namespaces.net = caravel::container::config::NamespaceMode::Host;

    let err = engine.container_create(spec).await.unwrap_err();
    assert!(matches!(err, Error::InvalidSpec { .. }));
}

// =============================================================================
// Ordered Start / Stop
// =============================================================================

#[tokio::test]
async fn infra_starts_first_and_stops_last() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["web", "db"]).await;
    let infra = engine
        .pod_inspect(&pod)
        .await
        .unwrap()
        .infra_container
        .unwrap();

    let start = engine.pod_start(&pod).await.unwrap();
    assert!(start.is_ok());
    assert_eq!(start.member_errs.first().unwrap().id, infra);

    let stop = engine.pod_stop(&pod, Some(0)).await.unwrap();
    assert!(stop.is_ok());
    assert_eq!(stop.member_errs.last().unwrap().id, infra);
}

#[tokio::test]
async fn member_start_brings_infra_up() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["web"]).await;
    let infra = engine
        .pod_inspect(&pod)
        .await
        .unwrap()
        .infra_container
        .unwrap();

    // Starting a member directly first starts the infra container.
    engine
        .container_start(&["web".to_string()])
        .await
        .unwrap();
    let infra_status = engine.container_inspect(&infra).await.unwrap().state.status;
    assert_eq!(infra_status, ContainerStatus::Running);
}

#[tokio::test]
async fn stop_then_start_restores_member_states() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["a", "b"]).await;
    engine.pod_start(&pod).await.unwrap();

    let before: Vec<_> = engine
        .pod_inspect(&pod)
        .await
        .unwrap()
        .members
        .iter()
        .map(|m| (m.id.clone(), m.status))
        .collect();

    engine.pod_stop(&pod, Some(0)).await.unwrap();
    assert_eq!(
        engine.pod_inspect(&pod).await.unwrap().state,
        PodState::Exited
    );
    engine.pod_start(&pod).await.unwrap();

    let after: Vec<_> = engine
        .pod_inspect(&pod)
        .await
        .unwrap()
        .members
        .iter()
        .map(|m| (m.id.clone(), m.status))
        .collect();
    assert_eq!(before, after);
}

// =============================================================================
// Benign Idempotencies
// =============================================================================

#[tokio::test]
async fn pod_start_when_started_is_304_kind() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["web"]).await;
    engine.pod_start(&pod).await.unwrap();

    let err = engine.pod_start(&pod).await.unwrap_err();
    assert!(matches!(err, Error::PodAlreadyStarted(_)));
    assert_eq!(err.http_status(), 304);
    assert_eq!(err.exit_code(), 0);
}

#[tokio::test]
async fn pod_stop_when_stopped_is_304_kind() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["web"]).await;
    engine.pod_start(&pod).await.unwrap();
    engine.pod_stop(&pod, Some(0)).await.unwrap();

    let err = engine.pod_stop(&pod, Some(0)).await.unwrap_err();
    assert!(matches!(err, Error::PodAlreadyStopped(_)));
}

// =============================================================================
// Kill & Derived State
// =============================================================================

#[tokio::test]
async fn kill_without_running_members_is_conflict() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["web"]).await;

    let err = engine.pod_kill(&pod, "SIGKILL").await.unwrap_err();
    assert_eq!(err.http_status(), 409);
}

#[tokio::test]
async fn derived_state_transitions() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["web"]).await;

    assert_eq!(
        engine.pod_inspect(&pod).await.unwrap().state,
        PodState::Created
    );

    engine.pod_start(&pod).await.unwrap();
    assert_eq!(
        engine.pod_inspect(&pod).await.unwrap().state,
        PodState::Running
    );

    engine.pod_pause(&pod).await.unwrap();
    assert_eq!(
        engine.pod_inspect(&pod).await.unwrap().state,
        PodState::Paused
    );

    engine.pod_unpause(&pod).await.unwrap();
    engine.pod_stop(&pod, Some(0)).await.unwrap();
    assert_eq!(
        engine.pod_inspect(&pod).await.unwrap().state,
        PodState::Exited
    );
}

// =============================================================================
// Removal
// =============================================================================

#[tokio::test]
async fn rm_refuses_running_pod_without_force() {
    let (_dir, engine) = engine();
    let pod = pod_with_members(&engine, "p1", &["web"]).await;
    engine.pod_start(&pod).await.unwrap();

    let err = engine.pod_rm(&pod, false, false).await.unwrap_err();
    assert!(matches!(err, Error::CtrStateInvalid { .. }));

    let report = engine.pod_rm(&pod, true, false).await.unwrap();
    assert!(report.is_ok());
    assert!(!engine.pod_exists(&pod).await.unwrap().value);
    // Members removed with the pod.
    assert!(!engine.container_exists("web").await.unwrap().value);
}

#[tokio::test]
async fn rm_ignore_suppresses_missing_pod() {
    let (_dir, engine) = engine();
    let report = engine.pod_rm("ghost", false, true).await.unwrap();
    assert!(report.member_errs.is_empty());

    let err = engine.pod_rm("ghost", false, false).await.unwrap_err();
    assert!(matches!(err, Error::NoSuchPod(_)));
}

#[tokio::test]
async fn prune_spares_running_pods() {
    let (_dir, engine) = engine();
    let cold = pod_with_members(&engine, "cold", &[]).await;
    let hot = pod_with_members(&engine, "hot", &["web"]).await;
    engine.pod_start(&hot).await.unwrap();

    let report = engine.pod_prune().await.unwrap();
    assert!(report.removed.contains(&cold));
    assert!(engine.pod_exists(&hot).await.unwrap().value);
}
