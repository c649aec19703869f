//! Tunnel-mode tests: a real service on a unix socket, a real client.
//!
//! The parity property: for the operations both transports support, the
//! tunnel engine returns the same reports as the ABI engine it fronts
//! (modulo timestamps), and remote 404s surface as the same `NoSuch*`
//! kinds ABI mode produces.

use caravel::config::EngineConfig;
use caravel::container::store::RemoveOptions;
use caravel::engine::abi::AbiEngine;
use caravel::engine::tunnel::TunnelEngine;
use caravel::engine::uri::ConnectionUri;
use caravel::engine::{ContainerEngine, ImageEngine};
use caravel::error::Error;
use caravel::service::{ApiServer, ListenAddr};
use caravel::specgen::ContainerSpec;
use std::collections::HashMap;
use std::sync::Arc;
use tempfile::TempDir;

// =============================================================================
// Test Helpers
// =============================================================================

struct Fixture {
    _dir: TempDir,
    abi: Arc<AbiEngine>,
    tunnel: TunnelEngine,
}

/// Starts a service over a temp unix socket and connects a tunnel client
/// to it. Both transports front the same engine instance.
async fn fixture() -> Fixture {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::rooted_at(dir.path());
    let abi = AbiEngine::new_for_testing(config).unwrap();

    let socket = dir.path().join("caravel.sock");
    let server = ApiServer::new(Arc::clone(&abi), ListenAddr::Unix(socket.clone()));
    tokio::spawn(async move {
        let _ = server.run().await;
    });

    // Wait for the socket to appear.
    for _ in 0..100 {
        if socket.exists() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }

    let tunnel = TunnelEngine::connect(ConnectionUri::Unix {
        path: socket.clone(),
    })
    .await
    .unwrap();

    Fixture {
        _dir: dir,
        abi,
        tunnel,
    }
}

fn sleeper(name: &str) -> ContainerSpec {
    ContainerSpec {
        name: Some(name.to_string()),
        rootfs: Some("/tmp/test-rootfs".into()),
        command: vec!["sleep".to_string(), "9".to_string()],
        ..Default::default()
    }
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn connect_performs_version_handshake() {
    // fixture() already pings; reaching here means the handshake passed.
    let fixture = fixture().await;
    let version = fixture.tunnel.version().await.unwrap();
    assert_eq!(version.api_version, caravel::constants::API_VERSION);
}

// =============================================================================
// Remote Parity
// =============================================================================

#[tokio::test]
async fn lifecycle_reports_match_between_transports() {
    let fixture = fixture().await;

    // Create through the tunnel; the ABI side sees it immediately.
    let id = fixture.tunnel.container_create(sleeper("c1")).await.unwrap();
    assert!(fixture.abi.container_exists(&id).await.unwrap().value);

    let remote_start = fixture.tunnel.container_start(&[id.clone()]).await.unwrap();
    assert!(remote_start[0].err.is_none());

    // Inspect through both; identical modulo nothing (same backing store).
    let local = fixture.abi.container_inspect(&id).await.unwrap();
    let remote = fixture.tunnel.container_inspect(&id).await.unwrap();
    assert_eq!(local.id, remote.id);
    assert_eq!(local.name, remote.name);
    assert_eq!(local.state.status, remote.state.status);
    assert_eq!(local.state.pid, remote.state.pid);
    assert_eq!(local.config.command, remote.config.command);

    // List parity.
    let local_list = fixture.abi.container_list(true).await.unwrap();
    let remote_list = fixture.tunnel.container_list(true).await.unwrap();
    assert_eq!(local_list.len(), remote_list.len());
    assert_eq!(local_list[0].id, remote_list[0].id);
    assert_eq!(local_list[0].status, remote_list[0].status);
}

#[tokio::test]
async fn stop_idempotence_travels_the_wire() {
    let fixture = fixture().await;
    let id = fixture.tunnel.container_create(sleeper("c1")).await.unwrap();
    fixture.tunnel.container_start(&[id.clone()]).await.unwrap();

    let first = fixture
        .tunnel
        .container_stop(&[id.clone()], Some(0), false)
        .await
        .unwrap();
    assert!(first[0].err.is_none());

    // The remote 304 comes back as a benign kind, so the report says ok.
    let second = fixture
        .tunnel
        .container_stop(&[id.clone()], Some(0), false)
        .await
        .unwrap();
    assert!(second[0].err.is_none());
}

#[tokio::test]
async fn remote_404_reclassifies_to_no_such_kinds() {
    let fixture = fixture().await;

    let err = fixture.tunnel.container_inspect("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NoSuchContainer(_)));

    let err = fixture.tunnel.pod_inspect("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NoSuchPod(_)));

    let err = fixture.tunnel.volume_inspect("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NoSuchVolume(_)));

    let err = fixture.tunnel.image_inspect("ghost").await.unwrap_err();
    assert!(matches!(err, Error::NoSuchImage(_)));
}

#[tokio::test]
async fn exists_checks_round_trip() {
    let fixture = fixture().await;
    fixture.tunnel.container_create(sleeper("real")).await.unwrap();

    assert!(fixture.tunnel.container_exists("real").await.unwrap().value);
    assert!(!fixture.tunnel.container_exists("fake").await.unwrap().value);
    assert!(!fixture.tunnel.pod_exists("fake").await.unwrap().value);
}

// =============================================================================
// Pods Over the Wire
// =============================================================================

#[tokio::test]
async fn pod_lifecycle_over_tunnel() {
    let fixture = fixture().await;
    let pod = fixture
        .tunnel
        .pod_create(caravel::pod::PodCreateOptions {
            name: Some("p1".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    let mut member = sleeper("member");
    member.pod = Some(pod.clone());
    fixture.tunnel.container_create(member).await.unwrap();

    let report = fixture.tunnel.pod_start(&pod).await.unwrap();
    assert!(report.is_ok());

    // Already started: benign kind across the wire.
    let err = fixture.tunnel.pod_start(&pod).await.unwrap_err();
    assert!(matches!(err, Error::PodAlreadyStarted(_)));

    let report = fixture.tunnel.pod_rm(&pod, true, false).await.unwrap();
    assert!(report.is_ok());
    assert!(!fixture.abi.pod_exists(&pod).await.unwrap().value);
}

// =============================================================================
// Volumes Over the Wire
// =============================================================================

#[tokio::test]
async fn volume_ops_and_prune_contract() {
    let fixture = fixture().await;
    let volume = fixture
        .tunnel
        .volume_create(caravel::volume::VolumeCreateOptions {
            name: Some("data".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(volume.name, "data");
    assert_eq!(volume.scope, "local");

    // Filterless prune works; any filter is rejected remotely too.
    fixture.tunnel.volume_prune(HashMap::new()).await.unwrap();
    let mut filters = HashMap::new();
    filters.insert("label".to_string(), vec!["x=y".to_string()]);
    let err = fixture.tunnel.volume_prune(filters).await.unwrap_err();
    assert!(matches!(err, Error::Internal(_) | Error::NotImplemented(_)));
}

// =============================================================================
// Local-Only Operations
// =============================================================================

#[tokio::test]
async fn local_only_operations_refuse_remotely() {
    let fixture = fixture().await;
    fixture.tunnel.container_create(sleeper("c1")).await.unwrap();

    let err = fixture.tunnel.container_mount("c1").await.unwrap_err();
    assert!(matches!(err, Error::NotImplementedRemote("mount")));
    assert_eq!(err.http_status(), 400);

    let err = fixture.tunnel.container_unmount("c1").await.unwrap_err();
    assert!(matches!(err, Error::NotImplementedRemote("unmount")));

    let err = fixture.tunnel.container_copy("/a", "c1:/b").await.unwrap_err();
    assert!(matches!(err, Error::NotImplementedRemote("copy")));

    // The ABI engine happily mounts the same container.
    let path = fixture.abi.container_mount("c1").await.unwrap();
    assert!(path.to_string_lossy().contains("rootfs")
        || path.to_string_lossy().contains("test-rootfs"));
}

// =============================================================================
// System Surface
// =============================================================================

#[tokio::test]
async fn system_reports_match() {
    let fixture = fixture().await;
    let local = fixture.abi.info().await.unwrap();
    let remote = fixture.tunnel.info().await.unwrap();
    assert_eq!(local.graph_root, remote.graph_root);
    assert_eq!(local.rootless, remote.rootless);

    let df = fixture.tunnel.system_df().await.unwrap();
    assert_eq!(df.len(), 3);
}

// =============================================================================
// Cleanup Path
// =============================================================================

#[tokio::test]
async fn rm_over_tunnel_cleans_up() {
    let fixture = fixture().await;
    let id = fixture.tunnel.container_create(sleeper("c1")).await.unwrap();
    fixture.tunnel.container_start(&[id.clone()]).await.unwrap();

    let reports = fixture
        .tunnel
        .container_rm(
            &[id.clone()],
            RemoveOptions {
                force: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(reports[0].err.is_none());
    assert!(!fixture.abi.container_exists(&id).await.unwrap().value);
}
