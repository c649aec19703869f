//! Copy engine integration tests.
//!
//! The documented semantics: at most one `CONTAINER:` side, fail before
//! touching the destination, base-name rename on file-to-file, bounded
//! symlink resolution inside the rootfs, and byte-identical round-trips
//! preserving mode bits.

use caravel::config::EngineConfig;
use caravel::engine::abi::AbiEngine;
use caravel::engine::ContainerEngine;
use caravel::error::Error;
use caravel::specgen::ContainerSpec;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use tempfile::TempDir;

async fn engine_with_container(name: &str) -> (TempDir, Arc<AbiEngine>, std::path::PathBuf) {
    let dir = TempDir::new().unwrap();
    let config = EngineConfig::rooted_at(dir.path());
    let engine = AbiEngine::new_for_testing(config).unwrap();

    let rootfs = dir.path().join("container-rootfs");
    std::fs::create_dir_all(rootfs.join("root")).unwrap();
    std::fs::create_dir_all(rootfs.join("etc")).unwrap();

    let spec = ContainerSpec {
        name: Some(name.to_string()),
        rootfs: Some(rootfs.clone()),
        command: vec!["sleep".to_string(), "1".to_string()],
        ..Default::default()
    };
    engine.container_create(spec).await.unwrap();

    (dir, engine, rootfs)
}

#[tokio::test]
async fn file_to_file_rename_into_container() {
    let (dir, engine, rootfs) = engine_with_container("c1").await;

    let host_a = dir.path().join("a");
    std::fs::write(&host_a, "hello").unwrap();

    engine
        .container_copy(host_a.to_str().unwrap(), "c1:/root/b")
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(rootfs.join("root/b")).unwrap(),
        "hello"
    );
    assert!(!rootfs.join("root/a").exists());
}

#[tokio::test]
async fn roundtrip_is_byte_identical_and_keeps_mode() {
    let (dir, engine, rootfs) = engine_with_container("c1").await;

    let original = rootfs.join("root/data.bin");
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    std::fs::write(&original, &payload).unwrap();
    std::fs::set_permissions(&original, std::fs::Permissions::from_mode(0o640)).unwrap();

    let host_copy = dir.path().join("x");
    engine
        .container_copy("c1:/root/data.bin", host_copy.to_str().unwrap())
        .await
        .unwrap();
    engine
        .container_copy(host_copy.to_str().unwrap(), "c1:/root/copy.bin")
        .await
        .unwrap();

    let roundtripped = std::fs::read(rootfs.join("root/copy.bin")).unwrap();
    assert_eq!(roundtripped, payload);
    let mode = std::fs::metadata(rootfs.join("root/copy.bin"))
        .unwrap()
        .permissions()
        .mode();
    assert_eq!(mode & 0o777, 0o640);
}

#[tokio::test]
async fn missing_container_source_fails_before_touching_destination() {
    let (dir, engine, _rootfs) = engine_with_container("c1").await;

    let dst = dir.path().join("out");
    let err = engine
        .container_copy("c1:/no/such/file", dst.to_str().unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
    assert!(!dst.exists());
}

#[tokio::test]
async fn missing_destination_parent_in_container_fails() {
    let (dir, engine, _rootfs) = engine_with_container("c1").await;

    let host_a = dir.path().join("a");
    std::fs::write(&host_a, "x").unwrap();

    let err = engine
        .container_copy(host_a.to_str().unwrap(), "c1:/no/such/dir/file")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
}

#[tokio::test]
async fn container_to_container_is_rejected() {
    let (_dir, engine, _rootfs) = engine_with_container("c1").await;
    let err = engine.container_copy("c1:/a", "c1:/b").await.unwrap_err();
    assert!(matches!(err, Error::InvalidArg(_)));
}

#[tokio::test]
async fn directory_copy_into_container() {
    let (dir, engine, rootfs) = engine_with_container("c1").await;

    let tree = dir.path().join("tree");
    std::fs::create_dir_all(tree.join("nested")).unwrap();
    std::fs::write(tree.join("top.txt"), "top").unwrap();
    std::fs::write(tree.join("nested/deep.txt"), "deep").unwrap();

    engine
        .container_copy(tree.to_str().unwrap(), "c1:/etc")
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(rootfs.join("etc/tree/nested/deep.txt")).unwrap(),
        "deep"
    );
}

#[tokio::test]
async fn symlink_in_container_cannot_escape_rootfs() {
    let (dir, engine, rootfs) = engine_with_container("c1").await;

    // A hostile absolute symlink inside the rootfs.
    std::os::unix::fs::symlink("/../../../../etc", rootfs.join("escape")).unwrap();

    let host_a = dir.path().join("a");
    std::fs::write(&host_a, "payload").unwrap();

    // The write lands inside the rootfs (clamped), never in the host /etc.
    engine
        .container_copy(host_a.to_str().unwrap(), "c1:/escape/injected")
        .await
        .unwrap();
    assert!(rootfs.join("etc/injected").exists());
    assert!(!std::path::Path::new("/etc/injected").exists());
}
