//! Image operation integration tests.
//!
//! Exercises the engine's image surface against locally registered images:
//! tag/untag identity, removal exit codes (1 missing, 2 in use), the
//! leaf-first prune fixpoint, and archive save/load round-trips.

use caravel::config::EngineConfig;
use caravel::engine::abi::AbiEngine;
use caravel::engine::{ContainerEngine, ImageEngine};
use caravel::image::{normalize_reference, ImageRecord};
use caravel::specgen::{ContainerSpec, ImageRuntimeConfig};
use chrono::Utc;
use sha2::Digest;
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

/// Registers a small synthetic image and returns its digest.
fn register_image(engine: &AbiEngine, tag: &str, parent: Option<&str>) -> String {
    let layer: Vec<u8> = format!("layer-for-{tag}").into_bytes();
    let layer_digest = format!("sha256:{}", hex::encode(sha2::Sha256::digest(&layer)));
    engine
        .image_store()
        .storage()
        .write_blob(&layer_digest, &layer)
        .unwrap();

    let digest = format!("sha256:{}", hex::encode(sha2::Sha256::digest(tag.as_bytes())));
    engine
        .image_store()
        .register(ImageRecord {
            digest: digest.clone(),
            tags: vec![normalize_reference(tag)],
            layers: vec![layer_digest],
            config_digest: "sha256:0".to_string(),
            config: ImageRuntimeConfig {
                id: digest.clone(),
                ..Default::default()
            },
            parent: parent.map(str::to_string),
            size: layer.len() as u64,
            created_at: Utc::now(),
        })
        .unwrap();
    digest
}

// =============================================================================
// Tag / Untag
// =============================================================================

#[tokio::test]
async fn tag_then_untag_is_identity_on_references() {
    let (_dir, engine) = engine();
    let digest = register_image(&engine, "alpine", None);

    let before = engine.image_inspect(&digest).await.unwrap().tags;
    engine.image_tag("alpine", "mine:v1").await.unwrap();
    assert!(engine.image_exists("mine:v1").await.unwrap().value);

    engine.image_untag("alpine", "mine:v1").await.unwrap();
    let after = engine.image_inspect(&digest).await.unwrap().tags;
    assert_eq!(before, after);
}

#[tokio::test]
async fn tags_are_exclusive_across_images() {
    let (_dir, engine) = engine();
    register_image(&engine, "one", None);
    let second = register_image(&engine, "two", None);

    engine.image_tag("one", "shared:t").await.unwrap();
    engine.image_tag("two", "shared:t").await.unwrap();

    // The tag moved; resolving it lands on the second image.
    let resolved = engine.image_inspect("shared:t").await.unwrap();
    assert_eq!(resolved.digest, second);
}

// =============================================================================
// Removal Exit Codes
// =============================================================================

#[tokio::test]
async fn remove_missing_reference_is_exit_1() {
    let (_dir, engine) = engine();
    let report = engine
        .image_remove(&["ghost".to_string()], false, false)
        .await
        .unwrap();
    assert_eq!(report.exit_code, 1);
}

#[tokio::test]
async fn remove_image_in_use_is_exit_2_until_container_gone() {
    let (_dir, engine) = engine();
    let digest = register_image(&engine, "busy", None);

    // A container whose record points at the image.
    let spec = ContainerSpec {
        name: Some("user".to_string()),
        rootfs: Some("/tmp/r".into()),
        command: vec!["true".to_string()],
        ..Default::default()
    };
    let generated = {
        let mut g = caravel::specgen::generate(&spec, None, None, engine.config()).unwrap();
        g.config.image_id = Some(digest.clone());
        g
    };
    let ctr = engine
        .container_store()
        .create(generated, vec![])
        .await
        .unwrap();

    let report = engine
        .image_remove(&["busy".to_string()], false, false)
        .await
        .unwrap();
    assert_eq!(report.exit_code, 2);
    assert!(report.errors[0].contains("in use"));

    // Remove the container, then removal succeeds.
    engine
        .container_rm(&[ctr], caravel::container::store::RemoveOptions::default())
        .await
        .unwrap();
    let report = engine
        .image_remove(&["busy".to_string()], false, false)
        .await
        .unwrap();
    assert_eq!(report.exit_code, 0);
    assert_eq!(report.deleted, vec![digest]);
}

#[tokio::test]
async fn remove_parent_of_another_image_is_exit_2() {
    let (_dir, engine) = engine();
    let parent = register_image(&engine, "base", None);
    register_image(&engine, "child", Some(&parent));

    let report = engine
        .image_remove(&["base".to_string()], false, false)
        .await
        .unwrap();
    assert_eq!(report.exit_code, 2);
}

// =============================================================================
// Prune
// =============================================================================

#[tokio::test]
async fn prune_all_removes_leaf_first_until_empty() {
    let (_dir, engine) = engine();
    let base = register_image(&engine, "base", None);
    let mid = register_image(&engine, "mid", Some(&base));
    register_image(&engine, "leaf", Some(&mid));

    let report = engine.image_prune(true).await.unwrap();
    assert_eq!(report.removed.len(), 3);
    assert_eq!(engine.image_list(None).await.unwrap().len(), 0);
}

#[tokio::test]
async fn prune_without_all_only_drops_untagged() {
    let (_dir, engine) = engine();
    register_image(&engine, "tagged", None);
    let dangling = register_image(&engine, "dangling", None);
    engine
        .image_untag(&dangling, "dangling")
        .await
        .unwrap();

    let report = engine.image_prune(false).await.unwrap();
    assert_eq!(report.removed, vec![dangling]);
    assert!(engine.image_exists("tagged").await.unwrap().value);
}

// =============================================================================
// Archives & Trees
// =============================================================================

#[tokio::test]
async fn save_then_load_restores_all_tags() {
    let (dir, engine) = engine();
    let digest = register_image(&engine, "keeper", None);
    engine.image_tag("keeper", "keeper:extra").await.unwrap();

    let archive = dir.path().join("image.tar");
    engine.image_save("keeper", &archive).await.unwrap();

    // Into a fresh engine.
    let (_dir2, other) = {
        let d = TempDir::new().unwrap();
        let config = EngineConfig::rooted_at(d.path());
        (d, AbiEngine::new_for_testing(config).unwrap())
    };
    let tags = other.image_load(&archive).await.unwrap();
    assert_eq!(tags.len(), 2);
    assert_eq!(other.image_inspect("keeper").await.unwrap().digest, digest);
}

#[tokio::test]
async fn import_then_history_and_tree() {
    let (_dir, engine) = engine();

    let mut tarball = Vec::new();
    {
        let mut builder = tar::Builder::new(&mut tarball);
        let mut header = tar::Header::new_gnu();
        header.set_size(3);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "etc/os", &b"abc"[..]).unwrap();
        builder.finish().unwrap();
    }
    let tmp = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), &tarball).unwrap();

    let digest = engine
        .image_import(tmp.path(), Some("imported:now"))
        .await
        .unwrap();
    let history = engine.image_history(&digest).await.unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].size > 0);

    let layers = engine.image_tree(&digest, false).await.unwrap();
    assert_eq!(layers.len(), 1);
}

#[tokio::test]
async fn tree_what_requires_lists_children() {
    let (_dir, engine) = engine();
    let base = register_image(&engine, "base", None);
    let child = register_image(&engine, "child", Some(&base));

    let requires = engine.image_tree(&base, true).await.unwrap();
    assert_eq!(requires, vec![child]);
}
