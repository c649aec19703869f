//! On-disk storage: content-addressed blobs and the graph/run layout.
//!
//! Layout:
//!
//! ```text
//! <graph-root>/
//! ├── blobs/sha256/ab/abcd...        content-addressed blobs (sharded)
//! ├── images/                        image records + tag index (JSON)
//! └── containers/<id>/
//!     ├── userdata/                  config.json, conmon.pid, pidfile,
//!     │                              hosts, hostname, resolv.conf
//!     └── rootfs/                    assembled root filesystem
//! <run-root>/
//! ├── containers/<id>/               ephemeral state, cleaned on reboot
//! └── volumes/<name>/_data/          volume mount points
//! ```
//!
//! Blob writes verify the SHA-256 digest before commit and land via a
//! temp-file rename, so a crash never leaves a partial blob under its final
//! name. Layer extraction into a rootfs validates every tar entry against
//! path traversal and size limits.

use crate::constants::{
    BLOB_STORE_DIR, CONTAINER_USERDATA_DIR, GRAPH_CONTAINERS_DIR, IMAGE_STORE_DIR,
    MAX_LAYER_SIZE, MAX_ROOTFS_SIZE, RUN_CONTAINERS_DIR, VOLUME_DATA_DIR, VOLUMES_DIR,
};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tar::Archive;
use tracing::{debug, info};

/// Owns the on-disk layout for one engine instance.
#[derive(Debug, Clone)]
pub struct Storage {
    graph_root: PathBuf,
    run_root: PathBuf,
}

impl Storage {
    /// Opens (creating if needed) the storage roots.
    pub fn open(graph_root: impl Into<PathBuf>, run_root: impl Into<PathBuf>) -> Result<Self> {
        let graph_root = graph_root.into();
        let run_root = run_root.into();
        for dir in [
            graph_root.join(BLOB_STORE_DIR),
            graph_root.join(IMAGE_STORE_DIR),
            graph_root.join(GRAPH_CONTAINERS_DIR),
            run_root.join(RUN_CONTAINERS_DIR),
            run_root.join(VOLUMES_DIR),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::Storage {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        info!(graph = %graph_root.display(), run = %run_root.display(), "storage opened");
        Ok(Self {
            graph_root,
            run_root,
        })
    }

    pub fn graph_root(&self) -> &Path {
        &self.graph_root
    }

    pub fn run_root(&self) -> &Path {
        &self.run_root
    }

    // =========================================================================
    // Container Layout
    // =========================================================================

    /// Persistent directory of a container.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.graph_root.join(GRAPH_CONTAINERS_DIR).join(id)
    }

    /// Runtime-files directory of a container.
    pub fn container_userdata(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(CONTAINER_USERDATA_DIR)
    }

    /// Assembled rootfs of a container.
    pub fn container_rootfs(&self, id: &str) -> PathBuf {
        self.container_dir(id).join("rootfs")
    }

    /// Ephemeral directory of a container.
    pub fn container_run_dir(&self, id: &str) -> PathBuf {
        self.run_root.join(RUN_CONTAINERS_DIR).join(id)
    }

    /// Image-record directory.
    pub fn image_store_dir(&self) -> PathBuf {
        self.graph_root.join(IMAGE_STORE_DIR)
    }

    /// Mount point of a named volume.
    pub fn volume_data_dir(&self, name: &str) -> PathBuf {
        self.run_root.join(VOLUMES_DIR).join(name).join(VOLUME_DATA_DIR)
    }

    /// Creates the container's persistent and ephemeral directories.
    pub fn create_container_dirs(&self, id: &str) -> Result<()> {
        for dir in [
            self.container_userdata(id),
            self.container_rootfs(id),
            self.container_run_dir(id),
        ] {
            fs::create_dir_all(&dir).map_err(|e| Error::Storage {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Removes every trace of a container from both roots.
    pub fn remove_container_dirs(&self, id: &str) -> Result<()> {
        for dir in [self.container_dir(id), self.container_run_dir(id)] {
            if dir.exists() {
                fs::remove_dir_all(&dir).map_err(|e| Error::Storage {
                    path: dir.clone(),
                    reason: e.to_string(),
                })?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Blobs
    // =========================================================================

    /// Path a digest maps to. Digests are sanitised to hex before any path
    /// is built, so a hostile digest cannot escape the blob directory.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        let hash = digest.strip_prefix("sha256:").unwrap_or(digest);
        let safe: String = hash.chars().filter(|c| c.is_ascii_hexdigit()).collect();
        if safe.is_empty() {
            return self.graph_root.join(BLOB_STORE_DIR).join("invalid");
        }
        let shard = &safe[..2.min(safe.len())];
        self.graph_root
            .join(BLOB_STORE_DIR)
            .join("sha256")
            .join(shard)
            .join(&safe)
    }

    pub fn has_blob(&self, digest: &str) -> bool {
        self.blob_path(digest).exists()
    }

    pub fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        let path = self.blob_path(digest);
        fs::read(&path).map_err(|_| Error::NoSuchImage(digest.to_string()))
    }

    /// Stores a blob, verifying its content hashes to `digest`.
    pub fn write_blob(&self, digest: &str, data: &[u8]) -> Result<()> {
        let expected = digest.strip_prefix("sha256:").ok_or_else(|| {
            Error::InvalidArg(format!("unsupported digest algorithm: {digest}"))
        })?;
        let computed = hex::encode(Sha256::digest(data));
        if computed != expected {
            return Err(Error::Storage {
                path: self.blob_path(digest),
                reason: format!("digest mismatch: expected {expected}, computed {computed}"),
            });
        }

        let path = self.blob_path(digest);
        if path.exists() {
            debug!(digest, "blob already present");
            return Ok(());
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::Storage {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        // Unique temp name so concurrent writers of the same blob never
        // collide; the final rename is atomic and content is identical.
        let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::new_v4().simple()));
        fs::write(&tmp, data).map_err(|e| Error::Storage {
            path: tmp.clone(),
            reason: e.to_string(),
        })?;
        fs::rename(&tmp, &path).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            Error::Storage {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;
        debug!(digest, bytes = data.len(), "blob stored");
        Ok(())
    }

    pub fn remove_blob(&self, digest: &str) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| Error::Storage {
                path,
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Size of a stored blob, if present.
    pub fn blob_size(&self, digest: &str) -> Option<u64> {
        fs::metadata(self.blob_path(digest)).ok().map(|m| m.len())
    }

    // =========================================================================
    // Rootfs Assembly
    // =========================================================================

    /// Extracts ordered gzip layers into `rootfs`, applying whiteouts and
    /// rejecting traversal escapes. Layers apply bottom-to-top.
    pub fn assemble_rootfs(&self, layer_digests: &[String], rootfs: &Path) -> Result<()> {
        fs::create_dir_all(rootfs).map_err(|e| Error::Storage {
            path: rootfs.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut total: u64 = 0;
        for digest in layer_digests {
            let data = self.read_blob(digest)?;
            if data.len() as u64 > MAX_LAYER_SIZE {
                return Err(Error::Storage {
                    path: rootfs.to_path_buf(),
                    reason: format!("layer {digest} exceeds the size limit"),
                });
            }
            total = extract_layer(&data, rootfs, total)
                .map_err(|e| match e {
                    Error::Internal(reason) => Error::Storage {
                        path: rootfs.to_path_buf(),
                        reason: format!("layer {digest}: {reason}"),
                    },
                    other => other,
                })?;
        }
        Ok(())
    }
}

/// Extracts one decompressed layer; returns the running rootfs size.
fn extract_layer(data: &[u8], rootfs: &Path, mut total: u64) -> Result<u64> {
    let decoder = GzDecoder::new(data);
    let mut archive = Archive::new(decoder);

    for entry in archive
        .entries()
        .map_err(|e| Error::Internal(e.to_string()))?
    {
        let mut entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
        let path = entry
            .path()
            .map_err(|e| Error::Internal(e.to_string()))?
            .into_owned();

        let path_str = path.to_string_lossy();
        if path_str.contains("..") || path_str.starts_with('/') {
            return Err(Error::Storage {
                path: rootfs.to_path_buf(),
                reason: format!("path traversal in layer entry: {path_str}"),
            });
        }

        // Whiteouts mark deletions from lower layers.
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if let Some(target) = filename.strip_prefix(".wh.") {
            if target == ".wh..opq" {
                continue;
            }
            let victim = rootfs
                .join(path.parent().unwrap_or(Path::new("")))
                .join(target);
            if victim.exists() {
                let _ = fs::remove_file(&victim);
                let _ = fs::remove_dir_all(&victim);
            }
            continue;
        }

        total += entry.size();
        if total > MAX_ROOTFS_SIZE {
            return Err(Error::Storage {
                path: rootfs.to_path_buf(),
                reason: "rootfs exceeds the size limit".to_string(),
            });
        }

        // Link targets must stay inside the rootfs: a hostile layer can
        // plant a symlink out and a later layer writes through it.
        let entry_type = entry.header().entry_type();
        if entry_type.is_symlink() || entry_type.is_hard_link() {
            if let Ok(Some(target)) = entry.link_name() {
                check_link_target(&path, &target)?;
            }
        }

        entry
            .unpack_in(rootfs)
            .map_err(|e| Error::Internal(e.to_string()))?;
    }
    Ok(total)
}

/// Rejects link targets that resolve above the rootfs.
fn check_link_target(entry_path: &Path, target: &Path) -> Result<()> {
    let target_str = target.to_string_lossy();
    if target_str.starts_with('/') {
        if target_str.contains("..") {
            return Err(Error::Storage {
                path: entry_path.to_path_buf(),
                reason: format!("link target escapes rootfs: {target_str}"),
            });
        }
        return Ok(());
    }
    let resolved = entry_path.parent().unwrap_or(Path::new("")).join(target);
    let mut depth: i32 = 0;
    for component in resolved.components() {
        match component {
            std::path::Component::ParentDir => depth -= 1,
            std::path::Component::Normal(_) => depth += 1,
            _ => {}
        }
        if depth < 0 {
            return Err(Error::Storage {
                path: entry_path.to_path_buf(),
                reason: format!("link target escapes rootfs: {target_str}"),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn storage() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("graph"), dir.path().join("run")).unwrap();
        (dir, storage)
    }

    fn digest_of(data: &[u8]) -> String {
        format!("sha256:{}", hex::encode(Sha256::digest(data)))
    }

    #[test]
    fn blob_roundtrip() {
        let (_dir, storage) = storage();
        let data = b"layer bytes";
        let digest = digest_of(data);

        storage.write_blob(&digest, data).unwrap();
        assert!(storage.has_blob(&digest));
        assert_eq!(storage.read_blob(&digest).unwrap(), data);
        assert_eq!(storage.blob_size(&digest), Some(data.len() as u64));

        storage.remove_blob(&digest).unwrap();
        assert!(!storage.has_blob(&digest));
    }

    #[test]
    fn blob_digest_mismatch_rejected() {
        let (_dir, storage) = storage();
        let wrong = "sha256:0000000000000000000000000000000000000000000000000000000000000000";
        assert!(storage.write_blob(wrong, b"data").is_err());
    }

    #[test]
    fn blob_path_is_sharded_and_sanitised() {
        let (_dir, storage) = storage();
        let path = storage.blob_path("sha256:abcd1234");
        let s = path.to_string_lossy();
        assert!(s.contains("sha256/ab/abcd1234"));

        // Traversal characters are stripped before path construction.
        let hostile = storage.blob_path("sha256:../../etc/passwd");
        assert!(hostile.starts_with(storage.graph_root()));
        assert!(!hostile.to_string_lossy().contains(".."));
    }

    #[test]
    fn container_layout_paths() {
        let (_dir, storage) = storage();
        storage.create_container_dirs("abc").unwrap();
        assert!(storage.container_userdata("abc").exists());
        assert!(storage.container_rootfs("abc").exists());
        assert!(storage.container_run_dir("abc").exists());

        storage.remove_container_dirs("abc").unwrap();
        assert!(!storage.container_dir("abc").exists());
    }

    #[test]
    fn assemble_rootfs_applies_layers_and_whiteouts() {
        let (_dir, storage) = storage();

        // Layer 1: /etc/app.conf and /data/keep
        let layer1 = build_layer(&[("etc/app.conf", "v1"), ("data/keep", "keep")]);
        // Layer 2: overwrites app.conf, whiteouts /data/keep
        let layer2 = build_layer(&[("etc/app.conf", "v2"), ("data/.wh.keep", "")]);

        let d1 = digest_of(&layer1);
        let d2 = digest_of(&layer2);
        storage.write_blob(&d1, &layer1).unwrap();
        storage.write_blob(&d2, &layer2).unwrap();

        let rootfs = storage.container_rootfs("c1");
        storage
            .assemble_rootfs(&[d1, d2], &rootfs)
            .unwrap();

        assert_eq!(
            fs::read_to_string(rootfs.join("etc/app.conf")).unwrap(),
            "v2"
        );
        assert!(!rootfs.join("data/keep").exists());
    }

    #[test]
    fn assemble_rootfs_rejects_traversal() {
        let (_dir, storage) = storage();
        let layer = build_layer(&[("../escape", "bad")]);
        let digest = digest_of(&layer);
        storage.write_blob(&digest, &layer).unwrap();

        let rootfs = storage.container_rootfs("c1");
        let err = storage.assemble_rootfs(&[digest], &rootfs).unwrap_err();
        assert!(err.to_string().contains("path traversal"));
    }

    /// Builds a small gzipped tar layer from (path, content) pairs.
    ///
    /// Writes the path directly into the raw header bytes instead of going
    /// through `Builder::append_data`, since newer `tar` versions reject
    /// `..` components there and some tests need to construct a malicious
    /// archive to exercise traversal handling.
    fn build_layer(files: &[(&str, &str)]) -> Vec<u8> {
        use flate2::write::GzEncoder;
        let mut builder = tar::Builder::new(GzEncoder::new(
            Vec::new(),
            flate2::Compression::default(),
        ));
        for (path, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            let name_bytes = path.as_bytes();
            let gnu = header.as_gnu_mut().unwrap();
            gnu.name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_cksum();
            builder.append(&header, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }
}
