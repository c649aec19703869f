//! Image store: records, tags, parents, and every local image operation.
//!
//! Images are immutable, content-addressed by their manifest digest. Tags
//! are a separate name→digest mapping: `tag`/`untag` rewrite only that
//! mapping and never touch blobs. Records persist as JSON files under the
//! graph root so a later invocation of the engine sees the same images.

pub mod pull;

use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::reports::{
    FileChange, HistoryEntry, ImageInspect, ImageRemoveReport, ImageSummary, PruneReport,
};
use crate::specgen::ImageRuntimeConfig;
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use std::collections::HashMap;
use std::io::Read;
use std::sync::RwLock;
use tracing::{debug, info, warn};

/// One stored image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Manifest digest, `sha256:<hex>`.
    pub digest: String,
    /// Repo:tag references pointing at this image.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Layer blob digests, bottom to top.
    pub layers: Vec<String>,
    /// Config blob digest.
    pub config_digest: String,
    /// Parsed runtime config for spec generation.
    pub config: ImageRuntimeConfig,
    /// Parent image digest, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    /// Total size of layer blobs.
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

impl ImageRecord {
    /// Short ID: the first 12 hex of the digest.
    pub fn short_id(&self) -> &str {
        let hex = self.digest.strip_prefix("sha256:").unwrap_or(&self.digest);
        &hex[..12.min(hex.len())]
    }
}

/// Normalizes a user reference into `registry/repo:tag` form: bare names
/// gain the default registry and `library/` namespace, missing tags become
/// `latest`. Digest references pass through.
pub fn normalize_reference(reference: &str) -> String {
    if reference.contains('@') {
        return reference.to_string();
    }
    let (name, tag) = match reference.rsplit_once(':') {
        // A colon inside a registry host:port is not a tag separator.
        Some((name, tag)) if !tag.contains('/') => (name.to_string(), tag.to_string()),
        _ => (
            reference.to_string(),
            crate::constants::DEFAULT_TAG.to_string(),
        ),
    };
    let qualified = if name.contains('/') {
        let first = name.split('/').next().unwrap_or("");
        // A registry component has a dot, a colon, or is localhost.
        if first.contains('.') || first.contains(':') || first == "localhost" {
            name
        } else {
            format!("{}/{}", crate::constants::DEFAULT_REGISTRY, name)
        }
    } else {
        format!(
            "{}/{}/{}",
            crate::constants::DEFAULT_REGISTRY,
            crate::constants::DEFAULT_REPO_NAMESPACE,
            name
        )
    };
    format!("{qualified}:{tag}")
}

/// Callback asking whether a container uses the image; returns its ID.
pub type ImageInUseCheck = dyn Fn(&str) -> Option<String> + Send + Sync;

/// The image store.
pub struct ImageStore {
    storage: Storage,
    events: EventBus,
    records: RwLock<HashMap<String, ImageRecord>>,
    in_use: Box<ImageInUseCheck>,
}

impl ImageStore {
    /// Opens the store, loading persisted records.
    pub fn open(storage: Storage, events: EventBus, in_use: Box<ImageInUseCheck>) -> Result<Self> {
        let mut records = HashMap::new();
        let dir = storage.image_store_dir();
        if let Ok(entries) = std::fs::read_dir(&dir) {
            for entry in entries.flatten() {
                if entry.path().extension().is_some_and(|e| e == "json") {
                    match std::fs::read(entry.path())
                        .map_err(Error::from)
                        .and_then(|data| Ok(serde_json::from_slice::<ImageRecord>(&data)?))
                    {
                        Ok(record) => {
                            records.insert(record.digest.clone(), record);
                        }
                        Err(e) => warn!("skipping unreadable image record: {e}"),
                    }
                }
            }
        }
        debug!(count = records.len(), "image store opened");
        Ok(Self {
            storage,
            events,
            records: RwLock::new(records),
            in_use,
        })
    }

    /// The backing storage, shared with the rest of the engine.
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    fn record_path(&self, digest: &str) -> std::path::PathBuf {
        let hex = digest.strip_prefix("sha256:").unwrap_or(digest);
        self.storage.image_store_dir().join(format!("{hex}.json"))
    }

    fn persist(&self, record: &ImageRecord) -> Result<()> {
        std::fs::write(
            self.record_path(&record.digest),
            serde_json::to_vec_pretty(record)?,
        )?;
        Ok(())
    }

    fn unpersist(&self, digest: &str) {
        let _ = std::fs::remove_file(self.record_path(digest));
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Resolves a reference (tag, digest, or digest prefix) to a digest.
    pub fn resolve(&self, reference: &str) -> Result<String> {
        let records = self.records.read().unwrap();
        if records.contains_key(reference) {
            return Ok(reference.to_string());
        }
        let with_prefix = format!("sha256:{reference}");
        if records.contains_key(&with_prefix) {
            return Ok(with_prefix);
        }

        let normalized = normalize_reference(reference);
        if let Some(record) = records.values().find(|r| r.tags.contains(&normalized)) {
            return Ok(record.digest.clone());
        }

        // Unique hex-prefix match.
        let mut matches = records
            .keys()
            .filter(|d| {
                d.strip_prefix("sha256:")
                    .unwrap_or(d)
                    .starts_with(reference)
            })
            .take(2);
        match (matches.next(), matches.next()) {
            (Some(d), None) => Ok(d.clone()),
            (Some(_), Some(_)) => Err(Error::InvalidArg(format!(
                "image ID prefix {reference:?} is ambiguous"
            ))),
            _ => Err(Error::NoSuchImage(reference.to_string())),
        }
    }

    pub fn exists(&self, reference: &str) -> bool {
        self.resolve(reference).is_ok()
    }

    /// Record snapshot by any reference.
    pub fn get(&self, reference: &str) -> Result<ImageRecord> {
        let digest = self.resolve(reference)?;
        Ok(self.records.read().unwrap()[&digest].clone())
    }

    pub fn count(&self) -> usize {
        self.records.read().unwrap().len()
    }

    /// Total bytes of stored layer blobs, deduplicated.
    pub fn total_size(&self) -> u64 {
        let records = self.records.read().unwrap();
        let mut seen = std::collections::HashSet::new();
        let mut total = 0;
        for record in records.values() {
            for layer in &record.layers {
                if seen.insert(layer.clone()) {
                    total += self.storage.blob_size(layer).unwrap_or(0);
                }
            }
        }
        total
    }

    // =========================================================================
    // Registration (used by pull / load / import / commit)
    // =========================================================================

    /// Adds or updates a record, merging tags.
    pub fn register(&self, mut record: ImageRecord) -> Result<()> {
        let mut records = self.records.write().unwrap();
        if let Some(existing) = records.get(&record.digest) {
            for tag in &existing.tags {
                if !record.tags.contains(tag) {
                    record.tags.push(tag.clone());
                }
            }
        }
        // A tag points at one image: steal it from any previous owner.
        let stolen: Vec<String> = record.tags.clone();
        for other in records.values_mut() {
            if other.digest != record.digest {
                other.tags.retain(|t| !stolen.contains(t));
            }
        }
        self.persist(&record)?;
        for other in records.values() {
            if other.digest != record.digest {
                self.persist(other)?;
            }
        }
        records.insert(record.digest.clone(), record);
        Ok(())
    }

    // =========================================================================
    // List / Inspect / History / Tree
    // =========================================================================

    pub fn list(&self, name_filter: Option<&str>) -> Vec<ImageSummary> {
        let records = self.records.read().unwrap();
        let mut out: Vec<ImageSummary> = records
            .values()
            .filter(|r| match name_filter {
                Some(f) => r.tags.iter().any(|t| t.contains(f)),
                None => true,
            })
            .map(|r| ImageSummary {
                id: r.short_id().to_string(),
                digest: r.digest.clone(),
                tags: r.tags.clone(),
                size: r.size,
                parent: r.parent.clone(),
                created_at: r.created_at,
            })
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    pub fn inspect(&self, reference: &str) -> Result<ImageInspect> {
        let record = self.get(reference)?;
        Ok(ImageInspect {
            id: record.short_id().to_string(),
            digest: record.digest.clone(),
            tags: record.tags.clone(),
            size: record.size,
            parent: record.parent.clone(),
            layers: record.layers.clone(),
            config: record.config.clone(),
            created_at: record.created_at,
        })
    }

    pub fn history(&self, reference: &str) -> Result<Vec<HistoryEntry>> {
        let record = self.get(reference)?;
        Ok(record
            .layers
            .iter()
            .rev()
            .map(|layer| HistoryEntry {
                layer: layer.clone(),
                size: self.storage.blob_size(layer).unwrap_or(0),
                comment: String::new(),
            })
            .collect())
    }

    /// Layer tree of an image; with `what_requires`, the images that build
    /// on it (share its top layer or name it as parent) instead.
    pub fn tree(&self, reference: &str, what_requires: bool) -> Result<Vec<String>> {
        let record = self.get(reference)?;
        if !what_requires {
            return Ok(record.layers.clone());
        }
        let records = self.records.read().unwrap();
        Ok(records
            .values()
            .filter(|r| {
                r.digest != record.digest
                    && (r.parent.as_deref() == Some(record.digest.as_str())
                        || record
                            .layers
                            .last()
                            .is_some_and(|top| r.layers.contains(top)))
            })
            .map(|r| r.digest.clone())
            .collect())
    }

    /// Changes the top layer introduces: added/changed entries and
    /// whiteout-marked deletions.
    pub fn diff(&self, reference: &str) -> Result<Vec<FileChange>> {
        let record = self.get(reference)?;
        let Some(top) = record.layers.last() else {
            return Ok(Vec::new());
        };
        let data = self.storage.read_blob(top)?;
        let decoder = flate2::read::GzDecoder::new(&data[..]);
        let mut archive = tar::Archive::new(decoder);

        let mut changes = Vec::new();
        for entry in archive.entries().map_err(|e| Error::Internal(e.to_string()))? {
            let entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| Error::Internal(e.to_string()))?
                .to_string_lossy()
                .to_string();
            let filename = path.rsplit('/').next().unwrap_or("");
            if let Some(target) = filename.strip_prefix(".wh.") {
                let parent = path.strip_suffix(filename).unwrap_or("");
                changes.push(FileChange {
                    kind: "D".to_string(),
                    path: format!("/{parent}{target}"),
                });
            } else {
                changes.push(FileChange {
                    kind: "A".to_string(),
                    path: format!("/{path}"),
                });
            }
        }
        Ok(changes)
    }

    // =========================================================================
    // Tag / Untag
    // =========================================================================

    pub fn tag(&self, reference: &str, new_tag: &str) -> Result<()> {
        let digest = self.resolve(reference)?;
        let normalized = normalize_reference(new_tag);
        let mut records = self.records.write().unwrap();
        for other in records.values_mut() {
            if other.digest != digest {
                other.tags.retain(|t| t != &normalized);
            }
        }
        let record = records.get_mut(&digest).expect("resolved digest present");
        if !record.tags.contains(&normalized) {
            record.tags.push(normalized.clone());
        }
        self.persist(record)?;
        self.events
            .publish(EventKind::Image, "tag", &digest, Some(&normalized));
        Ok(())
    }

    pub fn untag(&self, reference: &str, tag: &str) -> Result<()> {
        let digest = self.resolve(reference)?;
        let normalized = normalize_reference(tag);
        let mut records = self.records.write().unwrap();
        let record = records.get_mut(&digest).expect("resolved digest present");
        let before = record.tags.len();
        record.tags.retain(|t| t != &normalized);
        if record.tags.len() == before {
            return Err(Error::InvalidArg(format!(
                "image {digest} is not tagged {normalized}"
            )));
        }
        self.persist(record)?;
        self.events
            .publish(EventKind::Image, "untag", &digest, Some(&normalized));
        Ok(())
    }

    // =========================================================================
    // Remove / Prune
    // =========================================================================

    /// Removes images by reference. Exit codes: 0 clean, 1 some reference
    /// missing, 2 some image in use by a container or required by a child.
    pub fn remove(&self, references: &[String], force: bool, all: bool) -> ImageRemoveReport {
        let mut report = ImageRemoveReport::default();
        let targets: Vec<String> = if all {
            self.records.read().unwrap().keys().cloned().collect()
        } else {
            references.to_vec()
        };

        for reference in &targets {
            match self.remove_one(reference, force) {
                Ok(removed) => {
                    report.untagged.extend(removed.tags.clone());
                    report.deleted.push(removed.digest);
                }
                Err(Error::NoSuchImage(r)) => {
                    report.errors.push(format!("no such image: {r}"));
                    report.exit_code = report.exit_code.max(1);
                }
                Err(e @ Error::ImageInUse { .. }) => {
                    report.errors.push(e.to_string());
                    report.exit_code = 2;
                }
                Err(e) => {
                    report.errors.push(e.to_string());
                    report.exit_code = report.exit_code.max(1);
                }
            }
        }
        report
    }

    fn remove_one(&self, reference: &str, force: bool) -> Result<ImageRecord> {
        let digest = self.resolve(reference)?;
        let record = self.records.read().unwrap()[&digest].clone();

        if let Some(container) = (self.in_use)(&digest) {
            if !force {
                return Err(Error::ImageInUse {
                    id: record.short_id().to_string(),
                    reason: format!("image is in use by container {container}"),
                });
            }
        }
        let children: Vec<String> = {
            let records = self.records.read().unwrap();
            records
                .values()
                .filter(|r| r.parent.as_deref() == Some(digest.as_str()))
                .map(|r| r.digest.clone())
                .collect()
        };
        if !children.is_empty() && !force {
            return Err(Error::ImageInUse {
                id: record.short_id().to_string(),
                reason: format!("image is a parent of {}", children.join(", ")),
            });
        }

        // Drop the record, then any layer no other image references.
        {
            let mut records = self.records.write().unwrap();
            records.remove(&digest);
            let still_referenced: std::collections::HashSet<&String> =
                records.values().flat_map(|r| r.layers.iter()).collect();
            for layer in &record.layers {
                if !still_referenced.contains(layer) {
                    let _ = self.storage.remove_blob(layer);
                }
            }
        }
        let _ = self.storage.remove_blob(&record.config_digest);
        self.unpersist(&digest);
        self.events
            .publish(EventKind::Image, "remove", &digest, None);
        info!(image = %record.short_id(), "image removed");
        Ok(record)
    }

    /// Removes unused images. With `all`, iterates leaf-first until a pass
    /// makes no progress; images remaining after a stalled pass are an
    /// error.
    pub fn prune(&self, all: bool) -> Result<PruneReport> {
        let mut report = PruneReport::default();
        if !all {
            // Dangling only: untagged images nothing depends on.
            let candidates: Vec<String> = {
                let records = self.records.read().unwrap();
                records
                    .values()
                    .filter(|r| r.tags.is_empty())
                    .map(|r| r.digest.clone())
                    .collect()
            };
            for digest in candidates {
                if let Ok(removed) = self.remove_one(&digest, false) {
                    report.space_reclaimed += removed.size;
                    report.removed.push(removed.digest);
                }
            }
            return Ok(report);
        }

        loop {
            let snapshot: Vec<String> = self.records.read().unwrap().keys().cloned().collect();
            if snapshot.is_empty() {
                return Ok(report);
            }
            let mut progressed = false;
            for digest in snapshot {
                // Leaf-first: parents of other images fail and are retried
                // on a later pass once their children are gone.
                match self.remove_one(&digest, false) {
                    Ok(removed) => {
                        report.space_reclaimed += removed.size;
                        report.removed.push(removed.digest);
                        progressed = true;
                    }
                    Err(_) => {}
                }
            }
            if !progressed {
                let remaining = self.count();
                if remaining > 0 {
                    return Err(Error::Internal(format!(
                        "could not delete all images: {remaining} remaining"
                    )));
                }
                return Ok(report);
            }
        }
    }

    // =========================================================================
    // Import / Load / Save
    // =========================================================================

    /// Imports a rootfs tarball as a fresh single-layer image.
    pub fn import(&self, tarball: &[u8], tag: Option<&str>) -> Result<String> {
        use flate2::write::GzEncoder;
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(tarball)?;
        let layer = encoder.finish()?;
        let layer_digest = format!("sha256:{}", hex::encode(sha2::Sha256::digest(&layer)));
        self.storage.write_blob(&layer_digest, &layer)?;

        let config = ImageRuntimeConfig::default();
        let config_bytes = serde_json::to_vec(&config)?;
        let config_digest =
            format!("sha256:{}", hex::encode(sha2::Sha256::digest(&config_bytes)));
        self.storage.write_blob(&config_digest, &config_bytes)?;

        let manifest = serde_json::json!({
            "schemaVersion": 2,
            "config": { "digest": config_digest },
            "layers": [{ "digest": layer_digest }],
        });
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let digest = format!(
            "sha256:{}",
            hex::encode(sha2::Sha256::digest(&manifest_bytes))
        );

        let record = ImageRecord {
            digest: digest.clone(),
            tags: tag.map(normalize_reference).into_iter().collect(),
            layers: vec![layer_digest],
            config_digest,
            config: ImageRuntimeConfig {
                id: digest.clone(),
                ..Default::default()
            },
            parent: None,
            size: layer.len() as u64,
            created_at: Utc::now(),
        };
        self.register(record)?;
        self.events.publish(EventKind::Image, "import", &digest, tag);
        Ok(digest)
    }

    /// Writes one image (blobs + record) as an archive.
    pub fn save(&self, reference: &str, writer: impl std::io::Write) -> Result<()> {
        let record = self.get(reference)?;
        let mut builder = tar::Builder::new(writer);

        let mut append = |name: String, data: &[u8]| -> Result<()> {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, name, data)
                .map_err(Error::from)
        };

        append("record.json".to_string(), &serde_json::to_vec(&record)?)?;
        for layer in &record.layers {
            let data = self.storage.read_blob(layer)?;
            let hex = layer.strip_prefix("sha256:").unwrap_or(layer);
            append(format!("blobs/{hex}"), &data)?;
        }
        if let Ok(config) = self.storage.read_blob(&record.config_digest) {
            let hex = record
                .config_digest
                .strip_prefix("sha256:")
                .unwrap_or(&record.config_digest);
            append(format!("blobs/{hex}"), &config)?;
        }
        Ok(())
    }

    /// Loads an archive written by [`ImageStore::save`]. Every tag present
    /// in the archive is restored.
    pub fn load(&self, reader: impl std::io::Read) -> Result<Vec<String>> {
        let mut archive = tar::Archive::new(reader);
        let mut record: Option<ImageRecord> = None;
        let mut blobs: Vec<(String, Vec<u8>)> = Vec::new();

        for entry in archive.entries().map_err(|e| Error::Internal(e.to_string()))? {
            let mut entry = entry.map_err(|e| Error::Internal(e.to_string()))?;
            let path = entry
                .path()
                .map_err(|e| Error::Internal(e.to_string()))?
                .to_string_lossy()
                .to_string();
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            if path == "record.json" {
                record = Some(serde_json::from_slice(&data)?);
            } else if let Some(hex) = path.strip_prefix("blobs/") {
                blobs.push((format!("sha256:{hex}"), data));
            }
        }

        let record = record.ok_or_else(|| {
            Error::InvalidArg("archive does not contain an image record".to_string())
        })?;
        for (digest, data) in blobs {
            self.storage.write_blob(&digest, &data)?;
        }
        let tags = record.tags.clone();
        let digest = record.digest.clone();
        self.register(record)?;
        self.events.publish(EventKind::Image, "load", &digest, None);
        Ok(tags)
    }
}

/// Parses an OCI/Docker image config blob into the runtime config fields
/// spec generation merges from.
pub fn parse_image_config(id: &str, blob: &[u8]) -> Result<ImageRuntimeConfig> {
    let doc: serde_json::Value = serde_json::from_slice(blob)?;
    let config = doc.get("config").unwrap_or(&serde_json::Value::Null);

    let strings = |key: &str| -> Vec<String> {
        config
            .get(key)
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|s| s.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    };

    let env = strings("Env")
        .into_iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let exposed_ports = config
        .get("ExposedPorts")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.keys()
                .filter_map(|k| k.split('/').next()?.parse().ok())
                .collect()
        })
        .unwrap_or_default();

    let labels = config
        .get("Labels")
        .and_then(|v| v.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    // Healthcheck is a Docker-schema extension; OCI configs lack it.
    let healthcheck = config.get("Healthcheck").and_then(|hc| {
        let test = hc
            .get("Test")?
            .as_array()?
            .iter()
            .filter_map(|s| s.as_str().map(str::to_string))
            .collect::<Vec<_>>();
        Some(crate::container::config::HealthCheckConfig {
            test,
            interval_secs: hc.get("Interval").and_then(|v| v.as_u64()),
            timeout_secs: hc.get("Timeout").and_then(|v| v.as_u64()),
            retries: hc.get("Retries").and_then(|v| v.as_u64()).map(|r| r as u32),
            start_period_secs: hc.get("StartPeriod").and_then(|v| v.as_u64()),
        })
    });

    Ok(ImageRuntimeConfig {
        id: id.to_string(),
        cmd: strings("Cmd"),
        entrypoint: strings("Entrypoint"),
        env,
        user: config
            .get("User")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        working_dir: config
            .get("WorkingDir")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string),
        exposed_ports,
        stop_signal: config
            .get("StopSignal")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        labels,
        healthcheck,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;
    use tempfile::TempDir;

    fn store() -> (TempDir, ImageStore) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("graph"), dir.path().join("run")).unwrap();
        let store = ImageStore::open(storage, EventBus::new(), Box::new(|_| None)).unwrap();
        (dir, store)
    }

    fn store_with_user(user: &'static str) -> (TempDir, ImageStore) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("graph"), dir.path().join("run")).unwrap();
        let store = ImageStore::open(
            storage,
            EventBus::new(),
            Box::new(move |_| Some(user.to_string())),
        )
        .unwrap();
        (dir, store)
    }

    fn sample_record(store: &ImageStore, tag: &str, content: &[u8]) -> String {
        let layer = content.to_vec();
        let layer_digest = format!("sha256:{}", hex::encode(sha2::Sha256::digest(&layer)));
        store.storage.write_blob(&layer_digest, &layer).unwrap();
        let digest = format!(
            "sha256:{}",
            hex::encode(sha2::Sha256::digest(tag.as_bytes()))
        );
        store
            .register(ImageRecord {
                digest: digest.clone(),
                tags: vec![normalize_reference(tag)],
                layers: vec![layer_digest],
                config_digest: "sha256:0".to_string(),
                config: ImageRuntimeConfig::default(),
                parent: None,
                size: layer.len() as u64,
                created_at: Utc::now(),
            })
            .unwrap();
        digest
    }

    #[test]
    fn normalize_reference_rules() {
        assert_eq!(
            normalize_reference("alpine"),
            "docker.io/library/alpine:latest"
        );
        assert_eq!(
            normalize_reference("alpine:3.18"),
            "docker.io/library/alpine:3.18"
        );
        assert_eq!(
            normalize_reference("foo/bar"),
            "docker.io/foo/bar:latest"
        );
        assert_eq!(
            normalize_reference("ghcr.io/foo/bar:v1"),
            "ghcr.io/foo/bar:v1"
        );
        assert_eq!(
            normalize_reference("localhost:5000/img"),
            "localhost:5000/img:latest"
        );
        assert_eq!(
            normalize_reference("img@sha256:abcd"),
            "img@sha256:abcd"
        );
    }

    #[test]
    fn resolve_by_tag_digest_and_prefix() {
        let (_dir, store) = store();
        let digest = sample_record(&store, "alpine", b"layer-a");

        assert_eq!(store.resolve("alpine").unwrap(), digest);
        assert_eq!(store.resolve("alpine:latest").unwrap(), digest);
        assert_eq!(store.resolve(&digest).unwrap(), digest);
        let hex = digest.strip_prefix("sha256:").unwrap();
        assert_eq!(store.resolve(&hex[..10]).unwrap(), digest);
        assert!(matches!(
            store.resolve("missing"),
            Err(Error::NoSuchImage(_))
        ));
    }

    #[test]
    fn tag_untag_is_identity_on_references() {
        let (_dir, store) = store();
        let digest = sample_record(&store, "alpine", b"layer-a");
        let before = store.get(&digest).unwrap().tags;

        store.tag("alpine", "myalpine:v1").unwrap();
        assert!(store
            .get(&digest)
            .unwrap()
            .tags
            .contains(&"docker.io/library/myalpine:v1".to_string()));

        store.untag("alpine", "myalpine:v1").unwrap();
        assert_eq!(store.get(&digest).unwrap().tags, before);
    }

    #[test]
    fn tag_steals_from_previous_owner() {
        let (_dir, store) = store();
        let first = sample_record(&store, "one", b"layer-1");
        let second = sample_record(&store, "two", b"layer-2");

        store.tag("two", "shared:tag").unwrap();
        store.tag("one", "shared:tag").unwrap();

        assert!(store
            .get(&first)
            .unwrap()
            .tags
            .contains(&"docker.io/library/shared:tag".to_string()));
        assert!(!store
            .get(&second)
            .unwrap()
            .tags
            .contains(&"docker.io/library/shared:tag".to_string()));
    }

    #[test]
    fn remove_missing_is_exit_1() {
        let (_dir, store) = store();
        let report = store.remove(&["ghost".to_string()], false, false);
        assert_eq!(report.exit_code, 1);
        assert!(report.deleted.is_empty());
    }

    #[test]
    fn remove_in_use_is_exit_2() {
        let (_dir, store) = store_with_user("c99");
        sample_record(&store, "busy", b"layer-b");
        let report = store.remove(&["busy".to_string()], false, false);
        assert_eq!(report.exit_code, 2);
        assert!(report.errors[0].contains("in use"));
    }

    #[test]
    fn remove_parent_is_exit_2() {
        let (_dir, store) = store();
        let parent = sample_record(&store, "base", b"layer-base");
        let child_digest = format!(
            "sha256:{}",
            hex::encode(sha2::Sha256::digest(b"child-manifest"))
        );
        store
            .register(ImageRecord {
                digest: child_digest,
                tags: vec![normalize_reference("child")],
                layers: vec![],
                config_digest: "sha256:0".to_string(),
                config: ImageRuntimeConfig::default(),
                parent: Some(parent.clone()),
                size: 0,
                created_at: Utc::now(),
            })
            .unwrap();

        let report = store.remove(&["base".to_string()], false, false);
        assert_eq!(report.exit_code, 2);
    }

    #[test]
    fn prune_all_is_leaf_first_fixpoint() {
        let (_dir, store) = store();
        let parent = sample_record(&store, "base", b"layer-base");
        let child_digest = format!(
            "sha256:{}",
            hex::encode(sha2::Sha256::digest(b"child-manifest"))
        );
        store
            .register(ImageRecord {
                digest: child_digest,
                tags: vec![normalize_reference("child")],
                layers: vec![],
                config_digest: "sha256:0".to_string(),
                config: ImageRuntimeConfig::default(),
                parent: Some(parent),
                size: 0,
                created_at: Utc::now(),
            })
            .unwrap();

        // First pass removes the child, second pass the parent.
        let report = store.prune(true).unwrap();
        assert_eq!(report.removed.len(), 2);
        assert_eq!(store.count(), 0);
    }

    #[test]
    fn prune_all_stall_is_an_error() {
        let (_dir, store) = store_with_user("c1");
        sample_record(&store, "stuck", b"layer-s");
        assert!(store.prune(true).is_err());
    }

    #[test]
    fn save_load_roundtrip_restores_tags() {
        let (_dir, store1) = store();
        let digest = sample_record(&store1, "saved:v2", b"layer-z");

        let mut archive = Vec::new();
        store1.save("saved:v2", &mut archive).unwrap();

        let (_dir2, other) = store();
        let tags = other.load(&archive[..]).unwrap();
        assert_eq!(tags, vec!["docker.io/library/saved:v2".to_string()]);
        assert_eq!(other.resolve("saved:v2").unwrap(), digest);
        // Layer blob came across.
        let record = other.get(&digest).unwrap();
        assert!(other.storage.has_blob(&record.layers[0]));
    }

    #[test]
    fn import_creates_single_layer_image() {
        let (_dir, store) = store();
        let mut tarball = Vec::new();
        {
            let mut builder = tar::Builder::new(&mut tarball);
            let mut header = tar::Header::new_gnu();
            header.set_size(5);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, "hello", &b"world"[..]).unwrap();
            builder.finish().unwrap();
        }
        let digest = store.import(&tarball, Some("imported")).unwrap();
        let record = store.get("imported").unwrap();
        assert_eq!(record.digest, digest);
        assert_eq!(record.layers.len(), 1);
    }

    #[test]
    fn parse_image_config_fields() {
        let blob = serde_json::json!({
            "architecture": "amd64",
            "config": {
                "Cmd": ["nginx", "-g", "daemon off;"],
                "Entrypoint": ["/docker-entrypoint.sh"],
                "Env": ["PATH=/usr/bin", "NGINX_VERSION=1.25"],
                "User": "nginx",
                "WorkingDir": "/srv",
                "ExposedPorts": { "80/tcp": {}, "443/tcp": {} },
                "StopSignal": "SIGQUIT",
                "Labels": { "maintainer": "someone" },
                "Healthcheck": { "Test": ["CMD", "curl", "-f", "http://localhost/"], "Retries": 3 }
            }
        });
        let config =
            parse_image_config("sha256:x", serde_json::to_vec(&blob).unwrap().as_slice()).unwrap();
        assert_eq!(config.cmd[0], "nginx");
        assert_eq!(config.entrypoint[0], "/docker-entrypoint.sh");
        assert_eq!(config.env["NGINX_VERSION"], "1.25");
        assert_eq!(config.user.as_deref(), Some("nginx"));
        let mut ports = config.exposed_ports.clone();
        ports.sort_unstable();
        assert_eq!(ports, vec![80, 443]);
        assert_eq!(config.stop_signal.as_deref(), Some("SIGQUIT"));
        assert_eq!(config.healthcheck.unwrap().retries, Some(3));
    }

    #[test]
    fn persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("graph"), dir.path().join("run")).unwrap();
        {
            let store =
                ImageStore::open(storage.clone(), EventBus::new(), Box::new(|_| None)).unwrap();
            sample_record(&store, "persisted", b"layer-p");
        }
        let store = ImageStore::open(storage, EventBus::new(), Box::new(|_| None)).unwrap();
        assert!(store.exists("persisted"));
    }
}
