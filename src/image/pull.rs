//! Image resolution and pulling.
//!
//! Resolves user references against the local store per the pull policy,
//! talks to registries for what is missing, and loads archive transports.
//! Multi-arch indexes resolve to the requested (or detected) platform.

use super::{normalize_reference, parse_image_config, ImageRecord, ImageStore};
use crate::constants::{IMAGE_PULL_TIMEOUT, MAX_CONFIG_SIZE, MAX_IMAGE_REF_LEN, MAX_LAYERS,
    MAX_LAYER_SIZE, MAX_MANIFEST_SIZE};
use crate::error::{Error, Result};
use crate::events::EventKind;
use crate::reports::SearchResult;
use chrono::Utc;
use oci_distribution::client::{ClientConfig, ClientProtocol};
use oci_distribution::manifest::{OciDescriptor, OciManifest};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::{Client, Reference};
use tracing::{debug, info, warn};

/// When to hit the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PullPolicy {
    /// Pull regardless of local presence.
    Always,
    /// Pull only when the image is not present locally.
    #[default]
    Missing,
    /// Never pull; fail when missing.
    Never,
}

impl PullPolicy {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "always" => Ok(Self::Always),
            "" | "missing" | "ifnotpresent" => Ok(Self::Missing),
            "never" => Ok(Self::Never),
            _ => Err(Error::InvalidArg(format!("invalid pull policy: {s:?}"))),
        }
    }
}

/// Options for a pull.
#[derive(Debug, Clone, Default)]
pub struct PullOptions {
    pub policy: PullPolicy,
    /// Basic credentials.
    pub creds: Option<(String, String)>,
    /// Verify registry TLS certificates. On by default.
    pub tls_verify: Option<bool>,
    pub arch: Option<String>,
    pub os: Option<String>,
    /// Pull every tag of the repository; requires an untagged reference.
    pub all_tags: bool,
}

/// The registry-facing half of the image engine.
pub struct ImagePuller;

impl ImagePuller {
    fn client(opts: &PullOptions) -> Client {
        Client::new(ClientConfig {
            protocol: ClientProtocol::Https,
            accept_invalid_certificates: !opts.tls_verify.unwrap_or(true),
            ..Default::default()
        })
    }

    fn auth(opts: &PullOptions) -> RegistryAuth {
        match &opts.creds {
            Some((user, pass)) => RegistryAuth::Basic(user.clone(), pass.clone()),
            None => RegistryAuth::Anonymous,
        }
    }

    fn target_platform(opts: &PullOptions) -> (String, String) {
        let os = opts.os.clone().unwrap_or_else(|| "linux".to_string());
        let arch = opts.arch.clone().unwrap_or_else(|| {
            match std::env::consts::ARCH {
                "x86_64" => "amd64",
                "aarch64" => "arm64",
                other => other,
            }
            .to_string()
        });
        (os, arch)
    }

    /// Pulls a reference per the policy. Returns the digests now present,
    /// one per pulled tag (several for archives and `all_tags`).
    pub async fn pull(
        store: &ImageStore,
        reference: &str,
        opts: &PullOptions,
    ) -> Result<Vec<String>> {
        if reference.len() > MAX_IMAGE_REF_LEN {
            return Err(Error::InvalidArg(format!(
                "image reference exceeds {MAX_IMAGE_REF_LEN} bytes"
            )));
        }

        // Archive transport: load every tag in the archive.
        if let Some(path) = reference.strip_prefix("docker-archive:") {
            let file = std::fs::File::open(path)?;
            let tags = store.load(file)?;
            let mut digests = Vec::new();
            for tag in &tags {
                if let Ok(digest) = store.resolve(tag) {
                    if !digests.contains(&digest) {
                        digests.push(digest);
                    }
                }
            }
            return Ok(digests);
        }

        if opts.all_tags {
            return Self::pull_all_tags(store, reference, opts).await;
        }

        match opts.policy {
            PullPolicy::Missing if store.exists(reference) => {
                return Ok(vec![store.resolve(reference)?]);
            }
            PullPolicy::Never => {
                return store.resolve(reference).map(|d| vec![d]).map_err(|_| {
                    Error::NoSuchImage(format!("{reference} (pull policy is never)"))
                });
            }
            _ => {}
        }

        let digest = Self::pull_one(store, reference, opts).await?;
        Ok(vec![digest])
    }

    /// Enumerates the repository's tags and pulls each; per-tag failures
    /// are logged and skipped, but zero successes out of one-or-more
    /// attempts is a failure.
    async fn pull_all_tags(
        store: &ImageStore,
        reference: &str,
        opts: &PullOptions,
    ) -> Result<Vec<String>> {
        if reference.rsplit_once(':').is_some_and(|(_, t)| !t.contains('/')) {
            return Err(Error::InvalidArg(
                "all-tags requires a reference without a tag".to_string(),
            ));
        }

        let normalized = normalize_reference(reference);
        let parsed: Reference = normalized
            .parse()
            .map_err(|e| Error::InvalidArg(format!("invalid reference {reference:?}: {e}")))?;

        let client = Self::client(opts);
        let tags = client
            .list_tags(&parsed, &Self::auth(opts), None, None)
            .await
            .map_err(|e| Error::ImagePull {
                reference: reference.to_string(),
                reason: format!("cannot list tags: {e}"),
            })?;

        let mut pulled = Vec::new();
        let mut attempted = 0;
        for tag in &tags.tags {
            attempted += 1;
            let tagged = format!("{reference}:{tag}");
            match Self::pull_one(store, &tagged, opts).await {
                Ok(digest) => pulled.push(digest),
                Err(e) => warn!(reference = %tagged, "skipping tag: {e}"),
            }
        }
        if pulled.is_empty() && attempted > 0 {
            return Err(Error::ImagePull {
                reference: reference.to_string(),
                reason: format!("all {attempted} tags failed to pull"),
            });
        }
        Ok(pulled)
    }

    /// Pulls exactly one reference: manifest, config, missing layers.
    async fn pull_one(store: &ImageStore, reference: &str, opts: &PullOptions) -> Result<String> {
        let normalized = normalize_reference(reference);
        let parsed: Reference = normalized
            .parse()
            .map_err(|e| Error::InvalidArg(format!("invalid reference {reference:?}: {e}")))?;
        let client = Self::client(opts);
        let auth = Self::auth(opts);

        info!(reference = %normalized, "pulling");
        let (manifest, digest) =
            tokio::time::timeout(IMAGE_PULL_TIMEOUT, client.pull_manifest(&parsed, &auth))
                .await
                .map_err(|_| Error::ImagePull {
                    reference: normalized.clone(),
                    reason: "timed out fetching manifest".to_string(),
                })?
                .map_err(|e| Error::ImagePull {
                    reference: normalized.clone(),
                    reason: e.to_string(),
                })?;

        let image_manifest = match manifest {
            OciManifest::Image(m) => m,
            OciManifest::ImageIndex(index) => {
                let (os, arch) = Self::target_platform(opts);
                let entry = index
                    .manifests
                    .iter()
                    .find(|m| {
                        m.platform
                            .as_ref()
                            .is_some_and(|p| p.os == os && p.architecture == arch)
                    })
                    .ok_or_else(|| {
                        let available: Vec<String> = index
                            .manifests
                            .iter()
                            .filter_map(|m| m.platform.as_ref())
                            .map(|p| format!("{}/{}", p.os, p.architecture))
                            .collect();
                        Error::ImagePull {
                            reference: normalized.clone(),
                            reason: format!(
                                "no manifest for {os}/{arch}; available: {}",
                                available.join(", ")
                            ),
                        }
                    })?;
                if entry.size as usize > MAX_MANIFEST_SIZE {
                    return Err(Error::ImagePull {
                        reference: normalized.clone(),
                        reason: "platform manifest exceeds the size limit".to_string(),
                    });
                }
                let platform_ref: Reference = format!(
                    "{}/{}@{}",
                    parsed.registry(),
                    parsed.repository(),
                    entry.digest
                )
                .parse()
                .map_err(|e| Error::ImagePull {
                    reference: normalized.clone(),
                    reason: format!("cannot build digest reference: {e}"),
                })?;
                match client
                    .pull_manifest(&platform_ref, &auth)
                    .await
                    .map_err(|e| Error::ImagePull {
                        reference: normalized.clone(),
                        reason: e.to_string(),
                    })? {
                    (OciManifest::Image(m), _) => m,
                    _ => {
                        return Err(Error::ImagePull {
                            reference: normalized.clone(),
                            reason: "nested image index".to_string(),
                        })
                    }
                }
            }
        };

        if image_manifest.layers.len() > MAX_LAYERS {
            return Err(Error::ImagePull {
                reference: normalized.clone(),
                reason: format!("too many layers: {}", image_manifest.layers.len()),
            });
        }
        if image_manifest.config.size as usize > MAX_CONFIG_SIZE {
            return Err(Error::ImagePull {
                reference: normalized.clone(),
                reason: "config blob exceeds the size limit".to_string(),
            });
        }

        // Config blob.
        let mut config_bytes = Vec::new();
        client
            .pull_blob(&parsed, &image_manifest.config, &mut config_bytes)
            .await
            .map_err(|e| Error::ImagePull {
                reference: normalized.clone(),
                reason: format!("config pull failed: {e}"),
            })?;
        store
            .storage()
            .write_blob(&image_manifest.config.digest, &config_bytes)?;

        // Layers, deduplicated against the blob store.
        let mut size = 0;
        for layer in &image_manifest.layers {
            size += layer.size as u64;
            if layer.size as u64 > MAX_LAYER_SIZE {
                return Err(Error::ImagePull {
                    reference: normalized.clone(),
                    reason: format!("layer {} exceeds the size limit", layer.digest),
                });
            }
            if store.storage().has_blob(&layer.digest) {
                debug!(layer = %layer.digest, "layer cached");
                continue;
            }
            let descriptor = OciDescriptor {
                digest: layer.digest.clone(),
                size: layer.size,
                media_type: layer.media_type.clone(),
                urls: None,
                annotations: None,
            };
            let mut data = Vec::new();
            tokio::time::timeout(
                IMAGE_PULL_TIMEOUT,
                client.pull_blob(&parsed, &descriptor, &mut data),
            )
            .await
            .map_err(|_| Error::ImagePull {
                reference: normalized.clone(),
                reason: format!("timed out pulling layer {}", layer.digest),
            })?
            .map_err(|e| Error::ImagePull {
                reference: normalized.clone(),
                reason: format!("layer {} pull failed: {e}", layer.digest),
            })?;
            store.storage().write_blob(&layer.digest, &data)?;
        }

        let config = parse_image_config(&digest, &config_bytes)?;
        let record = ImageRecord {
            digest: digest.clone(),
            tags: vec![normalized.clone()],
            layers: image_manifest
                .layers
                .iter()
                .map(|l| l.digest.clone())
                .collect(),
            config_digest: image_manifest.config.digest.clone(),
            config,
            parent: None,
            size,
            created_at: Utc::now(),
        };
        store.register(record)?;
        store
            .events()
            .publish(EventKind::Image, "pull", &digest, Some(&normalized));
        Ok(digest)
    }

    /// Pushes a local image to its registry.
    pub async fn push(store: &ImageStore, reference: &str, opts: &PullOptions) -> Result<String> {
        use oci_distribution::client::{Config, ImageLayer};

        let record = store.get(reference)?;
        let normalized = normalize_reference(reference);
        let parsed: Reference = normalized
            .parse()
            .map_err(|e| Error::InvalidArg(format!("invalid reference {reference:?}: {e}")))?;

        let mut layers = Vec::with_capacity(record.layers.len());
        for digest in &record.layers {
            layers.push(ImageLayer::new(
                store.storage().read_blob(digest)?,
                oci_distribution::manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE.to_string(),
                None,
            ));
        }
        let config_bytes = store.storage().read_blob(&record.config_digest)?;
        let config = Config::new(
            config_bytes,
            oci_distribution::manifest::IMAGE_CONFIG_MEDIA_TYPE.to_string(),
            None,
        );

        let client = Self::client(opts);
        let response = client
            .push(&parsed, &layers, config, &Self::auth(opts), None)
            .await
            .map_err(|e| Error::ImagePull {
                reference: normalized.clone(),
                reason: format!("push failed: {e}"),
            })?;
        info!(reference = %normalized, "pushed");
        Ok(response.manifest_url)
    }

    /// Searches the registry's index for images matching `term`.
    pub async fn search(term: &str, limit: usize) -> Result<Vec<SearchResult>> {
        #[derive(serde::Deserialize)]
        struct Raw {
            name: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            star_count: u32,
            #[serde(default)]
            is_official: bool,
        }
        #[derive(serde::Deserialize)]
        struct Response {
            #[serde(default)]
            results: Vec<Raw>,
        }

        let url = format!(
            "https://index.docker.io/v1/search?q={}&n={}",
            term,
            limit.max(1)
        );
        let response: Response = reqwest::Client::new()
            .get(&url)
            .timeout(IMAGE_PULL_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::ImagePull {
                reference: term.to_string(),
                reason: format!("search failed: {e}"),
            })?
            .json()
            .await
            .map_err(|e| Error::ImagePull {
                reference: term.to_string(),
                reason: format!("unparseable search response: {e}"),
            })?;

        Ok(response
            .results
            .into_iter()
            .take(limit.max(1))
            .map(|r| SearchResult {
                name: r.name,
                description: r.description,
                stars: r.star_count,
                official: r.is_official,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pull_policy_parsing() {
        assert_eq!(PullPolicy::parse("always").unwrap(), PullPolicy::Always);
        assert_eq!(PullPolicy::parse("missing").unwrap(), PullPolicy::Missing);
        assert_eq!(PullPolicy::parse("").unwrap(), PullPolicy::Missing);
        assert_eq!(PullPolicy::parse("never").unwrap(), PullPolicy::Never);
        assert!(PullPolicy::parse("sometimes").is_err());
    }

    #[test]
    fn target_platform_defaults() {
        let (os, arch) = ImagePuller::target_platform(&PullOptions::default());
        assert_eq!(os, "linux");
        assert!(!arch.is_empty());

        let (os, arch) = ImagePuller::target_platform(&PullOptions {
            os: Some("linux".to_string()),
            arch: Some("arm64".to_string()),
            ..Default::default()
        });
        assert_eq!((os.as_str(), arch.as_str()), ("linux", "arm64"));
    }

    #[tokio::test]
    async fn never_policy_fails_on_missing() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage =
            crate::storage::Storage::open(dir.path().join("g"), dir.path().join("r")).unwrap();
        let store = ImageStore::open(storage, crate::events::EventBus::new(), Box::new(|_| None))
            .unwrap();

        let err = ImagePuller::pull(
            &store,
            "alpine",
            &PullOptions {
                policy: PullPolicy::Never,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NoSuchImage(_)));
    }

    #[tokio::test]
    async fn all_tags_rejects_tagged_reference() {
        let dir = tempfile::TempDir::new().unwrap();
        let storage =
            crate::storage::Storage::open(dir.path().join("g"), dir.path().join("r")).unwrap();
        let store = ImageStore::open(storage, crate::events::EventBus::new(), Box::new(|_| None))
            .unwrap();

        let err = ImagePuller::pull(
            &store,
            "alpine:3.18",
            &PullOptions {
                all_tags: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
    }
}
