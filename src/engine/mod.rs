//! Engine facade: one capability surface, two implementations.
//!
//! [`ContainerEngine`] and [`ImageEngine`] are the contract every command
//! programs against. [`abi::AbiEngine`] drives the in-process stores;
//! [`tunnel::TunnelEngine`] translates each call into an HTTP request
//! against a remote service. Both return the same report types, so output
//! is identical either way.

pub mod abi;
pub mod tunnel;
pub mod uri;

use crate::container::config::PortMapping;
use crate::container::exec::{ExecConfig, ExecInspect};
use crate::container::store::{LogOptions, RemoveOptions};
use crate::container::state::WaitCondition;
use crate::error::Result;
use crate::image::pull::PullOptions;
use crate::pod::PodCreateOptions;
use crate::reports::*;
use crate::specgen::ContainerSpec;
use crate::volume::{VolumeCreateOptions, VolumeFilters};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

/// Which transport an engine instance speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineMode {
    /// Direct library calls into the local runtime.
    Abi,
    /// HTTP client against a remote service.
    Tunnel,
}

// =============================================================================
// Container Engine
// =============================================================================

/// Container, pod, volume, and system capabilities.
///
/// Bulk operations take a list of names and return one report per target;
/// they never abort on the first failure.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    fn mode(&self) -> EngineMode;

    // --- containers ---
    async fn container_create(&self, spec: ContainerSpec) -> Result<String>;
    async fn container_init(&self, name: &str) -> Result<()>;
    async fn container_start(&self, names: &[String]) -> Result<Vec<ContainerReport>>;
    async fn container_stop(
        &self,
        names: &[String],
        timeout: Option<u64>,
        ignore: bool,
    ) -> Result<Vec<ContainerReport>>;
    async fn container_kill(&self, names: &[String], signal: &str)
        -> Result<Vec<ContainerReport>>;
    async fn container_pause(&self, names: &[String]) -> Result<Vec<ContainerReport>>;
    async fn container_unpause(&self, names: &[String]) -> Result<Vec<ContainerReport>>;
    async fn container_restart(
        &self,
        names: &[String],
        timeout: Option<u64>,
    ) -> Result<Vec<ContainerReport>>;
    async fn container_rm(
        &self,
        names: &[String],
        opts: RemoveOptions,
    ) -> Result<Vec<ContainerReport>>;
    async fn container_prune(&self) -> Result<PruneReport>;
    async fn container_exists(&self, name: &str) -> Result<BoolReport>;
    async fn container_inspect(&self, name: &str) -> Result<ContainerInspect>;
    async fn container_list(&self, all: bool) -> Result<Vec<ContainerSummary>>;
    async fn container_wait(&self, name: &str, conditions: &[WaitCondition])
        -> Result<WaitReport>;
    async fn container_logs(&self, name: &str, opts: &LogOptions) -> Result<Vec<LogEntry>>;
    async fn container_top(&self, name: &str) -> Result<TopReport>;
    async fn container_stats(&self, name: &str) -> Result<ContainerStats>;
    async fn container_diff(&self, name: &str) -> Result<Vec<FileChange>>;
    async fn container_port(&self, name: &str) -> Result<Vec<PortMapping>>;
    async fn container_export(&self, name: &str, path: &std::path::Path) -> Result<()>;
    async fn container_commit(&self, name: &str, tag: Option<&str>) -> Result<String>;
    async fn container_checkpoint(&self, name: &str, leave_running: bool) -> Result<()>;
    async fn container_restore(&self, name: &str) -> Result<()>;
    /// Fundamentally local: tunnel mode refuses.
    async fn container_mount(&self, name: &str) -> Result<PathBuf>;
    /// Fundamentally local: tunnel mode refuses.
    async fn container_unmount(&self, name: &str) -> Result<()>;
    /// Fundamentally local: tunnel mode refuses.
    async fn container_copy(&self, src: &str, dst: &str) -> Result<()>;
    /// Runs the recorded exit command bookkeeping after a container exits.
    async fn container_cleanup(&self, name: &str, rm: bool) -> Result<()>;

    // --- exec ---
    async fn exec_create(&self, container: &str, config: ExecConfig) -> Result<String>;
    async fn exec_start(&self, session: &str) -> Result<()>;
    /// Runs the session to completion, returning (exit code, stdout, stderr).
    async fn exec_start_attached(&self, session: &str) -> Result<(i32, Vec<u8>, Vec<u8>)>;
    async fn exec_inspect(&self, session: &str) -> Result<ExecInspect>;
    async fn exec_resize(&self, session: &str, height: u16, width: u16) -> Result<()>;
    /// Settles a session's record after its process exited; invoked by the
    /// session's exit command. Local-only.
    async fn exec_cleanup(&self, session: &str, exit_code: i32) -> Result<()>;

    // --- pods ---
    async fn pod_create(&self, opts: PodCreateOptions) -> Result<String>;
    async fn pod_exists(&self, name: &str) -> Result<BoolReport>;
    async fn pod_inspect(&self, name: &str) -> Result<PodInspect>;
    async fn pod_list(&self) -> Result<Vec<PodInspect>>;
    async fn pod_start(&self, name: &str) -> Result<PodReport>;
    async fn pod_stop(&self, name: &str, timeout: Option<u64>) -> Result<PodReport>;
    async fn pod_kill(&self, name: &str, signal: &str) -> Result<PodReport>;
    async fn pod_pause(&self, name: &str) -> Result<PodReport>;
    async fn pod_unpause(&self, name: &str) -> Result<PodReport>;
    async fn pod_restart(&self, name: &str) -> Result<PodReport>;
    async fn pod_rm(&self, name: &str, force: bool, ignore: bool) -> Result<PodReport>;
    async fn pod_prune(&self) -> Result<PruneReport>;
    async fn pod_top(&self, name: &str) -> Result<TopReport>;
    async fn pod_stats(&self, name: &str) -> Result<Vec<ContainerStats>>;

    // --- volumes ---
    async fn volume_create(&self, opts: VolumeCreateOptions) -> Result<VolumeInspect>;
    async fn volume_exists(&self, name: &str) -> Result<BoolReport>;
    async fn volume_inspect(&self, name: &str) -> Result<VolumeInspect>;
    async fn volume_list(&self, filters: VolumeFilters) -> Result<Vec<VolumeInspect>>;
    async fn volume_rm(&self, name: &str, force: bool) -> Result<()>;
    async fn volume_prune(&self, filters: HashMap<String, Vec<String>>) -> Result<PruneReport>;

    // --- system ---
    async fn version(&self) -> Result<VersionReport>;
    async fn info(&self) -> Result<InfoReport>;
    async fn system_df(&self) -> Result<Vec<DfEntry>>;
    /// Idempotent; the underlying teardown runs exactly once per engine.
    async fn shutdown(&self) -> Result<()>;
}

// =============================================================================
// Image Engine
// =============================================================================

/// Image capabilities.
#[async_trait]
pub trait ImageEngine: Send + Sync {
    async fn image_exists(&self, name: &str) -> Result<BoolReport>;
    async fn image_list(&self, filter: Option<&str>) -> Result<Vec<ImageSummary>>;
    async fn image_inspect(&self, name: &str) -> Result<ImageInspect>;
    async fn image_pull(&self, reference: &str, opts: PullOptions) -> Result<Vec<String>>;
    async fn image_push(&self, reference: &str, opts: PullOptions) -> Result<String>;
    async fn image_tag(&self, reference: &str, new_tag: &str) -> Result<()>;
    async fn image_untag(&self, reference: &str, tag: &str) -> Result<()>;
    async fn image_remove(
        &self,
        references: &[String],
        force: bool,
        all: bool,
    ) -> Result<ImageRemoveReport>;
    async fn image_prune(&self, all: bool) -> Result<PruneReport>;
    async fn image_history(&self, reference: &str) -> Result<Vec<HistoryEntry>>;
    async fn image_tree(&self, reference: &str, what_requires: bool) -> Result<Vec<String>>;
    async fn image_search(&self, term: &str, limit: usize) -> Result<Vec<SearchResult>>;
    async fn image_import(&self, tarball_path: &std::path::Path, tag: Option<&str>)
        -> Result<String>;
    async fn image_load(&self, archive_path: &std::path::Path) -> Result<Vec<String>>;
    async fn image_save(&self, reference: &str, path: &std::path::Path) -> Result<()>;
    async fn image_diff(&self, reference: &str) -> Result<Vec<FileChange>>;
}

// =============================================================================
// Query Encoding
// =============================================================================

/// Deterministic query-string builder: the compile-time replacement for
/// reflective parameter walking. Each options type pushes its own fields.
#[derive(Debug, Default, Clone)]
pub struct QueryParams {
    pairs: Vec<(String, String)>,
}

impl QueryParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_str(&mut self, key: &str, value: &str) -> &mut Self {
        self.pairs.push((key.to_string(), value.to_string()));
        self
    }

    /// Booleans are encoded only when true; absent means false.
    pub fn push_bool(&mut self, key: &str, value: bool) -> &mut Self {
        if value {
            self.pairs.push((key.to_string(), "true".to_string()));
        }
        self
    }

    pub fn push_int(&mut self, key: &str, value: impl std::fmt::Display) -> &mut Self {
        self.pairs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn push_opt(&mut self, key: &str, value: Option<impl std::fmt::Display>) -> &mut Self {
        if let Some(v) = value {
            self.pairs.push((key.to_string(), v.to_string()));
        }
        self
    }

    /// Slices repeat the key once per element.
    pub fn push_slice(&mut self, key: &str, values: &[String]) -> &mut Self {
        for v in values {
            self.pairs.push((key.to_string(), v.clone()));
        }
        self
    }

    /// Maps of string→list encode as one JSON value, the historical wire
    /// shape for filters.
    pub fn push_map(&mut self, key: &str, map: &HashMap<String, Vec<String>>) -> &mut Self {
        if !map.is_empty() {
            if let Ok(json) = serde_json::to_string(map) {
                self.pairs.push((key.to_string(), json));
            }
        }
        self
    }

    /// Percent-encoded query string, without the leading `?`.
    pub fn encode(&self) -> String {
        self.pairs
            .iter()
            .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

/// Percent-encodes everything outside the query-safe unreserved set.
fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_params_encoding() {
        let mut params = QueryParams::new();
        params
            .push_str("name", "web server")
            .push_bool("force", true)
            .push_bool("ignore", false)
            .push_int("t", 10)
            .push_slice(
                "names",
                &["a".to_string(), "b".to_string()],
            );
        let encoded = params.encode();
        assert!(encoded.contains("name=web%20server"));
        assert!(encoded.contains("force=true"));
        assert!(!encoded.contains("ignore"));
        assert!(encoded.contains("t=10"));
        assert!(encoded.contains("names=a&names=b"));
    }

    #[test]
    fn map_params_encode_as_json() {
        let mut params = QueryParams::new();
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec!["a=b".to_string()]);
        params.push_map("filters", &filters);
        let encoded = params.encode();
        assert!(encoded.starts_with("filters=%7B"));
    }

    #[test]
    fn encoding_is_deterministic() {
        let build = || {
            let mut p = QueryParams::new();
            p.push_str("a", "1").push_str("b", "2");
            p.encode()
        };
        assert_eq!(build(), build());
    }
}
