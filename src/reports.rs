//! Report types shared by every surface.
//!
//! The ABI engine produces these, the HTTP service serializes them, and the
//! tunnel engine deserializes them back: one set of structs, so remote and
//! local modes agree on shape by construction.

use crate::container::config::{ContainerConfig, PortMapping};
use crate::container::state::{ContainerStatus, RuntimeState, WaitCondition};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// =============================================================================
// Container Reports
// =============================================================================

/// Full inspect view of one container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInspect {
    pub id: String,
    pub name: String,
    pub config: ContainerConfig,
    pub state: RuntimeState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// One row of `ps`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub command: Vec<String>,
    pub status: ContainerStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    pub ports: Vec<PortMapping>,
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

/// Per-target outcome of a bulk container operation. `err` is `None` on
/// success; bulk calls never abort on the first failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerReport {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

impl ContainerReport {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            err: None,
        }
    }

    pub fn failed(id: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self {
            id: id.into(),
            err: Some(err.to_string()),
        }
    }
}

/// Outcome of `wait`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WaitReport {
    pub exit_code: i32,
    pub condition: WaitCondition,
}

/// One parsed log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    /// "stdout" or "stderr".
    pub stream: String,
    pub message: String,
}

/// `top` output: one header row plus one row per process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopReport {
    pub titles: Vec<String>,
    pub processes: Vec<Vec<String>>,
}

/// Point-in-time resource usage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub cpu_nanos: u64,
    pub memory_bytes: u64,
    pub memory_limit: u64,
    pub pids: u64,
}

/// One filesystem change from `diff`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    /// "A" added, "C" changed, "D" deleted.
    pub kind: String,
    pub path: String,
}

// =============================================================================
// Pod Reports
// =============================================================================

/// Derived pod state. Never stored; computed from member states on read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum PodState {
    Created,
    Running,
    Paused,
    Exited,
    Degraded,
}

impl std::fmt::Display for PodState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "Created",
            Self::Running => "Running",
            Self::Paused => "Paused",
            Self::Exited => "Exited",
            Self::Degraded => "Degraded",
        };
        write!(f, "{s}")
    }
}

/// Member line inside a pod inspect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodMember {
    pub id: String,
    pub name: String,
    pub status: ContainerStatus,
    pub is_infra: bool,
}

/// Full inspect view of one pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInspect {
    pub id: String,
    pub name: String,
    pub state: PodState,
    pub shared_namespaces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infra_container: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cgroup_parent: Option<String>,
    pub labels: HashMap<String, String>,
    pub members: Vec<PodMember>,
    pub created_at: DateTime<Utc>,
}

/// Aggregate outcome of a pod operation: the pod plus one entry per member
/// the operation touched.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodReport {
    pub id: String,
    #[serde(default)]
    pub member_errs: Vec<ContainerReport>,
}

impl PodReport {
    /// True when every member succeeded.
    pub fn is_ok(&self) -> bool {
        self.member_errs.iter().all(|r| r.err.is_none())
    }
}

// =============================================================================
// Image Reports
// =============================================================================

/// One row of `image list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub id: String,
    pub digest: String,
    pub tags: Vec<String>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Full inspect view of one image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInspect {
    pub id: String,
    pub digest: String,
    pub tags: Vec<String>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub layers: Vec<String>,
    pub config: crate::specgen::ImageRuntimeConfig,
    pub created_at: DateTime<Utc>,
}

/// One layer row of `image history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub layer: String,
    pub size: u64,
    pub comment: String,
}

/// Outcome of `image rm`: worst per-target exit code plus per-image results.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRemoveReport {
    pub deleted: Vec<String>,
    pub untagged: Vec<String>,
    pub errors: Vec<String>,
    /// 0 all good; 1 some ref missing; 2 some image in use.
    pub exit_code: u8,
}

/// One row of `image search`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub name: String,
    pub description: String,
    pub stars: u32,
    pub official: bool,
}

// =============================================================================
// Volume Reports
// =============================================================================

/// Inspect view of a volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInspect {
    pub name: String,
    pub driver: String,
    pub mountpoint: String,
    pub labels: HashMap<String, String>,
    pub options: HashMap<String, String>,
    pub scope: String,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// System Reports
// =============================================================================

/// `version` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionReport {
    pub version: String,
    pub api_version: String,
    pub oci_spec_version: String,
    pub os: String,
    pub arch: String,
}

/// `info` output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoReport {
    pub version: VersionReport,
    pub rootless: bool,
    pub graph_root: String,
    pub run_root: String,
    pub runtime: String,
    pub cgroup_manager: String,
    pub containers: usize,
    pub pods: usize,
    pub images: usize,
    pub volumes: usize,
}

/// One `system df` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfEntry {
    pub kind: String,
    pub total: usize,
    pub active: usize,
    pub size: u64,
}

/// Outcome of a prune: what was removed and how much space it freed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneReport {
    pub removed: Vec<String>,
    pub space_reclaimed: u64,
}

/// Boolean existence check, shaped as a report for wire parity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoolReport {
    pub value: bool,
}
