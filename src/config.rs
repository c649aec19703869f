//! Engine configuration.
//!
//! One explicit value constructed in `main` (or by tests) and passed down.
//! Nothing in the engine reads globals; the only environment lookups happen
//! here and in the tunnel URI resolver.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How cgroups are managed for containers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupManager {
    #[default]
    Systemd,
    Cgroupfs,
}

impl std::fmt::Display for CgroupManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Systemd => write!(f, "systemd"),
            Self::Cgroupfs => write!(f, "cgroupfs"),
        }
    }
}

/// Resource-control capabilities detected on the host. Limits the kernel
/// cannot enforce are dropped from generated specs with a warning.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CgroupCapabilities {
    pub memory: bool,
    pub memory_swap: bool,
    pub cpu: bool,
    pub pids: bool,
}

impl CgroupCapabilities {
    /// Everything supported; the default off-Linux and in tests.
    pub fn all() -> Self {
        Self {
            memory: true,
            memory_swap: true,
            cpu: true,
            pids: true,
        }
    }

    /// Probes the unified cgroup hierarchy for available controllers.
    #[cfg(target_os = "linux")]
    pub fn detect() -> Self {
        let controllers = std::fs::read_to_string("/sys/fs/cgroup/cgroup.controllers")
            .unwrap_or_default();
        let has = |c: &str| controllers.split_whitespace().any(|x| x == c);
        Self {
            memory: has("memory"),
            memory_swap: has("memory")
                && std::path::Path::new("/sys/fs/cgroup/memory.swap.max").exists(),
            cpu: has("cpu"),
            pids: has("pids"),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn detect() -> Self {
        Self::all()
    }
}

impl Default for CgroupCapabilities {
    fn default() -> Self {
        Self::all()
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Persistent state root (images, container configs, volumes metadata).
    pub graph_root: PathBuf,
    /// Ephemeral state root, cleaned on reboot.
    pub run_root: PathBuf,
    /// Temporary files directory.
    pub tmp_dir: PathBuf,
    /// OCI runtime binary driven for container processes.
    pub runtime: String,
    /// Storage driver name recorded in exit commands and reports.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_driver: Option<String>,
    /// Driver-specific storage options.
    #[serde(default)]
    pub storage_opts: Vec<String>,
    pub cgroup_manager: CgroupManager,
    /// Log level propagated to cleanup processes.
    pub log_level: String,
    /// Route engine logs to syslog in cleanup commands.
    #[serde(default)]
    pub syslog: bool,
    /// Size of the bounded worker pool for parallel bulk operations.
    pub parallel_workers: usize,
    /// Whether the engine runs unprivileged.
    pub rootless: bool,
    /// Host resource-control capabilities.
    #[serde(default)]
    pub cgroup_caps: CgroupCapabilities,
}

impl EngineConfig {
    /// Configuration rooted at the conventional system paths (or per-user
    /// paths when rootless).
    pub fn system() -> Self {
        let rootless = is_rootless();
        let (graph_root, run_root) = if rootless {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            let uid = unsafe { libc::geteuid() };
            (
                home.join(".local/share/caravel/storage"),
                PathBuf::from(format!("/run/user/{uid}/caravel")),
            )
        } else {
            (
                PathBuf::from("/var/lib/caravel/storage"),
                PathBuf::from("/run/caravel"),
            )
        };
        Self {
            graph_root,
            run_root,
            tmp_dir: std::env::temp_dir(),
            runtime: crate::constants::DEFAULT_OCI_RUNTIME.to_string(),
            storage_driver: None,
            storage_opts: Vec::new(),
            cgroup_manager: CgroupManager::default(),
            log_level: "warn".to_string(),
            syslog: false,
            parallel_workers: crate::constants::default_parallel_workers(),
            rootless,
            cgroup_caps: CgroupCapabilities::detect(),
        }
    }

    /// Configuration rooted at an arbitrary directory, for tests.
    pub fn rooted_at(base: &std::path::Path) -> Self {
        Self {
            graph_root: base.join("storage"),
            run_root: base.join("run"),
            tmp_dir: base.join("tmp"),
            runtime: crate::constants::DEFAULT_OCI_RUNTIME.to_string(),
            storage_driver: None,
            storage_opts: Vec::new(),
            cgroup_manager: CgroupManager::Cgroupfs,
            log_level: "debug".to_string(),
            syslog: false,
            parallel_workers: crate::constants::default_parallel_workers(),
            rootless: false,
            cgroup_caps: CgroupCapabilities::all(),
        }
    }
}

/// True when the current process runs without root privileges.
pub fn is_rootless() -> bool {
    unsafe { libc::geteuid() != 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_config_keeps_paths_under_base() {
        let config = EngineConfig::rooted_at(std::path::Path::new("/tmp/caravel-test"));
        assert!(config.graph_root.starts_with("/tmp/caravel-test"));
        assert!(config.run_root.starts_with("/tmp/caravel-test"));
    }

    #[test]
    fn cgroup_manager_display() {
        assert_eq!(CgroupManager::Systemd.to_string(), "systemd");
        assert_eq!(CgroupManager::Cgroupfs.to_string(), "cgroupfs");
    }
}
