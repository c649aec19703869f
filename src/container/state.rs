//! Container state machine.
//!
//! ```text
//!         create
//!   * ──────────► Created ──start──► Running ──stop/kill──► Exited
//!                    │                  │                      │
//!                    │                  ├──pause──► Paused ────┤
//!                    │                  │              │       │
//!                    │                  │           unpause    │
//!                    │                  │◄─────────────┘       │
//!                    │              finish                     │
//!                    │                  ▼                      │
//!                    └───────────────►Exited◄──────────────────┘
//!                                      │
//!                                      └── rm ──► (gone)
//! ```
//!
//! The status enum is the single source of truth for which operations are
//! legal; every store operation consults the transition predicates here
//! before touching the runtime.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Engine-level container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    /// Spec accepted, nothing materialised yet.
    Configured,
    /// Runtime record and rootfs exist, process not started.
    Created,
    /// Init process is alive.
    Running,
    /// Frozen by the cgroup freezer; was Running.
    Paused,
    /// Stopped by the engine, exit status not yet collected.
    Stopped,
    /// Init process has exited and the exit code is recorded.
    Exited,
    /// Removal in progress.
    Removing,
}

impl ContainerStatus {
    /// A state no further lifecycle progress happens from (except rm/start).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Stopped | Self::Configured)
    }

    /// States `start` accepts.
    pub fn can_start(&self) -> bool {
        matches!(self, Self::Created | Self::Exited | Self::Stopped)
    }

    /// States `stop` acts in. Stopping an already-stopped container is a
    /// benign no-op handled by the caller, not an illegal transition.
    pub fn can_stop(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    /// `kill` is legal only with a live process.
    pub fn can_kill(&self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }

    pub fn can_pause(&self) -> bool {
        matches!(self, Self::Running)
    }

    pub fn can_unpause(&self) -> bool {
        matches!(self, Self::Paused)
    }

    /// `init` materialises the runtime record; only from Configured.
    pub fn can_init(&self) -> bool {
        matches!(self, Self::Configured)
    }

    /// Exec sessions need a live, unfrozen init.
    pub fn can_exec(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// `rm` without force refuses live containers.
    pub fn can_remove(&self) -> bool {
        !matches!(self, Self::Running | Self::Paused | Self::Removing)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Configured => "configured",
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Exited => "exited",
            Self::Removing => "removing",
        };
        write!(f, "{s}")
    }
}

/// Mutable runtime state of a container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub status: ContainerStatus,
    /// PID of the init process while Running/Paused.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// PID of the monitor process while one exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conmon_pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Times the rootfs is currently mounted.
    #[serde(default)]
    pub mount_count: u32,
    /// Times the restart policy has restarted this container.
    #[serde(default)]
    pub restart_count: u32,
}

impl RuntimeState {
    pub fn new() -> Self {
        Self {
            status: ContainerStatus::Configured,
            pid: None,
            conmon_pid: None,
            exit_code: None,
            started_at: None,
            finished_at: None,
            mount_count: 0,
            restart_count: 0,
        }
    }
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self::new()
    }
}

/// Conditions `wait` can block on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitCondition {
    Configured,
    Created,
    Running,
    Paused,
    Stopped,
    Exited,
}

impl WaitCondition {
    /// Whether a status satisfies this condition.
    pub fn matches(&self, status: ContainerStatus) -> bool {
        matches!(
            (self, status),
            (Self::Configured, ContainerStatus::Configured)
                | (Self::Created, ContainerStatus::Created)
                | (Self::Running, ContainerStatus::Running)
                | (Self::Paused, ContainerStatus::Paused)
                | (Self::Stopped, ContainerStatus::Stopped)
                | (Self::Exited, ContainerStatus::Exited)
                | (Self::Exited, ContainerStatus::Stopped)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_predicates() {
        assert!(ContainerStatus::Created.can_start());
        assert!(ContainerStatus::Exited.can_start());
        assert!(!ContainerStatus::Running.can_start());

        assert!(ContainerStatus::Running.can_stop());
        assert!(ContainerStatus::Paused.can_stop());
        assert!(!ContainerStatus::Exited.can_stop());

        assert!(ContainerStatus::Running.can_pause());
        assert!(!ContainerStatus::Paused.can_pause());
        assert!(ContainerStatus::Paused.can_unpause());

        assert!(ContainerStatus::Configured.can_init());
        assert!(!ContainerStatus::Created.can_init());

        assert!(ContainerStatus::Exited.can_remove());
        assert!(!ContainerStatus::Running.can_remove());
        assert!(!ContainerStatus::Paused.can_remove());
    }

    #[test]
    fn exec_requires_running() {
        assert!(ContainerStatus::Running.can_exec());
        assert!(!ContainerStatus::Paused.can_exec());
        assert!(!ContainerStatus::Created.can_exec());
    }

    #[test]
    fn wait_condition_exited_accepts_stopped() {
        assert!(WaitCondition::Exited.matches(ContainerStatus::Exited));
        assert!(WaitCondition::Exited.matches(ContainerStatus::Stopped));
        assert!(!WaitCondition::Exited.matches(ContainerStatus::Running));
        assert!(WaitCondition::Running.matches(ContainerStatus::Running));
    }
}
