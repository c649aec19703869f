//! Container configuration value types.
//!
//! A container's config is immutable after create. The store reads each
//! field exactly once at create time; there are no option closures, every
//! knob is an explicit field.

use crate::error::{Error, Result};
use crate::oci::Signal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Generates a fresh 64-hex object ID.
pub fn new_id() -> String {
    let a = uuid::Uuid::new_v4().simple().to_string();
    let b = uuid::Uuid::new_v4().simple().to_string();
    format!("{a}{b}")
}

/// Validates a container/pod/volume name: DNS-label shaped, bounded length.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > crate::constants::MAX_NAME_LEN {
        return Err(Error::InvalidArg(format!(
            "name must be 1-{} characters: {name:?}",
            crate::constants::MAX_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| crate::constants::NAME_VALID_CHARS.contains(c))
    {
        return Err(Error::InvalidArg(format!(
            "name contains invalid characters: {name:?}"
        )));
    }
    if name.starts_with('-') || name.starts_with('.') {
        return Err(Error::InvalidArg(format!(
            "name must start with a letter or digit: {name:?}"
        )));
    }
    Ok(())
}

// =============================================================================
// Namespaces
// =============================================================================

/// Mode for one of the six container namespaces.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "value")]
pub enum NamespaceMode {
    /// Resolved at spec-generation time: pod first, then engine config.
    #[default]
    Default,
    /// Share the host's namespace.
    Host,
    /// Create a fresh namespace.
    Private,
    /// Join the namespace of another container by ID.
    FromContainer(String),
    /// Join the pod's shared namespace (via the infra container).
    FromPod,
    /// No namespace of this type (network only).
    None,
    /// Bridged network (network only, resolved form of Private).
    Bridge,
    /// User-mode slirp network (network only, rootless resolved default).
    Slirp,
}

impl NamespaceMode {
    /// Parses the user-facing syntax: `host`, `private`, `container:<id>`,
    /// `pod`, `none`, `bridge`, `slirp4netns`.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(target) = s.strip_prefix("container:") {
            if target.is_empty() {
                return Err(Error::InvalidArg(
                    "container: namespace mode requires a container ID".to_string(),
                ));
            }
            return Ok(Self::FromContainer(target.to_string()));
        }
        match s {
            "" | "default" => Ok(Self::Default),
            "host" => Ok(Self::Host),
            "private" => Ok(Self::Private),
            "pod" => Ok(Self::FromPod),
            "none" => Ok(Self::None),
            "bridge" => Ok(Self::Bridge),
            "slirp4netns" | "slirp" => Ok(Self::Slirp),
            _ => Err(Error::InvalidArg(format!("invalid namespace mode: {s:?}"))),
        }
    }

    /// True when the mode creates a namespace of our own (not shared/host).
    pub fn is_private(&self) -> bool {
        matches!(
            self,
            Self::Private | Self::Bridge | Self::Slirp | Self::Default
        )
    }
}

/// Per-container namespace configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NamespaceConfig {
    pub pid: NamespaceMode,
    pub ipc: NamespaceMode,
    pub uts: NamespaceMode,
    pub net: NamespaceMode,
    pub user: NamespaceMode,
    pub cgroup: NamespaceMode,
}

/// The namespace kinds a pod can share through its infra container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharedNamespace {
    Net,
    Ipc,
    Uts,
    Pid,
    Cgroup,
    User,
}

impl SharedNamespace {
    /// Default share set for new pods: net, ipc, uts.
    pub fn default_set() -> Vec<SharedNamespace> {
        vec![SharedNamespace::Net, SharedNamespace::Ipc, SharedNamespace::Uts]
    }
}

// =============================================================================
// Mounts & Ports
// =============================================================================

/// A mount requested for the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum Mount {
    /// Bind mount of a host path.
    Bind {
        source: PathBuf,
        destination: PathBuf,
        #[serde(default)]
        options: Vec<String>,
    },
    /// Tmpfs at the destination.
    Tmpfs {
        destination: PathBuf,
        #[serde(default)]
        options: Vec<String>,
    },
    /// Named volume managed by the volume manager.
    Volume {
        name: String,
        destination: PathBuf,
        #[serde(default)]
        options: Vec<String>,
    },
}

impl Mount {
    /// Destination path inside the container.
    pub fn destination(&self) -> &PathBuf {
        match self {
            Mount::Bind { destination, .. }
            | Mount::Tmpfs { destination, .. }
            | Mount::Volume { destination, .. } => destination,
        }
    }

    /// Volume name, when this is a named-volume mount.
    pub fn volume_name(&self) -> Option<&str> {
        match self {
            Mount::Volume { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// A published port mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_ip: Option<String>,
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

// =============================================================================
// Restart Policy
// =============================================================================

/// What to do when the container's init process exits.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "policy", content = "max_retries")]
pub enum RestartPolicy {
    #[default]
    No,
    OnFailure(Option<u32>),
    Always,
    UnlessStopped,
}

impl RestartPolicy {
    /// Parses `no`, `on-failure[:N]`, `always`, `unless-stopped`.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(rest) = s.strip_prefix("on-failure") {
            let retries = match rest.strip_prefix(':') {
                None if rest.is_empty() => None,
                Some(n) => Some(n.parse::<u32>().map_err(|_| {
                    Error::InvalidArg(format!("invalid restart retry count: {n:?}"))
                })?),
                _ => return Err(Error::InvalidArg(format!("invalid restart policy: {s:?}"))),
            };
            return Ok(Self::OnFailure(retries));
        }
        match s {
            "" | "no" => Ok(Self::No),
            "always" => Ok(Self::Always),
            "unless-stopped" => Ok(Self::UnlessStopped),
            _ => Err(Error::InvalidArg(format!("invalid restart policy: {s:?}"))),
        }
    }
}

// =============================================================================
// Security & Resources
// =============================================================================

/// Security-related settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default)]
    pub cap_add: Vec<String>,
    #[serde(default)]
    pub cap_drop: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seccomp_profile: Option<PathBuf>,
    #[serde(default)]
    pub selinux_labels: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apparmor_profile: Option<String>,
    #[serde(default)]
    pub no_new_privileges: bool,
    #[serde(default)]
    pub privileged: bool,
}

/// Resource limits. Unsupported limits are dropped with a warning at spec
/// generation; nonsensical values hard-error there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_swap: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_period: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_quota: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids_limit: Option<i64>,
}

// =============================================================================
// Health Check
// =============================================================================

/// Health-check configuration, merged from Docker-schema image config.
/// Stored but not scheduled: a daemonless engine has no place to run timers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub test: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_period_secs: Option<u64>,
}

// =============================================================================
// Container Config
// =============================================================================

/// Immutable configuration of a container, fixed at create time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// 64-hex ID, unique within the store.
    pub id: String,
    /// Unique human name.
    pub name: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    /// Image reference the container was created from. Exclusive with rootfs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Resolved image ID at create time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
    /// Pre-assembled rootfs path. Exclusive with image.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ports: Vec<PortMapping>,
    #[serde(default)]
    pub mounts: Vec<Mount>,
    #[serde(default)]
    pub namespaces: NamespaceConfig,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub restart_policy: RestartPolicy,
    /// Seconds of SIGTERM grace before SIGKILL on stop.
    pub stop_timeout: u64,
    /// Signal stop sends first.
    pub stop_signal: Signal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheckConfig>,
    /// Pod membership; a container belongs to at most one pod.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    /// True when this container is its pod's infra container.
    #[serde(default)]
    pub is_infra: bool,
    /// Whether a TTY is allocated (attach is raw, not multiplexed).
    #[serde(default)]
    pub tty: bool,
    /// Keep stdin open for attach.
    #[serde(default)]
    pub stdin: bool,
    /// argv the runtime executes when the container exits, for cleanup.
    #[serde(default)]
    pub exit_command: Vec<String>,
    /// Remove the container once it exits.
    #[serde(default)]
    pub auto_remove: bool,
    /// Path the monitor PID is written to.
    pub conmon_pid_file: PathBuf,
    /// DNS servers written to resolv.conf.
    #[serde(default)]
    pub dns_servers: Vec<String>,
    #[serde(default)]
    pub dns_search: Vec<String>,
    #[serde(default)]
    pub dns_options: Vec<String>,
    #[serde(default)]
    pub add_hosts: Vec<String>,
    #[serde(default)]
    pub use_image_resolv_conf: bool,
    #[serde(default)]
    pub use_image_hosts: bool,
    /// systemd mode: true, false, or always.
    #[serde(default)]
    pub systemd: String,
    pub created_at: DateTime<Utc>,
}

impl ContainerConfig {
    /// Minimal config used as a starting point by specgen and tests.
    pub fn new(name: &str) -> Self {
        let id = new_id();
        Self {
            conmon_pid_file: PathBuf::from(format!("/tmp/{id}-conmon.pid")),
            id,
            name: name.to_string(),
            aliases: Vec::new(),
            image: None,
            image_id: None,
            rootfs: None,
            command: Vec::new(),
            entrypoint: Vec::new(),
            env: HashMap::new(),
            labels: HashMap::new(),
            working_dir: None,
            user: None,
            hostname: None,
            ports: Vec::new(),
            mounts: Vec::new(),
            namespaces: NamespaceConfig::default(),
            resources: ResourceLimits::default(),
            security: SecurityConfig::default(),
            restart_policy: RestartPolicy::No,
            stop_timeout: crate::constants::DEFAULT_STOP_TIMEOUT,
            stop_signal: Signal::TERM,
            healthcheck: None,
            pod: None,
            is_infra: false,
            tty: false,
            stdin: false,
            exit_command: Vec::new(),
            auto_remove: false,
            dns_servers: Vec::new(),
            dns_search: Vec::new(),
            dns_options: Vec::new(),
            add_hosts: Vec::new(),
            use_image_resolv_conf: false,
            use_image_hosts: false,
            systemd: "false".to_string(),
            created_at: Utc::now(),
        }
    }

    /// Names of the volumes this container mounts.
    pub fn volume_names(&self) -> Vec<&str> {
        self.mounts.iter().filter_map(Mount::volume_name).collect()
    }
}
