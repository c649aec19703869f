//! Spec generation and validation.
//!
//! Turns a user-level [`ContainerSpec`] plus image metadata into a validated,
//! fully-defaulted OCI runtime spec and an engine-level [`ContainerConfig`].
//! Validation aborts on the first failing invariant; unsupported resource
//! limits degrade to warnings and are dropped from the generated spec.

use crate::config::EngineConfig;
use crate::constants::{
    CPU_PERIOD_MAX, CPU_PERIOD_MIN, DEFAULT_STOP_TIMEOUT, OCI_RUNTIME_SPEC_VERSION,
};
use crate::container::config::{
    ContainerConfig, HealthCheckConfig, Mount, NamespaceConfig, NamespaceMode, PortMapping,
    ResourceLimits, RestartPolicy, SecurityConfig, SharedNamespace, new_id, validate_name,
};
use crate::error::{Error, Result};
use crate::oci::Signal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Accepted values for the systemd field.
const SYSTEMD_VALUES: &[&str] = &["true", "false", "always"];

// =============================================================================
// User-Level Spec
// =============================================================================

/// What the user asked for. Everything is optional except that exactly one
/// of `image` / `rootfs` must be present; defaults come from the image
/// config, the pod, and the engine config, in that order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<PathBuf>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
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
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shm_size: Option<u64>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub uid_mappings: Vec<String>,
    #[serde(default)]
    pub gid_mappings: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(default)]
    pub systemd: String,
    /// Pod to join, by ID or name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod: Option<String>,
    #[serde(default)]
    pub tty: bool,
    #[serde(default)]
    pub stdin: bool,
    #[serde(default)]
    pub auto_remove: bool,
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
}

/// Image configuration relevant to spec generation, as stored in the image's
/// config blob. Fields the user left unset are filled from here.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImageRuntimeConfig {
    /// Resolved image ID (digest hex).
    pub id: String,
    #[serde(default)]
    pub cmd: Vec<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub exposed_ports: Vec<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_signal: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    /// Health check, present only on Docker-schema manifests.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub healthcheck: Option<HealthCheckConfig>,
}

/// Shared-namespace information for a pod the container is joining.
#[derive(Debug, Clone)]
pub struct PodJoinInfo {
    pub pod_id: String,
    pub infra_container: String,
    pub shared: Vec<SharedNamespace>,
}

/// Result of spec generation.
#[derive(Debug, Clone)]
pub struct GeneratedSpec {
    pub oci: OciSpec,
    pub config: ContainerConfig,
    pub warnings: Vec<String>,
}

// =============================================================================
// OCI Runtime Spec (serde view)
// =============================================================================

/// OCI runtime spec document written to the bundle's config.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciSpec {
    pub oci_version: String,
    pub process: OciProcess,
    pub root: OciRoot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub mounts: Vec<OciMount>,
    pub linux: OciLinux,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciProcess {
    pub terminal: bool,
    pub user: OciUser,
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<OciCapabilities>,
    #[serde(default)]
    pub no_new_privileges: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciUser {
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciCapabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub permitted: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciRoot {
    pub path: String,
    #[serde(default)]
    pub readonly: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciMount {
    pub destination: String,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciLinux {
    pub namespaces: Vec<OciNamespace>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resources: Option<OciResources>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uid_mappings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub gid_mappings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OciNamespace {
    #[serde(rename = "type")]
    pub ns_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciResources {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<OciMemory>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<OciCpu>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pids: Option<OciPids>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciMemory {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swap: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OciCpu {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shares: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub period: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OciPids {
    pub limit: i64,
}

// =============================================================================
// Generation
// =============================================================================

/// Generates the OCI spec and engine config for a container.
///
/// `image` must be present when `spec.image` is set; the caller resolves it.
/// `pod` carries the infra container and shared-namespace set when joining.
pub fn generate(
    spec: &ContainerSpec,
    image: Option<&ImageRuntimeConfig>,
    pod: Option<&PodJoinInfo>,
    engine: &EngineConfig,
) -> Result<GeneratedSpec> {
    validate(spec, pod)?;

    let mut warnings = Vec::new();
    let id = new_id();
    let name = match &spec.name {
        Some(n) => {
            validate_name(n)?;
            n.clone()
        }
        None => format!("caravel-{}", &id[..12]),
    };

    // Image merge: any field unset by the user takes the image's default.
    let command = if !spec.command.is_empty() {
        spec.command.clone()
    } else {
        image.map(|i| i.cmd.clone()).unwrap_or_default()
    };
    let entrypoint = match &spec.entrypoint {
        Some(ep) => ep.clone(),
        None => image.map(|i| i.entrypoint.clone()).unwrap_or_default(),
    };
    if entrypoint.is_empty() && command.is_empty() {
        return Err(Error::InvalidSpec {
            field: "command",
            reason: "no command specified and image provides none".to_string(),
        });
    }

    let user = spec
        .user
        .clone()
        .or_else(|| image.and_then(|i| i.user.clone()));
    let working_dir = spec
        .working_dir
        .clone()
        .or_else(|| image.and_then(|i| i.working_dir.clone()))
        .unwrap_or_else(|| "/".to_string());

    // Environment composition: defaults, then image, then user, later wins.
    let mut env = default_env();
    if let Some(image) = image {
        env.extend(image.env.clone());
    }
    env.extend(spec.env.clone());

    // Labels: user wins on collision.
    let mut labels = image.map(|i| i.labels.clone()).unwrap_or_default();
    labels.extend(spec.labels.clone());

    let mut ports = spec.ports.clone();
    if ports.is_empty() {
        if let Some(image) = image {
            ports = image
                .exposed_ports
                .iter()
                .map(|&p| PortMapping {
                    host_ip: None,
                    host_port: 0,
                    container_port: p,
                    protocol: "tcp".to_string(),
                })
                .collect();
        }
    }

    let stop_signal = match &spec.stop_signal {
        Some(s) => Signal::parse(s)?,
        None => match image.and_then(|i| i.stop_signal.as_deref()) {
            Some(s) => Signal::parse(s)?,
            None => Signal::TERM,
        },
    };

    let healthcheck = image.and_then(|i| i.healthcheck.clone());
    let restart_policy = match &spec.restart_policy {
        Some(p) => RestartPolicy::parse(p)?,
        None => RestartPolicy::No,
    };

    let mut namespaces = resolve_namespaces(&spec.namespaces, pod, engine, &mut warnings)?;
    // Applied here so the stored config and the OCI spec agree on the
    // user namespace; inspect must report what actually runs.
    resolve_userns(spec, &mut namespaces);
    let resources = filter_resources(&spec.resources, engine, &mut warnings)?;

    let userdata = engine
        .graph_root
        .join(crate::constants::GRAPH_CONTAINERS_DIR)
        .join(&id)
        .join(crate::constants::CONTAINER_USERDATA_DIR);

    let config = ContainerConfig {
        conmon_pid_file: userdata.join(crate::constants::CONMON_PID_FILE),
        id,
        name,
        aliases: Vec::new(),
        image: spec.image.clone(),
        image_id: image.map(|i| i.id.clone()),
        rootfs: spec.rootfs.clone(),
        command,
        entrypoint,
        env,
        labels,
        working_dir: Some(working_dir.clone()),
        user,
        hostname: spec.hostname.clone(),
        ports,
        mounts: spec.mounts.clone(),
        namespaces: namespaces.clone(),
        resources: resources.clone(),
        security: spec.security.clone(),
        restart_policy,
        stop_timeout: spec.stop_timeout.unwrap_or(DEFAULT_STOP_TIMEOUT),
        stop_signal,
        healthcheck,
        pod: pod.map(|p| p.pod_id.clone()),
        is_infra: false,
        tty: spec.tty,
        stdin: spec.stdin,
        exit_command: exit_command_args(engine, spec.auto_remove, false),
        auto_remove: spec.auto_remove,
        dns_servers: spec.dns_servers.clone(),
        dns_search: spec.dns_search.clone(),
        dns_options: spec.dns_options.clone(),
        add_hosts: spec.add_hosts.clone(),
        use_image_resolv_conf: spec.use_image_resolv_conf,
        use_image_hosts: spec.use_image_hosts,
        systemd: if spec.systemd.is_empty() {
            "false".to_string()
        } else {
            spec.systemd.to_lowercase()
        },
        created_at: chrono::Utc::now(),
    };

    let oci = build_oci_spec(&config, spec, &namespaces, &resources, &working_dir);

    Ok(GeneratedSpec {
        oci,
        config,
        warnings,
    })
}

/// Baseline environment every container gets before image and user values.
fn default_env() -> HashMap<String, String> {
    let mut env = HashMap::new();
    env.insert(
        "PATH".to_string(),
        "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
    );
    env.insert("TERM".to_string(), "xterm".to_string());
    env.insert("container".to_string(), "caravel".to_string());
    env
}

/// Builds the argv the OCI runtime executes when the container exits.
///
/// Recorded verbatim in the container config so cleanup works even when the
/// invoking process is long gone.
pub fn exit_command_args(engine: &EngineConfig, rm: bool, exec: bool) -> Vec<String> {
    let self_path = std::env::current_exe()
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_else(|_| "caravel".to_string());

    let mut command = vec![
        self_path,
        "--root".to_string(),
        engine.graph_root.to_string_lossy().to_string(),
        "--runroot".to_string(),
        engine.run_root.to_string_lossy().to_string(),
        "--log-level".to_string(),
        engine.log_level.clone(),
        "--cgroup-manager".to_string(),
        engine.cgroup_manager.to_string(),
    ];
    if !engine.runtime.is_empty() {
        command.push("--runtime".to_string());
        command.push(engine.runtime.clone());
    }
    if let Some(driver) = &engine.storage_driver {
        command.push("--storage-driver".to_string());
        command.push(driver.clone());
    }
    for opt in &engine.storage_opts {
        command.push("--storage-opt".to_string());
        command.push(opt.clone());
    }
    if engine.syslog {
        command.push("--syslog".to_string());
        command.push("true".to_string());
    }
    command.push("container".to_string());
    command.push("cleanup".to_string());
    if rm {
        command.push("--rm".to_string());
    }
    // Must stay last: the exec session ID is appended after it.
    if exec {
        command.push("--exec".to_string());
    }
    command
}

// =============================================================================
// Validation
// =============================================================================

/// Checks every spec invariant, aborting on the first failure.
pub fn validate(spec: &ContainerSpec, pod: Option<&PodJoinInfo>) -> Result<()> {
    if spec.image.is_some() && spec.rootfs.is_some() {
        return Err(Error::InvalidSpec {
            field: "image",
            reason: "image and rootfs are mutually exclusive".to_string(),
        });
    }
    if spec.image.is_none() && spec.rootfs.is_none() {
        return Err(Error::InvalidSpec {
            field: "image",
            reason: "either an image or a rootfs is required".to_string(),
        });
    }

    if spec.hostname.is_some()
        && !matches!(
            spec.namespaces.uts,
            NamespaceMode::Private | NamespaceMode::Default
        )
    {
        return Err(Error::InvalidSpec {
            field: "hostname",
            reason: "cannot set hostname when joining the host UTS namespace".to_string(),
        });
    }

    if !spec.systemd.is_empty() && !SYSTEMD_VALUES.contains(&spec.systemd.to_lowercase().as_str())
    {
        return Err(Error::InvalidSpec {
            field: "systemd",
            reason: format!("systemd must be one of {}", SYSTEMD_VALUES.join(", ")),
        });
    }

    if spec.security.privileged && !spec.security.cap_add.is_empty() {
        return Err(Error::InvalidSpec {
            field: "cap_add",
            reason: "CapAdd and privileged are mutually exclusive".to_string(),
        });
    }
    if spec.security.privileged && spec.security.apparmor_profile.is_some() {
        return Err(Error::InvalidSpec {
            field: "apparmor_profile",
            reason: "AppArmor profile and privileged are mutually exclusive".to_string(),
        });
    }

    if spec.use_image_resolv_conf {
        if !spec.dns_servers.is_empty() {
            return Err(Error::InvalidSpec {
                field: "dns_servers",
                reason: "UseImageResolvConf conflicts with DNS servers".to_string(),
            });
        }
        if !spec.dns_search.is_empty() {
            return Err(Error::InvalidSpec {
                field: "dns_search",
                reason: "UseImageResolvConf conflicts with DNS search domains".to_string(),
            });
        }
        if !spec.dns_options.is_empty() {
            return Err(Error::InvalidSpec {
                field: "dns_options",
                reason: "UseImageResolvConf conflicts with DNS options".to_string(),
            });
        }
    }
    if spec.use_image_hosts && !spec.add_hosts.is_empty() {
        return Err(Error::InvalidSpec {
            field: "add_hosts",
            reason: "UseImageHosts conflicts with added hosts".to_string(),
        });
    }

    // Namespace-specific conflicts.
    let dns_flags = !spec.dns_servers.is_empty()
        || !spec.dns_search.is_empty()
        || !spec.dns_options.is_empty();
    match &spec.namespaces.net {
        NamespaceMode::None | NamespaceMode::FromContainer(_) if dns_flags => {
            return Err(Error::InvalidSpec {
                field: "dns_servers",
                reason: "DNS options conflict with the network namespace mode".to_string(),
            });
        }
        _ => {}
    }
    if spec.namespaces.ipc == NamespaceMode::Host && spec.shm_size.is_some() {
        return Err(Error::InvalidSpec {
            field: "shm_size",
            reason: "cannot set shm size when sharing the host IPC namespace".to_string(),
        });
    }

    // Per-container namespace overrides that conflict with the pod's shared
    // set fail validation.
    if let Some(pod) = pod {
        let conflicts: &[(SharedNamespace, &NamespaceMode, &str)] = &[
            (SharedNamespace::Net, &spec.namespaces.net, "net"),
            (SharedNamespace::Ipc, &spec.namespaces.ipc, "ipc"),
            (SharedNamespace::Uts, &spec.namespaces.uts, "uts"),
            (SharedNamespace::Pid, &spec.namespaces.pid, "pid"),
            (SharedNamespace::Cgroup, &spec.namespaces.cgroup, "cgroup"),
        ];
        for (shared, mode, label) in conflicts {
            if pod.shared.contains(shared)
                && !matches!(mode, NamespaceMode::Default | NamespaceMode::FromPod)
            {
                return Err(Error::InvalidSpec {
                    field: "namespaces",
                    reason: format!(
                        "cannot override the {label} namespace of a container joining a pod that shares it"
                    ),
                });
            }
        }
    }

    // Hard resource errors; capability-based drops happen later as warnings.
    if let (Some(swap), Some(mem)) = (spec.resources.memory_swap, spec.resources.memory) {
        if swap < mem {
            return Err(Error::InvalidSpec {
                field: "memory_swap",
                reason: format!("memory swap limit {swap} is below the memory limit {mem}"),
            });
        }
    }
    if let Some(period) = spec.resources.cpu_period {
        if !(CPU_PERIOD_MIN..=CPU_PERIOD_MAX).contains(&period) {
            return Err(Error::InvalidSpec {
                field: "cpu_period",
                reason: format!(
                    "cpu period {period} outside [{CPU_PERIOD_MIN}, {CPU_PERIOD_MAX}]"
                ),
            });
        }
    }

    Ok(())
}

// =============================================================================
// Namespace & Resource Resolution
// =============================================================================

/// Resolves `Default` modes: the pod's shared set first, then engine config.
/// Rootless engines default the network namespace to slirp, not bridge.
/// `userns=host` combined with ID mappings silently upgrades to private.
fn resolve_namespaces(
    requested: &NamespaceConfig,
    pod: Option<&PodJoinInfo>,
    engine: &EngineConfig,
    warnings: &mut Vec<String>,
) -> Result<NamespaceConfig> {
    let from_pod = |ns: SharedNamespace| -> Option<NamespaceMode> {
        pod.filter(|p| p.shared.contains(&ns))
            .map(|p| NamespaceMode::FromContainer(p.infra_container.clone()))
    };

    let resolve = |mode: &NamespaceMode, ns: SharedNamespace, private: NamespaceMode| {
        match mode {
            NamespaceMode::Default => from_pod(ns).unwrap_or(private),
            NamespaceMode::FromPod => from_pod(ns).unwrap_or(NamespaceMode::Private),
            other => other.clone(),
        }
    };

    let net_private = if engine.rootless {
        NamespaceMode::Slirp
    } else {
        NamespaceMode::Bridge
    };

    let mut resolved = NamespaceConfig {
        pid: resolve(&requested.pid, SharedNamespace::Pid, NamespaceMode::Private),
        ipc: resolve(&requested.ipc, SharedNamespace::Ipc, NamespaceMode::Private),
        uts: resolve(&requested.uts, SharedNamespace::Uts, NamespaceMode::Private),
        net: resolve(&requested.net, SharedNamespace::Net, net_private),
        user: requested.user.clone(),
        cgroup: resolve(
            &requested.cgroup,
            SharedNamespace::Cgroup,
            NamespaceMode::Host,
        ),
    };

    if resolved.user == NamespaceMode::Default {
        resolved.user = if engine.rootless {
            NamespaceMode::Private
        } else {
            NamespaceMode::Host
        };
    }

    if engine.rootless && resolved.net == NamespaceMode::Bridge {
        warnings.push("bridge networking is unavailable rootless; using slirp".to_string());
        resolved.net = NamespaceMode::Slirp;
    }

    Ok(resolved)
}

/// Upgrades `userns=host` to private when ID mappings were given.
fn resolve_userns(spec: &ContainerSpec, resolved: &mut NamespaceConfig) {
    let has_mappings = !spec.uid_mappings.is_empty() || !spec.gid_mappings.is_empty();
    if has_mappings && resolved.user == NamespaceMode::Host {
        resolved.user = NamespaceMode::Private;
    }
}

/// Drops limits the host cannot enforce, with one warning per dropped limit.
fn filter_resources(
    requested: &ResourceLimits,
    engine: &EngineConfig,
    warnings: &mut Vec<String>,
) -> Result<ResourceLimits> {
    let caps = engine.cgroup_caps;
    let mut resources = requested.clone();

    if resources.memory.is_some() && !caps.memory {
        warnings.push("host does not support memory limits; discarding".to_string());
        resources.memory = None;
        resources.memory_swap = None;
    }
    if resources.memory_swap.is_some() && !caps.memory_swap {
        warnings.push("host does not support memory swap limits; discarding".to_string());
        resources.memory_swap = None;
    }
    if (resources.cpu_shares.is_some()
        || resources.cpu_period.is_some()
        || resources.cpu_quota.is_some())
        && !caps.cpu
    {
        warnings.push("host does not support CPU limits; discarding".to_string());
        resources.cpu_shares = None;
        resources.cpu_period = None;
        resources.cpu_quota = None;
    }
    if resources.pids_limit.is_some() && !caps.pids {
        warnings.push("host does not support pids limits; discarding".to_string());
        resources.pids_limit = None;
    }
    Ok(resources)
}

// =============================================================================
// OCI Spec Assembly
// =============================================================================

fn build_oci_spec(
    config: &ContainerConfig,
    spec: &ContainerSpec,
    namespaces: &NamespaceConfig,
    resources: &ResourceLimits,
    working_dir: &str,
) -> OciSpec {
    let mut args = config.entrypoint.clone();
    args.extend(config.command.iter().cloned());

    let mut env: Vec<String> = config
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    env.sort();

    let mut mounts = default_mounts();
    if let Some(shm) = spec.shm_size {
        mounts.push(OciMount {
            destination: "/dev/shm".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "shm".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                format!("size={shm}"),
            ],
        });
    }
    for mount in &config.mounts {
        mounts.push(match mount {
            Mount::Bind {
                source,
                destination,
                options,
            } => OciMount {
                destination: destination.to_string_lossy().to_string(),
                mount_type: "bind".to_string(),
                source: source.to_string_lossy().to_string(),
                options: with_bind_option(options),
            },
            Mount::Tmpfs {
                destination,
                options,
            } => OciMount {
                destination: destination.to_string_lossy().to_string(),
                mount_type: "tmpfs".to_string(),
                source: "tmpfs".to_string(),
                options: options.clone(),
            },
            // Volume mounts are rewritten to binds of the volume's data dir
            // at start time, once the volume's mount point is known.
            Mount::Volume {
                name,
                destination,
                options,
            } => OciMount {
                destination: destination.to_string_lossy().to_string(),
                mount_type: "bind".to_string(),
                source: format!("volume:{name}"),
                options: with_bind_option(options),
            },
        });
    }

    let capabilities = if config.security.privileged {
        None
    } else {
        Some(default_capabilities(&config.security))
    };

    OciSpec {
        oci_version: OCI_RUNTIME_SPEC_VERSION.to_string(),
        process: OciProcess {
            terminal: config.tty,
            user: OciUser::default(),
            args,
            env,
            cwd: working_dir.to_string(),
            capabilities,
            no_new_privileges: config.security.no_new_privileges,
        },
        root: OciRoot {
            path: "rootfs".to_string(),
            readonly: false,
        },
        hostname: config.hostname.clone(),
        mounts,
        linux: OciLinux {
            namespaces: oci_namespaces(namespaces),
            resources: oci_resources(resources),
            uid_mappings: spec.uid_mappings.clone(),
            gid_mappings: spec.gid_mappings.clone(),
        },
        annotations: HashMap::new(),
    }
}

fn with_bind_option(options: &[String]) -> Vec<String> {
    let mut opts = options.to_vec();
    if !opts.iter().any(|o| o == "bind" || o == "rbind") {
        opts.push("rbind".to_string());
    }
    opts
}

fn oci_namespaces(config: &NamespaceConfig) -> Vec<OciNamespace> {
    let mut namespaces = Vec::new();
    let mut push = |ns_type: &str, mode: &NamespaceMode| match mode {
        // Host mode: omit the namespace entry entirely.
        NamespaceMode::Host | NamespaceMode::Default => {}
        NamespaceMode::FromContainer(id) => namespaces.push(OciNamespace {
            ns_type: ns_type.to_string(),
            // Joined at start time once the target's PID is known.
            path: Some(format!("container:{id}")),
        }),
        _ => namespaces.push(OciNamespace {
            ns_type: ns_type.to_string(),
            path: None,
        }),
    };
    push("pid", &config.pid);
    push("ipc", &config.ipc);
    push("uts", &config.uts);
    push("network", &config.net);
    push("mount", &NamespaceMode::Private);
    if config.user == NamespaceMode::Private {
        push("user", &config.user);
    }
    if config.cgroup == NamespaceMode::Private {
        push("cgroup", &config.cgroup);
    }
    namespaces
}

fn oci_resources(limits: &ResourceLimits) -> Option<OciResources> {
    let memory = (limits.memory.is_some() || limits.memory_swap.is_some()).then(|| OciMemory {
        limit: limits.memory.map(|m| m as i64),
        swap: limits.memory_swap.map(|m| m as i64),
    });
    let cpu = (limits.cpu_shares.is_some()
        || limits.cpu_period.is_some()
        || limits.cpu_quota.is_some())
    .then(|| OciCpu {
        shares: limits.cpu_shares,
        period: limits.cpu_period,
        quota: limits.cpu_quota,
    });
    let pids = limits.pids_limit.map(|limit| OciPids { limit });

    (memory.is_some() || cpu.is_some() || pids.is_some()).then(|| OciResources {
        memory,
        cpu,
        pids,
    })
}

/// Standard mount set every container gets.
fn default_mounts() -> Vec<OciMount> {
    vec![
        OciMount {
            destination: "/proc".to_string(),
            mount_type: "proc".to_string(),
            source: "proc".to_string(),
            options: vec![],
        },
        OciMount {
            destination: "/dev".to_string(),
            mount_type: "tmpfs".to_string(),
            source: "tmpfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "strictatime".to_string(),
                "mode=755".to_string(),
                "size=65536k".to_string(),
            ],
        },
        OciMount {
            destination: "/dev/pts".to_string(),
            mount_type: "devpts".to_string(),
            source: "devpts".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "newinstance".to_string(),
                "ptmxmode=0666".to_string(),
                "mode=0620".to_string(),
            ],
        },
        OciMount {
            destination: "/sys".to_string(),
            mount_type: "sysfs".to_string(),
            source: "sysfs".to_string(),
            options: vec![
                "nosuid".to_string(),
                "noexec".to_string(),
                "nodev".to_string(),
                "ro".to_string(),
            ],
        },
    ]
}

/// Default capability set, adjusted by the add/drop lists.
fn default_capabilities(security: &SecurityConfig) -> OciCapabilities {
    const DEFAULT_CAPS: &[&str] = &[
        "CAP_AUDIT_WRITE",
        "CAP_CHOWN",
        "CAP_DAC_OVERRIDE",
        "CAP_FOWNER",
        "CAP_FSETID",
        "CAP_KILL",
        "CAP_MKNOD",
        "CAP_NET_BIND_SERVICE",
        "CAP_NET_RAW",
        "CAP_SETFCAP",
        "CAP_SETGID",
        "CAP_SETPCAP",
        "CAP_SETUID",
        "CAP_SYS_CHROOT",
    ];

    let normalize = |c: &String| {
        let upper = c.to_uppercase();
        if upper.starts_with("CAP_") {
            upper
        } else {
            format!("CAP_{upper}")
        }
    };

    let mut caps: Vec<String> = DEFAULT_CAPS.iter().map(|c| c.to_string()).collect();
    for cap in &security.cap_add {
        let cap = normalize(cap);
        if !caps.contains(&cap) {
            caps.push(cap);
        }
    }
    let dropped: Vec<String> = security.cap_drop.iter().map(normalize).collect();
    caps.retain(|c| !dropped.contains(c));
    caps.sort();

    OciCapabilities {
        bounding: caps.clone(),
        effective: caps.clone(),
        permitted: caps,
    }
}
