//! Constants for the engine.
//!
//! All limits, timeouts, defaults, and protocol identifiers are defined here
//! to keep magic numbers out of the rest of the codebase.

use std::time::Duration;

// =============================================================================
// API Versioning
// =============================================================================

/// Native API version advertised in the `Libpod-API-Version` header and used
/// for client/server handshake comparison.
pub const API_VERSION: &str = "2.0.0";

/// Docker-compatible API version the compat route tree emulates.
pub const COMPAT_API_VERSION: &str = "1.40";

/// Minimum Docker-compatible API version accepted on versioned routes.
pub const COMPAT_API_MIN_VERSION: &str = "1.24";

// =============================================================================
// Identifiers
// =============================================================================

/// Length of a full container/pod/volume/exec-session ID in hex characters.
pub const FULL_ID_LEN: usize = 64;

/// Valid characters for container and pod names (DNS-label shaped, plus the
/// separators Docker historically allowed).
pub const NAME_VALID_CHARS: &str =
    "abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789-_.";

/// Maximum container/pod name length.
pub const MAX_NAME_LEN: usize = 255;

/// Maximum OCI image reference length (bytes).
pub const MAX_IMAGE_REF_LEN: usize = 512;

// =============================================================================
// Size Limits
// =============================================================================

/// Maximum size of a single OCI layer (512 MiB).
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum total extracted rootfs size (4 GiB).
pub const MAX_ROOTFS_SIZE: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

/// Maximum attach frame payload length the demuxer will accept (1 MiB).
pub const MAX_FRAME_PAYLOAD: u32 = 1024 * 1024;

// =============================================================================
// Timeouts & Intervals
// =============================================================================

/// Timeout for image pull operations.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Default graceful stop timeout in seconds (SIGTERM grace before SIGKILL).
pub const DEFAULT_STOP_TIMEOUT: u64 = 10;

/// Poll interval while waiting for a container process to disappear.
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Idle exec sessions are reaped this long after they stop.
/// Fixed to mirror historic Docker behavior; deliberately not configurable.
pub const EXEC_SESSION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Tunnel-mode transport retry attempts.
pub const TUNNEL_RETRY_ATTEMPTS: u32 = 3;

/// Tunnel-mode linear backoff step between retries.
pub const TUNNEL_RETRY_BACKOFF: Duration = Duration::from_millis(100);

// =============================================================================
// Concurrency
// =============================================================================

/// Lower bound for the parallel worker pool: `max(3*cpus + 1, configured)`.
pub fn default_parallel_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1);
    3 * cpus + 1
}

// =============================================================================
// Storage Layout
// =============================================================================

/// Subdirectory of the graph root holding per-container persistent state.
pub const GRAPH_CONTAINERS_DIR: &str = "containers";

/// Per-container subdirectory for runtime files (config.json, conmon.pid,
/// pidfile, hosts, hostname, resolv.conf).
pub const CONTAINER_USERDATA_DIR: &str = "userdata";

/// Subdirectory of the graph root for content-addressed blobs.
pub const BLOB_STORE_DIR: &str = "blobs";

/// Subdirectory of the graph root for image records and the tag index.
pub const IMAGE_STORE_DIR: &str = "images";

/// Subdirectory of the run root for ephemeral container state.
pub const RUN_CONTAINERS_DIR: &str = "containers";

/// Subdirectory of the run root for volume mount points.
pub const VOLUMES_DIR: &str = "volumes";

/// Directory inside a volume that is bind-mounted into containers.
pub const VOLUME_DATA_DIR: &str = "_data";

/// File that records the container monitor's PID.
pub const CONMON_PID_FILE: &str = "conmon.pid";

/// File that records the container init process PID.
pub const CONTAINER_PID_FILE: &str = "pidfile";

// =============================================================================
// OCI
// =============================================================================

/// OCI Runtime Spec version written into generated specs.
pub const OCI_RUNTIME_SPEC_VERSION: &str = "1.0.2";

/// Default OCI runtime binary, overridable via engine config.
pub const DEFAULT_OCI_RUNTIME: &str = "crun";

/// Default registry prefix for short image references.
pub const DEFAULT_REGISTRY: &str = "docker.io";

/// Default repository namespace for bare image names.
pub const DEFAULT_REPO_NAMESPACE: &str = "library";

/// Default image tag when the reference carries none.
pub const DEFAULT_TAG: &str = "latest";

// =============================================================================
// Attach Protocol
// =============================================================================

/// Default detach-key byte sequence: ctrl-p, ctrl-q.
pub const DEFAULT_DETACH_KEYS: &[u8] = &[16, 17];

/// Attach frame header length.
pub const FRAME_HEADER_LEN: usize = 8;

// =============================================================================
// Resource Validation Bounds
// =============================================================================

/// Minimum accepted CPU period (microseconds).
pub const CPU_PERIOD_MIN: u64 = 1000;

/// Maximum accepted CPU period (microseconds).
pub const CPU_PERIOD_MAX: u64 = 1_000_000;
