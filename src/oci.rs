//! OCI runtime collaborator seam.
//!
//! The engine never calls kernel primitives itself: an external OCI runtime
//! binary (runc, crun, ...) creates and starts container processes from a
//! bundle directory, under a monitor process that owns the PTY, writes the
//! log, and persists the exit code. This module defines the narrow contract
//! the rest of the engine programs against and the [`CommandRuntime`]
//! implementation that shells out to that binary.
//!
//! [`FakeRuntime`] implements the same trait in memory so the state machine,
//! pod coordinator, and service layers are testable without root, a runtime
//! binary, or Linux namespaces.

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::RwLock;
use tokio::process::Command;
use tracing::{debug, warn};

// =============================================================================
// Signals
// =============================================================================

/// A Unix signal, validated to the kernel range [1, 64].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal(i32);

/// Signal names for parsing and display, indexed by number.
const SIGNAL_NAMES: &[(&str, i32)] = &[
    ("HUP", 1),
    ("INT", 2),
    ("QUIT", 3),
    ("ILL", 4),
    ("TRAP", 5),
    ("ABRT", 6),
    ("BUS", 7),
    ("FPE", 8),
    ("KILL", 9),
    ("USR1", 10),
    ("SEGV", 11),
    ("USR2", 12),
    ("PIPE", 13),
    ("ALRM", 14),
    ("TERM", 15),
    ("STKFLT", 16),
    ("CHLD", 17),
    ("CONT", 18),
    ("STOP", 19),
    ("TSTP", 20),
    ("TTIN", 21),
    ("TTOU", 22),
    ("URG", 23),
    ("XCPU", 24),
    ("XFSZ", 25),
    ("VTALRM", 26),
    ("PROF", 27),
    ("WINCH", 28),
    ("IO", 29),
    ("PWR", 30),
    ("SYS", 31),
];

impl Signal {
    /// SIGTERM.
    pub const TERM: Signal = Signal(15);
    /// SIGKILL.
    pub const KILL: Signal = Signal(9);

    /// Parses a signal from a name (with or without the SIG prefix) or a
    /// number in [1, 64].
    pub fn parse(s: &str) -> Result<Self> {
        if let Ok(n) = s.parse::<i32>() {
            if (1..=64).contains(&n) {
                return Ok(Signal(n));
            }
            return Err(Error::InvalidArg(format!(
                "signal number {n} out of range [1, 64]"
            )));
        }
        let upper = s.to_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        SIGNAL_NAMES
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, num)| Signal(*num))
            .ok_or_else(|| Error::InvalidArg(format!("invalid signal: {s}")))
    }

    /// Constructs from a raw number, validating the range.
    pub fn from_raw(n: i32) -> Result<Self> {
        if (1..=64).contains(&n) {
            Ok(Signal(n))
        } else {
            Err(Error::InvalidArg(format!(
                "signal number {n} out of range [1, 64]"
            )))
        }
    }

    /// Raw signal number.
    pub fn as_raw(&self) -> i32 {
        self.0
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match SIGNAL_NAMES.iter().find(|(_, n)| *n == self.0) {
            Some((name, _)) => write!(f, "SIG{name}"),
            None => write!(f, "{}", self.0),
        }
    }
}

// =============================================================================
// Runtime State
// =============================================================================

/// Runtime-level container status, as the OCI runtime reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OciStatus {
    Creating,
    Created,
    Running,
    Paused,
    Stopped,
}

/// State document returned by `state <id>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    pub oci_version: String,
    pub id: String,
    pub status: OciStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub bundle: String,
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// The narrow contract against the external OCI runtime.
///
/// One method per runtime CLI verb; implementations must be safe to call
/// concurrently for different container IDs. Serialization per container is
/// the store's job, not the runtime's.
#[async_trait]
pub trait OciRuntime: Send + Sync {
    /// Runtime name, for reports and diagnostics.
    fn name(&self) -> &str;

    /// Creates a container from a bundle (config.json + rootfs).
    async fn create(&self, id: &str, bundle: &Path) -> Result<()>;

    /// Starts a created container.
    async fn start(&self, id: &str) -> Result<()>;

    /// Queries runtime state.
    async fn state(&self, id: &str) -> Result<OciState>;

    /// Delivers a signal to the container init (or all processes).
    async fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()>;

    /// Freezes all processes in the container.
    async fn pause(&self, id: &str) -> Result<()>;

    /// Thaws a paused container.
    async fn resume(&self, id: &str) -> Result<()>;

    /// Removes the runtime's record of the container.
    async fn delete(&self, id: &str, force: bool) -> Result<()>;

    /// Blocks until the container exits; returns the exit code.
    async fn wait(&self, id: &str) -> Result<i32>;

    /// Starts an exec process inside a running container from a process
    /// spec JSON file. Returns the exec PID.
    async fn exec(&self, id: &str, process_spec: &Path, detach: bool) -> Result<u32>;

    /// Runs an exec process to completion, capturing its output.
    /// Returns (exit code, stdout, stderr).
    async fn exec_attached(
        &self,
        id: &str,
        process_spec: &Path,
    ) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let _ = (id, process_spec);
        Err(Error::NotImplemented(format!(
            "attached exec is not supported by the {} runtime",
            self.name()
        )))
    }

    /// Checkpoints a running container into `image_dir`.
    async fn checkpoint(&self, id: &str, image_dir: &Path, leave_running: bool) -> Result<()> {
        let _ = (id, image_dir, leave_running);
        Err(Error::NotImplemented(format!(
            "checkpoint is not supported by the {} runtime",
            self.name()
        )))
    }

    /// Restores a container from a checkpoint image.
    async fn restore(&self, id: &str, bundle: &Path, image_dir: &Path) -> Result<()> {
        let _ = (id, bundle, image_dir);
        Err(Error::NotImplemented(format!(
            "restore is not supported by the {} runtime",
            self.name()
        )))
    }
}

// =============================================================================
// Command Runtime
// =============================================================================

/// Drives a real OCI runtime binary over its CLI.
///
/// The monitor process invoked at create time owns the container's stdio,
/// appends to the JSON-lines log, records its own PID in `conmon.pid`, and
/// writes the exit code to `<exits_dir>/<id>` when the init process dies.
pub struct CommandRuntime {
    binary: PathBuf,
    /// Runtime state root, passed as `--root`.
    root: PathBuf,
    /// Directory the monitor writes exit-code files into.
    exits_dir: PathBuf,
}

impl CommandRuntime {
    /// Creates a command runtime for the given binary.
    pub fn new(binary: impl Into<PathBuf>, root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let exits_dir = root.join("exits");
        std::fs::create_dir_all(&exits_dir).map_err(|e| Error::Storage {
            path: exits_dir.clone(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            binary: binary.into(),
            root,
            exits_dir,
        })
    }

    async fn run(&self, id: &str, args: &[&str]) -> Result<Vec<u8>> {
        let output = Command::new(&self.binary)
            .arg("--root")
            .arg(&self.root)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::OciRuntime {
                id: id.to_string(),
                reason: format!("failed to spawn {}: {e}", self.binary.display()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::OciRuntime {
                id: id.to_string(),
                reason: format!(
                    "{} {} exited with {}: {}",
                    self.binary.display(),
                    args.first().copied().unwrap_or(""),
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(output.stdout)
    }

    fn exit_file(&self, id: &str) -> PathBuf {
        self.exits_dir.join(id)
    }

    fn read_exit_code(&self, id: &str) -> Option<i32> {
        std::fs::read_to_string(self.exit_file(id))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }
}

#[async_trait]
impl OciRuntime for CommandRuntime {
    fn name(&self) -> &str {
        "oci-command"
    }

    async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        if !bundle.join("config.json").exists() {
            return Err(Error::OciRuntime {
                id: id.to_string(),
                reason: format!("bundle {} has no config.json", bundle.display()),
            });
        }
        let bundle_str = bundle.to_string_lossy();
        debug!(container = id, bundle = %bundle_str, "oci create");
        self.run(id, &["create", "--bundle", &bundle_str, id]).await?;
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        debug!(container = id, "oci start");
        self.run(id, &["start", id]).await?;
        Ok(())
    }

    async fn state(&self, id: &str) -> Result<OciState> {
        let stdout = self.run(id, &["state", id]).await?;
        serde_json::from_slice(&stdout).map_err(|e| Error::OciRuntime {
            id: id.to_string(),
            reason: format!("unparseable state output: {e}"),
        })
    }

    async fn kill(&self, id: &str, signal: Signal, all: bool) -> Result<()> {
        debug!(container = id, signal = %signal, all, "oci kill");
        let sig = signal.as_raw().to_string();
        if all {
            self.run(id, &["kill", "--all", id, &sig]).await?;
        } else {
            self.run(id, &["kill", id, &sig]).await?;
        }
        Ok(())
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.run(id, &["pause", id]).await?;
        Ok(())
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.run(id, &["resume", id]).await?;
        Ok(())
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        if force {
            self.run(id, &["delete", "--force", id]).await?;
        } else {
            self.run(id, &["delete", id]).await?;
        }
        let _ = std::fs::remove_file(self.exit_file(id));
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i32> {
        // The monitor writes the exit file when init dies; poll state until
        // the runtime agrees the container stopped, then read it.
        loop {
            let state = self.state(id).await?;
            if state.status == OciStatus::Stopped {
                match self.read_exit_code(id) {
                    Some(code) => return Ok(code),
                    None => {
                        warn!(container = id, "stopped but no exit file yet");
                    }
                }
            }
            tokio::time::sleep(crate::constants::STOP_POLL_INTERVAL).await;
        }
    }

    async fn exec(&self, id: &str, process_spec: &Path, detach: bool) -> Result<u32> {
        let spec = process_spec.to_string_lossy();
        let pidfile = self.root.join(format!("{id}-exec.pid"));
        let pidfile_str = pidfile.to_string_lossy();
        let mut args: Vec<&str> =
            vec!["exec", "--process", &spec, "--pid-file", &pidfile_str];
        if detach {
            args.insert(1, "--detach");
        }
        args.push(id);
        self.run(id, &args).await?;
        let pid = std::fs::read_to_string(&pidfile)
            .ok()
            .and_then(|s| s.trim().parse().ok())
            .ok_or_else(|| Error::OciRuntime {
                id: id.to_string(),
                reason: "exec pid file missing or unparseable".to_string(),
            })?;
        let _ = std::fs::remove_file(&pidfile);
        Ok(pid)
    }

    async fn exec_attached(
        &self,
        id: &str,
        process_spec: &Path,
    ) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let spec = process_spec.to_string_lossy();
        let output = Command::new(&self.binary)
            .arg("--root")
            .arg(&self.root)
            .args(["exec", "--process", spec.as_ref(), id])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::OciRuntime {
                id: id.to_string(),
                reason: format!("failed to spawn {}: {e}", self.binary.display()),
            })?;
        Ok((
            output.status.code().unwrap_or(-1),
            output.stdout,
            output.stderr,
        ))
    }

    async fn checkpoint(&self, id: &str, image_dir: &Path, leave_running: bool) -> Result<()> {
        let dir = image_dir.to_string_lossy();
        let mut args: Vec<&str> = vec!["checkpoint", "--image-path", &dir];
        if leave_running {
            args.push("--leave-running");
        }
        args.push(id);
        self.run(id, &args).await?;
        Ok(())
    }

    async fn restore(&self, id: &str, bundle: &Path, image_dir: &Path) -> Result<()> {
        let bundle_str = bundle.to_string_lossy();
        let dir = image_dir.to_string_lossy();
        self.run(
            id,
            &[
                "restore",
                "--bundle",
                &bundle_str,
                "--image-path",
                &dir,
                id,
            ],
        )
        .await?;
        Ok(())
    }
}

// =============================================================================
// Fake Runtime (test seam)
// =============================================================================

/// In-memory runtime record for [`FakeRuntime`].
#[derive(Debug, Clone)]
struct FakeContainer {
    status: OciStatus,
    pid: u32,
    bundle: PathBuf,
    exit_code: i32,
}

/// In-memory implementation of [`OciRuntime`] for tests.
///
/// Containers "run" until killed; TERM and KILL both stop them, recording
/// `128 + signal` as the exit code unless an explicit code was staged with
/// [`FakeRuntime::stage_exit`].
pub struct FakeRuntime {
    containers: RwLock<HashMap<String, FakeContainer>>,
    next_pid: std::sync::atomic::AtomicU32,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            containers: RwLock::new(HashMap::new()),
            next_pid: std::sync::atomic::AtomicU32::new(1000),
        }
    }

    /// Stages the exit code the next signal-induced stop will record.
    pub fn stage_exit(&self, id: &str, code: i32) {
        if let Some(c) = self.containers.write().unwrap().get_mut(id) {
            c.exit_code = code;
        }
    }

    /// Marks a running container as exited, as if its process died.
    pub fn finish(&self, id: &str, code: i32) {
        if let Some(c) = self.containers.write().unwrap().get_mut(id) {
            c.status = OciStatus::Stopped;
            c.exit_code = code;
        }
    }

    fn with<T>(&self, id: &str, f: impl FnOnce(&mut FakeContainer) -> Result<T>) -> Result<T> {
        let mut map = self.containers.write().unwrap();
        let c = map
            .get_mut(id)
            .ok_or_else(|| Error::NoSuchContainer(id.to_string()))?;
        f(c)
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OciRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn create(&self, id: &str, bundle: &Path) -> Result<()> {
        let mut map = self.containers.write().unwrap();
        if map.contains_key(id) {
            return Err(Error::AlreadyExists {
                kind: "container",
                name: id.to_string(),
            });
        }
        let pid = self
            .next_pid
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        map.insert(
            id.to_string(),
            FakeContainer {
                status: OciStatus::Created,
                pid,
                bundle: bundle.to_path_buf(),
                exit_code: 0,
            },
        );
        Ok(())
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.with(id, |c| {
            if c.status != OciStatus::Created {
                return Err(Error::OciRuntime {
                    id: id.to_string(),
                    reason: format!("cannot start container in state {:?}", c.status),
                });
            }
            c.status = OciStatus::Running;
            Ok(())
        })
    }

    async fn state(&self, id: &str) -> Result<OciState> {
        let map = self.containers.read().unwrap();
        let c = map
            .get(id)
            .ok_or_else(|| Error::NoSuchContainer(id.to_string()))?;
        Ok(OciState {
            oci_version: crate::constants::OCI_RUNTIME_SPEC_VERSION.to_string(),
            id: id.to_string(),
            status: c.status,
            pid: (c.status == OciStatus::Running || c.status == OciStatus::Paused)
                .then_some(c.pid),
            bundle: c.bundle.to_string_lossy().to_string(),
        })
    }

    async fn kill(&self, id: &str, signal: Signal, _all: bool) -> Result<()> {
        self.with(id, |c| {
            if c.status != OciStatus::Running && c.status != OciStatus::Paused {
                return Err(Error::OciRuntime {
                    id: id.to_string(),
                    reason: "container is not running".to_string(),
                });
            }
            if signal == Signal::TERM || signal == Signal::KILL {
                c.status = OciStatus::Stopped;
                if c.exit_code == 0 {
                    c.exit_code = 128 + signal.as_raw();
                }
            }
            Ok(())
        })
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.with(id, |c| {
            if c.status != OciStatus::Running {
                return Err(Error::OciRuntime {
                    id: id.to_string(),
                    reason: "container is not running".to_string(),
                });
            }
            c.status = OciStatus::Paused;
            Ok(())
        })
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.with(id, |c| {
            if c.status != OciStatus::Paused {
                return Err(Error::OciRuntime {
                    id: id.to_string(),
                    reason: "container is not paused".to_string(),
                });
            }
            c.status = OciStatus::Running;
            Ok(())
        })
    }

    async fn delete(&self, id: &str, force: bool) -> Result<()> {
        let mut map = self.containers.write().unwrap();
        match map.get(id) {
            None => Err(Error::NoSuchContainer(id.to_string())),
            Some(c) if c.status == OciStatus::Running && !force => Err(Error::OciRuntime {
                id: id.to_string(),
                reason: "cannot delete a running container".to_string(),
            }),
            Some(_) => {
                map.remove(id);
                Ok(())
            }
        }
    }

    async fn wait(&self, id: &str) -> Result<i32> {
        loop {
            {
                let map = self.containers.read().unwrap();
                let c = map
                    .get(id)
                    .ok_or_else(|| Error::NoSuchContainer(id.to_string()))?;
                if c.status == OciStatus::Stopped {
                    return Ok(c.exit_code);
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    async fn exec(&self, id: &str, _process_spec: &Path, _detach: bool) -> Result<u32> {
        self.with(id, |c| {
            if c.status != OciStatus::Running {
                return Err(Error::OciRuntime {
                    id: id.to_string(),
                    reason: "container is not running".to_string(),
                });
            }
            Ok(c.pid + 1)
        })
    }

    async fn exec_attached(
        &self,
        id: &str,
        _process_spec: &Path,
    ) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        self.with(id, |c| {
            if c.status != OciStatus::Running {
                return Err(Error::OciRuntime {
                    id: id.to_string(),
                    reason: "container is not running".to_string(),
                });
            }
            Ok((0, Vec::new(), Vec::new()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_parses_names_and_numbers() {
        assert_eq!(Signal::parse("SIGTERM").unwrap(), Signal::TERM);
        assert_eq!(Signal::parse("term").unwrap(), Signal::TERM);
        assert_eq!(Signal::parse("9").unwrap(), Signal::KILL);
        assert_eq!(Signal::parse("64").unwrap().as_raw(), 64);
        assert!(Signal::parse("0").is_err());
        assert!(Signal::parse("65").is_err());
        assert!(Signal::parse("NOTASIG").is_err());
    }

    #[test]
    fn signal_displays_name_when_known() {
        assert_eq!(Signal::TERM.to_string(), "SIGTERM");
        assert_eq!(Signal::from_raw(40).unwrap().to_string(), "40");
    }

    #[tokio::test]
    async fn fake_runtime_lifecycle() {
        let rt = FakeRuntime::new();
        rt.create("c1", Path::new("/tmp/bundle")).await.unwrap();
        assert_eq!(rt.state("c1").await.unwrap().status, OciStatus::Created);

        rt.start("c1").await.unwrap();
        let state = rt.state("c1").await.unwrap();
        assert_eq!(state.status, OciStatus::Running);
        assert!(state.pid.is_some());

        rt.pause("c1").await.unwrap();
        assert_eq!(rt.state("c1").await.unwrap().status, OciStatus::Paused);
        rt.resume("c1").await.unwrap();

        rt.kill("c1", Signal::TERM, false).await.unwrap();
        assert_eq!(rt.state("c1").await.unwrap().status, OciStatus::Stopped);
        assert_eq!(rt.wait("c1").await.unwrap(), 128 + 15);

        rt.delete("c1", false).await.unwrap();
        assert!(rt.state("c1").await.is_err());
    }

    #[tokio::test]
    async fn fake_runtime_rejects_delete_while_running() {
        let rt = FakeRuntime::new();
        rt.create("c1", Path::new("/tmp/bundle")).await.unwrap();
        rt.start("c1").await.unwrap();
        assert!(rt.delete("c1", false).await.is_err());
        rt.delete("c1", true).await.unwrap();
    }
}
