//! Container store and state machine.
//!
//! Owns every container record: identity, immutable config, mutable runtime
//! state, and the legal transitions between states. All mutating operations
//! serialize on a per-container async lock; reads clone snapshots under a
//! shared lock. State changes publish events in commit order.
//!
//! The store drives the OCI runtime through the [`OciRuntime`] seam and
//! never touches kernel primitives itself.

use crate::config::EngineConfig;
use crate::container::config::ContainerConfig;
use crate::container::state::{ContainerStatus, RuntimeState, WaitCondition};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::oci::{OciRuntime, OciStatus, Signal};
use crate::reports::{
    ContainerInspect, ContainerStats, ContainerSummary, FileChange, LogEntry, PruneReport,
    TopReport, WaitReport,
};
use crate::specgen::{GeneratedSpec, OciSpec};
use crate::storage::Storage;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Options for `rm`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RemoveOptions {
    /// Remove even while Running/Paused (stops first).
    pub force: bool,
    /// Also remove named volumes not used elsewhere; the engine facade acts
    /// on the returned config.
    pub volumes: bool,
    /// Suppress "no such container".
    pub ignore: bool,
}

/// Options for `logs`.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub follow: bool,
    pub since: Option<chrono::DateTime<Utc>>,
    pub until: Option<chrono::DateTime<Utc>>,
    pub tail: Option<usize>,
    pub timestamps: bool,
}

/// One container record.
struct ContainerHandle {
    config: ContainerConfig,
    oci: OciSpec,
    /// Layer digests used to assemble the rootfs at init time.
    layers: Vec<String>,
    state: RwLock<RuntimeState>,
    /// Per-container exclusive lock: every mutating call holds it for the
    /// duration of the transition.
    op_lock: Mutex<()>,
    status_tx: tokio::sync::watch::Sender<ContainerStatus>,
}

impl ContainerHandle {
    fn snapshot(&self) -> RuntimeState {
        self.state.read().unwrap().clone()
    }

    fn set_status(&self, f: impl FnOnce(&mut RuntimeState)) -> ContainerStatus {
        let mut state = self.state.write().unwrap();
        f(&mut state);
        let status = state.status;
        drop(state);
        let _ = self.status_tx.send(status);
        status
    }
}

/// The container store.
pub struct ContainerStore {
    engine: EngineConfig,
    storage: Storage,
    runtime: Arc<dyn OciRuntime>,
    events: EventBus,
    containers: RwLock<HashMap<String, Arc<ContainerHandle>>>,
    /// name (and alias) → id.
    names: RwLock<HashMap<String, String>>,
}

impl ContainerStore {
    pub fn new(
        engine: EngineConfig,
        storage: Storage,
        runtime: Arc<dyn OciRuntime>,
        events: EventBus,
    ) -> Self {
        Self {
            engine,
            storage,
            runtime,
            events,
            containers: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Resolves a name, alias, full ID, or unique ID prefix.
    pub fn resolve(&self, name_or_id: &str) -> Result<String> {
        if let Some(id) = self.names.read().unwrap().get(name_or_id) {
            return Ok(id.clone());
        }
        let containers = self.containers.read().unwrap();
        if containers.contains_key(name_or_id) {
            return Ok(name_or_id.to_string());
        }
        let mut matches = containers
            .keys()
            .filter(|id| id.starts_with(name_or_id))
            .take(2);
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(Error::InvalidArg(format!(
                "container ID prefix {name_or_id:?} is ambiguous"
            ))),
            _ => Err(Error::NoSuchContainer(name_or_id.to_string())),
        }
    }

    fn handle(&self, name_or_id: &str) -> Result<Arc<ContainerHandle>> {
        let id = self.resolve(name_or_id)?;
        self.containers
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NoSuchContainer(name_or_id.to_string()))
    }

    pub fn exists(&self, name_or_id: &str) -> bool {
        self.resolve(name_or_id).is_ok()
    }

    // =========================================================================
    // Create / Init
    // =========================================================================

    /// Registers a container from a generated spec. The container starts in
    /// `Configured`; `init` or `start` materialises it.
    pub async fn create(&self, generated: GeneratedSpec, layers: Vec<String>) -> Result<String> {
        let config = generated.config;
        let id = config.id.clone();
        let name = config.name.clone();

        {
            let mut names = self.names.write().unwrap();
            let mut containers = self.containers.write().unwrap();
            if names.contains_key(&name) {
                return Err(Error::AlreadyExists {
                    kind: "container",
                    name,
                });
            }
            let (status_tx, _) = tokio::sync::watch::channel(ContainerStatus::Configured);
            names.insert(name.clone(), id.clone());
            for alias in &config.aliases {
                names.insert(alias.clone(), id.clone());
            }
            containers.insert(
                id.clone(),
                Arc::new(ContainerHandle {
                    config,
                    oci: generated.oci,
                    layers,
                    state: RwLock::new(RuntimeState::new()),
                    op_lock: Mutex::new(()),
                    status_tx,
                }),
            );
        }

        self.storage.create_container_dirs(&id)?;
        self.events
            .publish(EventKind::Container, "create", &id, Some(&name));
        info!(container = %id, name = %name, "created");
        Ok(id)
    }

    /// Materialises rootfs + runtime record without starting. Legal only
    /// from `Configured`.
    pub async fn init(&self, name_or_id: &str) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        let status = handle.snapshot().status;
        if !status.can_init() {
            return Err(Error::CtrStateInvalid {
                id: handle.config.id.clone(),
                state: status.to_string(),
                reason: "init requires a configured container".to_string(),
            });
        }
        self.init_locked(&handle).await?;
        self.events.publish(
            EventKind::Container,
            "init",
            &handle.config.id,
            Some(&handle.config.name),
        );
        Ok(())
    }

    async fn init_locked(&self, handle: &ContainerHandle) -> Result<()> {
        let id = &handle.config.id;
        let rootfs = self.storage.container_rootfs(id);

        match &handle.config.rootfs {
            // Externally provided rootfs: the bundle points straight at it.
            Some(_) => {}
            None => self.storage.assemble_rootfs(&handle.layers, &rootfs)?,
        }

        // Bundle directory is the container dir: config.json next to rootfs/.
        let bundle = self.storage.container_dir(id);
        let mut oci = handle.oci.clone();
        if let Some(external) = &handle.config.rootfs {
            oci.root.path = external.to_string_lossy().to_string();
        }
        self.resolve_namespace_paths(&mut oci).await;
        let config_json = serde_json::to_vec_pretty(&oci)?;
        std::fs::write(bundle.join("config.json"), config_json)?;

        // Record a content manifest for `diff`.
        let manifest = build_manifest(&self.effective_rootfs(handle))?;
        let manifest_path = self.storage.container_userdata(id).join("manifest.json");
        std::fs::write(&manifest_path, serde_json::to_vec(&manifest)?)?;

        self.runtime.create(id, &bundle).await?;
        handle.set_status(|s| s.status = ContainerStatus::Created);
        debug!(container = %id, "initialised");
        Ok(())
    }

    /// Rewrites `container:<id>` namespace placeholders to the target's
    /// `/proc/<pid>/ns/<type>` path once the target is running. Targets
    /// without a live process keep the placeholder; the runtime will
    /// reject it, which is the right failure for a dead infra container.
    async fn resolve_namespace_paths(&self, oci: &mut OciSpec) {
        for namespace in &mut oci.linux.namespaces {
            let Some(path) = namespace.path.clone() else { continue };
            let Some(target) = path.strip_prefix("container:") else {
                continue;
            };
            let proc_name = if namespace.ns_type == "network" {
                "net"
            } else {
                namespace.ns_type.as_str()
            };
            if let Ok(state) = self.runtime.state(target).await {
                if let Some(pid) = state.pid {
                    namespace.path = Some(format!("/proc/{pid}/ns/{proc_name}"));
                }
            }
        }
    }

    fn effective_rootfs(&self, handle: &ContainerHandle) -> PathBuf {
        handle
            .config
            .rootfs
            .clone()
            .unwrap_or_else(|| self.storage.container_rootfs(&handle.config.id))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts a container, initialising it first if needed.
    pub async fn start(&self, name_or_id: &str) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        self.sync(&handle).await?;

        let status = handle.snapshot().status;
        match status {
            ContainerStatus::Running => {
                return Err(Error::CtrRunning(handle.config.id.clone()));
            }
            ContainerStatus::Paused => {
                return Err(Error::CtrStateInvalid {
                    id: handle.config.id.clone(),
                    state: status.to_string(),
                    reason: "unpause the container instead".to_string(),
                });
            }
            ContainerStatus::Configured => self.init_locked(&handle).await?,
            ContainerStatus::Exited | ContainerStatus::Stopped => {
                // Re-create the runtime record for a fresh run.
                let _ = self.runtime.delete(&handle.config.id, false).await;
                self.init_locked(&handle).await?;
            }
            ContainerStatus::Created => {}
            ContainerStatus::Removing => {
                return Err(Error::CtrStateInvalid {
                    id: handle.config.id.clone(),
                    state: status.to_string(),
                    reason: "container is being removed".to_string(),
                });
            }
        }

        let id = handle.config.id.clone();
        self.runtime.start(&id).await?;
        let runtime_state = self.runtime.state(&id).await?;
        let conmon_pid = read_pid_file(&handle.config.conmon_pid_file);
        handle.set_status(|s| {
            s.status = ContainerStatus::Running;
            s.pid = runtime_state.pid;
            s.conmon_pid = conmon_pid;
            s.started_at = Some(Utc::now());
            s.finished_at = None;
            s.exit_code = None;
        });
        self.events
            .publish(EventKind::Container, "start", &id, Some(&handle.config.name));
        info!(container = %id, "started");
        Ok(())
    }

    /// Stops a container: stop signal, grace period, then SIGKILL.
    ///
    /// Already-stopped containers yield the benign [`Error::CtrStopped`];
    /// paused containers are unpaused first. `timeout` overrides the
    /// config's stop timeout; zero kills immediately.
    pub async fn stop(&self, name_or_id: &str, timeout: Option<u64>) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        self.sync(&handle).await?;

        let id = handle.config.id.clone();
        let status = handle.snapshot().status;
        if !status.can_stop() {
            return match status {
                ContainerStatus::Stopped | ContainerStatus::Exited => {
                    Err(Error::CtrStopped(id))
                }
                _ => Err(Error::CtrStateInvalid {
                    id,
                    state: status.to_string(),
                    reason: "can only stop running or paused containers".to_string(),
                }),
            };
        }

        if status == ContainerStatus::Paused {
            self.runtime.resume(&id).await?;
        }

        let timeout = timeout.unwrap_or(handle.config.stop_timeout);
        if timeout > 0 {
            self.runtime
                .kill(&id, handle.config.stop_signal, false)
                .await?;
            let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(timeout);
            loop {
                let state = self.runtime.state(&id).await?;
                if state.status == OciStatus::Stopped {
                    break;
                }
                if tokio::time::Instant::now() >= deadline {
                    warn!(container = %id, timeout, "graceful stop timed out; killing");
                    self.runtime.kill(&id, Signal::KILL, false).await?;
                    break;
                }
                tokio::time::sleep(crate::constants::STOP_POLL_INTERVAL).await;
            }
        } else {
            self.runtime.kill(&id, Signal::KILL, false).await?;
        }

        let exit_code = self.runtime.wait(&id).await?;
        handle.set_status(|s| {
            s.status = ContainerStatus::Exited;
            s.exit_code = Some(exit_code);
            s.finished_at = Some(Utc::now());
            s.pid = None;
            s.conmon_pid = None;
        });
        self.events
            .publish(EventKind::Container, "died", &id, Some(&handle.config.name));
        info!(container = %id, exit_code, "stopped");
        Ok(())
    }

    /// Delivers a signal. Legal only with a live process.
    pub async fn kill(&self, name_or_id: &str, signal: Signal) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        self.sync(&handle).await?;

        let id = handle.config.id.clone();
        let status = handle.snapshot().status;
        if !status.can_kill() {
            return Err(Error::CtrStateInvalid {
                id,
                state: status.to_string(),
                reason: format!("cannot send {signal} to a container that is not running"),
            });
        }

        self.runtime.kill(&id, signal, false).await?;
        self.events
            .publish(EventKind::Container, "kill", &id, Some(&handle.config.name));
        // A fatal signal may have stopped it; fold that in now.
        self.sync(&handle).await?;
        Ok(())
    }

    /// Freezes a running container. Rejected rootless: the cgroup freezer
    /// is not delegated to unprivileged users on cgroup v1 hosts.
    pub async fn pause(&self, name_or_id: &str) -> Result<()> {
        if self.engine.rootless {
            return Err(Error::InvalidArg(
                "pause is not supported for rootless containers".to_string(),
            ));
        }
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        let id = handle.config.id.clone();
        let status = handle.snapshot().status;
        if !status.can_pause() {
            return Err(Error::CtrStateInvalid {
                id,
                state: status.to_string(),
                reason: "can only pause running containers".to_string(),
            });
        }
        self.runtime.pause(&id).await?;
        handle.set_status(|s| s.status = ContainerStatus::Paused);
        self.events
            .publish(EventKind::Container, "pause", &id, Some(&handle.config.name));
        Ok(())
    }

    /// Thaws a paused container back to Running.
    pub async fn unpause(&self, name_or_id: &str) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        let id = handle.config.id.clone();
        let status = handle.snapshot().status;
        if !status.can_unpause() {
            return Err(Error::CtrStateInvalid {
                id,
                state: status.to_string(),
                reason: "can only unpause paused containers".to_string(),
            });
        }
        self.runtime.resume(&id).await?;
        handle.set_status(|s| s.status = ContainerStatus::Running);
        self.events.publish(
            EventKind::Container,
            "unpause",
            &id,
            Some(&handle.config.name),
        );
        Ok(())
    }

    /// stop(t) then start when Running; plain start otherwise.
    pub async fn restart(&self, name_or_id: &str, timeout: Option<u64>) -> Result<()> {
        let id = self.resolve(name_or_id)?;
        if self.status(&id).await?.can_stop() {
            match self.stop(&id, timeout).await {
                Ok(()) => {}
                Err(e) if e.is_benign() => {}
                Err(e) => return Err(e),
            }
        }
        self.start(&id).await?;
        let handle = self.handle(&id)?;
        handle.state.write().unwrap().restart_count += 1;
        self.events.publish(
            EventKind::Container,
            "restart",
            &id,
            Some(&handle.config.name),
        );
        Ok(())
    }

    /// Removes a container. Refuses on live containers unless forced;
    /// returns the removed config so the caller can release volumes.
    pub async fn remove(
        &self,
        name_or_id: &str,
        opts: RemoveOptions,
    ) -> Result<Option<ContainerConfig>> {
        let handle = match self.handle(name_or_id) {
            Ok(h) => h,
            Err(Error::NoSuchContainer(_)) if opts.ignore => return Ok(None),
            Err(e) => return Err(e),
        };
        let _guard = handle.op_lock.lock().await;
        self.sync(&handle).await?;

        let id = handle.config.id.clone();
        let status = handle.snapshot().status;
        if !status.can_remove() {
            if !opts.force {
                return Err(Error::CtrStateInvalid {
                    id,
                    state: status.to_string(),
                    reason: "cannot remove a running container without force".to_string(),
                });
            }
            self.stop_for_remove(&handle).await?;
        }

        handle.set_status(|s| s.status = ContainerStatus::Removing);
        if let Err(e) = self.runtime.delete(&id, opts.force).await {
            // The runtime may never have seen this container (Configured).
            debug!(container = %id, "runtime delete: {e}");
        }
        self.storage.remove_container_dirs(&id)?;

        {
            let mut names = self.names.write().unwrap();
            names.remove(&handle.config.name);
            for alias in &handle.config.aliases {
                names.remove(alias);
            }
            self.containers.write().unwrap().remove(&id);
        }
        self.events.publish(
            EventKind::Container,
            "remove",
            &id,
            Some(&handle.config.name),
        );
        info!(container = %id, "removed");
        Ok(Some(handle.config.clone()))
    }

    async fn stop_for_remove(&self, handle: &ContainerHandle) -> Result<()> {
        let id = &handle.config.id;
        if handle.snapshot().status == ContainerStatus::Paused {
            self.runtime.resume(id).await?;
        }
        self.runtime.kill(id, Signal::KILL, false).await?;
        let exit_code = self.runtime.wait(id).await?;
        handle.set_status(|s| {
            s.status = ContainerStatus::Exited;
            s.exit_code = Some(exit_code);
            s.finished_at = Some(Utc::now());
            s.pid = None;
        });
        Ok(())
    }

    /// Removes all containers in a terminal state.
    pub async fn prune(&self) -> Result<PruneReport> {
        let candidates: Vec<String> = {
            let containers = self.containers.read().unwrap();
            containers
                .iter()
                .filter(|(_, h)| h.snapshot().status.is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };
        let mut report = PruneReport::default();
        for id in candidates {
            match self.remove(&id, RemoveOptions::default()).await {
                Ok(Some(_)) => report.removed.push(id),
                Ok(None) => {}
                // Raced with a concurrent start or remove; skip it.
                Err(e) => debug!(container = %id, "prune skipped: {e}"),
            }
        }
        Ok(report)
    }

    // =========================================================================
    // Wait & Sync
    // =========================================================================

    /// Blocks until the container reaches any of `conditions` (default:
    /// Exited). Returns the exit code and the condition that matched.
    pub async fn wait(
        &self,
        name_or_id: &str,
        conditions: &[WaitCondition],
    ) -> Result<WaitReport> {
        let handle = self.handle(name_or_id)?;
        let conditions = if conditions.is_empty() {
            vec![WaitCondition::Exited]
        } else {
            conditions.to_vec()
        };
        let mut rx = handle.status_tx.subscribe();
        loop {
            self.sync(&handle).await?;
            let state = handle.snapshot();
            if let Some(matched) = conditions.iter().find(|c| c.matches(state.status)) {
                return Ok(WaitReport {
                    exit_code: state.exit_code.unwrap_or(0),
                    condition: *matched,
                });
            }
            // Wake on the next transition or re-poll; the runtime can stop a
            // container without the store hearing about it synchronously.
            let _ = tokio::time::timeout(
                std::time::Duration::from_millis(100),
                rx.changed(),
            )
            .await;
        }
    }

    /// Folds the runtime's view into ours: a Running container whose
    /// process died becomes Exited with its exit code recorded.
    ///
    /// Reads call this without the operation lock, so the commit is a
    /// compare-and-set: only the Running→Exited transition is applied, and
    /// the `died` event fires once even when a mutating operation races us.
    async fn sync(&self, handle: &ContainerHandle) -> Result<()> {
        let status = handle.snapshot().status;
        if status != ContainerStatus::Running {
            return Ok(());
        }
        let id = &handle.config.id;
        match self.runtime.state(id).await {
            Ok(state) if state.status == OciStatus::Stopped => {
                let exit_code = self.runtime.wait(id).await?;
                let transitioned = {
                    let mut state = handle.state.write().unwrap();
                    if state.status == ContainerStatus::Running {
                        state.status = ContainerStatus::Exited;
                        state.exit_code = Some(exit_code);
                        state.finished_at = Some(Utc::now());
                        state.pid = None;
                        state.conmon_pid = None;
                        true
                    } else {
                        false
                    }
                };
                if transitioned {
                    let _ = handle.status_tx.send(ContainerStatus::Exited);
                    self.events.publish(
                        EventKind::Container,
                        "died",
                        id,
                        Some(&handle.config.name),
                    );
                }
                Ok(())
            }
            Ok(_) => Ok(()),
            // Runtime record gone from under us: treat as exited.
            Err(Error::NoSuchContainer(_)) => {
                handle.set_status(|s| {
                    if s.status == ContainerStatus::Running {
                        s.status = ContainerStatus::Exited;
                        s.finished_at = Some(Utc::now());
                        s.pid = None;
                    }
                });
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub async fn inspect(&self, name_or_id: &str) -> Result<ContainerInspect> {
        let handle = self.handle(name_or_id)?;
        self.sync(&handle).await?;
        Ok(ContainerInspect {
            id: handle.config.id.clone(),
            name: handle.config.name.clone(),
            config: handle.config.clone(),
            state: handle.snapshot(),
            pod: handle.config.pod.clone(),
            created_at: handle.config.created_at,
        })
    }

    pub async fn list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let handles: Vec<Arc<ContainerHandle>> =
            self.containers.read().unwrap().values().cloned().collect();
        let mut summaries = Vec::new();
        for handle in handles {
            self.sync(&handle).await?;
            let state = handle.snapshot();
            if !all && state.status != ContainerStatus::Running {
                continue;
            }
            summaries.push(ContainerSummary {
                id: handle.config.id.clone(),
                names: std::iter::once(handle.config.name.clone())
                    .chain(handle.config.aliases.iter().cloned())
                    .collect(),
                image: handle.config.image.clone(),
                command: handle.config.command.clone(),
                status: state.status,
                exit_code: state.exit_code,
                pod: handle.config.pod.clone(),
                ports: handle.config.ports.clone(),
                labels: handle.config.labels.clone(),
                created_at: handle.config.created_at,
                started_at: state.started_at,
            });
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }

    /// Config snapshot, for callers that need fields rather than reports.
    pub fn config(&self, name_or_id: &str) -> Result<ContainerConfig> {
        Ok(self.handle(name_or_id)?.config.clone())
    }

    /// Current status without a full inspect.
    pub async fn status(&self, name_or_id: &str) -> Result<ContainerStatus> {
        let handle = self.handle(name_or_id)?;
        self.sync(&handle).await?;
        Ok(handle.snapshot().status)
    }

    /// True when any container mounts the named volume.
    pub fn volume_in_use(&self, volume: &str) -> Option<String> {
        let containers = self.containers.read().unwrap();
        containers
            .values()
            .find(|h| h.config.volume_names().contains(&volume))
            .map(|h| h.config.id.clone())
    }

    /// True when any container uses the given image ID.
    pub fn image_in_use(&self, image_id: &str) -> Option<String> {
        let containers = self.containers.read().unwrap();
        containers
            .values()
            .find(|h| h.config.image_id.as_deref() == Some(image_id))
            .map(|h| h.config.id.clone())
    }

    pub fn count(&self) -> usize {
        self.containers.read().unwrap().len()
    }

    // =========================================================================
    // Logs / Top / Stats / Port
    // =========================================================================

    /// Path of the container's JSON-lines log.
    pub fn log_path(&self, id: &str) -> PathBuf {
        self.storage.container_userdata(id).join("ctr.log")
    }

    /// Reads log entries with since/until/tail filtering applied.
    pub async fn logs(&self, name_or_id: &str, opts: &LogOptions) -> Result<Vec<LogEntry>> {
        let handle = self.handle(name_or_id)?;
        let path = self.log_path(&handle.config.id);
        let mut entries = read_log_file(&path)?;
        if let Some(since) = opts.since {
            entries.retain(|e| e.time >= since);
        }
        if let Some(until) = opts.until {
            entries.retain(|e| e.time <= until);
        }
        if let Some(tail) = opts.tail {
            let skip = entries.len().saturating_sub(tail);
            entries.drain(..skip);
        }
        Ok(entries)
    }

    /// Follows the log until the container exits. Entries stream through
    /// the returned receiver; dropping it cancels the reader.
    pub async fn logs_follow(
        &self,
        name_or_id: &str,
        opts: LogOptions,
    ) -> Result<tokio::sync::mpsc::Receiver<LogEntry>> {
        let handle = self.handle(name_or_id)?;
        let path = self.log_path(&handle.config.id);
        let (tx, rx) = tokio::sync::mpsc::channel(64);
        let mut status_rx = handle.status_tx.subscribe();

        let initial = self.logs(name_or_id, &opts).await?;
        tokio::spawn(async move {
            let mut sent = 0usize;
            for entry in initial {
                sent += 1;
                if tx.send(entry).await.is_err() {
                    return;
                }
            }
            loop {
                let entries = read_log_file(&path).unwrap_or_default();
                for entry in entries.iter().skip(sent) {
                    sent += 1;
                    if tx.send(entry.clone()).await.is_err() {
                        return;
                    }
                }
                let done = matches!(
                    *status_rx.borrow(),
                    ContainerStatus::Exited | ContainerStatus::Stopped
                );
                if done {
                    return;
                }
                let _ = tokio::time::timeout(
                    std::time::Duration::from_millis(200),
                    status_rx.changed(),
                )
                .await;
            }
        });
        Ok(rx)
    }

    /// Lists processes. Descriptors select ps-style columns; only the
    /// default set is supported.
    pub async fn top(&self, name_or_id: &str, _descriptors: &[String]) -> Result<TopReport> {
        let handle = self.handle(name_or_id)?;
        self.sync(&handle).await?;
        let state = handle.snapshot();
        let pid = state.pid.ok_or_else(|| Error::CtrStateInvalid {
            id: handle.config.id.clone(),
            state: state.status.to_string(),
            reason: "top requires a running container".to_string(),
        })?;

        let command = read_cmdline(pid)
            .unwrap_or_else(|| handle.config.command.join(" "));
        Ok(TopReport {
            titles: vec!["PID".to_string(), "COMMAND".to_string()],
            processes: vec![vec![pid.to_string(), command]],
        })
    }

    /// Point-in-time usage. Zeros where the host offers no accounting.
    pub async fn stats(&self, name_or_id: &str) -> Result<ContainerStats> {
        let handle = self.handle(name_or_id)?;
        self.sync(&handle).await?;
        let state = handle.snapshot();
        let mut stats = ContainerStats {
            id: handle.config.id.clone(),
            name: handle.config.name.clone(),
            memory_limit: handle.config.resources.memory.unwrap_or(0),
            ..Default::default()
        };
        if let Some(pid) = state.pid {
            if let Some((cpu, rss)) = read_proc_usage(pid) {
                stats.cpu_nanos = cpu;
                stats.memory_bytes = rss;
                stats.pids = 1;
            }
        }
        Ok(stats)
    }

    /// Published port mappings.
    pub fn port(&self, name_or_id: &str) -> Result<Vec<crate::container::config::PortMapping>> {
        Ok(self.handle(name_or_id)?.config.ports.clone())
    }

    // =========================================================================
    // Diff / Export / Mount
    // =========================================================================

    /// Filesystem changes since init, against the recorded manifest.
    pub async fn diff(&self, name_or_id: &str) -> Result<Vec<FileChange>> {
        let handle = self.handle(name_or_id)?;
        let id = &handle.config.id;
        let manifest_path = self.storage.container_userdata(id).join("manifest.json");
        let baseline: HashMap<String, String> = match std::fs::read(&manifest_path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(_) => {
                return Err(Error::CtrStateInvalid {
                    id: id.clone(),
                    state: handle.snapshot().status.to_string(),
                    reason: "diff requires an initialised container".to_string(),
                })
            }
        };
        let current = build_manifest(&self.effective_rootfs(&handle))?;

        let mut changes = Vec::new();
        for (path, digest) in &current {
            match baseline.get(path) {
                None => changes.push(FileChange {
                    kind: "A".to_string(),
                    path: path.clone(),
                }),
                Some(old) if old != digest => changes.push(FileChange {
                    kind: "C".to_string(),
                    path: path.clone(),
                }),
                _ => {}
            }
        }
        for path in baseline.keys() {
            if !current.contains_key(path) {
                changes.push(FileChange {
                    kind: "D".to_string(),
                    path: path.clone(),
                });
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    /// Streams the rootfs as a tar archive into `writer`.
    pub async fn export(&self, name_or_id: &str, writer: impl std::io::Write) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let rootfs = self.effective_rootfs(&handle);
        if !rootfs.exists() {
            return Err(Error::CtrStateInvalid {
                id: handle.config.id.clone(),
                state: handle.snapshot().status.to_string(),
                reason: "export requires an initialised container".to_string(),
            });
        }
        let mut builder = tar::Builder::new(writer);
        builder.append_dir_all(".", &rootfs)?;
        builder.finish()?;
        Ok(())
    }

    /// Marks the rootfs mounted; returns its path. The storage driver does
    /// the actual mount, outside this engine.
    pub fn mount(&self, name_or_id: &str) -> Result<PathBuf> {
        let handle = self.handle(name_or_id)?;
        handle.state.write().unwrap().mount_count += 1;
        Ok(self.effective_rootfs(&handle))
    }

    /// Releases one mount reference.
    pub fn unmount(&self, name_or_id: &str) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let mut state = handle.state.write().unwrap();
        if state.mount_count == 0 {
            return Err(Error::InvalidArg(format!(
                "container {} is not mounted",
                handle.config.id
            )));
        }
        state.mount_count -= 1;
        Ok(())
    }

    // =========================================================================
    // Checkpoint / Restore
    // =========================================================================

    /// Checkpoints a running container. Unless `leave_running`, it ends up
    /// Exited with code 0.
    pub async fn checkpoint(&self, name_or_id: &str, leave_running: bool) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        let id = handle.config.id.clone();
        let status = handle.snapshot().status;
        if status != ContainerStatus::Running {
            return Err(Error::CtrStateInvalid {
                id,
                state: status.to_string(),
                reason: "can only checkpoint running containers".to_string(),
            });
        }
        let image_dir = self.storage.container_userdata(&id).join("checkpoint");
        std::fs::create_dir_all(&image_dir)?;
        self.runtime
            .checkpoint(&id, &image_dir, leave_running)
            .await?;
        if !leave_running {
            handle.set_status(|s| {
                s.status = ContainerStatus::Exited;
                s.exit_code = Some(0);
                s.finished_at = Some(Utc::now());
                s.pid = None;
            });
        }
        self.events
            .publish(EventKind::Container, "checkpoint", &id, Some(&handle.config.name));
        Ok(())
    }

    /// Restores a previously checkpointed container to Running.
    pub async fn restore(&self, name_or_id: &str) -> Result<()> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        let id = handle.config.id.clone();
        let image_dir = self.storage.container_userdata(&id).join("checkpoint");
        if !image_dir.exists() {
            return Err(Error::InvalidArg(format!(
                "container {id} has no checkpoint to restore"
            )));
        }
        let bundle = self.storage.container_dir(&id);
        self.runtime.restore(&id, &bundle, &image_dir).await?;
        let runtime_state = self.runtime.state(&id).await?;
        handle.set_status(|s| {
            s.status = ContainerStatus::Running;
            s.pid = runtime_state.pid;
            s.started_at = Some(Utc::now());
            s.finished_at = None;
            s.exit_code = None;
        });
        self.events
            .publish(EventKind::Container, "restore", &id, Some(&handle.config.name));
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn read_pid_file(path: &Path) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn read_cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    let joined = raw
        .split(|&b| b == 0)
        .filter(|s| !s.is_empty())
        .map(|s| String::from_utf8_lossy(s).to_string())
        .collect::<Vec<_>>()
        .join(" ");
    (!joined.is_empty()).then_some(joined)
}

/// (cpu time in nanos, resident bytes) for a PID, from procfs.
fn read_proc_usage(pid: u32) -> Option<(u64, u64)> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields 14 and 15 are utime/stime in clock ticks, after the comm field
    // which may contain spaces; split after the closing paren.
    let after = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = after.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks_per_sec = 100u64;
    let cpu_nanos = (utime + stime) * (1_000_000_000 / ticks_per_sec);

    let status = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    let rss_kb: u64 = status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())?;
    Some((cpu_nanos, rss_kb * 1024))
}

/// Walks a rootfs producing path → content-hash for regular files.
fn build_manifest(rootfs: &Path) -> Result<HashMap<String, String>> {
    let mut manifest = HashMap::new();
    if !rootfs.exists() {
        return Ok(manifest);
    }
    walk(rootfs, rootfs, &mut manifest)?;
    return Ok(manifest);

    fn walk(
        base: &Path,
        dir: &Path,
        manifest: &mut HashMap<String, String>,
    ) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                walk(base, &path, manifest)?;
            } else if file_type.is_file() {
                let rel = path
                    .strip_prefix(base)
                    .unwrap_or(&path)
                    .to_string_lossy()
                    .to_string();
                let digest = hex::encode(Sha256::digest(std::fs::read(&path)?));
                manifest.insert(format!("/{rel}"), digest);
            }
        }
        Ok(())
    }
}

/// Parses a JSON-lines log file; unparseable lines are skipped.
fn read_log_file(path: &Path) -> Result<Vec<LogEntry>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(_) => return Ok(Vec::new()),
    };
    Ok(content
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}
