//! ABI engine: the capability traits implemented against the in-process
//! stores.
//!
//! This is the one place the stores are wired together: container create
//! resolves images and registers pod membership, container removal releases
//! volumes and cascades exec sessions, commit bridges the container store
//! and the image store. `shutdown` is idempotent behind an atomic flag.

use super::{ContainerEngine, EngineMode, ImageEngine};
use crate::config::EngineConfig;
use crate::container::config::PortMapping;
use crate::container::exec::{ExecConfig, ExecInspect, ExecSessionManager};
use crate::container::state::WaitCondition;
use crate::container::store::{ContainerStore, LogOptions, RemoveOptions};
use crate::copy::{self, CopySpec, ResolvedTarget};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventFilter};
use crate::image::pull::{ImagePuller, PullOptions, PullPolicy};
use crate::image::ImageStore;
use crate::oci::{CommandRuntime, FakeRuntime, OciRuntime, Signal};
use crate::pod::{PodCoordinator, PodCreateOptions};
use crate::reports::*;
use crate::specgen::{self, ContainerSpec};
use crate::storage::Storage;
use crate::volume::{VolumeCreateOptions, VolumeFilters, VolumeManager};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// The in-process engine.
pub struct AbiEngine {
    config: EngineConfig,
    events: EventBus,
    containers: Arc<ContainerStore>,
    pods: PodCoordinator,
    images: Arc<ImageStore>,
    volumes: VolumeManager,
    exec: ExecSessionManager,
    /// Bounds concurrent per-target work in bulk operations.
    workers: Arc<tokio::sync::Semaphore>,
    shutdown_done: AtomicBool,
}

impl AbiEngine {
    /// Builds an engine against the real OCI runtime binary.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        let runtime: Arc<dyn OciRuntime> = Arc::new(CommandRuntime::new(
            &config.runtime,
            config.run_root.join("oci"),
        )?);
        Self::with_runtime(config, runtime)
    }

    /// Builds an engine against an in-memory fake runtime, for tests and
    /// development off-Linux.
    pub fn new_for_testing(config: EngineConfig) -> Result<Arc<Self>> {
        Self::with_runtime(config, Arc::new(FakeRuntime::new()))
    }

    /// Builds an engine with an explicit runtime implementation.
    pub fn with_runtime(config: EngineConfig, runtime: Arc<dyn OciRuntime>) -> Result<Arc<Self>> {
        let events = EventBus::new();
        let storage = Storage::open(&config.graph_root, &config.run_root)?;

        let containers = Arc::new(ContainerStore::new(
            config.clone(),
            storage.clone(),
            runtime.clone(),
            events.clone(),
        ));

        let in_use_containers = Arc::clone(&containers);
        let images = Arc::new(ImageStore::open(
            storage.clone(),
            events.clone(),
            Box::new(move |digest| in_use_containers.image_in_use(digest)),
        )?);

        let volume_users = Arc::clone(&containers);
        let volumes = VolumeManager::new(
            storage,
            events.clone(),
            Box::new(move |name| volume_users.volume_in_use(name)),
        );

        let pods = PodCoordinator::new(config.clone(), Arc::clone(&containers), events.clone());
        let exec = ExecSessionManager::new(config.clone(), Arc::clone(&containers), runtime);

        Ok(Arc::new(Self {
            workers: Arc::new(tokio::sync::Semaphore::new(config.parallel_workers.max(1))),
            config,
            events,
            containers,
            pods,
            images,
            volumes,
            exec,
            shutdown_done: AtomicBool::new(false),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Filtered live event stream.
    pub fn subscribe_events(
        &self,
        filter: EventFilter,
    ) -> tokio::sync::mpsc::Receiver<crate::events::Event> {
        let mut rx = self.events.subscribe();
        let (tx, out) = tokio::sync::mpsc::channel(64);
        tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if filter.matches(&event) && tx.send(event).await.is_err() {
                    return;
                }
            }
        });
        out
    }

    pub fn container_store(&self) -> &Arc<ContainerStore> {
        &self.containers
    }

    pub fn exec_manager(&self) -> &ExecSessionManager {
        &self.exec
    }

    pub fn image_store(&self) -> &Arc<ImageStore> {
        &self.images
    }

    /// Starts one container, bringing its pod's infra container up first:
    /// a pod member may only run while the infra holds the namespaces.
    pub async fn start_one(&self, name: &str) -> Result<()> {
        let config = self.containers.config(name)?;
        if let Some(pod) = &config.pod {
            if !config.is_infra {
                if let Some(infra) = self.pods.infra_id(pod)? {
                    let status = self.containers.status(&infra).await?;
                    if status != crate::container::state::ContainerStatus::Running {
                        self.containers.start(&infra).await?;
                    }
                }
            }
        }
        self.containers.start(name).await
    }

    /// Resolves the image for a create: pull-if-missing policy.
    async fn resolve_create_image(
        &self,
        reference: &str,
    ) -> Result<(crate::specgen::ImageRuntimeConfig, Vec<String>)> {
        let opts = PullOptions {
            policy: PullPolicy::Missing,
            ..Default::default()
        };
        ImagePuller::pull(&self.images, reference, &opts).await?;
        let record = self.images.get(reference)?;
        Ok((record.config.clone(), record.layers.clone()))
    }

    /// Runs one future per target on the bounded worker pool. Reports come
    /// back in input order and never short-circuit on the first failure.
    async fn bulk<F, Fut>(&self, names: &[String], f: F) -> Result<Vec<ContainerReport>>
    where
        F: Fn(String) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let tasks = names.iter().map(|name| {
            let id = self
                .containers
                .resolve(name)
                .unwrap_or_else(|_| name.clone());
            let fut = f(name.clone());
            let workers = Arc::clone(&self.workers);
            async move {
                let _permit = workers.acquire().await;
                match fut.await {
                    Ok(()) => ContainerReport::ok(id),
                    // Benign idempotencies count as success in bulk reports.
                    Err(e) if e.is_benign() => ContainerReport::ok(id),
                    Err(e) => ContainerReport::failed(id, e),
                }
            }
        });
        Ok(futures::future::join_all(tasks).await)
    }
}

#[async_trait]
impl ContainerEngine for AbiEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Abi
    }

    async fn container_create(&self, spec: ContainerSpec) -> Result<String> {
        let (image_config, layers) = match &spec.image {
            Some(reference) => {
                let (config, layers) = self.resolve_create_image(reference).await?;
                (Some(config), layers)
            }
            None => (None, Vec::new()),
        };

        // Pods without an infra container still accept members; they just
        // have nothing to share.
        let pod_info = match &spec.pod {
            Some(pod) => match self.pods.infra_id(pod)? {
                Some(_) => Some(self.pods.join_info(pod)?),
                None => Some(crate::specgen::PodJoinInfo {
                    pod_id: self.pods.resolve(pod)?,
                    infra_container: String::new(),
                    shared: Vec::new(),
                }),
            },
            None => None,
        };

        let generated = specgen::generate(
            &spec,
            image_config.as_ref(),
            pod_info.as_ref(),
            &self.config,
        )?;
        for warning in &generated.warnings {
            tracing::warn!("{warning}");
        }

        let pod_id = generated.config.pod.clone();
        let id = self.containers.create(generated, layers).await?;
        if let Some(pod) = pod_id {
            self.pods.register_member(&pod, &id)?;
        }
        Ok(id)
    }

    async fn container_init(&self, name: &str) -> Result<()> {
        self.containers.init(name).await
    }

    async fn container_start(&self, names: &[String]) -> Result<Vec<ContainerReport>> {
        self.bulk(names, |name| async move { self.start_one(&name).await })
            .await
    }

    async fn container_stop(
        &self,
        names: &[String],
        timeout: Option<u64>,
        ignore: bool,
    ) -> Result<Vec<ContainerReport>> {
        self.bulk(names, |name| async move {
            match self.containers.stop(&name, timeout).await {
                Err(Error::NoSuchContainer(_)) if ignore => Ok(()),
                other => other,
            }
        })
        .await
    }

    async fn container_kill(
        &self,
        names: &[String],
        signal: &str,
    ) -> Result<Vec<ContainerReport>> {
        let signal = Signal::parse(signal)?;
        self.bulk(names, |name| async move {
            self.containers.kill(&name, signal).await
        })
        .await
    }

    async fn container_pause(&self, names: &[String]) -> Result<Vec<ContainerReport>> {
        self.bulk(names, |name| async move { self.containers.pause(&name).await })
            .await
    }

    async fn container_unpause(&self, names: &[String]) -> Result<Vec<ContainerReport>> {
        self.bulk(names, |name| async move { self.containers.unpause(&name).await })
            .await
    }

    async fn container_restart(
        &self,
        names: &[String],
        timeout: Option<u64>,
    ) -> Result<Vec<ContainerReport>> {
        self.bulk(names, |name| async move {
            self.containers.restart(&name, timeout).await
        })
        .await
    }

    async fn container_rm(
        &self,
        names: &[String],
        opts: RemoveOptions,
    ) -> Result<Vec<ContainerReport>> {
        self.bulk(names, |name| async move {
            let removed = self.containers.remove(&name, opts).await?;
            if let Some(config) = removed {
                self.exec.remove_for_container(&config.id);
                if let Some(pod) = &config.pod {
                    let _ = self.pods.deregister_member(pod, &config.id);
                }
                if opts.volumes {
                    for volume in config.volume_names() {
                        // Skip volumes other containers still use.
                        if self.containers.volume_in_use(volume).is_none() {
                            let _ = self.volumes.remove(volume, true);
                        }
                    }
                }
            }
            Ok(())
        })
        .await
    }

    async fn container_prune(&self) -> Result<PruneReport> {
        self.containers.prune().await
    }

    async fn container_exists(&self, name: &str) -> Result<BoolReport> {
        Ok(BoolReport {
            value: self.containers.exists(name),
        })
    }

    async fn container_inspect(&self, name: &str) -> Result<ContainerInspect> {
        self.containers.inspect(name).await
    }

    async fn container_list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        self.containers.list(all).await
    }

    async fn container_wait(
        &self,
        name: &str,
        conditions: &[WaitCondition],
    ) -> Result<WaitReport> {
        self.containers.wait(name, conditions).await
    }

    async fn container_logs(&self, name: &str, opts: &LogOptions) -> Result<Vec<LogEntry>> {
        self.containers.logs(name, opts).await
    }

    async fn container_top(&self, name: &str) -> Result<TopReport> {
        self.containers.top(name, &[]).await
    }

    async fn container_stats(&self, name: &str) -> Result<ContainerStats> {
        self.containers.stats(name).await
    }

    async fn container_diff(&self, name: &str) -> Result<Vec<FileChange>> {
        self.containers.diff(name).await
    }

    async fn container_port(&self, name: &str) -> Result<Vec<PortMapping>> {
        self.containers.port(name)
    }

    async fn container_export(&self, name: &str, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.containers.export(name, file).await
    }

    async fn container_commit(&self, name: &str, tag: Option<&str>) -> Result<String> {
        let mut tarball = Vec::new();
        self.containers.export(name, &mut tarball).await?;
        let digest = self.images.import(&tarball, tag)?;
        info!(container = name, image = %digest, "committed");
        Ok(digest)
    }

    async fn container_checkpoint(&self, name: &str, leave_running: bool) -> Result<()> {
        self.containers.checkpoint(name, leave_running).await
    }

    async fn container_restore(&self, name: &str) -> Result<()> {
        self.containers.restore(name).await
    }

    async fn container_mount(&self, name: &str) -> Result<PathBuf> {
        self.containers.mount(name)
    }

    async fn container_unmount(&self, name: &str) -> Result<()> {
        self.containers.unmount(name)
    }

    async fn container_copy(&self, src: &str, dst: &str) -> Result<()> {
        // Stdin source: buffer, validate as a tar archive, then extract.
        if src == "-" {
            let dst_spec = CopySpec::parse(dst);
            let resolved = match &dst_spec {
                CopySpec::Host(path) => ResolvedTarget::new(copy::resolve_host(path), dst),
                CopySpec::Container { name, path } => {
                    let rootfs = self.containers.mount(name)?;
                    ResolvedTarget::new(copy::resolve_in_rootfs(&rootfs, path), dst)
                }
            };
            let result = tokio::task::spawn_blocking(move || {
                copy::copy_from_stream(std::io::stdin(), &resolved)
            })
            .await
            .map_err(|e| Error::Internal(format!("copy task failed: {e}")))?;
            if let CopySpec::Container { name, .. } = &dst_spec {
                let _ = self.containers.unmount(name);
            }
            return result;
        }

        let (src_spec, dst_spec) = copy::parse_pair(src, dst)?;

        let resolve = |spec: &CopySpec, original: &str| -> Result<ResolvedTarget> {
            match spec {
                CopySpec::Host(path) => {
                    Ok(ResolvedTarget::new(copy::resolve_host(path), original))
                }
                CopySpec::Container { name, path } => {
                    let rootfs = self.containers.mount(name)?;
                    Ok(ResolvedTarget::new(
                        copy::resolve_in_rootfs(&rootfs, path),
                        original,
                    ))
                }
            }
        };

        let resolved_src = resolve(&src_spec, src)?;
        let resolved_dst = resolve(&dst_spec, dst)?;
        let result = tokio::task::spawn_blocking(move || copy::copy(&resolved_src, &resolved_dst))
            .await
            .map_err(|e| Error::Internal(format!("copy task failed: {e}")))?;

        for spec in [&src_spec, &dst_spec] {
            if let CopySpec::Container { name, .. } = spec {
                let _ = self.containers.unmount(name);
            }
        }
        result
    }

    async fn container_cleanup(&self, name: &str, rm: bool) -> Result<()> {
        // The exit command lands here after the container dies: settle the
        // state record, apply the restart policy, then honour --rm.
        let _ = self.containers.status(name).await?;
        let inspect = self.containers.inspect(name).await?;

        use crate::container::config::RestartPolicy;
        let should_restart = match &inspect.config.restart_policy {
            RestartPolicy::No => false,
            RestartPolicy::Always | RestartPolicy::UnlessStopped => true,
            RestartPolicy::OnFailure(max) => {
                let failed = inspect.state.exit_code.unwrap_or(0) != 0;
                let budget = max
                    .map(|m| inspect.state.restart_count < m)
                    .unwrap_or(true);
                failed && budget
            }
        };
        if should_restart {
            debug!(container = name, "restart policy re-starting container");
            return self.containers.restart(name, None).await;
        }

        if rm {
            self.containers
                .remove(
                    name,
                    RemoveOptions {
                        ignore: true,
                        ..Default::default()
                    },
                )
                .await?;
        }
        debug!(container = name, "cleanup complete");
        Ok(())
    }

    // --- exec ---

    async fn exec_create(&self, container: &str, config: ExecConfig) -> Result<String> {
        self.exec.create(container, config).await
    }

    async fn exec_start(&self, session: &str) -> Result<()> {
        self.exec.start(session).await
    }

    async fn exec_start_attached(&self, session: &str) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        self.exec.start_and_attach(session).await
    }

    async fn exec_inspect(&self, session: &str) -> Result<ExecInspect> {
        self.exec.inspect(session)
    }

    async fn exec_resize(&self, session: &str, height: u16, width: u16) -> Result<()> {
        self.exec.resize(session, height, width)
    }

    async fn exec_cleanup(&self, session: &str, exit_code: i32) -> Result<()> {
        self.exec.mark_stopped(session, exit_code)
    }

    // --- pods ---

    async fn pod_create(&self, opts: PodCreateOptions) -> Result<String> {
        self.pods.create(opts).await
    }

    async fn pod_exists(&self, name: &str) -> Result<BoolReport> {
        Ok(BoolReport {
            value: self.pods.exists(name),
        })
    }

    async fn pod_inspect(&self, name: &str) -> Result<PodInspect> {
        self.pods.inspect(name).await
    }

    async fn pod_list(&self) -> Result<Vec<PodInspect>> {
        self.pods.list().await
    }

    async fn pod_start(&self, name: &str) -> Result<PodReport> {
        self.pods.start(name).await
    }

    async fn pod_stop(&self, name: &str, timeout: Option<u64>) -> Result<PodReport> {
        self.pods.stop(name, timeout).await
    }

    async fn pod_kill(&self, name: &str, signal: &str) -> Result<PodReport> {
        self.pods.kill(name, Signal::parse(signal)?).await
    }

    async fn pod_pause(&self, name: &str) -> Result<PodReport> {
        self.pods.pause(name).await
    }

    async fn pod_unpause(&self, name: &str) -> Result<PodReport> {
        self.pods.unpause(name).await
    }

    async fn pod_restart(&self, name: &str) -> Result<PodReport> {
        self.pods.restart(name).await
    }

    async fn pod_rm(&self, name: &str, force: bool, ignore: bool) -> Result<PodReport> {
        let report = self.pods.remove(name, force, ignore).await?;
        for member in &report.member_errs {
            if member.err.is_none() {
                self.exec.remove_for_container(&member.id);
            }
        }
        Ok(report)
    }

    async fn pod_prune(&self) -> Result<PruneReport> {
        self.pods.prune().await
    }

    async fn pod_top(&self, name: &str) -> Result<TopReport> {
        self.pods.top(name).await
    }

    async fn pod_stats(&self, name: &str) -> Result<Vec<ContainerStats>> {
        self.pods.stats(name).await
    }

    // --- volumes ---

    async fn volume_create(&self, opts: VolumeCreateOptions) -> Result<VolumeInspect> {
        let volume = self.volumes.create(opts)?;
        self.volumes.inspect(&volume.name)
    }

    async fn volume_exists(&self, name: &str) -> Result<BoolReport> {
        Ok(BoolReport {
            value: self.volumes.exists(name),
        })
    }

    async fn volume_inspect(&self, name: &str) -> Result<VolumeInspect> {
        self.volumes.inspect(name)
    }

    async fn volume_list(&self, filters: VolumeFilters) -> Result<Vec<VolumeInspect>> {
        Ok(self.volumes.list(&filters))
    }

    async fn volume_rm(&self, name: &str, force: bool) -> Result<()> {
        self.volumes.remove(name, force)
    }

    async fn volume_prune(&self, filters: HashMap<String, Vec<String>>) -> Result<PruneReport> {
        self.volumes.prune(&filters)
    }

    // --- system ---

    async fn version(&self) -> Result<VersionReport> {
        Ok(VersionReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            api_version: crate::constants::API_VERSION.to_string(),
            oci_spec_version: crate::constants::OCI_RUNTIME_SPEC_VERSION.to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        })
    }

    async fn info(&self) -> Result<InfoReport> {
        Ok(InfoReport {
            version: self.version().await?,
            rootless: self.config.rootless,
            graph_root: self.config.graph_root.to_string_lossy().to_string(),
            run_root: self.config.run_root.to_string_lossy().to_string(),
            runtime: self.config.runtime.clone(),
            cgroup_manager: self.config.cgroup_manager.to_string(),
            containers: self.containers.count(),
            pods: self.pods.count(),
            images: self.images.count(),
            volumes: self.volumes.count(),
        })
    }

    async fn system_df(&self) -> Result<Vec<DfEntry>> {
        let containers = self.containers.list(true).await?;
        let active = containers
            .iter()
            .filter(|c| c.status == crate::container::state::ContainerStatus::Running)
            .count();
        Ok(vec![
            DfEntry {
                kind: "Images".to_string(),
                total: self.images.count(),
                active: containers.iter().filter(|c| c.image.is_some()).count(),
                size: self.images.total_size(),
            },
            DfEntry {
                kind: "Containers".to_string(),
                total: containers.len(),
                active,
                size: 0,
            },
            DfEntry {
                kind: "Local Volumes".to_string(),
                total: self.volumes.count(),
                active: 0,
                size: self.volumes.total_size(),
            },
        ])
    }

    async fn shutdown(&self) -> Result<()> {
        if self.shutdown_done.swap(true, Ordering::SeqCst) {
            debug!("shutdown already ran; ignoring");
            return Ok(());
        }
        info!("engine shut down");
        Ok(())
    }
}

#[async_trait]
impl ImageEngine for AbiEngine {
    async fn image_exists(&self, name: &str) -> Result<BoolReport> {
        Ok(BoolReport {
            value: self.images.exists(name),
        })
    }

    async fn image_list(&self, filter: Option<&str>) -> Result<Vec<ImageSummary>> {
        Ok(self.images.list(filter))
    }

    async fn image_inspect(&self, name: &str) -> Result<ImageInspect> {
        self.images.inspect(name)
    }

    async fn image_pull(&self, reference: &str, opts: PullOptions) -> Result<Vec<String>> {
        ImagePuller::pull(&self.images, reference, &opts).await
    }

    async fn image_push(&self, reference: &str, opts: PullOptions) -> Result<String> {
        ImagePuller::push(&self.images, reference, &opts).await
    }

    async fn image_tag(&self, reference: &str, new_tag: &str) -> Result<()> {
        self.images.tag(reference, new_tag)
    }

    async fn image_untag(&self, reference: &str, tag: &str) -> Result<()> {
        self.images.untag(reference, tag)
    }

    async fn image_remove(
        &self,
        references: &[String],
        force: bool,
        all: bool,
    ) -> Result<ImageRemoveReport> {
        Ok(self.images.remove(references, force, all))
    }

    async fn image_prune(&self, all: bool) -> Result<PruneReport> {
        self.images.prune(all)
    }

    async fn image_history(&self, reference: &str) -> Result<Vec<HistoryEntry>> {
        self.images.history(reference)
    }

    async fn image_tree(&self, reference: &str, what_requires: bool) -> Result<Vec<String>> {
        self.images.tree(reference, what_requires)
    }

    async fn image_search(&self, term: &str, limit: usize) -> Result<Vec<SearchResult>> {
        ImagePuller::search(term, limit).await
    }

    async fn image_import(&self, tarball_path: &Path, tag: Option<&str>) -> Result<String> {
        let tarball = std::fs::read(tarball_path)?;
        self.images.import(&tarball, tag)
    }

    async fn image_load(&self, archive_path: &Path) -> Result<Vec<String>> {
        let file = std::fs::File::open(archive_path)?;
        self.images.load(file)
    }

    async fn image_save(&self, reference: &str, path: &Path) -> Result<()> {
        let file = std::fs::File::create(path)?;
        self.images.save(reference, file)
    }

    async fn image_diff(&self, reference: &str) -> Result<Vec<FileChange>> {
        self.images.diff(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn engine() -> (TempDir, Arc<AbiEngine>) {
        let dir = TempDir::new().unwrap();
        let config = EngineConfig::rooted_at(dir.path());
        let engine = AbiEngine::new_for_testing(config).unwrap();
        (dir, engine)
    }

    fn rootfs_spec(name: &str) -> ContainerSpec {
        ContainerSpec {
            name: Some(name.to_string()),
            rootfs: Some("/tmp/rootfs".into()),
            command: vec!["sleep".to_string(), "60".to_string()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn bulk_stop_reports_per_target() {
        let (_dir, engine) = engine();
        let a = engine.container_create(rootfs_spec("a")).await.unwrap();
        engine.container_start(&[a.clone()]).await.unwrap();

        let reports = engine
            .container_stop(
                &[a.clone(), "ghost".to_string()],
                Some(0),
                false,
            )
            .await
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert!(reports[0].err.is_none());
        assert!(reports[1].err.as_deref().unwrap().contains("no such container"));
    }

    #[tokio::test]
    async fn stop_twice_is_success_in_bulk_report() {
        let (_dir, engine) = engine();
        let a = engine.container_create(rootfs_spec("a")).await.unwrap();
        engine.container_start(&[a.clone()]).await.unwrap();
        engine
            .container_stop(&[a.clone()], Some(0), false)
            .await
            .unwrap();

        // Second stop is benign: exit 0, no error in the report.
        let reports = engine
            .container_stop(&[a.clone()], Some(0), false)
            .await
            .unwrap();
        assert!(reports[0].err.is_none());
    }

    #[tokio::test]
    async fn rm_with_volumes_releases_unused_volumes() {
        let (_dir, engine) = engine();
        engine
            .volume_create(VolumeCreateOptions {
                name: Some("data".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut spec = rootfs_spec("user");
        spec.mounts = vec![crate::container::config::Mount::Volume {
            name: "data".to_string(),
            destination: "/data".into(),
            options: vec![],
        }];
        let id = engine.container_create(spec).await.unwrap();

        // In use: rm without volumes leaves it; with volumes removes it.
        let err = engine.volume_rm("data", false).await.unwrap_err();
        assert!(matches!(err, Error::VolumeBeingUsed { .. }));

        engine
            .container_rm(
                &[id],
                RemoveOptions {
                    volumes: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let exists = engine.volume_exists("data").await.unwrap();
        assert!(!exists.value);
    }

    #[tokio::test]
    async fn commit_creates_image_from_container() {
        let (dir, engine) = engine();
        // Give the container a real (external) rootfs with content.
        let rootfs = dir.path().join("myrootfs");
        std::fs::create_dir_all(rootfs.join("etc")).unwrap();
        std::fs::write(rootfs.join("etc/motd"), "hi").unwrap();

        let mut spec = rootfs_spec("c");
        spec.rootfs = Some(rootfs);
        let id = engine.container_create(spec).await.unwrap();
        engine.container_init(&id).await.unwrap();

        let digest = engine
            .container_commit(&id, Some("committed:v1"))
            .await
            .unwrap();
        assert!(engine.image_exists("committed:v1").await.unwrap().value);
        assert!(digest.starts_with("sha256:"));
    }

    #[tokio::test]
    async fn shutdown_runs_once() {
        let (_dir, engine) = engine();
        engine.shutdown().await.unwrap();
        engine.shutdown().await.unwrap();
        assert!(engine.shutdown_done.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn pod_member_create_and_rm_keep_membership_consistent() {
        let (_dir, engine) = engine();
        let pod = engine
            .pod_create(PodCreateOptions {
                name: Some("p".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let mut spec = rootfs_spec("member");
        spec.pod = Some(pod.clone());
        let id = engine.container_create(spec).await.unwrap();

        let inspect = engine.pod_inspect(&pod).await.unwrap();
        assert!(inspect.members.iter().any(|m| m.id == id));

        engine
            .container_rm(&[id.clone()], RemoveOptions::default())
            .await
            .unwrap();
        let inspect = engine.pod_inspect(&pod).await.unwrap();
        assert!(!inspect.members.iter().any(|m| m.id == id));
    }

    #[tokio::test]
    async fn copy_between_host_and_container() {
        let (dir, engine) = engine();
        let rootfs = dir.path().join("cr");
        std::fs::create_dir_all(rootfs.join("root")).unwrap();

        let mut spec = rootfs_spec("c1");
        spec.rootfs = Some(rootfs.clone());
        engine.container_create(spec).await.unwrap();

        let host_file = dir.path().join("a");
        std::fs::write(&host_file, "hello").unwrap();

        engine
            .container_copy(host_file.to_str().unwrap(), "c1:/root/b")
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(rootfs.join("root/b")).unwrap(),
            "hello"
        );
        // Base-name rename: no /root/a appeared.
        assert!(!rootfs.join("root/a").exists());
    }

    #[tokio::test]
    async fn version_and_info() {
        let (_dir, engine) = engine();
        let version = engine.version().await.unwrap();
        assert_eq!(version.api_version, crate::constants::API_VERSION);
        let info = engine.info().await.unwrap();
        assert_eq!(info.containers, 0);
        let df = engine.system_df().await.unwrap();
        assert_eq!(df.len(), 3);
    }
}
