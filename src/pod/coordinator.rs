//! Pod coordinator.
//!
//! Aggregate lifecycle over a pod's members: start in dependency order
//! (infra first, then a stable topological sort of `from-container` edges),
//! stop in reverse, and per-member result collection that never
//! short-circuits on the first error.

use super::{InfraConfig, PodConfig};
use crate::config::EngineConfig;
use crate::container::config::{new_id, validate_name, SharedNamespace};
use crate::container::state::ContainerStatus;
use crate::container::store::{ContainerStore, RemoveOptions};
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};
use crate::oci::Signal;
use crate::reports::{
    ContainerReport, ContainerStats, PodInspect, PodMember, PodReport, PodState, PruneReport,
    TopReport,
};
use crate::specgen::{generate, ContainerSpec, PodJoinInfo};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// User-facing options for `pod create`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct PodCreateOptions {
    pub name: Option<String>,
    /// Defaults to {net, ipc, uts} when the pod has an infra container.
    pub shared_namespaces: Option<Vec<SharedNamespace>>,
    pub infra: Option<InfraConfig>,
    pub cgroup_parent: Option<String>,
    pub labels: HashMap<String, String>,
}

struct PodHandle {
    config: PodConfig,
    /// Member container IDs in insertion order. The infra container, when
    /// present, is always index 0.
    members: RwLock<Vec<String>>,
    infra_id: RwLock<Option<String>>,
    op_lock: Mutex<()>,
}

/// The pod store and aggregate-operation engine.
pub struct PodCoordinator {
    engine: EngineConfig,
    store: Arc<ContainerStore>,
    events: EventBus,
    pods: RwLock<HashMap<String, Arc<PodHandle>>>,
    names: RwLock<HashMap<String, String>>,
}

impl PodCoordinator {
    pub fn new(engine: EngineConfig, store: Arc<ContainerStore>, events: EventBus) -> Self {
        Self {
            engine,
            store,
            events,
            pods: RwLock::new(HashMap::new()),
            names: RwLock::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn resolve(&self, name_or_id: &str) -> Result<String> {
        if let Some(id) = self.names.read().unwrap().get(name_or_id) {
            return Ok(id.clone());
        }
        let pods = self.pods.read().unwrap();
        if pods.contains_key(name_or_id) {
            return Ok(name_or_id.to_string());
        }
        let mut matches = pods.keys().filter(|id| id.starts_with(name_or_id)).take(2);
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id.clone()),
            (Some(_), Some(_)) => Err(Error::InvalidArg(format!(
                "pod ID prefix {name_or_id:?} is ambiguous"
            ))),
            _ => Err(Error::NoSuchPod(name_or_id.to_string())),
        }
    }

    fn handle(&self, name_or_id: &str) -> Result<Arc<PodHandle>> {
        let id = self.resolve(name_or_id)?;
        self.pods
            .read()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::NoSuchPod(name_or_id.to_string()))
    }

    pub fn exists(&self, name_or_id: &str) -> bool {
        self.resolve(name_or_id).is_ok()
    }

    pub fn count(&self) -> usize {
        self.pods.read().unwrap().len()
    }

    // =========================================================================
    // Create / Membership
    // =========================================================================

    /// Creates a pod, including its infra container when namespaces are to
    /// be shared.
    pub async fn create(&self, opts: PodCreateOptions) -> Result<String> {
        let id = new_id();
        let name = match opts.name {
            Some(n) => {
                validate_name(&n)?;
                n
            }
            None => format!("pod-{}", &id[..12]),
        };

        let infra = opts.infra.unwrap_or_default();
        let shared = match opts.shared_namespaces {
            Some(s) => s,
            None if infra.enabled => SharedNamespace::default_set(),
            None => Vec::new(),
        };
        if !shared.is_empty() && !infra.enabled {
            return Err(Error::InvalidArg(
                "shared namespaces require an infra container".to_string(),
            ));
        }

        let config = PodConfig {
            id: id.clone(),
            name: name.clone(),
            shared_namespaces: shared,
            infra,
            cgroup_parent: opts.cgroup_parent,
            labels: opts.labels,
            created_at: Utc::now(),
        };

        {
            let mut names = self.names.write().unwrap();
            if names.contains_key(&name) {
                return Err(Error::AlreadyExists { kind: "pod", name });
            }
            names.insert(name.clone(), id.clone());
            self.pods.write().unwrap().insert(
                id.clone(),
                Arc::new(PodHandle {
                    config,
                    members: RwLock::new(Vec::new()),
                    infra_id: RwLock::new(None),
                    op_lock: Mutex::new(()),
                }),
            );
        }

        let handle = self.handle(&id)?;
        if handle.config.infra.enabled {
            let infra_id = self.create_infra(&handle).await?;
            *handle.infra_id.write().unwrap() = Some(infra_id.clone());
            handle.members.write().unwrap().insert(0, infra_id);
        }

        self.events.publish(EventKind::Pod, "create", &id, Some(&name));
        info!(pod = %id, name = %name, "pod created");
        Ok(id)
    }

    /// Builds the infra container from the engine-provisioned pause rootfs.
    async fn create_infra(&self, handle: &PodHandle) -> Result<String> {
        let pause_rootfs = self.engine.graph_root.join("pause-rootfs");
        std::fs::create_dir_all(&pause_rootfs)?;

        let spec = ContainerSpec {
            name: Some(format!("{}-infra", &handle.config.id[..12])),
            rootfs: Some(pause_rootfs),
            command: handle.config.infra.command.clone(),
            ports: handle.config.infra.ports.clone(),
            dns_servers: handle.config.infra.dns_servers.clone(),
            add_hosts: handle.config.infra.add_hosts.clone(),
            ..Default::default()
        };
        let mut generated = generate(&spec, None, None, &self.engine)?;
        generated.config.pod = Some(handle.config.id.clone());
        generated.config.is_infra = true;
        self.store.create(generated, vec![]).await
    }

    /// Join information a member's spec generation needs.
    pub fn join_info(&self, name_or_id: &str) -> Result<PodJoinInfo> {
        let handle = self.handle(name_or_id)?;
        let infra = handle.infra_id.read().unwrap().clone().ok_or_else(|| {
            Error::InvalidArg(format!(
                "pod {} has no infra container to share namespaces",
                handle.config.name
            ))
        })?;
        Ok(PodJoinInfo {
            pod_id: handle.config.id.clone(),
            infra_container: infra,
            shared: handle.config.shared_namespaces.clone(),
        })
    }

    /// Registers an already-created container as a member.
    pub fn register_member(&self, pod: &str, container_id: &str) -> Result<()> {
        let handle = self.handle(pod)?;
        let mut members = handle.members.write().unwrap();
        if !members.iter().any(|m| m == container_id) {
            members.push(container_id.to_string());
        }
        Ok(())
    }

    /// Drops a member (the container itself is the store's business).
    pub fn deregister_member(&self, pod: &str, container_id: &str) -> Result<()> {
        let handle = self.handle(pod)?;
        handle.members.write().unwrap().retain(|m| m != container_id);
        Ok(())
    }

    /// The infra container ID, when the pod has one.
    pub fn infra_id(&self, pod: &str) -> Result<Option<String>> {
        Ok(self.handle(pod)?.infra_id.read().unwrap().clone())
    }

    // =========================================================================
    // Ordering
    // =========================================================================

    /// Start order: infra first, then a stable topological sort of
    /// `from-container` edges; ties keep insertion order.
    async fn start_order(&self, handle: &PodHandle) -> Result<Vec<String>> {
        let members = handle.members.read().unwrap().clone();
        let infra = handle.infra_id.read().unwrap().clone();

        // Dependency edges: member → the member it joins namespaces from.
        let mut deps: HashMap<String, Vec<String>> = HashMap::new();
        for id in &members {
            let config = self.store.config(id)?;
            let mut targets = Vec::new();
            for mode in [
                &config.namespaces.pid,
                &config.namespaces.ipc,
                &config.namespaces.uts,
                &config.namespaces.net,
                &config.namespaces.cgroup,
            ] {
                if let crate::container::config::NamespaceMode::FromContainer(target) = mode {
                    if members.contains(target) && !targets.contains(target) {
                        targets.push(target.clone());
                    }
                }
            }
            deps.insert(id.clone(), targets);
        }

        // Kahn's algorithm, scanning members in insertion order for
        // stability; the infra container has no deps so it sorts first.
        let mut ordered = Vec::with_capacity(members.len());
        let mut placed: std::collections::HashSet<String> = std::collections::HashSet::new();
        if let Some(infra) = &infra {
            ordered.push(infra.clone());
            placed.insert(infra.clone());
        }
        while ordered.len() < members.len() {
            let mut progressed = false;
            for id in &members {
                if placed.contains(id) {
                    continue;
                }
                let ready = deps[id].iter().all(|d| placed.contains(d));
                if ready {
                    ordered.push(id.clone());
                    placed.insert(id.clone());
                    progressed = true;
                }
            }
            if !progressed {
                return Err(Error::InvalidArg(format!(
                    "pod {} has a namespace dependency cycle",
                    handle.config.name
                )));
            }
        }
        Ok(ordered)
    }

    // =========================================================================
    // Aggregate Lifecycle
    // =========================================================================

    /// Starts every member in dependency order.
    pub async fn start(&self, name_or_id: &str) -> Result<PodReport> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;

        let order = self.start_order(&handle).await?;
        if !order.is_empty() {
            let mut all_running = true;
            for id in &order {
                if self.store.status(id).await? != ContainerStatus::Running {
                    all_running = false;
                    break;
                }
            }
            if all_running {
                return Err(Error::PodAlreadyStarted(handle.config.id.clone()));
            }
        }

        let mut report = PodReport {
            id: handle.config.id.clone(),
            member_errs: Vec::new(),
        };
        for id in order {
            match self.store.start(&id).await {
                Ok(()) => report.member_errs.push(ContainerReport::ok(&id)),
                Err(e) if e.is_benign() => report.member_errs.push(ContainerReport::ok(&id)),
                Err(e) => report.member_errs.push(ContainerReport::failed(&id, e)),
            }
        }
        self.events.publish(
            EventKind::Pod,
            "start",
            &handle.config.id,
            Some(&handle.config.name),
        );
        Ok(report)
    }

    /// Stops every member in reverse start order.
    pub async fn stop(&self, name_or_id: &str, timeout: Option<u64>) -> Result<PodReport> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;

        let mut order = self.start_order(&handle).await?;
        order.reverse();

        let mut any_live = false;
        for id in &order {
            if self.store.status(id).await?.can_stop() {
                any_live = true;
                break;
            }
        }
        if !order.is_empty() && !any_live {
            return Err(Error::PodAlreadyStopped(handle.config.id.clone()));
        }

        let mut report = PodReport {
            id: handle.config.id.clone(),
            member_errs: Vec::new(),
        };
        for id in order {
            match self.store.stop(&id, timeout).await {
                Ok(()) => report.member_errs.push(ContainerReport::ok(&id)),
                Err(e) if e.is_benign() => report.member_errs.push(ContainerReport::ok(&id)),
                Err(e) => report.member_errs.push(ContainerReport::failed(&id, e)),
            }
        }
        self.events.publish(
            EventKind::Pod,
            "stop",
            &handle.config.id,
            Some(&handle.config.name),
        );
        Ok(report)
    }

    /// Signals every running member. Requires at least one running member.
    pub async fn kill(&self, name_or_id: &str, signal: Signal) -> Result<PodReport> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;

        let members = handle.members.read().unwrap().clone();
        let mut any_running = false;
        for id in &members {
            if self.store.status(id).await? == ContainerStatus::Running {
                any_running = true;
                break;
            }
        }
        if !any_running {
            return Err(Error::CtrStateInvalid {
                id: handle.config.id.clone(),
                state: self.derive_state(&handle).await?.to_string(),
                reason: "no running containers in pod to kill".to_string(),
            });
        }

        let mut report = PodReport {
            id: handle.config.id.clone(),
            member_errs: Vec::new(),
        };
        for id in members {
            if self.store.status(&id).await? != ContainerStatus::Running {
                continue;
            }
            match self.store.kill(&id, signal).await {
                Ok(()) => report.member_errs.push(ContainerReport::ok(&id)),
                Err(e) => report.member_errs.push(ContainerReport::failed(&id, e)),
            }
        }
        self.events.publish(
            EventKind::Pod,
            "kill",
            &handle.config.id,
            Some(&handle.config.name),
        );
        Ok(report)
    }

    /// Pauses every running member.
    pub async fn pause(&self, name_or_id: &str) -> Result<PodReport> {
        self.for_each_member(name_or_id, "pause", |store, id| async move {
            if store.status(&id).await? == ContainerStatus::Running {
                store.pause(&id).await?;
            }
            Ok(())
        })
        .await
    }

    /// Unpauses every paused member.
    pub async fn unpause(&self, name_or_id: &str) -> Result<PodReport> {
        self.for_each_member(name_or_id, "unpause", |store, id| async move {
            if store.status(&id).await? == ContainerStatus::Paused {
                store.unpause(&id).await?;
            }
            Ok(())
        })
        .await
    }

    /// Restarts members in start order.
    pub async fn restart(&self, name_or_id: &str) -> Result<PodReport> {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        let order = self.start_order(&handle).await?;

        let mut report = PodReport {
            id: handle.config.id.clone(),
            member_errs: Vec::new(),
        };
        for id in order {
            match self.store.restart(&id, None).await {
                Ok(()) => report.member_errs.push(ContainerReport::ok(&id)),
                Err(e) => report.member_errs.push(ContainerReport::failed(&id, e)),
            }
        }
        self.events.publish(
            EventKind::Pod,
            "restart",
            &handle.config.id,
            Some(&handle.config.name),
        );
        Ok(report)
    }

    async fn for_each_member<F, Fut>(
        &self,
        name_or_id: &str,
        action: &str,
        f: F,
    ) -> Result<PodReport>
    where
        F: Fn(Arc<ContainerStore>, String) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let handle = self.handle(name_or_id)?;
        let _guard = handle.op_lock.lock().await;
        let members = handle.members.read().unwrap().clone();

        let mut report = PodReport {
            id: handle.config.id.clone(),
            member_errs: Vec::new(),
        };
        for id in members {
            match f(Arc::clone(&self.store), id.clone()).await {
                Ok(()) => report.member_errs.push(ContainerReport::ok(&id)),
                Err(e) => report.member_errs.push(ContainerReport::failed(&id, e)),
            }
        }
        self.events.publish(
            EventKind::Pod,
            action,
            &handle.config.id,
            Some(&handle.config.name),
        );
        Ok(report)
    }

    /// Removes all members, then the pod. Refuses when any member is
    /// running unless forced.
    pub async fn remove(&self, name_or_id: &str, force: bool, ignore: bool) -> Result<PodReport> {
        let handle = match self.handle(name_or_id) {
            Ok(h) => h,
            Err(Error::NoSuchPod(_)) if ignore => {
                return Ok(PodReport {
                    id: name_or_id.to_string(),
                    member_errs: Vec::new(),
                })
            }
            Err(e) => return Err(e),
        };
        let _guard = handle.op_lock.lock().await;

        let mut order = self.start_order(&handle).await?;
        order.reverse();

        if !force {
            for id in &order {
                let status = self.store.status(id).await?;
                if !status.can_remove() {
                    return Err(Error::CtrStateInvalid {
                        id: handle.config.id.clone(),
                        state: PodState::Running.to_string(),
                        reason: format!("container {id} is {status}; use force"),
                    });
                }
            }
        }

        let mut report = PodReport {
            id: handle.config.id.clone(),
            member_errs: Vec::new(),
        };
        for id in order {
            let opts = RemoveOptions {
                force,
                ..Default::default()
            };
            match self.store.remove(&id, opts).await {
                Ok(_) => report.member_errs.push(ContainerReport::ok(&id)),
                Err(e) => report.member_errs.push(ContainerReport::failed(&id, e)),
            }
        }

        if report.is_ok() {
            let mut names = self.names.write().unwrap();
            names.remove(&handle.config.name);
            self.pods.write().unwrap().remove(&handle.config.id);
            self.events.publish(
                EventKind::Pod,
                "remove",
                &handle.config.id,
                Some(&handle.config.name),
            );
            info!(pod = %handle.config.id, "pod removed");
        }
        Ok(report)
    }

    /// Removes every pod whose derived state is not Running.
    pub async fn prune(&self) -> Result<PruneReport> {
        let candidates: Vec<String> = {
            let pods = self.pods.read().unwrap();
            pods.keys().cloned().collect()
        };
        let mut report = PruneReport::default();
        for id in candidates {
            let handle = match self.handle(&id) {
                Ok(h) => h,
                Err(_) => continue,
            };
            if self.derive_state(&handle).await? == PodState::Running {
                continue;
            }
            match self.remove(&id, false, false).await {
                Ok(r) if r.is_ok() => report.removed.push(id),
                Ok(_) | Err(_) => debug!(pod = %id, "prune skipped"),
            }
        }
        Ok(report)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Derives pod state from member states. Never stored.
    async fn derive_state(&self, handle: &PodHandle) -> Result<PodState> {
        let members = handle.members.read().unwrap().clone();
        if members.is_empty() {
            return Ok(PodState::Created);
        }
        let mut statuses = Vec::with_capacity(members.len());
        for id in &members {
            statuses.push(self.store.status(id).await?);
        }

        if statuses.iter().any(|s| *s == ContainerStatus::Running) {
            return Ok(PodState::Running);
        }
        if statuses.iter().all(|s| *s == ContainerStatus::Exited) {
            return Ok(PodState::Exited);
        }
        let non_exited_paused = statuses
            .iter()
            .filter(|s| **s != ContainerStatus::Exited)
            .all(|s| *s == ContainerStatus::Paused);
        if non_exited_paused {
            return Ok(PodState::Paused);
        }
        let all_fresh = statuses.iter().all(|s| {
            matches!(s, ContainerStatus::Configured | ContainerStatus::Created)
        });
        if all_fresh {
            return Ok(PodState::Created);
        }
        Ok(PodState::Degraded)
    }

    pub async fn inspect(&self, name_or_id: &str) -> Result<PodInspect> {
        let handle = self.handle(name_or_id)?;
        let members = handle.members.read().unwrap().clone();
        let infra = handle.infra_id.read().unwrap().clone();

        let mut member_reports = Vec::with_capacity(members.len());
        for id in &members {
            let config = self.store.config(id)?;
            member_reports.push(PodMember {
                id: id.clone(),
                name: config.name,
                status: self.store.status(id).await?,
                is_infra: config.is_infra,
            });
        }

        Ok(PodInspect {
            id: handle.config.id.clone(),
            name: handle.config.name.clone(),
            state: self.derive_state(&handle).await?,
            shared_namespaces: handle
                .config
                .shared_namespaces
                .iter()
                .map(|ns| format!("{ns:?}").to_lowercase())
                .collect(),
            infra_container: infra,
            cgroup_parent: handle.config.cgroup_parent.clone(),
            labels: handle.config.labels.clone(),
            members: member_reports,
            created_at: handle.config.created_at,
        })
    }

    pub async fn list(&self) -> Result<Vec<PodInspect>> {
        let ids: Vec<String> = self.pods.read().unwrap().keys().cloned().collect();
        let mut pods = Vec::with_capacity(ids.len());
        for id in ids {
            pods.push(self.inspect(&id).await?);
        }
        pods.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pods)
    }

    /// Aggregated `top` over all running members.
    pub async fn top(&self, name_or_id: &str) -> Result<TopReport> {
        let handle = self.handle(name_or_id)?;
        let members = handle.members.read().unwrap().clone();
        let mut report = TopReport {
            titles: vec!["PID".to_string(), "COMMAND".to_string()],
            processes: Vec::new(),
        };
        for id in members {
            if let Ok(member_top) = self.store.top(&id, &[]).await {
                report.processes.extend(member_top.processes);
            }
        }
        Ok(report)
    }

    /// Per-member stats.
    pub async fn stats(&self, name_or_id: &str) -> Result<Vec<ContainerStats>> {
        let handle = self.handle(name_or_id)?;
        let members = handle.members.read().unwrap().clone();
        let mut stats = Vec::with_capacity(members.len());
        for id in members {
            stats.push(self.store.stats(&id).await?);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{FakeRuntime, OciRuntime};
    use crate::storage::Storage;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        engine: EngineConfig,
        store: Arc<ContainerStore>,
        pods: PodCoordinator,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let engine = EngineConfig::rooted_at(dir.path());
        let storage = Storage::open(&engine.graph_root, &engine.run_root).unwrap();
        let runtime: Arc<dyn OciRuntime> = Arc::new(FakeRuntime::new());
        let events = EventBus::new();
        let store = Arc::new(ContainerStore::new(
            engine.clone(),
            storage,
            runtime,
            events.clone(),
        ));
        let pods = PodCoordinator::new(engine.clone(), store.clone(), events);
        Fixture {
            _dir: dir,
            engine,
            store,
            pods,
        }
    }

    async fn add_member(fixture: &Fixture, pod_id: &str, name: &str) -> String {
        let join = fixture.pods.join_info(pod_id).unwrap();
        let spec = ContainerSpec {
            name: Some(name.to_string()),
            rootfs: Some("/tmp/rootfs".into()),
            command: vec!["sleep".to_string(), "1".to_string()],
            ..Default::default()
        };
        let generated = generate(&spec, None, Some(&join), &fixture.engine).unwrap();
        let id = fixture.store.create(generated, vec![]).await.unwrap();
        fixture.pods.register_member(pod_id, &id).unwrap();
        id
    }

    #[tokio::test]
    async fn create_pod_with_infra() {
        let fixture = fixture();
        let pod = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let inspect = fixture.pods.inspect(&pod).await.unwrap();
        assert_eq!(inspect.name, "p1");
        assert!(inspect.infra_container.is_some());
        assert_eq!(inspect.state, PodState::Created);
        assert_eq!(inspect.members.len(), 1);
        assert!(inspect.members[0].is_infra);
    }

    #[tokio::test]
    async fn duplicate_pod_name_rejected() {
        let fixture = fixture();
        fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn start_orders_infra_first_and_stop_reverses() {
        let fixture = fixture();
        let pod = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let web = add_member(&fixture, &pod, "web").await;
        let db = add_member(&fixture, &pod, "db").await;
        let infra = fixture.pods.infra_id(&pod).unwrap().unwrap();

        let report = fixture.pods.start(&pod).await.unwrap();
        assert!(report.is_ok());
        let started: Vec<&str> = report.member_errs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(started[0], infra);
        assert_eq!(started[1], web);
        assert_eq!(started[2], db);

        assert_eq!(
            fixture.pods.inspect(&pod).await.unwrap().state,
            PodState::Running
        );

        let report = fixture.pods.stop(&pod, Some(0)).await.unwrap();
        let stopped: Vec<&str> = report.member_errs.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(stopped[0], db);
        assert_eq!(stopped[1], web);
        assert_eq!(stopped[2], infra);
        assert_eq!(
            fixture.pods.inspect(&pod).await.unwrap().state,
            PodState::Exited
        );
    }

    #[tokio::test]
    async fn start_twice_is_already_started() {
        let fixture = fixture();
        let pod = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        add_member(&fixture, &pod, "web").await;

        fixture.pods.start(&pod).await.unwrap();
        let err = fixture.pods.start(&pod).await.unwrap_err();
        assert!(matches!(err, Error::PodAlreadyStarted(_)));
        assert_eq!(err.http_status(), 304);
    }

    #[tokio::test]
    async fn stop_twice_is_already_stopped() {
        let fixture = fixture();
        let pod = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        add_member(&fixture, &pod, "web").await;
        fixture.pods.start(&pod).await.unwrap();
        fixture.pods.stop(&pod, Some(0)).await.unwrap();
        let err = fixture.pods.stop(&pod, Some(0)).await.unwrap_err();
        assert!(matches!(err, Error::PodAlreadyStopped(_)));
    }

    #[tokio::test]
    async fn kill_requires_running_member() {
        let fixture = fixture();
        let pod = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        add_member(&fixture, &pod, "web").await;

        let err = fixture.pods.kill(&pod, Signal::KILL).await.unwrap_err();
        assert_eq!(err.http_status(), 409);

        fixture.pods.start(&pod).await.unwrap();
        let report = fixture.pods.kill(&pod, Signal::KILL).await.unwrap();
        assert!(report.is_ok());
    }

    #[tokio::test]
    async fn remove_refuses_running_without_force() {
        let fixture = fixture();
        let pod = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        add_member(&fixture, &pod, "web").await;
        fixture.pods.start(&pod).await.unwrap();

        let err = fixture.pods.remove(&pod, false, false).await.unwrap_err();
        assert!(matches!(err, Error::CtrStateInvalid { .. }));

        let report = fixture.pods.remove(&pod, true, false).await.unwrap();
        assert!(report.is_ok());
        assert!(!fixture.pods.exists(&pod));
        // Members are gone too.
        assert!(!fixture.store.exists("web"));
    }

    #[tokio::test]
    async fn pod_state_stop_start_roundtrip() {
        let fixture = fixture();
        let pod = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        add_member(&fixture, &pod, "a").await;
        add_member(&fixture, &pod, "b").await;

        fixture.pods.start(&pod).await.unwrap();
        let before: Vec<_> = fixture
            .pods
            .inspect(&pod)
            .await
            .unwrap()
            .members
            .iter()
            .map(|m| (m.id.clone(), m.status))
            .collect();

        fixture.pods.stop(&pod, Some(0)).await.unwrap();
        fixture.pods.start(&pod).await.unwrap();
        let after: Vec<_> = fixture
            .pods
            .inspect(&pod)
            .await
            .unwrap()
            .members
            .iter()
            .map(|m| (m.id.clone(), m.status))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn pause_unpause_derives_paused_state() {
        let fixture = fixture();
        let pod = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("p1".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        add_member(&fixture, &pod, "web").await;
        fixture.pods.start(&pod).await.unwrap();

        fixture.pods.pause(&pod).await.unwrap();
        assert_eq!(
            fixture.pods.inspect(&pod).await.unwrap().state,
            PodState::Paused
        );
        fixture.pods.unpause(&pod).await.unwrap();
        assert_eq!(
            fixture.pods.inspect(&pod).await.unwrap().state,
            PodState::Running
        );
    }

    #[tokio::test]
    async fn prune_removes_only_non_running() {
        let fixture = fixture();
        let stopped = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("cold".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let running = fixture
            .pods
            .create(PodCreateOptions {
                name: Some("hot".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        add_member(&fixture, &running, "web").await;
        fixture.pods.start(&running).await.unwrap();

        let report = fixture.pods.prune().await.unwrap();
        assert!(report.removed.contains(&stopped));
        assert!(fixture.pods.exists(&running));
    }
}
