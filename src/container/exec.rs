//! Exec sessions.
//!
//! An exec session is created and owned by its parent container: it exists
//! only while the parent does, records its own exit command (the parent's
//! with `--exec` appended, then the session ID), and is reaped after an
//! idle delay once it stops.

use crate::config::EngineConfig;
use crate::constants::EXEC_SESSION_IDLE_TIMEOUT;
use crate::container::config::new_id;
use crate::container::state::ContainerStatus;
use crate::container::store::ContainerStore;
use crate::error::{Error, Result};
use crate::oci::OciRuntime;
use crate::specgen::exit_command_args;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// Lifecycle state of an exec session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecStatus {
    Created,
    Running,
    Stopped,
}

/// What to run and how to wire it. The field aliases accept the
/// Docker-schema body on the compat endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecConfig {
    #[serde(default, alias = "Cmd")]
    pub command: Vec<String>,
    #[serde(default, alias = "Tty")]
    pub tty: bool,
    #[serde(default, alias = "AttachStdin")]
    pub attach_stdin: bool,
    #[serde(default, alias = "AttachStdout")]
    pub attach_stdout: bool,
    #[serde(default, alias = "AttachStderr")]
    pub attach_stderr: bool,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "User")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "WorkingDir")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", alias = "DetachKeys")]
    pub detach_keys: Option<String>,
}

/// Inspect view of a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecInspect {
    pub id: String,
    pub container_id: String,
    pub config: ExecConfig,
    pub status: ExecStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
}

struct ExecSession {
    id: String,
    container_id: String,
    config: ExecConfig,
    status: ExecStatus,
    pid: Option<u32>,
    exit_code: Option<i32>,
    started_at: Option<DateTime<Utc>>,
    /// Desired TTY size, updated by resize.
    tty_size: Option<(u16, u16)>,
    /// Cleanup argv; the session ID is the final element.
    exit_command: Vec<String>,
}

/// Registry of exec sessions across all containers.
pub struct ExecSessionManager {
    engine: EngineConfig,
    store: Arc<ContainerStore>,
    runtime: Arc<dyn OciRuntime>,
    sessions: Arc<RwLock<HashMap<String, ExecSession>>>,
}

impl ExecSessionManager {
    pub fn new(
        engine: EngineConfig,
        store: Arc<ContainerStore>,
        runtime: Arc<dyn OciRuntime>,
    ) -> Self {
        Self {
            engine,
            store,
            runtime,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Creates a session. The parent must be Running; Paused is a state
    /// conflict, everything else is too.
    pub async fn create(&self, container: &str, config: ExecConfig) -> Result<String> {
        if config.command.is_empty() {
            return Err(Error::InvalidArg("exec requires a command".to_string()));
        }
        let container_id = self.store.resolve(container)?;
        let status = self.store.status(&container_id).await?;
        if !status.can_exec() {
            return Err(Error::CtrStateInvalid {
                id: container_id,
                state: status.to_string(),
                reason: "exec requires a running container".to_string(),
            });
        }

        let id = new_id();
        let mut exit_command = exit_command_args(&self.engine, false, true);
        exit_command.push(id.clone());

        let session = ExecSession {
            id: id.clone(),
            container_id: container_id.clone(),
            config,
            status: ExecStatus::Created,
            pid: None,
            exit_code: None,
            started_at: None,
            tty_size: None,
            exit_command,
        };
        self.sessions.write().unwrap().insert(id.clone(), session);
        debug!(session = %id, container = %container_id, "exec session created");
        Ok(id)
    }

    /// Starts a session detached.
    pub async fn start(&self, session_id: &str) -> Result<()> {
        let (container_id, config) = {
            let sessions = self.sessions.read().unwrap();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| Error::NoSuchExecSession(session_id.to_string()))?;
            if session.status != ExecStatus::Created {
                return Err(Error::CtrStateInvalid {
                    id: session_id.to_string(),
                    state: format!("{:?}", session.status).to_lowercase(),
                    reason: "exec session was already started".to_string(),
                });
            }
            (session.container_id.clone(), session.config.clone())
        };

        // Re-check the parent under its current state; it may have stopped
        // between create and start.
        let status = self.store.status(&container_id).await?;
        if status != ContainerStatus::Running {
            return Err(Error::CtrStateInvalid {
                id: container_id,
                state: status.to_string(),
                reason: "exec requires a running container".to_string(),
            });
        }

        let process_spec = self.write_process_spec(session_id, &container_id, &config)?;
        let pid = self
            .runtime
            .exec(&container_id, &process_spec, true)
            .await?;

        let mut sessions = self.sessions.write().unwrap();
        if let Some(session) = sessions.get_mut(session_id) {
            session.status = ExecStatus::Running;
            session.pid = Some(pid);
            session.started_at = Some(Utc::now());
        }
        info!(session = %session_id, container = %container_id, pid, "exec started");
        Ok(())
    }

    fn write_process_spec(
        &self,
        session_id: &str,
        container_id: &str,
        config: &ExecConfig,
    ) -> Result<std::path::PathBuf> {
        let userdata = self.store.storage().container_userdata(container_id);
        std::fs::create_dir_all(&userdata)?;
        let path = userdata.join(format!("exec-{session_id}.json"));

        let mut env: Vec<String> = config.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        env.sort();
        let process = serde_json::json!({
            "terminal": config.tty,
            "args": config.command,
            "env": env,
            "cwd": config.working_dir.as_deref().unwrap_or("/"),
            "user": { "uid": 0, "gid": 0 },
        });
        std::fs::write(&path, serde_json::to_vec_pretty(&process)?)?;
        Ok(path)
    }

    /// Runs a session to completion with captured output: the attached
    /// form of start. Marks the session stopped and schedules the idle
    /// reap before returning.
    pub async fn start_and_attach(
        &self,
        session_id: &str,
    ) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        let (container_id, config) = {
            let sessions = self.sessions.read().unwrap();
            let session = sessions
                .get(session_id)
                .ok_or_else(|| Error::NoSuchExecSession(session_id.to_string()))?;
            if session.status != ExecStatus::Created {
                return Err(Error::CtrStateInvalid {
                    id: session_id.to_string(),
                    state: format!("{:?}", session.status).to_lowercase(),
                    reason: "exec session was already started".to_string(),
                });
            }
            (session.container_id.clone(), session.config.clone())
        };

        let status = self.store.status(&container_id).await?;
        if status != ContainerStatus::Running {
            return Err(Error::CtrStateInvalid {
                id: container_id,
                state: status.to_string(),
                reason: "exec requires a running container".to_string(),
            });
        }

        {
            let mut sessions = self.sessions.write().unwrap();
            if let Some(session) = sessions.get_mut(session_id) {
                session.status = ExecStatus::Running;
                session.started_at = Some(Utc::now());
            }
        }

        let process_spec = self.write_process_spec(session_id, &container_id, &config)?;
        let (exit_code, stdout, stderr) = self
            .runtime
            .exec_attached(&container_id, &process_spec)
            .await?;
        self.mark_stopped(session_id, exit_code)?;
        Ok((exit_code, stdout, stderr))
    }

    pub fn inspect(&self, session_id: &str) -> Result<ExecInspect> {
        let sessions = self.sessions.read().unwrap();
        let session = sessions
            .get(session_id)
            .ok_or_else(|| Error::NoSuchExecSession(session_id.to_string()))?;
        Ok(ExecInspect {
            id: session.id.clone(),
            container_id: session.container_id.clone(),
            config: session.config.clone(),
            status: session.status,
            pid: session.pid,
            exit_code: session.exit_code,
            started_at: session.started_at,
        })
    }

    /// Records a new TTY size for the session.
    pub fn resize(&self, session_id: &str, height: u16, width: u16) -> Result<()> {
        let mut sessions = self.sessions.write().unwrap();
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| Error::NoSuchExecSession(session_id.to_string()))?;
        if session.status != ExecStatus::Running {
            return Err(Error::CtrStateInvalid {
                id: session_id.to_string(),
                state: format!("{:?}", session.status).to_lowercase(),
                reason: "can only resize running exec sessions".to_string(),
            });
        }
        session.tty_size = Some((height, width));
        Ok(())
    }

    /// Marks a session stopped (the cleanup process calls this through the
    /// session's exit command) and schedules the idle reap.
    pub fn mark_stopped(&self, session_id: &str, exit_code: i32) -> Result<()> {
        {
            let mut sessions = self.sessions.write().unwrap();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::NoSuchExecSession(session_id.to_string()))?;
            session.status = ExecStatus::Stopped;
            session.exit_code = Some(exit_code);
        }

        let sessions = Arc::clone(&self.sessions);
        let id = session_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(EXEC_SESSION_IDLE_TIMEOUT).await;
            let mut sessions = sessions.write().unwrap();
            if let Some(session) = sessions.get(&id) {
                if session.status == ExecStatus::Stopped {
                    sessions.remove(&id);
                    debug!(session = %id, "idle exec session reaped");
                }
            }
        });
        Ok(())
    }

    /// The session's cleanup argv (ends with `--exec <session-id>`).
    pub fn exit_command(&self, session_id: &str) -> Result<Vec<String>> {
        let sessions = self.sessions.read().unwrap();
        sessions
            .get(session_id)
            .map(|s| s.exit_command.clone())
            .ok_or_else(|| Error::NoSuchExecSession(session_id.to_string()))
    }

    /// Cascade: drops every session owned by a removed container.
    pub fn remove_for_container(&self, container_id: &str) -> usize {
        let mut sessions = self.sessions.write().unwrap();
        let before = sessions.len();
        sessions.retain(|_, s| s.container_id != container_id);
        before - sessions.len()
    }

    /// Session IDs belonging to a container.
    pub fn sessions_for_container(&self, container_id: &str) -> Vec<String> {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|s| s.container_id == container_id)
            .map(|s| s.id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::oci::FakeRuntime;
    use crate::specgen::{generate, ContainerSpec};
    use crate::storage::Storage;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        store: Arc<ContainerStore>,
        manager: ExecSessionManager,
    }

    async fn fixture_with_running(name: &str) -> (Fixture, String) {
        let dir = TempDir::new().unwrap();
        let engine = EngineConfig::rooted_at(dir.path());
        let storage = Storage::open(&engine.graph_root, &engine.run_root).unwrap();
        let runtime: Arc<dyn OciRuntime> = Arc::new(FakeRuntime::new());
        let store = Arc::new(ContainerStore::new(
            engine.clone(),
            storage,
            runtime.clone(),
            EventBus::new(),
        ));
        let manager = ExecSessionManager::new(engine.clone(), store.clone(), runtime);

        let spec = ContainerSpec {
            name: Some(name.to_string()),
            rootfs: Some("/tmp/rootfs".into()),
            command: vec!["sleep".to_string(), "9".to_string()],
            ..Default::default()
        };
        let generated = generate(&spec, None, None, &engine).unwrap();
        let id = store.create(generated, vec![]).await.unwrap();
        store.start(&id).await.unwrap();

        (
            Fixture {
                _dir: dir,
                store,
                manager,
            },
            id,
        )
    }

    fn exec_config() -> ExecConfig {
        ExecConfig {
            command: vec!["ls".to_string(), "/".to_string()],
            attach_stdout: true,
            attach_stderr: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_start_inspect() {
        let (fixture, container) = fixture_with_running("c1").await;
        let session = fixture
            .manager
            .create(&container, exec_config())
            .await
            .unwrap();

        let inspect = fixture.manager.inspect(&session).unwrap();
        assert_eq!(inspect.status, ExecStatus::Created);
        assert_eq!(inspect.container_id, container);

        fixture.manager.start(&session).await.unwrap();
        let inspect = fixture.manager.inspect(&session).unwrap();
        assert_eq!(inspect.status, ExecStatus::Running);
        assert!(inspect.pid.is_some());
    }

    #[tokio::test]
    async fn create_rejects_paused_parent() {
        let (fixture, container) = fixture_with_running("c1").await;
        fixture.store.pause(&container).await.unwrap();
        let err = fixture
            .manager
            .create(&container, exec_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::CtrStateInvalid { .. }));
        assert_eq!(err.http_status(), 409);
    }

    #[tokio::test]
    async fn create_rejects_empty_command() {
        let (fixture, container) = fixture_with_running("c1").await;
        let err = fixture
            .manager
            .create(&container, ExecConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArg(_)));
    }

    #[tokio::test]
    async fn exit_command_ends_with_exec_and_session_id() {
        let (fixture, container) = fixture_with_running("c1").await;
        let session = fixture
            .manager
            .create(&container, exec_config())
            .await
            .unwrap();
        let argv = fixture.manager.exit_command(&session).unwrap();
        let n = argv.len();
        assert_eq!(argv[n - 2], "--exec");
        assert_eq!(argv[n - 1], session);
        assert!(argv.iter().any(|a| a == "cleanup"));
    }

    #[tokio::test]
    async fn resize_requires_running_session() {
        let (fixture, container) = fixture_with_running("c1").await;
        let session = fixture
            .manager
            .create(&container, exec_config())
            .await
            .unwrap();
        assert!(fixture.manager.resize(&session, 24, 80).is_err());
        fixture.manager.start(&session).await.unwrap();
        fixture.manager.resize(&session, 24, 80).unwrap();
    }

    #[tokio::test]
    async fn parent_removal_cascades() {
        let (fixture, container) = fixture_with_running("c1").await;
        let s1 = fixture
            .manager
            .create(&container, exec_config())
            .await
            .unwrap();
        let s2 = fixture
            .manager
            .create(&container, exec_config())
            .await
            .unwrap();
        assert_eq!(fixture.manager.sessions_for_container(&container).len(), 2);

        let removed = fixture.manager.remove_for_container(&container);
        assert_eq!(removed, 2);
        assert!(fixture.manager.inspect(&s1).is_err());
        assert!(fixture.manager.inspect(&s2).is_err());
    }

    #[tokio::test]
    async fn mark_stopped_records_exit_code() {
        let (fixture, container) = fixture_with_running("c1").await;
        let session = fixture
            .manager
            .create(&container, exec_config())
            .await
            .unwrap();
        fixture.manager.start(&session).await.unwrap();
        fixture.manager.mark_stopped(&session, 2).unwrap();
        let inspect = fixture.manager.inspect(&session).unwrap();
        assert_eq!(inspect.status, ExecStatus::Stopped);
        assert_eq!(inspect.exit_code, Some(2));
    }
}
