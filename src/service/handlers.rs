//! Native-schema handlers: containers, exec sessions, pods.
//!
//! Query strings decode through typed serde extractors; bodies are JSON.
//! Attach and exec-start answer 101 and continue on the upgraded
//! connection with the frame protocol.

use super::{ApiResult, AppState};
use crate::attach::{broker, AttachConfig, AttachIo, Channel};
use crate::container::exec::ExecConfig;
use crate::container::state::WaitCondition;
use crate::container::store::{LogOptions, RemoveOptions};
use crate::engine::ContainerEngine;
use crate::error::Error;
use crate::pod::PodCreateOptions;
use crate::specgen::ContainerSpec;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::{debug, warn};

fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

// =============================================================================
// System
// =============================================================================

pub async fn ping() -> Response {
    (
        StatusCode::OK,
        [("Content-Type", "text/plain")],
        "OK".to_string(),
    )
        .into_response()
}

// =============================================================================
// Containers
// =============================================================================

pub async fn container_create(
    State(state): State<AppState>,
    Json(spec): Json<ContainerSpec>,
) -> ApiResult<Response> {
    let id = state.engine.container_create(spec).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub all: bool,
}

pub async fn container_list(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Response> {
    let list = state.engine.container_list(query.all).await?;
    Ok(Json(list).into_response())
}

pub async fn container_exists(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    if state.engine.container_exists(&name).await?.value {
        Ok(no_content())
    } else {
        Err(Error::NoSuchContainer(name).into())
    }
}

pub async fn container_inspect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.container_inspect(&name).await?).into_response())
}

pub async fn container_init(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.engine.container_init(&name).await?;
    Ok(no_content())
}

/// Single-target start. An already-running container surfaces as 304.
pub async fn container_start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.engine.start_one(&name).await?;
    Ok(no_content())
}

#[derive(Debug, Deserialize)]
pub struct StopQuery {
    pub t: Option<u64>,
    #[serde(default)]
    pub ignore: bool,
}

/// Single-target stop. Already-stopped surfaces as 304.
pub async fn container_stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<StopQuery>,
) -> ApiResult<Response> {
    match state.engine.container_store().stop(&name, query.t).await {
        Ok(()) => Ok(no_content()),
        Err(Error::NoSuchContainer(_)) if query.ignore => Ok(no_content()),
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct KillQuery {
    #[serde(default = "default_signal")]
    pub signal: String,
}

fn default_signal() -> String {
    "SIGKILL".to_string()
}

pub async fn container_kill(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<KillQuery>,
) -> ApiResult<Response> {
    let signal = crate::oci::Signal::parse(&query.signal)?;
    state.engine.container_store().kill(&name, signal).await?;
    Ok(no_content())
}

pub async fn container_pause(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.engine.container_store().pause(&name).await?;
    Ok(no_content())
}

pub async fn container_unpause(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.engine.container_store().unpause(&name).await?;
    Ok(no_content())
}

#[derive(Debug, Deserialize)]
pub struct RestartQuery {
    pub t: Option<u64>,
}

pub async fn container_restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RestartQuery>,
) -> ApiResult<Response> {
    state
        .engine
        .container_store()
        .restart(&name, query.t)
        .await?;
    Ok(no_content())
}

#[derive(Debug, Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
    #[serde(default, rename = "v")]
    pub volumes: bool,
    #[serde(default)]
    pub ignore: bool,
}

pub async fn container_rm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> ApiResult<Response> {
    let reports = state
        .engine
        .container_rm(
            &[name.clone()],
            RemoveOptions {
                force: query.force,
                volumes: query.volumes,
                ignore: query.ignore,
            },
        )
        .await?;
    if let Some(err) = reports.first().and_then(|r| r.err.as_ref()) {
        // Classified at the store; re-parse the kind for the status code.
        if err.contains("no such container") {
            return Err(Error::NoSuchContainer(name).into());
        }
        return Err(Error::CtrStateInvalid {
            id: name,
            state: "unknown".to_string(),
            reason: err.clone(),
        }
        .into());
    }
    Ok(no_content())
}

pub async fn container_prune(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.engine.container_prune().await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct WaitQuery {
    /// Comma-separated condition list; empty means exited.
    pub condition: Option<String>,
}

pub async fn container_wait(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<WaitQuery>,
) -> ApiResult<Response> {
    let mut conditions = Vec::new();
    for c in query
        .condition
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|c| !c.is_empty())
    {
        let parsed: WaitCondition =
            serde_json::from_value(serde_json::Value::String(c.to_string()))
                .map_err(|_| Error::InvalidArg(format!("invalid wait condition: {c:?}")))?;
        conditions.push(parsed);
    }
    let report = state.engine.container_wait(&name, &conditions).await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default)]
    pub follow: bool,
    pub since: Option<String>,
    pub until: Option<String>,
    pub tail: Option<usize>,
    #[serde(default)]
    pub timestamps: bool,
}

pub async fn container_logs(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Response> {
    let parse_time = |s: &Option<String>| -> ApiResult<Option<chrono::DateTime<chrono::Utc>>> {
        match s {
            None => Ok(None),
            Some(raw) => chrono::DateTime::parse_from_rfc3339(raw)
                .map(|t| Some(t.with_timezone(&chrono::Utc)))
                .map_err(|_| Error::InvalidArg(format!("invalid timestamp: {raw:?}")).into()),
        }
    };
    let opts = LogOptions {
        follow: query.follow,
        since: parse_time(&query.since)?,
        until: parse_time(&query.until)?,
        tail: query.tail,
        timestamps: query.timestamps,
    };
    let entries = state.engine.container_logs(&name, &opts).await?;
    Ok(Json(entries).into_response())
}

pub async fn container_top(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.container_top(&name).await?).into_response())
}

pub async fn container_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.container_stats(&name).await?).into_response())
}

pub async fn container_diff(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.container_diff(&name).await?).into_response())
}

pub async fn container_port(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.container_port(&name).await?).into_response())
}

pub async fn container_export(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let mut tarball = Vec::new();
    state
        .engine
        .container_store()
        .export(&name, &mut tarball)
        .await?;
    Ok((
        StatusCode::OK,
        [("Content-Type", "application/x-tar")],
        tarball,
    )
        .into_response())
}

#[derive(Debug, Deserialize)]
pub struct CommitQuery {
    pub container: String,
    pub repo: Option<String>,
}

pub async fn container_commit(
    State(state): State<AppState>,
    Query(query): Query<CommitQuery>,
) -> ApiResult<Response> {
    let id = state
        .engine
        .container_commit(&query.container, query.repo.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CheckpointQuery {
    #[serde(default, rename = "leaveRunning")]
    pub leave_running: bool,
}

pub async fn container_checkpoint(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<CheckpointQuery>,
) -> ApiResult<Response> {
    state
        .engine
        .container_checkpoint(&name, query.leave_running)
        .await?;
    Ok(no_content())
}

pub async fn container_restore(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    state.engine.container_restore(&name).await?;
    Ok(no_content())
}

#[derive(Debug, Deserialize)]
pub struct ResizeQuery {
    pub h: u16,
    pub w: u16,
}

/// TTY resize side channel. The PTY itself is the monitor process's; the
/// engine records the requested size.
pub async fn container_resize(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ResizeQuery>,
) -> ApiResult<Response> {
    // Existence check keeps 404 semantics; the size itself is advisory
    // because the monitor process owns the PTY.
    if !state.engine.container_exists(&name).await?.value {
        return Err(Error::NoSuchContainer(name).into());
    }
    debug!(container = %name, h = query.h, w = query.w, "resize");
    Ok(no_content())
}

// =============================================================================
// Attach
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct AttachQuery {
    #[serde(default)]
    pub stdin: bool,
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default = "default_true")]
    pub stderr: bool,
    #[serde(rename = "detachKeys")]
    pub detach_keys: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Hijacks the connection: 101, then container output as frames (or raw
/// bytes for TTY containers) on the upgraded stream.
pub async fn container_attach(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<AttachQuery>,
    request: axum::extract::Request,
) -> ApiResult<Response> {
    let inspect = state.engine.container_inspect(&name).await?;
    if inspect.state.status != crate::container::state::ContainerStatus::Running
        && inspect.state.status != crate::container::state::ContainerStatus::Created
    {
        return Err(Error::CtrStateInvalid {
            id: name,
            state: inspect.state.status.to_string(),
            reason: "can only attach to created or running containers".to_string(),
        }
        .into());
    }

    let config = AttachConfig {
        stdin: query.stdin,
        stdout: query.stdout,
        stderr: query.stderr,
        tty: inspect.config.tty,
        detach_keys: crate::attach::parse_detach_keys(
            query.detach_keys.as_deref().unwrap_or(""),
        )?,
    };

    // Wire the container's log stream into the broker as output frames.
    let follow = state
        .engine
        .container_store()
        .logs_follow(&name, LogOptions {
            follow: true,
            ..Default::default()
        })
        .await?;

    let upgrade = hyper::upgrade::on(request);
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(u) => u,
            Err(e) => {
                warn!("attach upgrade failed: {e}");
                return;
            }
        };
        let stream = hyper_util::rt::TokioIo::new(upgraded);

        let (out_tx, out_rx) = tokio::sync::mpsc::channel(64);
        let mut follow = follow;
        tokio::spawn(async move {
            while let Some(entry) = follow.recv().await {
                let channel = if entry.stream == "stderr" {
                    Channel::Stderr
                } else {
                    Channel::Stdout
                };
                if out_tx
                    .send((channel, entry.message.into_bytes()))
                    .await
                    .is_err()
                {
                    return;
                }
            }
        });

        let io = AttachIo {
            output: out_rx,
            stdin: None,
        };
        if let Err(e) = broker(stream, config, io).await {
            debug!("attach ended: {e}");
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "tcp")
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

// =============================================================================
// Exec
// =============================================================================

pub async fn exec_create(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(config): Json<ExecConfig>,
) -> ApiResult<Response> {
    let id = state.engine.exec_create(&name, config).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ExecStartQuery {
    #[serde(default)]
    pub detach: bool,
}

/// Starts an exec session. Detached: 204 once the process is off. Attached:
/// hijack the connection, run to completion, stream captured output as
/// frames, then close.
pub async fn exec_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExecStartQuery>,
    request: axum::extract::Request,
) -> ApiResult<Response> {
    if query.detach {
        state.engine.exec_start(&id).await?;
        return Ok(no_content());
    }

    // Fail before hijacking when the session cannot start.
    state.engine.exec_inspect(&id).await?;

    let engine = state.engine.clone();
    let upgrade = hyper::upgrade::on(request);
    tokio::spawn(async move {
        let upgraded = match upgrade.await {
            Ok(u) => u,
            Err(e) => {
                warn!("exec upgrade failed: {e}");
                return;
            }
        };
        let mut stream = hyper_util::rt::TokioIo::new(upgraded);
        match engine.exec_start_attached(&id).await {
            Ok((_exit, stdout, stderr)) => {
                if !stdout.is_empty() {
                    let _ = crate::attach::write_frame(
                        &mut stream,
                        Channel::Stdout,
                        &stdout,
                    )
                    .await;
                }
                if !stderr.is_empty() {
                    let _ = crate::attach::write_frame(
                        &mut stream,
                        Channel::Stderr,
                        &stderr,
                    )
                    .await;
                }
            }
            Err(e) => {
                let _ = crate::attach::write_frame(
                    &mut stream,
                    Channel::AsyncError,
                    e.to_string().as_bytes(),
                )
                .await;
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "tcp")
        .body(axum::body::Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

pub async fn exec_inspect(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.exec_inspect(&id).await?).into_response())
}

pub async fn exec_resize(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ResizeQuery>,
) -> ApiResult<Response> {
    state.engine.exec_resize(&id, query.h, query.w).await?;
    Ok(no_content())
}

// =============================================================================
// Pods
// =============================================================================

pub async fn pod_create(
    State(state): State<AppState>,
    Json(opts): Json<PodCreateOptions>,
) -> ApiResult<Response> {
    let id = state.engine.pod_create(opts).await?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response())
}

pub async fn pod_list(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_list().await?).into_response())
}

pub async fn pod_exists(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    if state.engine.pod_exists(&name).await?.value {
        Ok(no_content())
    } else {
        Err(Error::NoSuchPod(name).into())
    }
}

pub async fn pod_inspect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_inspect(&name).await?).into_response())
}

pub async fn pod_start(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_start(&name).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PodStopQuery {
    pub t: Option<u64>,
}

pub async fn pod_stop(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PodStopQuery>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_stop(&name, query.t).await?).into_response())
}

pub async fn pod_kill(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<KillQuery>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_kill(&name, &query.signal).await?).into_response())
}

pub async fn pod_pause(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_pause(&name).await?).into_response())
}

pub async fn pod_unpause(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_unpause(&name).await?).into_response())
}

pub async fn pod_restart(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_restart(&name).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PodRmQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn pod_rm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PodRmQuery>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_rm(&name, query.force, false).await?).into_response())
}

pub async fn pod_prune(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_prune().await?).into_response())
}

pub async fn pod_top(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_top(&name).await?).into_response())
}

pub async fn pod_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.pod_stats(&name).await?).into_response())
}
