//! Docker-compatible schema translation.
//!
//! The same operations as the native tree, with request and response
//! shapes matching the historical Docker Engine API: slash-prefixed names,
//! `KEY=VALUE` env lists, `Up 3 seconds` status strings, and the
//! `{"Volumes": [...], "Warnings": [...]}` envelope.

use super::{ApiResult, AppState};
use crate::container::state::ContainerStatus;
use crate::engine::{ContainerEngine, ImageEngine};
use crate::error::Error;
use crate::image::pull::{PullOptions, PullPolicy};
use crate::specgen::ContainerSpec;
use crate::volume::{VolumeCreateOptions, VolumeFilters};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;

// =============================================================================
// System
// =============================================================================

pub async fn version(State(state): State<AppState>) -> ApiResult<Response> {
    let native = state.engine.version().await?;
    Ok(Json(serde_json::json!({
        "Version": native.version.clone(),
        "ApiVersion": crate::constants::COMPAT_API_VERSION,
        "MinAPIVersion": crate::constants::COMPAT_API_MIN_VERSION,
        "Os": native.os,
        "Arch": native.arch,
        "Components": [{
            "Name": "caravel",
            "Version": native.version,
        }],
    }))
    .into_response())
}

pub async fn info(State(state): State<AppState>) -> ApiResult<Response> {
    let native = state.engine.info().await?;
    Ok(Json(serde_json::json!({
        "Containers": native.containers,
        "Images": native.images,
        "OSType": native.version.os,
        "Architecture": native.version.arch,
        "ServerVersion": native.version.version,
        "DockerRootDir": native.graph_root,
        "CgroupDriver": native.cgroup_manager,
        "Rootless": native.rootless,
        "Swarm": { "LocalNodeState": "inactive" },
    }))
    .into_response())
}

// =============================================================================
// Containers
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct CompatListQuery {
    #[serde(default)]
    pub all: bool,
}

pub async fn container_list(
    State(state): State<AppState>,
    Query(query): Query<CompatListQuery>,
) -> ApiResult<Response> {
    let list = state.engine.container_list(query.all).await?;
    let summaries: Vec<serde_json::Value> = list
        .iter()
        .map(|c| {
            serde_json::json!({
                "Id": c.id.clone(),
                "Names": c.names.iter().map(|n| format!("/{n}")).collect::<Vec<_>>(),
                "Image": c.image.clone().unwrap_or_default(),
                "Command": c.command.join(" "),
                "Created": c.created_at.timestamp(),
                "State": compat_state(c.status),
                "Status": compat_status(c.status, c.started_at, c.exit_code),
                "Labels": c.labels.clone(),
                "Ports": c.ports.iter().map(|p| serde_json::json!({
                    "PrivatePort": p.container_port,
                    "PublicPort": p.host_port,
                    "Type": p.protocol.clone(),
                })).collect::<Vec<_>>(),
            })
        })
        .collect();
    Ok(Json(summaries).into_response())
}

fn compat_state(status: ContainerStatus) -> &'static str {
    match status {
        ContainerStatus::Configured | ContainerStatus::Created => "created",
        ContainerStatus::Running => "running",
        ContainerStatus::Paused => "paused",
        ContainerStatus::Removing => "removing",
        ContainerStatus::Stopped | ContainerStatus::Exited => "exited",
    }
}

fn compat_status(
    status: ContainerStatus,
    started_at: Option<chrono::DateTime<chrono::Utc>>,
    exit_code: Option<i32>,
) -> String {
    match status {
        ContainerStatus::Running => match started_at {
            Some(started) => {
                let seconds = (chrono::Utc::now() - started).num_seconds().max(0);
                format!("Up {seconds} seconds")
            }
            None => "Up".to_string(),
        },
        ContainerStatus::Paused => "Paused".to_string(),
        ContainerStatus::Exited | ContainerStatus::Stopped => {
            format!("Exited ({})", exit_code.unwrap_or(0))
        }
        _ => "Created".to_string(),
    }
}

/// Docker container create body, translated field by field.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CompatCreateBody {
    #[serde(rename = "Image")]
    pub image: String,
    #[serde(rename = "Cmd")]
    pub cmd: Option<Vec<String>>,
    #[serde(rename = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(rename = "Env")]
    pub env: Option<Vec<String>>,
    #[serde(rename = "WorkingDir")]
    pub working_dir: Option<String>,
    #[serde(rename = "User")]
    pub user: Option<String>,
    #[serde(rename = "Hostname")]
    pub hostname: Option<String>,
    #[serde(rename = "Labels")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(rename = "Tty")]
    pub tty: bool,
    #[serde(rename = "OpenStdin")]
    pub open_stdin: bool,
    #[serde(rename = "StopSignal")]
    pub stop_signal: Option<String>,
    #[serde(rename = "StopTimeout")]
    pub stop_timeout: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct CompatCreateQuery {
    pub name: Option<String>,
}

pub async fn container_create(
    State(state): State<AppState>,
    Query(query): Query<CompatCreateQuery>,
    Json(body): Json<CompatCreateBody>,
) -> ApiResult<Response> {
    if body.image.is_empty() {
        return Err(Error::InvalidArg("Image is required".to_string()).into());
    }
    let env = body
        .env
        .unwrap_or_default()
        .into_iter()
        .filter_map(|kv| {
            kv.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect();

    let spec = ContainerSpec {
        name: query.name,
        image: Some(body.image),
        command: body.cmd.unwrap_or_default(),
        entrypoint: body.entrypoint,
        env,
        labels: body.labels.unwrap_or_default(),
        working_dir: body.working_dir,
        user: body.user,
        hostname: body.hostname,
        tty: body.tty,
        stdin: body.open_stdin,
        stop_signal: body.stop_signal,
        stop_timeout: body.stop_timeout,
        ..Default::default()
    };
    let id = state.engine.container_create(spec).await?;
    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "Id": id, "Warnings": [] })),
    )
        .into_response())
}

pub async fn container_inspect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let inspect = state.engine.container_inspect(&name).await?;
    let env: Vec<String> = inspect
        .config
        .env
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    Ok(Json(serde_json::json!({
        "Id": inspect.id,
        "Name": format!("/{}", inspect.name),
        "Created": inspect.created_at.to_rfc3339(),
        "State": {
            "Status": compat_state(inspect.state.status),
            "Running": inspect.state.status == ContainerStatus::Running,
            "Paused": inspect.state.status == ContainerStatus::Paused,
            "Pid": inspect.state.pid.unwrap_or(0),
            "ExitCode": inspect.state.exit_code.unwrap_or(0),
            "StartedAt": inspect.state.started_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
            "FinishedAt": inspect.state.finished_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        },
        "Config": {
            "Image": inspect.config.image.clone().unwrap_or_default(),
            "Cmd": inspect.config.command,
            "Entrypoint": inspect.config.entrypoint,
            "Env": env,
            "WorkingDir": inspect.config.working_dir.clone().unwrap_or_default(),
            "Labels": inspect.config.labels,
            "Tty": inspect.config.tty,
        },
        "HostConfig": {
            "RestartPolicy": { "Name": "no" },
        },
    }))
    .into_response())
}

pub async fn container_wait(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let report = state.engine.container_wait(&name, &[]).await?;
    Ok(Json(serde_json::json!({ "StatusCode": report.exit_code })).into_response())
}

// =============================================================================
// Images
// =============================================================================

pub async fn image_list(State(state): State<AppState>) -> ApiResult<Response> {
    let list = state.engine.image_list(None).await?;
    let summaries: Vec<serde_json::Value> = list
        .iter()
        .map(|i| {
            serde_json::json!({
                "Id": i.digest.clone(),
                "RepoTags": i.tags.clone(),
                "Created": i.created_at.timestamp(),
                "Size": i.size,
                "ParentId": i.parent.clone().unwrap_or_default(),
                "Labels": {},
            })
        })
        .collect();
    Ok(Json(summaries).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ImageCreateQuery {
    #[serde(rename = "fromImage")]
    pub from_image: Option<String>,
    pub tag: Option<String>,
}

/// `POST /images/create?fromImage=&tag=` is Docker's pull.
pub async fn image_create(
    State(state): State<AppState>,
    Query(query): Query<ImageCreateQuery>,
) -> ApiResult<Response> {
    let from = query
        .from_image
        .ok_or_else(|| Error::InvalidArg("fromImage is required".to_string()))?;
    let reference = match &query.tag {
        Some(tag) => format!("{from}:{tag}"),
        None => from,
    };
    let opts = PullOptions {
        policy: PullPolicy::Always,
        ..Default::default()
    };
    let images = state.engine.image_pull(&reference, opts).await?;
    Ok(Json(serde_json::json!({
        "status": format!("Downloaded newer image for {reference}"),
        "images": images,
    }))
    .into_response())
}

// =============================================================================
// Volumes
// =============================================================================

pub async fn volume_list(State(state): State<AppState>) -> ApiResult<Response> {
    let volumes = state.engine.volume_list(VolumeFilters::default()).await?;
    let entries: Vec<serde_json::Value> = volumes.iter().map(compat_volume).collect();
    Ok(Json(serde_json::json!({
        "Volumes": entries,
        "Warnings": [],
    }))
    .into_response())
}

fn compat_volume(v: &crate::reports::VolumeInspect) -> serde_json::Value {
    serde_json::json!({
        "Name": v.name.clone(),
        "Driver": v.driver.clone(),
        "Mountpoint": v.mountpoint.clone(),
        "Labels": v.labels.clone(),
        "Options": v.options.clone(),
        "Scope": v.scope.clone(),
        "CreatedAt": v.created_at.to_rfc3339(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CompatVolumeBody {
    #[serde(rename = "Name")]
    pub name: Option<String>,
    #[serde(rename = "Driver")]
    pub driver: Option<String>,
    #[serde(rename = "Labels")]
    pub labels: Option<HashMap<String, String>>,
    #[serde(rename = "DriverOpts")]
    pub driver_opts: Option<HashMap<String, String>>,
}

pub async fn volume_create(
    State(state): State<AppState>,
    Json(body): Json<CompatVolumeBody>,
) -> ApiResult<Response> {
    let volume = state
        .engine
        .volume_create(VolumeCreateOptions {
            name: body.name,
            driver: body.driver,
            labels: body.labels.unwrap_or_default(),
            options: body.driver_opts.unwrap_or_default(),
        })
        .await?;
    Ok((StatusCode::CREATED, Json(compat_volume(&volume))).into_response())
}

#[derive(Debug, Deserialize)]
pub struct CompatVolumeRmQuery {
    #[serde(default)]
    pub force: bool,
}

/// Docker-compat volume removal. `force` here strictly means "don't error
/// when the volume is absent". It never detaches a volume in use, same as
/// the native endpoint.
pub async fn volume_rm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<CompatVolumeRmQuery>,
) -> ApiResult<Response> {
    state.engine.volume_rm(&name, query.force).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compat_state_strings() {
        assert_eq!(compat_state(ContainerStatus::Running), "running");
        assert_eq!(compat_state(ContainerStatus::Configured), "created");
        assert_eq!(compat_state(ContainerStatus::Stopped), "exited");
    }

    #[test]
    fn compat_status_text() {
        let status = compat_status(ContainerStatus::Exited, None, Some(137));
        assert_eq!(status, "Exited (137)");

        let status = compat_status(
            ContainerStatus::Running,
            Some(chrono::Utc::now() - chrono::Duration::seconds(3)),
            None,
        );
        assert!(status.starts_with("Up "));
    }

    #[test]
    fn compat_create_body_translates_env() {
        let body: CompatCreateBody = serde_json::from_value(serde_json::json!({
            "Image": "alpine",
            "Cmd": ["sleep", "100"],
            "Env": ["A=1", "B=2"],
        }))
        .unwrap();
        assert_eq!(body.image, "alpine");
        assert_eq!(body.env.unwrap().len(), 2);
    }
}
