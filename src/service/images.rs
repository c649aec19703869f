//! Native-schema handlers: images, volumes, system.

use super::{ApiResult, AppState};
use crate::engine::{ContainerEngine, ImageEngine};
use crate::error::Error;
use crate::events::{EventFilter, EventKind};
use crate::image::pull::{PullOptions, PullPolicy};
use crate::volume::{VolumeCreateOptions, VolumeFilters};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use std::collections::HashMap;

fn no_content() -> Response {
    StatusCode::NO_CONTENT.into_response()
}

// =============================================================================
// Images
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct ImageListQuery {
    pub filter: Option<String>,
}

pub async fn image_list(
    State(state): State<AppState>,
    Query(query): Query<ImageListQuery>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.image_list(query.filter.as_deref()).await?).into_response())
}

pub async fn image_exists(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    if state.engine.image_exists(&name).await?.value {
        Ok(no_content())
    } else {
        Err(Error::NoSuchImage(name).into())
    }
}

pub async fn image_inspect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.image_inspect(&name).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PullQuery {
    pub reference: String,
    pub policy: Option<String>,
    #[serde(default, rename = "allTags")]
    pub all_tags: bool,
    pub arch: Option<String>,
    pub os: Option<String>,
    #[serde(rename = "tlsVerify")]
    pub tls_verify: Option<bool>,
}

pub async fn image_pull(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> ApiResult<Response> {
    let opts = PullOptions {
        policy: PullPolicy::parse(query.policy.as_deref().unwrap_or(""))?,
        creds: None,
        tls_verify: query.tls_verify,
        arch: query.arch,
        os: query.os,
        all_tags: query.all_tags,
    };
    let images = state.engine.image_pull(&query.reference, opts).await?;
    Ok(Json(serde_json::json!({ "images": images })).into_response())
}

#[derive(Debug, Deserialize)]
pub struct PushQuery {
    #[serde(rename = "tlsVerify")]
    pub tls_verify: Option<bool>,
}

pub async fn image_push(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<PushQuery>,
) -> ApiResult<Response> {
    let opts = PullOptions {
        tls_verify: query.tls_verify,
        ..Default::default()
    };
    let url = state.engine.image_push(&name, opts).await?;
    Ok((StatusCode::OK, url).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TagQuery {
    pub target: String,
}

pub async fn image_tag(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Response> {
    state.engine.image_tag(&name, &query.target).await?;
    Ok((StatusCode::CREATED, ()).into_response())
}

pub async fn image_untag(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TagQuery>,
) -> ApiResult<Response> {
    state.engine.image_untag(&name, &query.target).await?;
    Ok((StatusCode::CREATED, ()).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ImageRemoveQuery {
    /// Comma-separated references.
    pub images: Option<String>,
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub all: bool,
}

pub async fn image_remove_bulk(
    State(state): State<AppState>,
    Query(query): Query<ImageRemoveQuery>,
) -> ApiResult<Response> {
    let references: Vec<String> = query
        .images
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    let report = state
        .engine
        .image_remove(&references, query.force, query.all)
        .await?;
    Ok(Json(report).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ImageRemoveOneQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn image_remove_one(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<ImageRemoveOneQuery>,
) -> ApiResult<Response> {
    let report = state
        .engine
        .image_remove(&[name.clone()], query.force, false)
        .await?;
    match report.exit_code {
        0 => Ok(Json(report).into_response()),
        1 => Err(Error::NoSuchImage(name).into()),
        _ => Err(Error::ImageInUse {
            id: name,
            reason: report.errors.join("; "),
        }
        .into()),
    }
}

#[derive(Debug, Deserialize)]
pub struct ImagePruneQuery {
    #[serde(default)]
    pub all: bool,
}

pub async fn image_prune(
    State(state): State<AppState>,
    Query(query): Query<ImagePruneQuery>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.image_prune(query.all).await?).into_response())
}

pub async fn image_history(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.image_history(&name).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct TreeQuery {
    #[serde(default)]
    pub whatrequires: bool,
}

pub async fn image_tree(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<TreeQuery>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.image_tree(&name, query.whatrequires).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub term: String,
    #[serde(default = "default_search_limit")]
    pub limit: usize,
}

fn default_search_limit() -> usize {
    25
}

pub async fn image_search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.image_search(&query.term, query.limit).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct ImportQuery {
    pub reference: Option<String>,
}

pub async fn image_import(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    body: axum::body::Bytes,
) -> ApiResult<Response> {
    let id = state
        .engine
        .image_store()
        .import(&body, query.reference.as_deref())?;
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))).into_response())
}

pub async fn image_load(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> ApiResult<Response> {
    let names = state.engine.image_store().load(body.as_ref())?;
    Ok(Json(serde_json::json!({ "names": names })).into_response())
}

pub async fn image_save(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let mut archive = Vec::new();
    state.engine.image_store().save(&name, &mut archive)?;
    Ok((
        StatusCode::OK,
        [("Content-Type", "application/x-tar")],
        archive,
    )
        .into_response())
}

pub async fn image_diff(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.image_diff(&name).await?).into_response())
}

// =============================================================================
// Volumes
// =============================================================================

pub async fn volume_create(
    State(state): State<AppState>,
    Json(opts): Json<VolumeCreateOptions>,
) -> ApiResult<Response> {
    let volume = state.engine.volume_create(opts).await?;
    Ok((StatusCode::CREATED, Json(volume)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct VolumeListQuery {
    pub driver: Option<String>,
    /// Comma-separated name substrings.
    pub name: Option<String>,
}

pub async fn volume_list(
    State(state): State<AppState>,
    Query(query): Query<VolumeListQuery>,
) -> ApiResult<Response> {
    let filters = VolumeFilters {
        driver: query.driver,
        names: query
            .name
            .as_deref()
            .unwrap_or("")
            .split(',')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        labels: HashMap::new(),
    };
    Ok(Json(state.engine.volume_list(filters).await?).into_response())
}

pub async fn volume_exists(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    if state.engine.volume_exists(&name).await?.value {
        Ok(no_content())
    } else {
        Err(Error::NoSuchVolume(name).into())
    }
}

pub async fn volume_inspect(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    Ok(Json(state.engine.volume_inspect(&name).await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct VolumeRmQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn volume_rm(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<VolumeRmQuery>,
) -> ApiResult<Response> {
    state.engine.volume_rm(&name, query.force).await?;
    Ok(no_content())
}

#[derive(Debug, Deserialize)]
pub struct VolumePruneQuery {
    /// JSON-encoded filter map; any content is rejected downstream.
    pub filters: Option<String>,
}

pub async fn volume_prune(
    State(state): State<AppState>,
    Query(query): Query<VolumePruneQuery>,
) -> ApiResult<Response> {
    let filters: HashMap<String, Vec<String>> = match query.filters.as_deref() {
        None | Some("") => HashMap::new(),
        Some(raw) => serde_json::from_str(raw)
            .map_err(|_| Error::InvalidArg(format!("invalid filters: {raw:?}")))?,
    };
    Ok(Json(state.engine.volume_prune(filters).await?).into_response())
}

// =============================================================================
// System
// =============================================================================

pub async fn version(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.engine.version().await?).into_response())
}

pub async fn info(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.engine.info().await?).into_response())
}

pub async fn system_df(State(state): State<AppState>) -> ApiResult<Response> {
    Ok(Json(state.engine.system_df().await?).into_response())
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub since: Option<String>,
    pub until: Option<String>,
    /// `kind=value` pairs, comma separated (e.g. `type=container`).
    pub filters: Option<String>,
}

/// Streams events as JSON lines until the client hangs up.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Response> {
    let parse_time = |s: &Option<String>| {
        s.as_deref().and_then(|raw| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .map(|t| t.with_timezone(&chrono::Utc))
                .ok()
        })
    };

    let mut filter = EventFilter {
        since: parse_time(&query.since),
        until: parse_time(&query.until),
        ..Default::default()
    };
    if let Some(raw) = &query.filters {
        for pair in raw.split(',') {
            match pair.split_once('=') {
                Some(("type", v)) => {
                    let kind = match v {
                        "container" => Some(EventKind::Container),
                        "pod" => Some(EventKind::Pod),
                        "image" => Some(EventKind::Image),
                        "volume" => Some(EventKind::Volume),
                        _ => None,
                    };
                    if let Some(kind) = kind {
                        filter.kinds.push(kind);
                    }
                }
                Some(("event", v)) => filter.actions.push(v.to_string()),
                Some(("id", v)) | Some(("name", v)) => filter.ids.push(v.to_string()),
                _ => {}
            }
        }
    }

    let mut rx = state.engine.subscribe_events(filter);
    let stream = async_stream_body(move |tx| async move {
        while let Some(event) = rx.recv().await {
            let Ok(mut line) = serde_json::to_vec(&event) else {
                continue;
            };
            line.push(b'\n');
            if tx.send(Ok(line.into())).await.is_err() {
                return;
            }
        }
    });
    Ok((
        StatusCode::OK,
        [("Content-Type", "application/json")],
        axum::body::Body::from_stream(stream),
    )
        .into_response())
}

/// Bridges an mpsc-producing closure into a byte stream body.
fn async_stream_body<F, Fut>(
    f: F,
) -> tokio_stream::wrappers::ReceiverStream<std::result::Result<axum::body::Bytes, std::io::Error>>
where
    F: FnOnce(
        tokio::sync::mpsc::Sender<std::result::Result<axum::body::Bytes, std::io::Error>>,
    ) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let (tx, rx) = tokio::sync::mpsc::channel(64);
    tokio::spawn(f(tx));
    tokio_stream::wrappers::ReceiverStream::new(rx)
}
