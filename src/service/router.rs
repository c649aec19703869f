//! Route trees.
//!
//! `/{version}/libpod/...` is the native schema; `/{version}/...` and the
//! unversioned root are the Docker-compatible schema. Swarm-family route
//! prefixes answer 503 so compat clients know this is not a swarm node.
//! Every response carries the `Libpod-API-Version` header.

use super::{compat, handlers, images, AppState};
use axum::http::HeaderValue;
use axum::middleware::{self, Next};
use axum::routing::{delete, get, post};
use axum::Router;

/// Builds the full router.
pub fn build_router(state: AppState) -> Router {
    let versioned = Router::new()
        .nest("/libpod", libpod_router())
        .merge(compat_router())
        .merge(swarm_router());

    Router::new()
        .route("/_ping", get(handlers::ping).head(handlers::ping))
        .route("/libpod/_ping", get(handlers::ping))
        .nest("/{version}", versioned)
        .merge(compat_router())
        .layer(middleware::from_fn(version_header))
        .with_state(state)
}

/// Stamps the native API version on every response.
async fn version_header(request: axum::extract::Request, next: Next) -> axum::response::Response {
    let mut response = next.run(request).await;
    response.headers_mut().insert(
        "Libpod-API-Version",
        HeaderValue::from_static(crate::constants::API_VERSION),
    );
    response
}

/// Native route tree.
fn libpod_router() -> Router<AppState> {
    Router::new()
        .route("/_ping", get(handlers::ping))
        // containers
        .route("/containers/create", post(handlers::container_create))
        .route("/containers/json", get(handlers::container_list))
        .route("/containers/prune", post(handlers::container_prune))
        .route("/containers/{name}/exists", get(handlers::container_exists))
        .route("/containers/{name}/json", get(handlers::container_inspect))
        .route("/containers/{name}/init", post(handlers::container_init))
        .route("/containers/{name}/start", post(handlers::container_start))
        .route("/containers/{name}/stop", post(handlers::container_stop))
        .route("/containers/{name}/kill", post(handlers::container_kill))
        .route("/containers/{name}/pause", post(handlers::container_pause))
        .route(
            "/containers/{name}/unpause",
            post(handlers::container_unpause),
        )
        .route(
            "/containers/{name}/restart",
            post(handlers::container_restart),
        )
        .route("/containers/{name}/wait", post(handlers::container_wait))
        .route("/containers/{name}/logs", get(handlers::container_logs))
        .route("/containers/{name}/top", get(handlers::container_top))
        .route("/containers/{name}/stats", get(handlers::container_stats))
        .route("/containers/{name}/changes", get(handlers::container_diff))
        .route("/containers/{name}/ports", get(handlers::container_port))
        .route("/containers/{name}/export", get(handlers::container_export))
        .route(
            "/containers/{name}/checkpoint",
            post(handlers::container_checkpoint),
        )
        .route(
            "/containers/{name}/restore",
            post(handlers::container_restore),
        )
        .route("/containers/{name}/attach", post(handlers::container_attach))
        .route("/containers/{name}/resize", post(handlers::container_resize))
        .route("/containers/{name}", delete(handlers::container_rm))
        .route("/commit", post(handlers::container_commit))
        // exec
        .route("/containers/{name}/exec", post(handlers::exec_create))
        .route("/exec/{id}/start", post(handlers::exec_start))
        .route("/exec/{id}/json", get(handlers::exec_inspect))
        .route("/exec/{id}/resize", post(handlers::exec_resize))
        // pods
        .route("/pods/create", post(handlers::pod_create))
        .route("/pods/json", get(handlers::pod_list))
        .route("/pods/prune", post(handlers::pod_prune))
        .route("/pods/{name}/exists", get(handlers::pod_exists))
        .route("/pods/{name}/json", get(handlers::pod_inspect))
        .route("/pods/{name}/start", post(handlers::pod_start))
        .route("/pods/{name}/stop", post(handlers::pod_stop))
        .route("/pods/{name}/kill", post(handlers::pod_kill))
        .route("/pods/{name}/pause", post(handlers::pod_pause))
        .route("/pods/{name}/unpause", post(handlers::pod_unpause))
        .route("/pods/{name}/restart", post(handlers::pod_restart))
        .route("/pods/{name}/top", get(handlers::pod_top))
        .route("/pods/{name}/stats", get(handlers::pod_stats))
        .route("/pods/{name}", delete(handlers::pod_rm))
        // images
        .route("/images/json", get(images::image_list))
        .route("/images/pull", post(images::image_pull))
        .route("/images/prune", post(images::image_prune))
        .route("/images/remove", delete(images::image_remove_bulk))
        .route("/images/search", get(images::image_search))
        .route("/images/import", post(images::image_import))
        .route("/images/load", post(images::image_load))
        .route("/images/{name}/exists", get(images::image_exists))
        .route("/images/{name}/json", get(images::image_inspect))
        .route("/images/{name}/history", get(images::image_history))
        .route("/images/{name}/tree", get(images::image_tree))
        .route("/images/{name}/tag", post(images::image_tag))
        .route("/images/{name}/untag", post(images::image_untag))
        .route("/images/{name}/get", get(images::image_save))
        .route("/images/{name}/changes", get(images::image_diff))
        .route("/images/{name}/push", post(images::image_push))
        .route("/images/{name}", delete(images::image_remove_one))
        // volumes
        .route("/volumes/create", post(images::volume_create))
        .route("/volumes/json", get(images::volume_list))
        .route("/volumes/prune", post(images::volume_prune))
        .route("/volumes/{name}/exists", get(images::volume_exists))
        .route("/volumes/{name}/json", get(images::volume_inspect))
        .route("/volumes/{name}", delete(images::volume_rm))
        // system
        .route("/version", get(images::version))
        .route("/info", get(images::info))
        .route("/system/df", get(images::system_df))
        .route("/events", get(images::events))
}

/// Docker-compatible route tree.
fn compat_router() -> Router<AppState> {
    Router::new()
        .route("/version", get(compat::version))
        .route("/info", get(compat::info))
        .route("/events", get(images::events))
        // containers
        .route("/containers/json", get(compat::container_list))
        .route("/containers/create", post(compat::container_create))
        .route("/containers/prune", post(handlers::container_prune))
        .route("/containers/{name}/json", get(compat::container_inspect))
        .route("/containers/{name}/start", post(handlers::container_start))
        .route("/containers/{name}/stop", post(handlers::container_stop))
        .route("/containers/{name}/kill", post(handlers::container_kill))
        .route("/containers/{name}/pause", post(handlers::container_pause))
        .route(
            "/containers/{name}/unpause",
            post(handlers::container_unpause),
        )
        .route(
            "/containers/{name}/restart",
            post(handlers::container_restart),
        )
        .route("/containers/{name}/wait", post(compat::container_wait))
        .route("/containers/{name}/logs", get(handlers::container_logs))
        .route("/containers/{name}/top", get(handlers::container_top))
        .route("/containers/{name}/attach", post(handlers::container_attach))
        .route("/containers/{name}/resize", post(handlers::container_resize))
        .route("/containers/{name}/export", get(handlers::container_export))
        .route("/containers/{name}", delete(handlers::container_rm))
        // exec
        .route("/containers/{name}/exec", post(handlers::exec_create))
        .route("/exec/{id}/start", post(handlers::exec_start))
        .route("/exec/{id}/json", get(handlers::exec_inspect))
        .route("/exec/{id}/resize", post(handlers::exec_resize))
        // images
        .route("/images/json", get(compat::image_list))
        .route("/images/create", post(compat::image_create))
        .route("/images/{name}/json", get(images::image_inspect))
        .route("/images/{name}/tag", post(images::image_tag))
        .route("/images/{name}", delete(images::image_remove_one))
        // volumes
        .route("/volumes", get(compat::volume_list))
        .route("/volumes/create", post(compat::volume_create))
        .route("/volumes/prune", post(images::volume_prune))
        .route("/volumes/{name}", get(images::volume_inspect))
        .route("/volumes/{name}", delete(compat::volume_rm))
}

/// Swarm-family endpoints: always 503, never pretend.
fn swarm_router() -> Router<AppState> {
    async fn no_swarm() -> impl axum::response::IntoResponse {
        (
            axum::http::StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({ "message": "node is not part of a swarm" })),
        )
    }

    let mut router = Router::new();
    for prefix in ["swarm", "services", "nodes", "tasks", "secrets", "configs"] {
        router = router
            .route(&format!("/{prefix}"), axum::routing::any(no_swarm))
            .route(&format!("/{prefix}/{{*rest}}"), axum::routing::any(no_swarm));
    }
    router
}
