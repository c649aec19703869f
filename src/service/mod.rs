//! HTTP service: the engine's capabilities over REST.
//!
//! One router, two schemas: `/{version}/libpod/...` serves the native
//! report types; `/{version}/...` (and the unversioned root) serves
//! Docker-compatible translations of the same operations. Attach and
//! exec-start hijack the connection and speak the 8-byte frame protocol.
//!
//! Handlers receive the engine as typed axum state; there are no untyped
//! request-context values.

mod compat;
mod handlers;
mod images;
mod router;

pub use router::build_router;

use crate::engine::abi::AbiEngine;
use crate::error::{Error, Result};
use axum::response::{IntoResponse, Response};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tower::Service;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared state every handler receives.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<AbiEngine>,
}

/// Engine errors as HTTP responses: kind decides the status, the body is
/// `{"message": ...}`. 304 responses carry no body.
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.0.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        if status == axum::http::StatusCode::NOT_MODIFIED {
            return status.into_response();
        }
        let body = serde_json::json!({ "message": self.0.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

/// Result alias for handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Where the service listens.
#[derive(Debug, Clone)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(std::net::SocketAddr),
}

/// The API server.
pub struct ApiServer {
    engine: Arc<AbiEngine>,
    addr: ListenAddr,
}

impl ApiServer {
    pub fn new(engine: Arc<AbiEngine>, addr: ListenAddr) -> Self {
        Self { engine, addr }
    }

    /// Default per-user socket path.
    pub fn default_socket(rootless: bool) -> PathBuf {
        if rootless {
            let uid = unsafe { libc::geteuid() };
            PathBuf::from(format!("/run/user/{uid}/caravel/caravel.sock"))
        } else {
            PathBuf::from("/run/caravel/caravel.sock")
        }
    }

    /// Serves until the process exits. Connections are HTTP/1.1 with
    /// upgrade support so attach and exec can hijack them.
    pub async fn run(&self) -> Result<()> {
        let app = build_router(AppState {
            engine: Arc::clone(&self.engine),
        })
        .layer(TraceLayer::new_for_http());

        match &self.addr {
            ListenAddr::Unix(path) => {
                let _ = std::fs::remove_file(path);
                if let Some(parent) = path.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                let listener = tokio::net::UnixListener::bind(path)?;
                info!(socket = %path.display(), "API service listening");
                loop {
                    let (stream, _) = listener.accept().await?;
                    serve_connection(stream, app.clone());
                }
            }
            ListenAddr::Tcp(addr) => {
                let listener = tokio::net::TcpListener::bind(addr).await?;
                info!(%addr, "API service listening");
                loop {
                    let (stream, _) = listener.accept().await?;
                    serve_connection(stream, app.clone());
                }
            }
        }
    }
}

fn serve_connection<S>(stream: S, app: axum::Router)
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
            app.clone().call(request)
        });
        if let Err(err) = http1::Builder::new()
            .serve_connection(TokioIo::new(stream), service)
            .with_upgrades()
            .await
        {
            let text = err.to_string().to_lowercase();
            if !text.contains("connection reset") && !text.contains("broken pipe") {
                error!("connection error: {err}");
            }
        }
    });
}

/// Removes a stale socket on shutdown.
pub fn cleanup_socket(path: &Path) {
    let _ = std::fs::remove_file(path);
}
