//! Tunnel engine: the capability traits over HTTP.
//!
//! Each call becomes method + path + query + JSON body against the remote
//! service's native route tree. Transport failures retry up to three times
//! with linear backoff; HTTP errors are reclassified into the same error
//! kinds the ABI engine produces, so CLI output matches byte-for-byte.
//! Fundamentally local operations (mount, unmount, copy, cleanup) refuse
//! with a stable message instead of pretending to work.

use super::uri::ConnectionUri;
use super::{ContainerEngine, EngineMode, ImageEngine, QueryParams};
use crate::constants::{API_VERSION, TUNNEL_RETRY_ATTEMPTS, TUNNEL_RETRY_BACKOFF};
use crate::container::config::PortMapping;
use crate::container::exec::{ExecConfig, ExecInspect};
use crate::container::state::WaitCondition;
use crate::container::store::{LogOptions, RemoveOptions};
use crate::error::{Error, RemoteEntity, Result};
use crate::image::pull::PullOptions;
use crate::pod::PodCreateOptions;
use crate::reports::*;
use crate::specgen::ContainerSpec;
use crate::volume::{VolumeCreateOptions, VolumeFilters};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Method;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;
use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::{debug, warn};

// =============================================================================
// Byte Streams
// =============================================================================

/// One dialed connection, whatever the transport.
enum IoStream {
    Unix(tokio::net::UnixStream),
    Tcp(tokio::net::TcpStream),
    Ssh(SshStream),
}

impl AsyncRead for IoStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            IoStream::Ssh(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for IoStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            IoStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            IoStream::Ssh(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Unix(s) => Pin::new(s).poll_flush(cx),
            IoStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            IoStream::Ssh(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            IoStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            IoStream::Ssh(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Bidirectional stream over an ssh child's stdio. The remote side bridges
/// stdio to the service's unix socket.
struct SshStream {
    child: tokio::process::Child,
    stdin: tokio::process::ChildStdin,
    stdout: tokio::process::ChildStdout,
}

impl AsyncRead for SshStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for SshStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}

impl Drop for SshStream {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

// =============================================================================
// Client
// =============================================================================

/// Low-level HTTP client for the service.
pub struct TunnelClient {
    uri: ConnectionUri,
}

impl TunnelClient {
    pub fn new(uri: ConnectionUri) -> Self {
        Self { uri }
    }

    async fn dial(&self) -> std::io::Result<IoStream> {
        match &self.uri {
            ConnectionUri::Unix { path } => {
                Ok(IoStream::Unix(tokio::net::UnixStream::connect(path).await?))
            }
            ConnectionUri::Tcp { host, port } => Ok(IoStream::Tcp(
                tokio::net::TcpStream::connect((host.as_str(), *port)).await?,
            )),
            ConnectionUri::Ssh {
                user,
                host,
                port,
                socket,
                secure,
                identity,
                passphrase: _,
            } => {
                let mut command = tokio::process::Command::new("ssh");
                command
                    .arg("-x")
                    .arg("-o")
                    .arg("BatchMode=yes")
                    .arg("-o")
                    .arg(if *secure {
                        "StrictHostKeyChecking=yes"
                    } else {
                        "StrictHostKeyChecking=no"
                    })
                    .arg("-p")
                    .arg(port.to_string());
                if let Some(identity) = identity {
                    command.arg("-i").arg(identity);
                }
                let target = match user {
                    Some(user) => format!("{user}@{host}"),
                    None => host.clone(),
                };
                command
                    .arg(target)
                    .arg("--")
                    .arg(format!(
                        "exec socat STDIO UNIX-CONNECT:{}",
                        socket.display()
                    ))
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::null())
                    .kill_on_drop(true);

                let mut child = command.spawn()?;
                let stdin = child.stdin.take().expect("piped stdin");
                let stdout = child.stdout.take().expect("piped stdout");
                Ok(IoStream::Ssh(SshStream {
                    child,
                    stdin,
                    stdout,
                }))
            }
        }
    }

    /// One HTTP exchange over a fresh connection.
    async fn exchange(
        &self,
        method: &Method,
        path: &str,
        body: Option<Bytes>,
    ) -> std::io::Result<(u16, HashMap<String, String>, Bytes)> {
        let stream = self.dial().await?;
        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(std::io::Error::other)?;
        tokio::spawn(async move {
            let _ = connection.await;
        });

        let request = hyper::Request::builder()
            .method(method.clone())
            .uri(path)
            .header(hyper::header::HOST, "d")
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(body.unwrap_or_default()))
            .map_err(std::io::Error::other)?;

        let response = sender
            .send_request(request)
            .await
            .map_err(std::io::Error::other)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(k, v)| {
                (
                    k.as_str().to_string(),
                    v.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(std::io::Error::other)?
            .to_bytes();
        Ok((status, headers, bytes))
    }

    /// Issues a request with the retry budget: transport errors retry with
    /// 0/100/200 ms backoff, HTTP-level errors never do.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        query: &QueryParams,
        body: Option<Bytes>,
    ) -> Result<(u16, Bytes)> {
        let full_path = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", query.encode())
        };

        let mut last_err = None;
        for attempt in 0..TUNNEL_RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(TUNNEL_RETRY_BACKOFF * attempt).await;
            }
            match self.exchange(&method, &full_path, body.clone()).await {
                Ok((status, _, bytes)) => return Ok((status, bytes)),
                Err(e) => {
                    debug!(attempt, path = %full_path, "transport error: {e}");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::TunnelTransport {
            uri: self.uri.label(),
            reason: last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
        })
    }

    /// Hijacks a connection: sends the request with upgrade headers and
    /// returns the raw bidirectional stream once the server switches
    /// protocols.
    pub async fn upgrade(
        &self,
        method: Method,
        path: &str,
        query: &QueryParams,
    ) -> Result<impl tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin> {
        let full_path = if query.is_empty() {
            path.to_string()
        } else {
            format!("{path}?{}", query.encode())
        };
        let stream = self.dial().await.map_err(|e| Error::TunnelTransport {
            uri: self.uri.label(),
            reason: e.to_string(),
        })?;
        let (mut sender, connection) =
            hyper::client::conn::http1::handshake(TokioIo::new(stream))
                .await
                .map_err(|e| Error::TunnelTransport {
                    uri: self.uri.label(),
                    reason: e.to_string(),
                })?;
        tokio::spawn(async move {
            // with_upgrades keeps the connection alive for the hijack.
            let _ = connection.with_upgrades().await;
        });

        let request = hyper::Request::builder()
            .method(method)
            .uri(full_path)
            .header(hyper::header::HOST, "d")
            .header(hyper::header::CONNECTION, "Upgrade")
            .header(hyper::header::UPGRADE, "tcp")
            .body(Full::new(Bytes::new()))
            .map_err(|e| Error::Internal(e.to_string()))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| Error::TunnelTransport {
                uri: self.uri.label(),
                reason: e.to_string(),
            })?;
        if response.status() != hyper::StatusCode::SWITCHING_PROTOCOLS {
            return Err(Error::TunnelTransport {
                uri: self.uri.label(),
                reason: format!("upgrade refused with status {}", response.status()),
            });
        }
        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| Error::TunnelTransport {
                uri: self.uri.label(),
                reason: e.to_string(),
            })?;
        Ok(TokioIo::new(upgraded))
    }

    /// Version handshake: the server must not be older than this client.
    pub async fn ping(&self) -> Result<()> {
        let (status, headers, _) = self
            .exchange(&Method::GET, "/_ping", None)
            .await
            .map_err(|e| Error::TunnelTransport {
                uri: self.uri.label(),
                reason: e.to_string(),
            })?;
        if status != 200 {
            return Err(Error::TunnelTransport {
                uri: self.uri.label(),
                reason: format!("ping returned {status}"),
            });
        }
        match headers.get("libpod-api-version") {
            Some(server) => match compare_semver(server, API_VERSION) {
                std::cmp::Ordering::Less => Err(Error::ServerTooOld {
                    server: server.clone(),
                    client: API_VERSION.to_string(),
                }),
                _ => Ok(()),
            },
            // Older services may not declare a version; accept them the way
            // the CLI always has.
            None => {
                warn!("service did not provide Libpod-API-Version");
                Ok(())
            }
        }
    }
}

/// Compares dotted-decimal versions; missing components count as zero.
fn compare_semver(a: &str, b: &str) -> std::cmp::Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.split('.')
            .map(|p| p.trim().parse().unwrap_or(0))
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    for i in 0..a.len().max(b.len()) {
        let (x, y) = (a.get(i).copied().unwrap_or(0), b.get(i).copied().unwrap_or(0));
        match x.cmp(&y) {
            std::cmp::Ordering::Equal => continue,
            other => return other,
        }
    }
    std::cmp::Ordering::Equal
}

// =============================================================================
// Engine
// =============================================================================

/// The remote engine: every capability translated to HTTP.
pub struct TunnelEngine {
    client: TunnelClient,
}

impl TunnelEngine {
    /// Connects and performs the version handshake.
    pub async fn connect(uri: ConnectionUri) -> Result<Self> {
        let client = TunnelClient::new(uri);
        client.ping().await?;
        Ok(Self { client })
    }

    /// Builds without the handshake, for late-binding callers.
    pub fn new_unchecked(uri: ConnectionUri) -> Self {
        Self {
            client: TunnelClient::new(uri),
        }
    }

    fn base(path: &str) -> String {
        format!("/v{API_VERSION}/libpod{path}")
    }

    /// Decodes a 2xx JSON response, reclassifying everything else.
    fn decode<T: DeserializeOwned>(
        status: u16,
        bytes: &Bytes,
        entity: RemoteEntity,
        name: &str,
    ) -> Result<T> {
        Self::check(status, bytes, entity, name)?;
        serde_json::from_slice(bytes).map_err(Error::from)
    }

    /// Maps non-success statuses to classified errors, including the benign
    /// 304 kinds.
    fn check(status: u16, bytes: &Bytes, entity: RemoteEntity, name: &str) -> Result<()> {
        if (200..300).contains(&status) {
            return Ok(());
        }
        if status == 304 {
            return Err(match entity {
                RemoteEntity::Pod => Error::PodAlreadyStarted(name.to_string()),
                _ => Error::CtrStopped(name.to_string()),
            });
        }
        let message = serde_json::from_slice::<serde_json::Value>(bytes)
            .ok()
            .and_then(|v| {
                v.get("message")
                    .and_then(|m| m.as_str())
                    .map(str::to_string)
            })
            .unwrap_or_else(|| format!("service returned status {status}"));
        Err(Error::from_remote_status(status, entity, name, message))
    }

    async fn post_reports(
        &self,
        path: &str,
        query: &QueryParams,
        entity: RemoteEntity,
        name: &str,
    ) -> Result<Vec<ContainerReport>> {
        let (status, bytes) = self
            .client
            .request(Method::POST, &Self::base(path), query, None)
            .await?;
        Self::decode(status, &bytes, entity, name)
    }

    async fn pod_op(&self, path: &str, query: &QueryParams, name: &str) -> Result<PodReport> {
        let (status, bytes) = self
            .client
            .request(Method::POST, &Self::base(path), query, None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Pod, name)
    }
}

#[async_trait]
impl ContainerEngine for TunnelEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Tunnel
    }

    async fn container_create(&self, spec: ContainerSpec) -> Result<String> {
        let body = Bytes::from(serde_json::to_vec(&spec)?);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base("/containers/create"),
                &QueryParams::new(),
                Some(body),
            )
            .await?;
        #[derive(serde::Deserialize)]
        struct CreateResponse {
            id: String,
        }
        let response: CreateResponse =
            Self::decode(status, &bytes, RemoteEntity::Container, "")?;
        Ok(response.id)
    }

    async fn container_init(&self, name: &str) -> Result<()> {
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/containers/{name}/init")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_start(&self, names: &[String]) -> Result<Vec<ContainerReport>> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let (status, bytes) = self
                .client
                .request(
                    Method::POST,
                    &Self::base(&format!("/containers/{name}/start")),
                    &QueryParams::new(),
                    None,
                )
                .await?;
            match Self::check(status, &bytes, RemoteEntity::Container, name) {
                Ok(()) => reports.push(ContainerReport::ok(name.clone())),
                Err(e) if e.is_benign() => reports.push(ContainerReport::ok(name.clone())),
                Err(e) => reports.push(ContainerReport::failed(name.clone(), e)),
            }
        }
        Ok(reports)
    }

    async fn container_stop(
        &self,
        names: &[String],
        timeout: Option<u64>,
        ignore: bool,
    ) -> Result<Vec<ContainerReport>> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let mut query = QueryParams::new();
            query.push_opt("t", timeout).push_bool("ignore", ignore);
            let (status, bytes) = self
                .client
                .request(
                    Method::POST,
                    &Self::base(&format!("/containers/{name}/stop")),
                    &query,
                    None,
                )
                .await?;
            match Self::check(status, &bytes, RemoteEntity::Container, name) {
                Ok(()) => reports.push(ContainerReport::ok(name.clone())),
                Err(e) if e.is_benign() => reports.push(ContainerReport::ok(name.clone())),
                Err(Error::NoSuchContainer(_)) if ignore => {
                    reports.push(ContainerReport::ok(name.clone()))
                }
                Err(e) => reports.push(ContainerReport::failed(name.clone(), e)),
            }
        }
        Ok(reports)
    }

    async fn container_kill(
        &self,
        names: &[String],
        signal: &str,
    ) -> Result<Vec<ContainerReport>> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let mut query = QueryParams::new();
            query.push_str("signal", signal);
            let (status, bytes) = self
                .client
                .request(
                    Method::POST,
                    &Self::base(&format!("/containers/{name}/kill")),
                    &query,
                    None,
                )
                .await?;
            match Self::check(status, &bytes, RemoteEntity::Container, name) {
                Ok(()) => reports.push(ContainerReport::ok(name.clone())),
                Err(e) => reports.push(ContainerReport::failed(name.clone(), e)),
            }
        }
        Ok(reports)
    }

    async fn container_pause(&self, names: &[String]) -> Result<Vec<ContainerReport>> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let (status, bytes) = self
                .client
                .request(
                    Method::POST,
                    &Self::base(&format!("/containers/{name}/pause")),
                    &QueryParams::new(),
                    None,
                )
                .await?;
            match Self::check(status, &bytes, RemoteEntity::Container, name) {
                Ok(()) => reports.push(ContainerReport::ok(name.clone())),
                Err(e) => reports.push(ContainerReport::failed(name.clone(), e)),
            }
        }
        Ok(reports)
    }

    async fn container_unpause(&self, names: &[String]) -> Result<Vec<ContainerReport>> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let (status, bytes) = self
                .client
                .request(
                    Method::POST,
                    &Self::base(&format!("/containers/{name}/unpause")),
                    &QueryParams::new(),
                    None,
                )
                .await?;
            match Self::check(status, &bytes, RemoteEntity::Container, name) {
                Ok(()) => reports.push(ContainerReport::ok(name.clone())),
                Err(e) => reports.push(ContainerReport::failed(name.clone(), e)),
            }
        }
        Ok(reports)
    }

    async fn container_restart(
        &self,
        names: &[String],
        timeout: Option<u64>,
    ) -> Result<Vec<ContainerReport>> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let mut query = QueryParams::new();
            query.push_opt("t", timeout);
            let (status, bytes) = self
                .client
                .request(
                    Method::POST,
                    &Self::base(&format!("/containers/{name}/restart")),
                    &query,
                    None,
                )
                .await?;
            match Self::check(status, &bytes, RemoteEntity::Container, name) {
                Ok(()) => reports.push(ContainerReport::ok(name.clone())),
                Err(e) => reports.push(ContainerReport::failed(name.clone(), e)),
            }
        }
        Ok(reports)
    }

    async fn container_rm(
        &self,
        names: &[String],
        opts: RemoveOptions,
    ) -> Result<Vec<ContainerReport>> {
        let mut reports = Vec::with_capacity(names.len());
        for name in names {
            let mut query = QueryParams::new();
            query
                .push_bool("force", opts.force)
                .push_bool("v", opts.volumes)
                .push_bool("ignore", opts.ignore);
            let (status, bytes) = self
                .client
                .request(
                    Method::DELETE,
                    &Self::base(&format!("/containers/{name}")),
                    &query,
                    None,
                )
                .await?;
            match Self::check(status, &bytes, RemoteEntity::Container, name) {
                Ok(()) => reports.push(ContainerReport::ok(name.clone())),
                Err(Error::NoSuchContainer(_)) if opts.ignore => {
                    reports.push(ContainerReport::ok(name.clone()))
                }
                Err(e) => reports.push(ContainerReport::failed(name.clone(), e)),
            }
        }
        Ok(reports)
    }

    async fn container_prune(&self) -> Result<PruneReport> {
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base("/containers/prune"),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, "")
    }

    async fn container_exists(&self, name: &str) -> Result<BoolReport> {
        let (status, _bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/containers/{name}/exists")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Ok(BoolReport {
            value: status == 204,
        })
    }

    async fn container_inspect(&self, name: &str) -> Result<ContainerInspect> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/containers/{name}/json")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_list(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let mut query = QueryParams::new();
        query.push_bool("all", all);
        let (status, bytes) = self
            .client
            .request(Method::GET, &Self::base("/containers/json"), &query, None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, "")
    }

    async fn container_wait(
        &self,
        name: &str,
        conditions: &[WaitCondition],
    ) -> Result<WaitReport> {
        let mut query = QueryParams::new();
        let strs: Vec<String> = conditions
            .iter()
            .map(|c| serde_json::to_string(c).unwrap_or_default().replace('"', ""))
            .collect();
        if !strs.is_empty() {
            query.push_str("condition", &strs.join(","));
        }
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/containers/{name}/wait")),
                &query,
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_logs(&self, name: &str, opts: &LogOptions) -> Result<Vec<LogEntry>> {
        let mut query = QueryParams::new();
        query
            .push_bool("follow", opts.follow)
            .push_bool("timestamps", opts.timestamps)
            .push_opt("since", opts.since.map(|t| t.to_rfc3339()))
            .push_opt("until", opts.until.map(|t| t.to_rfc3339()))
            .push_opt("tail", opts.tail);
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/containers/{name}/logs")),
                &query,
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_top(&self, name: &str) -> Result<TopReport> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/containers/{name}/top")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_stats(&self, name: &str) -> Result<ContainerStats> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/containers/{name}/stats")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_diff(&self, name: &str) -> Result<Vec<FileChange>> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/containers/{name}/changes")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_port(&self, name: &str) -> Result<Vec<PortMapping>> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/containers/{name}/ports")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_export(&self, name: &str, path: &Path) -> Result<()> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/containers/{name}/export")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Container, name)?;
        std::fs::write(path, &bytes)?;
        Ok(())
    }

    async fn container_commit(&self, name: &str, tag: Option<&str>) -> Result<String> {
        let mut query = QueryParams::new();
        query.push_str("container", name);
        if let Some(tag) = tag {
            query.push_str("repo", tag);
        }
        let (status, bytes) = self
            .client
            .request(Method::POST, &Self::base("/commit"), &query, None)
            .await?;
        #[derive(serde::Deserialize)]
        struct CommitResponse {
            id: String,
        }
        let response: CommitResponse =
            Self::decode(status, &bytes, RemoteEntity::Container, name)?;
        Ok(response.id)
    }

    async fn container_checkpoint(&self, name: &str, leave_running: bool) -> Result<()> {
        let mut query = QueryParams::new();
        query.push_bool("leaveRunning", leave_running);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/containers/{name}/checkpoint")),
                &query,
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_restore(&self, name: &str) -> Result<()> {
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/containers/{name}/restore")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Container, name)
    }

    async fn container_mount(&self, _name: &str) -> Result<std::path::PathBuf> {
        Err(Error::NotImplementedRemote("mount"))
    }

    async fn container_unmount(&self, _name: &str) -> Result<()> {
        Err(Error::NotImplementedRemote("unmount"))
    }

    async fn container_copy(&self, _src: &str, _dst: &str) -> Result<()> {
        Err(Error::NotImplementedRemote("copy"))
    }

    async fn container_cleanup(&self, _name: &str, _rm: bool) -> Result<()> {
        Err(Error::NotImplementedRemote("cleanup"))
    }

    // --- exec ---

    async fn exec_create(&self, container: &str, config: ExecConfig) -> Result<String> {
        let body = Bytes::from(serde_json::to_vec(&config)?);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/containers/{container}/exec")),
                &QueryParams::new(),
                Some(body),
            )
            .await?;
        #[derive(serde::Deserialize)]
        struct ExecCreateResponse {
            id: String,
        }
        let response: ExecCreateResponse =
            Self::decode(status, &bytes, RemoteEntity::Container, container)?;
        Ok(response.id)
    }

    async fn exec_start(&self, session: &str) -> Result<()> {
        let mut query = QueryParams::new();
        query.push_bool("detach", true);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/exec/{session}/start")),
                &query,
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::ExecSession, session)
    }

    async fn exec_start_attached(&self, session: &str) -> Result<(i32, Vec<u8>, Vec<u8>)> {
        // Hijack the start endpoint and demux frames until the stream
        // closes, then read the exit code off the session record.
        let mut stream = self
            .client
            .upgrade(
                Method::POST,
                &Self::base(&format!("/exec/{session}/start")),
                &QueryParams::new(),
            )
            .await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some((channel, payload)) = crate::attach::read_frame(&mut stream).await? {
            match channel {
                crate::attach::Channel::Stdout => stdout.extend(payload),
                crate::attach::Channel::Stderr => stderr.extend(payload),
                crate::attach::Channel::AsyncError => {
                    return Err(Error::StreamError(
                        String::from_utf8_lossy(&payload).to_string(),
                    ));
                }
                crate::attach::Channel::Stdin => {}
            }
        }

        let inspect = self.exec_inspect(session).await?;
        Ok((inspect.exit_code.unwrap_or(0), stdout, stderr))
    }

    async fn exec_inspect(&self, session: &str) -> Result<ExecInspect> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/exec/{session}/json")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::ExecSession, session)
    }

    async fn exec_cleanup(&self, _session: &str, _exit_code: i32) -> Result<()> {
        Err(Error::NotImplementedRemote("cleanup"))
    }

    async fn exec_resize(&self, session: &str, height: u16, width: u16) -> Result<()> {
        let mut query = QueryParams::new();
        query.push_int("h", height).push_int("w", width);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/exec/{session}/resize")),
                &query,
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::ExecSession, session)
    }

    // --- pods ---

    async fn pod_create(&self, opts: PodCreateOptions) -> Result<String> {
        let body = Bytes::from(serde_json::to_vec(&opts)?);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base("/pods/create"),
                &QueryParams::new(),
                Some(body),
            )
            .await?;
        #[derive(serde::Deserialize)]
        struct PodCreateResponse {
            id: String,
        }
        let response: PodCreateResponse = Self::decode(status, &bytes, RemoteEntity::Pod, "")?;
        Ok(response.id)
    }

    async fn pod_exists(&self, name: &str) -> Result<BoolReport> {
        let (status, _) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/pods/{name}/exists")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Ok(BoolReport {
            value: status == 204,
        })
    }

    async fn pod_inspect(&self, name: &str) -> Result<PodInspect> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/pods/{name}/json")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Pod, name)
    }

    async fn pod_list(&self) -> Result<Vec<PodInspect>> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base("/pods/json"),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Pod, "")
    }

    async fn pod_start(&self, name: &str) -> Result<PodReport> {
        match self
            .pod_op(&format!("/pods/{name}/start"), &QueryParams::new(), name)
            .await
        {
            Err(Error::CtrStopped(n)) => Err(Error::PodAlreadyStarted(n)),
            other => other,
        }
    }

    async fn pod_stop(&self, name: &str, timeout: Option<u64>) -> Result<PodReport> {
        let mut query = QueryParams::new();
        query.push_opt("t", timeout);
        match self.pod_op(&format!("/pods/{name}/stop"), &query, name).await {
            Err(Error::PodAlreadyStarted(n)) => Err(Error::PodAlreadyStopped(n)),
            other => other,
        }
    }

    async fn pod_kill(&self, name: &str, signal: &str) -> Result<PodReport> {
        let mut query = QueryParams::new();
        query.push_str("signal", signal);
        self.pod_op(&format!("/pods/{name}/kill"), &query, name).await
    }

    async fn pod_pause(&self, name: &str) -> Result<PodReport> {
        self.pod_op(&format!("/pods/{name}/pause"), &QueryParams::new(), name)
            .await
    }

    async fn pod_unpause(&self, name: &str) -> Result<PodReport> {
        self.pod_op(&format!("/pods/{name}/unpause"), &QueryParams::new(), name)
            .await
    }

    async fn pod_restart(&self, name: &str) -> Result<PodReport> {
        self.pod_op(&format!("/pods/{name}/restart"), &QueryParams::new(), name)
            .await
    }

    async fn pod_rm(&self, name: &str, force: bool, ignore: bool) -> Result<PodReport> {
        let mut query = QueryParams::new();
        query.push_bool("force", force);
        let (status, bytes) = self
            .client
            .request(
                Method::DELETE,
                &Self::base(&format!("/pods/{name}")),
                &query,
                None,
            )
            .await?;
        match Self::decode(status, &bytes, RemoteEntity::Pod, name) {
            Err(Error::NoSuchPod(_)) if ignore => Ok(PodReport {
                id: name.to_string(),
                member_errs: Vec::new(),
            }),
            other => other,
        }
    }

    async fn pod_prune(&self) -> Result<PruneReport> {
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base("/pods/prune"),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Pod, "")
    }

    async fn pod_top(&self, name: &str) -> Result<TopReport> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/pods/{name}/top")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Pod, name)
    }

    async fn pod_stats(&self, name: &str) -> Result<Vec<ContainerStats>> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/pods/{name}/stats")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Pod, name)
    }

    // --- volumes ---

    async fn volume_create(&self, opts: VolumeCreateOptions) -> Result<VolumeInspect> {
        let body = Bytes::from(serde_json::to_vec(&opts)?);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base("/volumes/create"),
                &QueryParams::new(),
                Some(body),
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Volume, "")
    }

    async fn volume_exists(&self, name: &str) -> Result<BoolReport> {
        let (status, _) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/volumes/{name}/exists")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Ok(BoolReport {
            value: status == 204,
        })
    }

    async fn volume_inspect(&self, name: &str) -> Result<VolumeInspect> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/volumes/{name}/json")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Volume, name)
    }

    async fn volume_list(&self, filters: VolumeFilters) -> Result<Vec<VolumeInspect>> {
        let mut query = QueryParams::new();
        query.push_opt("driver", filters.driver.as_deref());
        if !filters.names.is_empty() {
            query.push_str("name", &filters.names.join(","));
        }
        let (status, bytes) = self
            .client
            .request(Method::GET, &Self::base("/volumes/json"), &query, None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Volume, "")
    }

    async fn volume_rm(&self, name: &str, force: bool) -> Result<()> {
        let mut query = QueryParams::new();
        query.push_bool("force", force);
        let (status, bytes) = self
            .client
            .request(
                Method::DELETE,
                &Self::base(&format!("/volumes/{name}")),
                &query,
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Volume, name)
    }

    async fn volume_prune(&self, filters: HashMap<String, Vec<String>>) -> Result<PruneReport> {
        let mut query = QueryParams::new();
        query.push_map("filters", &filters);
        let (status, bytes) = self
            .client
            .request(Method::POST, &Self::base("/volumes/prune"), &query, None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Volume, "")
    }

    // --- system ---

    async fn version(&self) -> Result<VersionReport> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base("/version"),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Other, "")
    }

    async fn info(&self) -> Result<InfoReport> {
        let (status, bytes) = self
            .client
            .request(Method::GET, &Self::base("/info"), &QueryParams::new(), None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Other, "")
    }

    async fn system_df(&self) -> Result<Vec<DfEntry>> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base("/system/df"),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Other, "")
    }

    async fn shutdown(&self) -> Result<()> {
        // Nothing to tear down client-side; the remote service owns its own
        // lifecycle.
        Ok(())
    }
}

#[async_trait]
impl ImageEngine for TunnelEngine {
    async fn image_exists(&self, name: &str) -> Result<BoolReport> {
        let (status, _) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/images/{name}/exists")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Ok(BoolReport {
            value: status == 204,
        })
    }

    async fn image_list(&self, filter: Option<&str>) -> Result<Vec<ImageSummary>> {
        let mut query = QueryParams::new();
        query.push_opt("filter", filter);
        let (status, bytes) = self
            .client
            .request(Method::GET, &Self::base("/images/json"), &query, None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Image, "")
    }

    async fn image_inspect(&self, name: &str) -> Result<ImageInspect> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/images/{name}/json")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Image, name)
    }

    async fn image_pull(&self, reference: &str, opts: PullOptions) -> Result<Vec<String>> {
        let mut query = QueryParams::new();
        query
            .push_str("reference", reference)
            .push_bool("allTags", opts.all_tags)
            .push_opt("arch", opts.arch.as_deref())
            .push_opt("os", opts.os.as_deref())
            .push_opt("tlsVerify", opts.tls_verify);
        let policy = match opts.policy {
            crate::image::pull::PullPolicy::Always => "always",
            crate::image::pull::PullPolicy::Missing => "missing",
            crate::image::pull::PullPolicy::Never => "never",
        };
        query.push_str("policy", policy);
        let (status, bytes) = self
            .client
            .request(Method::POST, &Self::base("/images/pull"), &query, None)
            .await?;
        #[derive(serde::Deserialize)]
        struct PullResponse {
            images: Vec<String>,
        }
        let response: PullResponse = Self::decode(status, &bytes, RemoteEntity::Image, reference)?;
        Ok(response.images)
    }

    async fn image_push(&self, reference: &str, opts: PullOptions) -> Result<String> {
        let mut query = QueryParams::new();
        query.push_opt("tlsVerify", opts.tls_verify);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/images/{reference}/push")),
                &query,
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Image, reference)?;
        Ok(String::from_utf8_lossy(&bytes).to_string())
    }

    async fn image_tag(&self, reference: &str, new_tag: &str) -> Result<()> {
        let mut query = QueryParams::new();
        query.push_str("target", new_tag);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/images/{reference}/tag")),
                &query,
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Image, reference)
    }

    async fn image_untag(&self, reference: &str, tag: &str) -> Result<()> {
        let mut query = QueryParams::new();
        query.push_str("target", tag);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base(&format!("/images/{reference}/untag")),
                &query,
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Image, reference)
    }

    async fn image_remove(
        &self,
        references: &[String],
        force: bool,
        all: bool,
    ) -> Result<ImageRemoveReport> {
        let mut query = QueryParams::new();
        if !references.is_empty() {
            query.push_str("images", &references.join(","));
        }
        query.push_bool("force", force).push_bool("all", all);
        let (status, bytes) = self
            .client
            .request(Method::DELETE, &Self::base("/images/remove"), &query, None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Image, "")
    }

    async fn image_prune(&self, all: bool) -> Result<PruneReport> {
        let mut query = QueryParams::new();
        query.push_bool("all", all);
        let (status, bytes) = self
            .client
            .request(Method::POST, &Self::base("/images/prune"), &query, None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Image, "")
    }

    async fn image_history(&self, reference: &str) -> Result<Vec<HistoryEntry>> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/images/{reference}/history")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Image, reference)
    }

    async fn image_tree(&self, reference: &str, what_requires: bool) -> Result<Vec<String>> {
        let mut query = QueryParams::new();
        query.push_bool("whatrequires", what_requires);
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/images/{reference}/tree")),
                &query,
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Image, reference)
    }

    async fn image_search(&self, term: &str, limit: usize) -> Result<Vec<SearchResult>> {
        let mut query = QueryParams::new();
        query.push_str("term", term).push_int("limit", limit);
        let (status, bytes) = self
            .client
            .request(Method::GET, &Self::base("/images/search"), &query, None)
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Image, term)
    }

    async fn image_import(&self, tarball_path: &Path, tag: Option<&str>) -> Result<String> {
        let data = std::fs::read(tarball_path)?;
        let mut query = QueryParams::new();
        query.push_opt("reference", tag);
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base("/images/import"),
                &query,
                Some(Bytes::from(data)),
            )
            .await?;
        #[derive(serde::Deserialize)]
        struct ImportResponse {
            id: String,
        }
        let response: ImportResponse = Self::decode(status, &bytes, RemoteEntity::Image, "")?;
        Ok(response.id)
    }

    async fn image_load(&self, archive_path: &Path) -> Result<Vec<String>> {
        let data = std::fs::read(archive_path)?;
        let (status, bytes) = self
            .client
            .request(
                Method::POST,
                &Self::base("/images/load"),
                &QueryParams::new(),
                Some(Bytes::from(data)),
            )
            .await?;
        #[derive(serde::Deserialize)]
        struct LoadResponse {
            names: Vec<String>,
        }
        let response: LoadResponse = Self::decode(status, &bytes, RemoteEntity::Image, "")?;
        Ok(response.names)
    }

    async fn image_save(&self, reference: &str, path: &Path) -> Result<()> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/images/{reference}/get")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::check(status, &bytes, RemoteEntity::Image, reference)?;
        std::fs::write(path, &bytes)?;
        Ok(())
    }

    async fn image_diff(&self, reference: &str) -> Result<Vec<FileChange>> {
        let (status, bytes) = self
            .client
            .request(
                Method::GET,
                &Self::base(&format!("/images/{reference}/changes")),
                &QueryParams::new(),
                None,
            )
            .await?;
        Self::decode(status, &bytes, RemoteEntity::Image, reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn semver_comparison() {
        use std::cmp::Ordering;
        assert_eq!(compare_semver("2.0.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_semver("1.9.0", "2.0.0"), Ordering::Less);
        assert_eq!(compare_semver("2.1.0", "2.0.0"), Ordering::Greater);
        assert_eq!(compare_semver("2.0", "2.0.0"), Ordering::Equal);
    }

    #[test]
    fn base_path_carries_api_version() {
        assert_eq!(
            TunnelEngine::base("/containers/json"),
            format!("/v{API_VERSION}/libpod/containers/json")
        );
    }

    #[test]
    fn check_reclassifies_404_by_entity() {
        let body = Bytes::from(r#"{"message":"no such thing"}"#);
        let err =
            TunnelEngine::check(404, &body, RemoteEntity::Container, "c1").unwrap_err();
        assert!(matches!(err, Error::NoSuchContainer(_)));

        let err = TunnelEngine::check(404, &body, RemoteEntity::Volume, "v1").unwrap_err();
        assert!(matches!(err, Error::NoSuchVolume(_)));
    }

    #[test]
    fn check_maps_304_to_benign() {
        let err = TunnelEngine::check(304, &Bytes::new(), RemoteEntity::Container, "c1")
            .unwrap_err();
        assert!(err.is_benign());
        let err = TunnelEngine::check(304, &Bytes::new(), RemoteEntity::Pod, "p1").unwrap_err();
        assert!(matches!(err, Error::PodAlreadyStarted(_)));
    }

    #[test]
    fn check_passes_2xx() {
        assert!(TunnelEngine::check(200, &Bytes::new(), RemoteEntity::Other, "").is_ok());
        assert!(TunnelEngine::check(204, &Bytes::new(), RemoteEntity::Other, "").is_ok());
    }

    #[tokio::test]
    async fn transport_failure_exhausts_retries() {
        // Nothing listens here; every attempt is a transport error.
        let client = TunnelClient::new(ConnectionUri::Unix {
            path: "/nonexistent/caravel-test.sock".into(),
        });
        let started = std::time::Instant::now();
        let err = client
            .request(
                Method::GET,
                "/v2.0.0/libpod/containers/json",
                &QueryParams::new(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TunnelTransport { .. }));
        // Backoff 0 + 100 + 200 ms ran.
        assert!(started.elapsed() >= std::time::Duration::from_millis(290));
    }
}
