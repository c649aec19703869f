//! # caravel
//!
//! **Daemonless OCI container and pod engine.**
//!
//! Every invocation is a process that drives the OCI runtime binary,
//! content-addressed storage, and image distribution itself. There is no
//! privileged daemon: the same capability surface is available in-process
//! (ABI mode) or against a remote service over HTTP (tunnel mode), and
//! every command behaves identically either way.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                     ContainerEngine / ImageEngine                    │
//! │                      (one contract, two transports)                  │
//! │        ┌──────────────────────┐   ┌───────────────────────────┐      │
//! │        │       AbiEngine      │   │       TunnelEngine        │      │
//! │        │  in-process stores   │   │  HTTP over unix/tcp/ssh   │      │
//! │        └──────────┬───────────┘   └──────────────┬────────────┘      │
//! ├───────────────────┼──────────────────────────────┼──────────────────┤
//! │                   ▼                              ▼                   │
//! │  ┌─────────────────────────────┐   ┌──────────────────────────────┐  │
//! │  │ ContainerStore  (states)    │   │  ApiServer                   │  │
//! │  │ PodCoordinator  (groups)    │◄──┤  /v{ver}/libpod/...  native  │  │
//! │  │ ImageStore      (content)   │   │  /v{ver}/...  Docker-compat  │  │
//! │  │ VolumeManager   (mounts)    │   │  attach: 8-byte frames       │  │
//! │  │ ExecSessions    (day-2)     │   └──────────────────────────────┘  │
//! │  └──────────┬──────────────────┘                                     │
//! ├─────────────┼────────────────────────────────────────────────────────┤
//! │             ▼                                                        │
//! │  ┌─────────────────────┐  ┌──────────────────┐  ┌────────────────┐   │
//! │  │  OciRuntime seam    │  │  Storage         │  │  ImagePuller   │   │
//! │  │  (runtime binary +  │  │  (blobs, rootfs, │  │  (registries,  │   │
//! │  │   monitor process)  │  │   graph layout)  │  │   archives)    │   │
//! │  └─────────────────────┘  └──────────────────┘  └────────────────┘   │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Container Lifecycle
//!
//! ```text
//!         create
//!   * ──────────► Configured ──init──► Created ──start──► Running
//!                                                  stop / kill │
//!                            Paused ◄──pause──────────────────┤
//!                               │       unpause               │
//!                               └─────────────────────────────┤
//!                                                             ▼
//!                                        rm ◄──────────── Exited
//! ```
//!
//! Pods layer on top: a pod's members share its infra container's
//! namespaces and start in dependency order (infra first), stop in
//! reverse. Pod state is derived from member states on every read.
//!
//! # Example
//!
//! ```rust,ignore
//! use caravel::config::EngineConfig;
//! use caravel::engine::abi::AbiEngine;
//! use caravel::engine::ContainerEngine;
//! use caravel::specgen::ContainerSpec;
//!
//! #[tokio::main]
//! async fn main() -> caravel::Result<()> {
//!     let engine = AbiEngine::new(EngineConfig::system())?;
//!
//!     let id = engine
//!         .container_create(ContainerSpec {
//!             name: Some("web".into()),
//!             image: Some("nginx:latest".into()),
//!             ..Default::default()
//!         })
//!         .await?;
//!     engine.container_start(&[id]).await?;
//!     Ok(())
//! }
//! ```

pub mod attach;
pub mod config;
pub mod constants;
pub mod container;
pub mod copy;
pub mod engine;
pub mod error;
pub mod events;
pub mod image;
pub mod oci;
pub mod pod;
pub mod reports;
pub mod service;
pub mod specgen;
pub mod storage;
pub mod volume;

pub use error::{Error, Result};
