//! Container model: config, state machine, store, exec sessions.

pub mod config;
pub mod exec;
pub mod state;
pub mod store;

pub use config::{ContainerConfig, Mount, NamespaceConfig, NamespaceMode, RestartPolicy};
pub use exec::{ExecConfig, ExecInspect, ExecSessionManager, ExecStatus};
pub use state::{ContainerStatus, RuntimeState, WaitCondition};
pub use store::{ContainerStore, LogOptions, RemoveOptions};
