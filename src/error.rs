//! Error types for the engine.
//!
//! Errors are classified by kind at the edge where they arise and preserved
//! all the way up: the HTTP service maps kinds to status codes and the CLI
//! maps kinds to exit codes, so ABI mode and tunnel mode surface identical
//! failures. Remote 404s are reclassified back into the `NoSuch*` kinds by
//! the tunnel engine so output matches byte-for-byte.

use std::path::PathBuf;

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Exit code when the engine itself failed before the container ran.
pub const EXIT_ENGINE_FAILURE: u8 = 125;

/// Exit code when the container command exists but is not executable.
pub const EXIT_NOT_EXECUTABLE: u8 = 126;

/// Exit code when the container command was not found.
pub const EXIT_NOT_FOUND: u8 = 127;

/// Errors that can occur in the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Missing Objects
    // =========================================================================
    /// Container not found.
    #[error("no such container: {0}")]
    NoSuchContainer(String),

    /// Image not found.
    #[error("no such image: {0}")]
    NoSuchImage(String),

    /// Pod not found.
    #[error("no such pod: {0}")]
    NoSuchPod(String),

    /// Volume not found.
    #[error("no such volume: {0}")]
    NoSuchVolume(String),

    /// Exec session not found.
    #[error("no such exec session: {0}")]
    NoSuchExecSession(String),

    // =========================================================================
    // State Conflicts
    // =========================================================================
    /// Container is in the wrong state for the requested action.
    #[error("container '{id}' is in state '{state}': {reason}")]
    CtrStateInvalid {
        id: String,
        state: String,
        reason: String,
    },

    /// Stopping a container that is already stopped. Benign idempotency:
    /// HTTP 304, CLI exit 0.
    #[error("container '{0}' is already stopped")]
    CtrStopped(String),

    /// Starting a container that is already running. Benign idempotency.
    #[error("container '{0}' is already running")]
    CtrRunning(String),

    /// Starting a pod that is already started. Benign idempotency.
    #[error("pod '{0}' is already started")]
    PodAlreadyStarted(String),

    /// Stopping a pod that is already stopped. Benign idempotency.
    #[error("pod '{0}' is already stopped")]
    PodAlreadyStopped(String),

    /// A name is already taken or an object already exists.
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: &'static str, name: String },

    // =========================================================================
    // In-Use Conflicts
    // =========================================================================
    /// Image is still used by a container or is a parent of another image.
    #[error("image '{id}' is in use: {reason}")]
    ImageInUse { id: String, reason: String },

    /// Volume is still referenced by a container.
    #[error("volume '{name}' is being used by container {container}")]
    VolumeBeingUsed { name: String, container: String },

    // =========================================================================
    // Bad Input
    // =========================================================================
    /// Invalid argument to an operation.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Container spec failed validation; names the first failing invariant.
    #[error("invalid spec: {field}: {reason}")]
    InvalidSpec { field: &'static str, reason: String },

    /// Operation has no remote counterpart. Stable message: clients match it.
    #[error("{0} is not supported on remote connections")]
    NotImplementedRemote(&'static str),

    /// Operation is recognised but deliberately unimplemented.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    // =========================================================================
    // Collaborator Failures
    // =========================================================================
    /// The OCI runtime binary failed.
    #[error("OCI runtime error on container '{id}': {reason}")]
    OciRuntime { id: String, reason: String },

    /// Image pull failed.
    #[error("failed to pull image '{reference}': {reason}")]
    ImagePull { reference: String, reason: String },

    /// Storage layer failure.
    #[error("storage error at {path}: {reason}")]
    Storage { path: PathBuf, reason: String },

    /// Tunnel transport failure after retries were exhausted.
    #[error("unable to reach service at {uri}: {reason}")]
    TunnelTransport { uri: String, reason: String },

    /// The remote service's API version predates ours.
    #[error("server API version {server} is older than client {client}")]
    ServerTooOld { server: String, client: String },

    /// Attach stream lost frame synchronization mid-frame.
    #[error("attach stream lost synchronization: {0}")]
    SyncLost(String),

    /// Remote side reported an error frame on an attach stream.
    #[error("error from service on attach stream: {0}")]
    StreamError(String),

    // =========================================================================
    // I/O & Internal
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything unclassified.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status the service layer writes for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NoSuchContainer(_)
            | Error::NoSuchImage(_)
            | Error::NoSuchPod(_)
            | Error::NoSuchVolume(_)
            | Error::NoSuchExecSession(_) => 404,
            Error::CtrStateInvalid { .. }
            | Error::AlreadyExists { .. }
            | Error::ImageInUse { .. }
            | Error::VolumeBeingUsed { .. } => 409,
            Error::CtrStopped(_)
            | Error::CtrRunning(_)
            | Error::PodAlreadyStarted(_)
            | Error::PodAlreadyStopped(_) => 304,
            Error::InvalidArg(_)
            | Error::InvalidSpec { .. }
            | Error::NotImplementedRemote(_) => 400,
            Error::NotImplemented(_) => 501,
            _ => 500,
        }
    }

    /// Exit code the CLI maps this kind to.
    pub fn exit_code(&self) -> u8 {
        match self {
            Error::NoSuchContainer(_)
            | Error::NoSuchImage(_)
            | Error::NoSuchPod(_)
            | Error::NoSuchVolume(_)
            | Error::NoSuchExecSession(_) => 1,
            // Benign idempotencies: success at the CLI.
            Error::CtrStopped(_)
            | Error::CtrRunning(_)
            | Error::PodAlreadyStarted(_)
            | Error::PodAlreadyStopped(_) => 0,
            Error::ImageInUse { .. } => 2,
            _ => EXIT_ENGINE_FAILURE,
        }
    }

    /// True for the kinds that only signal "already in the requested state".
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Error::CtrStopped(_)
                | Error::CtrRunning(_)
                | Error::PodAlreadyStarted(_)
                | Error::PodAlreadyStopped(_)
        )
    }

    /// Reclassifies a remote 404 into the right `NoSuch*` kind so tunnel-mode
    /// output matches ABI mode.
    pub fn from_remote_status(status: u16, entity: RemoteEntity, name: &str, msg: String) -> Self {
        match (status, entity) {
            (404, RemoteEntity::Container) => Error::NoSuchContainer(name.to_string()),
            (404, RemoteEntity::Image) => Error::NoSuchImage(name.to_string()),
            (404, RemoteEntity::Pod) => Error::NoSuchPod(name.to_string()),
            (404, RemoteEntity::Volume) => Error::NoSuchVolume(name.to_string()),
            (404, RemoteEntity::ExecSession) => Error::NoSuchExecSession(name.to_string()),
            (409, _) => Error::CtrStateInvalid {
                id: name.to_string(),
                state: "unknown".to_string(),
                reason: msg,
            },
            (400, _) => Error::InvalidArg(msg),
            _ => Error::Internal(msg),
        }
    }
}

/// Entity hint used when reclassifying remote errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteEntity {
    Container,
    Image,
    Pod,
    Volume,
    ExecSession,
    Other,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_contract() {
        assert_eq!(Error::NoSuchContainer("x".into()).http_status(), 404);
        assert_eq!(Error::NoSuchVolume("v".into()).http_status(), 404);
        assert_eq!(
            Error::CtrStateInvalid {
                id: "x".into(),
                state: "paused".into(),
                reason: "cannot exec".into()
            }
            .http_status(),
            409
        );
        assert_eq!(Error::CtrStopped("x".into()).http_status(), 304);
        assert_eq!(Error::InvalidArg("bad".into()).http_status(), 400);
        assert_eq!(Error::Internal("boom".into()).http_status(), 500);
    }

    #[test]
    fn exit_codes_match_contract() {
        assert_eq!(Error::NoSuchContainer("x".into()).exit_code(), 1);
        assert_eq!(Error::CtrStopped("x".into()).exit_code(), 0);
        assert_eq!(
            Error::ImageInUse {
                id: "abc".into(),
                reason: "container c1".into()
            }
            .exit_code(),
            2
        );
        assert_eq!(Error::Internal("boom".into()).exit_code(), 125);
    }

    #[test]
    fn remote_404_reclassification() {
        let err = Error::from_remote_status(404, RemoteEntity::Pod, "p1", "gone".into());
        assert!(matches!(err, Error::NoSuchPod(ref n) if n == "p1"));
        let err = Error::from_remote_status(404, RemoteEntity::ExecSession, "e1", "gone".into());
        assert!(matches!(err, Error::NoSuchExecSession(_)));
    }

    #[test]
    fn benign_kinds() {
        assert!(Error::PodAlreadyStopped("p".into()).is_benign());
        assert!(!Error::NoSuchPod("p".into()).is_benign());
    }
}
