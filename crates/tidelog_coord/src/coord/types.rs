//! Shared types for the coordination-ensemble client seam.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both the epoch store and the ensemble implementations. `Rc` is the
//! wire-level return code of an individual operation; `Status` is the
//! internal outcome vocabulary the rest of the system speaks.

use std::sync::Arc;

use async_trait::async_trait;

/// Sentinel accepted by conditional operations to mean "any version".
pub const ANY_VERSION: i32 = -1;

/// Wire-level return code reported by the coordination ensemble for a single
/// operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rc {
    Ok,
    /// Target (or a required parent) znode does not exist.
    NoNode,
    /// Create target already exists.
    NodeExists,
    /// Conditional operation observed a different znode version.
    BadVersion,
    /// Malformed arguments; a programmer error on the caller's side.
    BadArguments,
    /// The session handle is unusable; consult the session state.
    InvalidState,
    /// The ensemble detected an internal inconsistency while applying.
    RuntimeInconsistency,
    AuthFailed,
    ConnectionLoss,
    SessionExpired,
    OperationTimeout,
    /// The client is shutting down and will not issue further operations.
    Closing,
    Unimplemented,
    SystemError,
}

impl Rc {
    /// Base mapping into the internal status vocabulary.
    ///
    /// Completion paths layer additional handling on top of this (version
    /// mismatch remapping, session-state inspection, inconsistency counters);
    /// this is only the context-free part.
    pub fn to_status(self) -> Status {
        match self {
            Rc::Ok => Status::Ok,
            Rc::NoNode => Status::NotFound,
            Rc::NodeExists => Status::Exists,
            Rc::BadVersion => Status::VersionMismatch,
            Rc::BadArguments => Status::Internal,
            Rc::InvalidState | Rc::RuntimeInconsistency => Status::Failed,
            Rc::AuthFailed => Status::Access,
            Rc::ConnectionLoss | Rc::SessionExpired | Rc::OperationTimeout => Status::NotConn,
            Rc::Closing => Status::Shutdown,
            Rc::Unimplemented | Rc::SystemError => Status::Unknown,
        }
    }
}

/// Session state of a client handle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Connected,
    Expired,
    AuthFailed,
    Closed,
}

/// Znode metadata returned with every read.
///
/// `version` increases by one on every successful write to the znode and is
/// the sole basis for conditional sets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stat {
    pub version: i32,
}

/// A single sub-operation of an atomic multi.
#[derive(Clone, Debug)]
pub enum Op {
    Create { path: String, value: Vec<u8> },
    SetData { path: String, value: Vec<u8>, version: i32 },
    Check { path: String, version: i32 },
}

impl Op {
    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. } | Op::SetData { path, .. } | Op::Check { path, .. } => path,
        }
    }
}

/// Result of a single sub-operation of a multi.
#[derive(Clone, Copy, Debug)]
pub struct OpResponse {
    pub rc: Rc,
}

/// Aggregate result of an atomic multi: the overall return code plus the
/// per-operation sub-results.
#[derive(Clone, Debug)]
pub struct MultiResponse {
    pub rc: Rc,
    pub results: Vec<OpResponse>,
}

/// Internal outcome vocabulary. This set is closed; callers dispatch on it
/// and new variants are not added casually.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Ok,
    /// Znode or log absent.
    NotFound,
    /// Create target already present.
    Exists,
    /// A conditional write lost to a concurrent writer; remapped to `Again`
    /// on completion paths.
    VersionMismatch,
    /// Concurrent writer won; the caller decides whether to re-drive the
    /// read-modify-write.
    Again,
    /// The updater decided no change was needed; success-equivalent.
    Uptodate,
    /// The proposed update is older than what is stored.
    Stale,
    BadMsg,
    Empty,
    TooBig,
    Disabled,
    InvalidParam,
    Aborted,
    Access,
    /// Session expired.
    NotConn,
    /// Unspecified coordination-service failure or runtime inconsistency.
    Failed,
    /// Programmer error: bad arguments, oversize buffer.
    Internal,
    /// The store or the client is shutting down.
    Shutdown,
    /// Unexpected code from the ensemble; completion paths log and convert
    /// this to `Failed`.
    Unknown,
}

/// Client handle onto the coordination ensemble.
///
/// Implementations must be cheap to clone behind an `Arc` and safe to call
/// from any task. Every operation either completes or fails with an `Rc`;
/// there is no implicit retry at this layer.
#[async_trait]
pub trait CoordClient: Send + Sync + 'static {
    /// Read a znode's value and stat.
    async fn get_data(&self, path: &str) -> Result<(Vec<u8>, Stat), Rc>;

    /// Conditionally overwrite a znode. Succeeds only when the znode's
    /// current version equals `expected_version` (or `ANY_VERSION`).
    async fn set_data(&self, path: &str, value: Vec<u8>, expected_version: i32)
        -> Result<Stat, Rc>;

    /// Run a batch of operations atomically: either every operation applies
    /// or none are observable.
    async fn multi(&self, ops: Vec<Op>) -> MultiResponse;

    /// Current session state. Reflects the state at call time, which is not
    /// necessarily the state at the time of a previously returned error.
    fn session_state(&self) -> SessionState;

    /// The quorum string this client is connected to.
    fn quorum(&self) -> String;
}

/// Builds clients from quorum strings. Injected into the epoch store so it
/// can swap clients when the cluster configuration changes.
pub trait CoordClientFactory: Send + Sync + 'static {
    fn connect(&self, quorum: &str) -> anyhow::Result<Arc<dyn CoordClient>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_status_mapping() {
        assert_eq!(Rc::Ok.to_status(), Status::Ok);
        assert_eq!(Rc::NoNode.to_status(), Status::NotFound);
        assert_eq!(Rc::NodeExists.to_status(), Status::Exists);
        assert_eq!(Rc::BadVersion.to_status(), Status::VersionMismatch);
        assert_eq!(Rc::Closing.to_status(), Status::Shutdown);
        assert_eq!(Rc::SessionExpired.to_status(), Status::NotConn);
        assert_eq!(Rc::SystemError.to_status(), Status::Unknown);
    }
}
