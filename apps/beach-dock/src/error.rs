use thiserror::Error;

use crate::backend::BackendError;
use crate::config::ConfigError;
use crate::session::{SessionId, SessionKind, TabId};
use crate::transport::TransportError;

/// Failures reported back to callers of [`crate::DockHandle`].
///
/// Only problems the caller can act on surface here. Stream errors,
/// disconnects and late frames become session state changes instead.
#[derive(Debug, Error)]
pub enum DockError {
    #[error("session {0} not found")]
    NotFound(SessionId),
    #[error("tab {0} not found")]
    TabNotFound(TabId),
    #[error("{operation} is not supported for {kind} sessions")]
    Unsupported {
        operation: &'static str,
        kind: SessionKind,
    },
    #[error("session {0} has no backend id yet")]
    NotReady(SessionId),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("job backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("session engine has stopped")]
    EngineStopped,
}
