//! Error taxonomy for the sync core.
//!
//! None of these are fatal to the host application. Each variant maps to a
//! fixed degradation:
//!
//! - [`SyncError::Transport`] → connection goes to `Failed` and is retried
//! - [`SyncError::Protocol`] → the payload is dropped and logged
//! - [`SyncError::UpstreamAck`] → local state is kept, retried once, then logged
//! - [`SyncError::StorageRead`] → treated as an anonymous session

/// Errors surfaced inside the notification/session core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Connect or subscribe failure on the push transport.
    Transport(String),
    /// Malformed inbound payload or unexpected frame.
    Protocol(String),
    /// Confirm or logout request to the REST API failed.
    UpstreamAck {
        /// Which upstream operation failed (e.g. `"confirm 17"`).
        operation: String,
        /// Failure description.
        reason: String,
    },
    /// The shared credential store could not be read.
    StorageRead(String),
}

impl SyncError {
    /// Build an upstream acknowledgment error.
    pub fn upstream(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::UpstreamAck {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(msg) => write!(f, "Transport error: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
            Self::UpstreamAck { operation, reason } => {
                write!(f, "Upstream {operation} failed: {reason}")
            }
            Self::StorageRead(msg) => write!(f, "Credential storage unreadable: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}
