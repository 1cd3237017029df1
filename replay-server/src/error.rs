//! Failure taxonomy of the streaming pipelines and its mapping onto RPC
//! status codes.

use replay_core::ReplayError;
use thiserror::Error;
use tonic::{Code, Status};

/// Errors that end an RPC call or stream.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Peer broke the stream protocol, e.g. referenced a chunk it never sent.
    #[error("{0}")]
    ProtocolViolation(String),

    /// Request named a table the registry does not know.
    #[error("Priority table {name} was not found")]
    TableNotFound {
        /// Requested table name.
        name: String,
    },

    /// Request parameters are out of range, or the call is not configured.
    #[error("{0}")]
    InvalidArgument(String),

    /// Response could not be handed to the transport.
    #[error("{0}")]
    WriteFailed(String),

    /// Chunk store was closed while the stream was running.
    #[error("Service has been closed")]
    Shutdown,

    /// Per-stream chunk cache disagrees with the keys the client asked to
    /// keep. Indicates a bug on one side of the protocol.
    #[error("{0}")]
    CacheInvariant(String),

    /// Error reported by a table, the chunk store or the checkpointer.
    #[error(transparent)]
    Upstream(#[from] ReplayError),
}

impl ServiceError {
    pub fn table_not_found(name: impl Into<String>) -> Self {
        Self::TableNotFound { name: name.into() }
    }

    /// Status code surfaced to the peer.
    #[must_use]
    pub const fn code(&self) -> Code {
        match self {
            Self::ProtocolViolation(_) | Self::WriteFailed(_) | Self::CacheInvariant(_) => {
                Code::Internal
            }
            Self::TableNotFound { .. } => Code::NotFound,
            Self::InvalidArgument(_) => Code::InvalidArgument,
            Self::Shutdown => Code::Cancelled,
            Self::Upstream(err) => upstream_code(err),
        }
    }
}

const fn upstream_code(err: &ReplayError) -> Code {
    match err {
        ReplayError::NotFound(_) => Code::NotFound,
        ReplayError::InvalidArgument(_) => Code::InvalidArgument,
        ReplayError::FailedPrecondition(_) => Code::FailedPrecondition,
        ReplayError::DeadlineExceeded(_) => Code::DeadlineExceeded,
        ReplayError::Cancelled(_) => Code::Cancelled,
        ReplayError::Internal(_) => Code::Internal,
    }
}

impl From<ServiceError> for Status {
    fn from(err: ServiceError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}
