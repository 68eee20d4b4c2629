use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::{CodecError, CorrelationId, ValidationError};

/// Errors settling a single request/response exchange.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("Execution context '{context}' is not ready")]
    ChannelNotReady { context: String },

    #[error("Execution context '{context}' already has a request in flight")]
    ChannelBusy { context: String },

    #[error("Collaborator failed to initialize: {0}")]
    InitializationFailure(String),

    #[error("Initialization of '{context}' is already in progress")]
    InitializationInProgress { context: String },

    #[error("Request {id} timed out after {timeout_ms}ms")]
    Timeout { id: CorrelationId, timeout_ms: u64 },

    #[error("Remote error: {0}")]
    RemoteError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Execution context '{context}' was terminated")]
    Terminated { context: String },

    #[error("Correlation id {0} is already pending")]
    DuplicateCorrelation(CorrelationId),

    #[error("Invalid task input: {0}")]
    Validation(#[from] ValidationError),
}

impl From<CodecError> for RpcError {
    fn from(err: CodecError) -> Self {
        RpcError::TransportError(err.to_string())
    }
}

/// Coarse classification of a failed task, kept on its outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Initialization,
    NotReady,
    Busy,
    Timeout,
    Remote,
    Transport,
    Terminated,
}

impl RpcError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RpcError::ChannelNotReady { .. } => FailureKind::NotReady,
            RpcError::ChannelBusy { .. } | RpcError::InitializationInProgress { .. } => {
                FailureKind::Busy
            }
            RpcError::InitializationFailure(_) => FailureKind::Initialization,
            RpcError::Timeout { .. } => FailureKind::Timeout,
            RpcError::RemoteError(_) => FailureKind::Remote,
            RpcError::TransportError(_) | RpcError::DuplicateCorrelation(_) => {
                FailureKind::Transport
            }
            RpcError::Terminated { .. } => FailureKind::Terminated,
            RpcError::Validation(_) => FailureKind::Validation,
        }
    }

    /// Whether the error invalidates every request outstanding on the same channel.
    pub fn is_channel_fatal(&self) -> bool {
        matches!(
            self,
            RpcError::TransportError(_) | RpcError::Terminated { .. }
        )
    }
}
