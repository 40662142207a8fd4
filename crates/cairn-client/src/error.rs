//! Client error types.

use cairn_types::{CurrentVersion, ExpectedVersion, NodeEndpoints, TypeError};
use thiserror::Error;

use crate::operation::OperationKind;
use crate::subscription::SubscriptionDropReason;
use crate::transport::TransportError;

/// Result type for client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by operations, subscriptions and the connection itself.
#[derive(Debug, Clone, Error)]
pub enum ClientError {
    /// The server did not accept the presented credentials.
    #[error("not authenticated: {0}")]
    NotAuthenticated(String),

    /// The credentials lack permission for the operation.
    #[error("access denied: {0}")]
    AccessDenied(String),

    /// The stream was not at the expected version.
    #[error("wrong expected version for stream '{stream}': expected {expected}, actual {actual}")]
    WrongExpectedVersion {
        stream: String,
        expected: ExpectedVersion,
        actual: CurrentVersion,
    },

    /// The stream has been deleted.
    #[error("stream '{0}' has been deleted")]
    StreamDeleted(String),

    /// The request kept landing on nodes that are not the leader until the
    /// retry budget ran out.
    #[error("not leader (leader hint: {})", describe_hint(.leader))]
    NotLeader { leader: Option<NodeEndpoints> },

    /// The server failed to process the request.
    #[error("server error: {0}")]
    ServerError(String),

    /// The request is not valid in the server's current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// The server refused to start a subscription.
    #[error("subscription rejected: {0}")]
    SubscriptionRejected(SubscriptionDropReason),

    /// No response arrived in time and the retry budget is spent, or the
    /// caller's deadline passed.
    #[error("{operation} timed out after {attempts} attempt(s)")]
    OperationTimedOut {
        operation: OperationKind,
        attempts: u32,
    },

    /// Every permitted retry failed with a transient error.
    #[error("{operation} failed after {attempts} attempt(s): {reason}")]
    RetriesExhausted {
        operation: OperationKind,
        attempts: u32,
        reason: String,
    },

    /// The pending-operation queue is at capacity.
    #[error("operation queue is full ({capacity} pending)")]
    QueueFull { capacity: usize },

    /// The connection is closed and accepts no further operations.
    #[error("connection has been closed")]
    ConnectionDisposed,

    /// The connection closed while the operation was pending.
    #[error("connection closed: {reason}")]
    ConnectionClosed { reason: String },

    /// No usable cluster node could be found.
    #[error("cluster discovery failed after {attempts} attempt(s): {reason}")]
    DiscoveryFailed { attempts: u32, reason: String },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The server answered with something the client did not expect.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Transport failure.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The request was rejected before being queued.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl ClientError {
    /// Returns true if resubmitting the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::OperationTimedOut { .. }
                | Self::RetriesExhausted { .. }
                | Self::NotLeader { .. }
                | Self::QueueFull { .. }
                | Self::Transport(_)
        )
    }

    /// Returns true if the connection can no longer be used.
    pub fn is_connection_terminal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionDisposed | Self::ConnectionClosed { .. } | Self::DiscoveryFailed { .. }
        )
    }

    /// The version the stream was actually at, for concurrency failures.
    pub fn actual_version(&self) -> Option<CurrentVersion> {
        match self {
            Self::WrongExpectedVersion { actual, .. } => Some(*actual),
            _ => None,
        }
    }
}

impl From<TypeError> for ClientError {
    fn from(err: TypeError) -> Self {
        Self::InvalidArgument(err.to_string())
    }
}

fn describe_hint(leader: &Option<NodeEndpoints>) -> String {
    leader
        .as_ref()
        .map_or_else(|| "none".to_string(), ToString::to_string)
}
