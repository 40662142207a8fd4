//! Operation table: commands, server replies and reply inspection.
//!
//! Every operation kind is a [`Command`] variant. The server answers each
//! request with exactly one [`Reply`]. [`inspect`] maps a reply to the
//! dispatcher's next step; the typed result is built afterwards from the
//! same reply (see `results`).

use std::fmt::Display;

use cairn_types::{
    CurrentVersion, EventData, EventNumber, ExpectedVersion, NodeEndpoints, Position,
    ResolvedEvent,
};

use crate::error::ClientError;
use crate::filter::Filter;
use crate::subscription::{PersistentSubscriptionSettings, SubscriptionDropReason};

/// Largest page a single read may request.
pub const MAX_READ_SIZE: u32 = 4096;

// ============================================================================
// Commands
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadDirection {
    Forward,
    Backward,
}

/// The kind of an operation, for errors and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    AppendToStream,
    ConditionalAppendToStream,
    DeleteStream,
    ReadEvent,
    ReadStreamEventsForward,
    ReadStreamEventsBackward,
    ReadAllEventsForward,
    ReadAllEventsBackward,
    CreatePersistentSubscription,
    UpdatePersistentSubscription,
    DeletePersistentSubscription,
    SubscribeToStream,
    ConnectToPersistentSubscription,
}

impl OperationKind {
    /// Writes can only be served by the leader.
    pub fn is_write(self) -> bool {
        matches!(
            self,
            Self::AppendToStream
                | Self::ConditionalAppendToStream
                | Self::DeleteStream
                | Self::CreatePersistentSubscription
                | Self::UpdatePersistentSubscription
                | Self::DeletePersistentSubscription
        )
    }
}

impl Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::AppendToStream => "AppendToStream",
            Self::ConditionalAppendToStream => "ConditionalAppendToStream",
            Self::DeleteStream => "DeleteStream",
            Self::ReadEvent => "ReadEvent",
            Self::ReadStreamEventsForward => "ReadStreamEventsForward",
            Self::ReadStreamEventsBackward => "ReadStreamEventsBackward",
            Self::ReadAllEventsForward => "ReadAllEventsForward",
            Self::ReadAllEventsBackward => "ReadAllEventsBackward",
            Self::CreatePersistentSubscription => "CreatePersistentSubscription",
            Self::UpdatePersistentSubscription => "UpdatePersistentSubscription",
            Self::DeletePersistentSubscription => "DeletePersistentSubscription",
            Self::SubscribeToStream => "SubscribeToStream",
            Self::ConnectToPersistentSubscription => "ConnectToPersistentSubscription",
        };
        f.write_str(name)
    }
}

/// A request the client can send. Retries resend the same command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    AppendToStream {
        stream: String,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    },
    /// Like `AppendToStream`, but a version mismatch or a deleted stream is
    /// a result status rather than an error.
    ConditionalAppendToStream {
        stream: String,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    },
    DeleteStream {
        stream: String,
        expected_version: ExpectedVersion,
        hard_delete: bool,
    },
    /// `event_number: None` reads the last event of the stream.
    ReadEvent {
        stream: String,
        event_number: Option<EventNumber>,
        resolve_link_tos: bool,
    },
    /// `from: None` starts at the end of the stream (backward reads only).
    ReadStreamEvents {
        stream: String,
        from: Option<EventNumber>,
        max_count: u32,
        direction: ReadDirection,
        resolve_link_tos: bool,
    },
    ReadAllEvents {
        position: Position,
        max_count: u32,
        direction: ReadDirection,
        resolve_link_tos: bool,
        filter: Option<Filter>,
        max_search_window: Option<u32>,
    },
    CreatePersistentSubscription {
        stream: String,
        group: String,
        settings: PersistentSubscriptionSettings,
    },
    UpdatePersistentSubscription {
        stream: String,
        group: String,
        settings: PersistentSubscriptionSettings,
    },
    DeletePersistentSubscription {
        stream: String,
        group: String,
    },
    /// `stream: None` subscribes to `$all`.
    SubscribeToStream {
        stream: Option<String>,
        resolve_link_tos: bool,
        filter: Option<Filter>,
        checkpoint_interval: Option<u32>,
    },
    ConnectToPersistentSubscription {
        stream: String,
        group: String,
        allowed_in_flight: u32,
    },
}

impl Command {
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::AppendToStream { .. } => OperationKind::AppendToStream,
            Self::ConditionalAppendToStream { .. } => OperationKind::ConditionalAppendToStream,
            Self::DeleteStream { .. } => OperationKind::DeleteStream,
            Self::ReadEvent { .. } => OperationKind::ReadEvent,
            Self::ReadStreamEvents {
                direction: ReadDirection::Forward,
                ..
            } => OperationKind::ReadStreamEventsForward,
            Self::ReadStreamEvents { .. } => OperationKind::ReadStreamEventsBackward,
            Self::ReadAllEvents {
                direction: ReadDirection::Forward,
                ..
            } => OperationKind::ReadAllEventsForward,
            Self::ReadAllEvents { .. } => OperationKind::ReadAllEventsBackward,
            Self::CreatePersistentSubscription { .. } => {
                OperationKind::CreatePersistentSubscription
            }
            Self::UpdatePersistentSubscription { .. } => {
                OperationKind::UpdatePersistentSubscription
            }
            Self::DeletePersistentSubscription { .. } => {
                OperationKind::DeletePersistentSubscription
            }
            Self::SubscribeToStream { .. } => OperationKind::SubscribeToStream,
            Self::ConnectToPersistentSubscription { .. } => {
                OperationKind::ConnectToPersistentSubscription
            }
        }
    }

    /// The stream the command addresses; `$all` operations have none.
    pub fn stream(&self) -> Option<&str> {
        match self {
            Self::AppendToStream { stream, .. }
            | Self::ConditionalAppendToStream { stream, .. }
            | Self::DeleteStream { stream, .. }
            | Self::ReadEvent { stream, .. }
            | Self::ReadStreamEvents { stream, .. }
            | Self::CreatePersistentSubscription { stream, .. }
            | Self::UpdatePersistentSubscription { stream, .. }
            | Self::DeletePersistentSubscription { stream, .. }
            | Self::ConnectToPersistentSubscription { stream, .. } => Some(stream),
            Self::SubscribeToStream { stream, .. } => stream.as_deref(),
            Self::ReadAllEvents { .. } => None,
        }
    }

    fn stream_name(&self) -> String {
        self.stream().unwrap_or(cairn_types::ALL_STREAM).to_string()
    }

    fn expected_version(&self) -> ExpectedVersion {
        match self {
            Self::AppendToStream {
                expected_version, ..
            }
            | Self::ConditionalAppendToStream {
                expected_version, ..
            }
            | Self::DeleteStream {
                expected_version, ..
            } => *expected_version,
            _ => ExpectedVersion::Any,
        }
    }

    /// Whether the request must be served by the leader. Writes always are;
    /// everything else follows the connection setting.
    pub fn requires_leader(&self, require_leader_setting: bool) -> bool {
        self.kind().is_write() || require_leader_setting
    }

    /// Subscriptions stay open after their first reply.
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Self::SubscribeToStream { .. } | Self::ConnectToPersistentSubscription { .. }
        )
    }
}

// ============================================================================
// Replies
// ============================================================================

/// Why a node declined to handle a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotHandled {
    NotReady,
    TooBusy,
    /// The request needs the leader; `leader` is the node's best guess.
    NotLeader { leader: Option<NodeEndpoints> },
    /// The node is a read-only replica and cannot serve writes.
    IsReadOnly,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Success {
        next_expected_version: CurrentVersion,
        position: Option<Position>,
    },
    PrepareTimeout,
    CommitTimeout,
    ForwardTimeout,
    WrongExpectedVersion {
        current: CurrentVersion,
    },
    StreamDeleted,
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadEventOutcome {
    Success(ResolvedEvent),
    NotFound,
    NoStream,
    StreamDeleted,
    Error(String),
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStreamOutcome {
    Success {
        events: Vec<ResolvedEvent>,
        /// Where the next page starts; `None` once a backward read passed
        /// the first event.
        next_event_number: Option<EventNumber>,
        last_event_number: Option<EventNumber>,
        is_end_of_stream: bool,
    },
    NoStream,
    StreamDeleted,
    Error(String),
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadAllOutcome {
    Success {
        events: Vec<ResolvedEvent>,
        position: Position,
        next_position: Position,
        is_end_of_stream: bool,
    },
    Error(String),
    AccessDenied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistentOutcome {
    Success,
    AlreadyExists,
    DoesNotExist,
    Failed(String),
    AccessDenied,
}

/// The server's single reply to a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    NotHandled(NotHandled),
    BadRequest(String),
    NotAuthenticated(String),
    ServerError(String),
    Write(WriteOutcome),
    Delete(WriteOutcome),
    ReadEvent(ReadEventOutcome),
    ReadStream(ReadStreamOutcome),
    ReadAll(ReadAllOutcome),
    Persistent(PersistentOutcome),
    SubscriptionConfirmed {
        last_commit_position: i64,
        last_event_number: Option<EventNumber>,
    },
    PersistentSubscriptionConfirmed {
        subscription_id: String,
        last_commit_position: i64,
        last_event_number: Option<EventNumber>,
    },
    SubscriptionDropped(SubscriptionDropReason),
}

// ============================================================================
// Inspection
// ============================================================================

/// What the dispatcher does with a reply.
#[derive(Debug, Clone)]
pub enum Inspection {
    /// Hand the reply to the caller.
    Succeed,
    /// Transient failure; send again if the retry budget allows.
    Retry(String),
    /// Re-resolve the endpoint (optionally to the hinted node), then retry.
    Reconnect(Option<NodeEndpoints>),
    /// Fail the operation with this error.
    Fail(ClientError),
}

/// Maps a reply to the dispatcher's next step.
pub fn inspect(command: &Command, reply: &Reply) -> Inspection {
    let kind = command.kind();
    let stream = || command.stream_name();

    match (command, reply) {
        (_, Reply::NotHandled(NotHandled::NotReady)) => {
            Inspection::Retry("server not ready".to_string())
        }
        (_, Reply::NotHandled(NotHandled::TooBusy)) => {
            Inspection::Retry("server too busy".to_string())
        }
        (_, Reply::NotHandled(NotHandled::NotLeader { leader })) => {
            Inspection::Reconnect(leader.clone())
        }
        (_, Reply::NotHandled(NotHandled::IsReadOnly)) => Inspection::Fail(
            ClientError::InvalidOperation(format!("{kind} is not allowed on a read-only replica")),
        ),
        (_, Reply::BadRequest(message)) => {
            Inspection::Fail(ClientError::ServerError(format!("bad request: {message}")))
        }
        (_, Reply::NotAuthenticated(message)) => {
            Inspection::Fail(ClientError::NotAuthenticated(message.clone()))
        }
        (_, Reply::ServerError(message)) => {
            tracing::warn!(operation = %kind, %message, "server error, re-resolving endpoint");
            Inspection::Reconnect(None)
        }

        (
            Command::AppendToStream { .. } | Command::ConditionalAppendToStream { .. },
            Reply::Write(outcome),
        )
        | (Command::DeleteStream { .. }, Reply::Delete(outcome)) => {
            let conditional = matches!(command, Command::ConditionalAppendToStream { .. });
            match outcome {
                WriteOutcome::Success { .. } => Inspection::Succeed,
                WriteOutcome::PrepareTimeout => Inspection::Retry("prepare timeout".to_string()),
                WriteOutcome::CommitTimeout => Inspection::Retry("commit timeout".to_string()),
                WriteOutcome::ForwardTimeout => Inspection::Retry("forward timeout".to_string()),
                WriteOutcome::WrongExpectedVersion { .. } | WriteOutcome::StreamDeleted
                    if conditional =>
                {
                    Inspection::Succeed
                }
                WriteOutcome::WrongExpectedVersion { current } => {
                    Inspection::Fail(ClientError::WrongExpectedVersion {
                        stream: stream(),
                        expected: command.expected_version(),
                        actual: *current,
                    })
                }
                WriteOutcome::StreamDeleted => {
                    Inspection::Fail(ClientError::StreamDeleted(stream()))
                }
                WriteOutcome::AccessDenied => {
                    Inspection::Fail(ClientError::AccessDenied(format!("{kind} on '{}'", stream())))
                }
            }
        }

        (Command::ReadEvent { .. }, Reply::ReadEvent(outcome)) => match outcome {
            ReadEventOutcome::Error(message) => {
                Inspection::Fail(ClientError::ServerError(message.clone()))
            }
            ReadEventOutcome::AccessDenied => {
                Inspection::Fail(ClientError::AccessDenied(format!("read of '{}'", stream())))
            }
            _ => Inspection::Succeed,
        },

        (Command::ReadStreamEvents { .. }, Reply::ReadStream(outcome)) => match outcome {
            ReadStreamOutcome::Error(message) => {
                Inspection::Fail(ClientError::ServerError(message.clone()))
            }
            ReadStreamOutcome::AccessDenied => {
                Inspection::Fail(ClientError::AccessDenied(format!("read of '{}'", stream())))
            }
            _ => Inspection::Succeed,
        },

        (Command::ReadAllEvents { .. }, Reply::ReadAll(outcome)) => match outcome {
            ReadAllOutcome::Success { .. } => Inspection::Succeed,
            ReadAllOutcome::Error(message) => {
                Inspection::Fail(ClientError::ServerError(message.clone()))
            }
            ReadAllOutcome::AccessDenied => Inspection::Fail(ClientError::AccessDenied(format!(
                "read of '{}'",
                cairn_types::ALL_STREAM
            ))),
        },

        (
            Command::CreatePersistentSubscription { group, .. }
            | Command::UpdatePersistentSubscription { group, .. }
            | Command::DeletePersistentSubscription { group, .. },
            Reply::Persistent(outcome),
        ) => match outcome {
            PersistentOutcome::Success => Inspection::Succeed,
            PersistentOutcome::AlreadyExists => Inspection::Fail(ClientError::InvalidOperation(
                format!("subscription group '{group}' on '{}' already exists", stream()),
            )),
            PersistentOutcome::DoesNotExist => Inspection::Fail(ClientError::InvalidOperation(
                format!("subscription group '{group}' on '{}' does not exist", stream()),
            )),
            PersistentOutcome::Failed(reason) => Inspection::Fail(ClientError::InvalidOperation(
                format!("{kind} failed: {reason}"),
            )),
            PersistentOutcome::AccessDenied => Inspection::Fail(ClientError::AccessDenied(
                format!("{kind} for group '{group}'"),
            )),
        },

        (Command::SubscribeToStream { .. }, Reply::SubscriptionConfirmed { .. })
        | (
            Command::ConnectToPersistentSubscription { .. },
            Reply::PersistentSubscriptionConfirmed { .. },
        ) => Inspection::Succeed,

        (
            Command::SubscribeToStream { .. } | Command::ConnectToPersistentSubscription { .. },
            Reply::SubscriptionDropped(reason),
        ) => Inspection::Fail(match reason {
            SubscriptionDropReason::AccessDenied => {
                ClientError::AccessDenied(format!("subscription to '{}'", stream()))
            }
            SubscriptionDropReason::NotAuthenticated => {
                ClientError::NotAuthenticated(format!("subscription to '{}'", stream()))
            }
            other => ClientError::SubscriptionRejected(*other),
        }),

        (_, unexpected) => Inspection::Fail(ClientError::Protocol(format!(
            "unexpected reply to {kind}: {unexpected:?}"
        ))),
    }
}
