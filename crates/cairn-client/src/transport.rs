//! The command transport seam.
//!
//! A [`Connector`] opens a [`TransportHandle`] to one node. The handle is a
//! pair of channels: requests flow out tagged with a [`CorrelationId`], and
//! replies, subscription pushes and heartbeat responses flow back tagged with
//! the same id. Framing, TLS and sockets live behind the trait; the engine
//! only sees these messages.
//!
//! The connection actor is the only writer to the outbound side, which keeps
//! transmission on a transport serialized.

use std::fmt::Display;

use async_trait::async_trait;
use cairn_types::{Credentials, Endpoint, Position, ResolvedEvent};
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::operation::{Command, Reply};
use crate::subscription::{NackAction, SubscriptionDropReason};

/// Tags a request so its reply can be matched regardless of arrival order.
///
/// Unique for the lifetime of a connection. Every send attempt of an
/// operation gets a fresh id, so a late reply to an abandoned attempt never
/// matches the retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CorrelationId(u64);

impl CorrelationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Client to server.
#[derive(Debug, Clone)]
pub enum Outbound {
    Request {
        correlation_id: CorrelationId,
        require_leader: bool,
        credentials: Option<Credentials>,
        command: Command,
    },
    Heartbeat {
        correlation_id: CorrelationId,
    },
    /// Ends the subscription opened under `correlation_id`.
    Unsubscribe {
        correlation_id: CorrelationId,
    },
    PersistentAck {
        correlation_id: CorrelationId,
        subscription_id: String,
        event_ids: Vec<Uuid>,
    },
    PersistentNack {
        correlation_id: CorrelationId,
        subscription_id: String,
        event_ids: Vec<Uuid>,
        action: NackAction,
        message: String,
    },
}

/// Server to client.
#[derive(Debug, Clone)]
pub enum Inbound {
    /// The single reply to a request.
    Reply {
        correlation_id: CorrelationId,
        reply: Reply,
    },
    /// Unsolicited traffic for a confirmed subscription.
    Push {
        correlation_id: CorrelationId,
        push: Push,
    },
    HeartbeatResponse {
        correlation_id: CorrelationId,
    },
    /// The server is closing the transport.
    Closed {
        reason: String,
    },
}

/// Messages pushed to a confirmed subscription.
#[derive(Debug, Clone)]
pub enum Push {
    EventAppeared(ResolvedEvent),
    PersistentEventAppeared {
        event: ResolvedEvent,
        retry_count: Option<u32>,
    },
    /// A filtered subscription scanned up to this position.
    CheckpointReached(Position),
    Dropped(SubscriptionDropReason),
}

/// Identification presented when a transport is opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub connection_name: String,
    pub use_tls: bool,
    pub validate_server: bool,
    pub credentials: Option<Credentials>,
}

/// An open transport to one node.
#[derive(Debug)]
pub struct TransportHandle {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// The server's side of a [`TransportHandle`].
#[derive(Debug)]
pub struct TransportPeer {
    pub requests: mpsc::UnboundedReceiver<Outbound>,
    pub responses: mpsc::UnboundedSender<Inbound>,
}

impl TransportHandle {
    /// Creates a connected handle and peer. Dropping either side is seen by
    /// the other as the transport closing.
    pub fn channel() -> (TransportHandle, TransportPeer) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        (
            TransportHandle {
                outbound: out_tx,
                inbound: in_rx,
            },
            TransportPeer {
                requests: out_rx,
                responses: in_tx,
            },
        )
    }
}

/// Opens transports to cluster nodes.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        handshake: &Handshake,
    ) -> Result<TransportHandle, TransportError>;
}

/// Failures opening or using a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("connection to {endpoint} refused")]
    Refused { endpoint: Endpoint },

    #[error("handshake with {endpoint} failed: {reason}")]
    Handshake { endpoint: Endpoint, reason: String },

    #[error("timed out connecting to {endpoint}")]
    Timeout { endpoint: Endpoint },

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("i/o error: {0}")]
    Io(String),
}
