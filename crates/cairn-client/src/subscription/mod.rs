//! Subscriptions.
//!
//! Three flavours share one delivery path: the connection actor routes every
//! push tagged with a subscription's correlation id into that subscription's
//! inbox, and a task per subscription drains the inbox into the user's
//! handler, one event at a time.
//!
//! - [`live`]: events from the moment the server confirms.
//! - [`catchup`]: history from a checkpoint, then live, with every event
//!   delivered once across the boundary.
//! - [`persistent`]: server-managed groups with ack/nack flow control.

use std::fmt::Display;
use std::future::Future;

use async_trait::async_trait;
use cairn_types::{EventNumber, Position, ResolvedEvent};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub mod catchup;
pub mod live;
pub mod persistent;

pub use catchup::{CatchUpSettings, CatchUpSubscription};
pub use persistent::{
    ConsumerStrategy, NackAction, PersistentEventHandler, PersistentSubscription,
    PersistentSubscriptionSettings, StartFrom,
};

/// Why a subscription stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionDropReason {
    UserInitiated,
    NotAuthenticated,
    AccessDenied,
    SubscribingError,
    ServerError,
    ConnectionClosed,
    CatchUpError,
    ProcessingQueueOverflow,
    EventHandlerException,
    MaxSubscribersReached,
    PersistentSubscriptionDeleted,
    NotFound,
    Unknown,
}

impl Display for SubscriptionDropReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::UserInitiated => "unsubscribed by user",
            Self::NotAuthenticated => "not authenticated",
            Self::AccessDenied => "access denied",
            Self::SubscribingError => "subscribing error",
            Self::ServerError => "server error",
            Self::ConnectionClosed => "connection closed",
            Self::CatchUpError => "catch-up error",
            Self::ProcessingQueueOverflow => "processing queue overflow",
            Self::EventHandlerException => "event handler exception",
            Self::MaxSubscribersReached => "max subscribers reached",
            Self::PersistentSubscriptionDeleted => "persistent subscription deleted",
            Self::NotFound => "not found",
            Self::Unknown => "unknown",
        };
        f.write_str(text)
    }
}

/// What the connection actor pushes into a subscription's inbox.
#[derive(Debug, Clone)]
pub(crate) enum SubscriptionMessage {
    Event(ResolvedEvent),
    PersistentEvent {
        event: ResolvedEvent,
        retry_count: Option<u32>,
    },
    Checkpoint(Position),
    ServerDropped(SubscriptionDropReason),
    /// The transport carrying the subscription is gone; the connection will
    /// reconnect.
    ConnectionLost,
    /// The connection closed for good.
    ConnectionClosed(String),
}

pub(crate) type SubscriptionRoute = mpsc::UnboundedSender<SubscriptionMessage>;
pub(crate) type SubscriptionInbox = mpsc::UnboundedReceiver<SubscriptionMessage>;

/// Details of a dropped subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DropNotice {
    pub reason: SubscriptionDropReason,
    /// The handler or server error that caused the drop, if any.
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionState {
    Subscribing,
    CatchingUp,
    Live,
    Dropped(DropNotice),
}

impl SubscriptionState {
    pub fn is_dropped(&self) -> bool {
        matches!(self, Self::Dropped(_))
    }
}

/// What the server reported when it confirmed a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionConfirmation {
    pub last_commit_position: i64,
    pub last_event_number: Option<EventNumber>,
}

/// Requests from a subscription handle to its task.
#[derive(Debug)]
pub(crate) enum Control {
    Stop,
    Ack(Vec<uuid::Uuid>),
    Nack {
        event_ids: Vec<uuid::Uuid>,
        action: NackAction,
        reason: String,
    },
}

/// Handle shared by live and catch-up subscriptions.
///
/// Dropping the handle leaves the subscription running; call
/// [`Subscription::stop`] or [`Subscription::unsubscribe`] to end it.
#[derive(Debug, Clone)]
pub struct Subscription {
    stream: Option<String>,
    confirmation: Option<SubscriptionConfirmation>,
    state: watch::Receiver<SubscriptionState>,
    control: mpsc::UnboundedSender<Control>,
}

impl Subscription {
    pub(crate) fn new(
        stream: Option<String>,
        confirmation: Option<SubscriptionConfirmation>,
        state: watch::Receiver<SubscriptionState>,
        control: mpsc::UnboundedSender<Control>,
    ) -> Self {
        Self {
            stream,
            confirmation,
            state,
            control,
        }
    }

    /// The subscribed stream; `None` for `$all`.
    pub fn stream_id(&self) -> Option<&str> {
        self.stream.as_deref()
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.stream.is_none()
    }

    /// Last commit position reported by the server when a live subscription
    /// was confirmed.
    pub fn last_commit_position(&self) -> Option<i64> {
        self.confirmation.map(|c| c.last_commit_position)
    }

    /// Last event number of the stream when a live subscription was
    /// confirmed; `None` if the stream did not exist or for `$all`.
    pub fn last_event_number(&self) -> Option<EventNumber> {
        self.confirmation.and_then(|c| c.last_event_number)
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    /// Asks the subscription to stop. Returns at once.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Stops the subscription and waits until it has dropped.
    pub async fn unsubscribe(&self) -> DropNotice {
        self.stop();
        self.dropped().await
    }

    /// Waits until the subscription drops.
    pub async fn dropped(&self) -> DropNotice {
        wait_dropped(self.state.clone()).await
    }
}

pub(crate) async fn wait_dropped(mut state: watch::Receiver<SubscriptionState>) -> DropNotice {
    loop {
        if let SubscriptionState::Dropped(notice) = &*state.borrow_and_update() {
            return notice.clone();
        }
        if state.changed().await.is_err() {
            // The task is gone without reporting; treat it as a closed
            // connection.
            return match &*state.borrow() {
                SubscriptionState::Dropped(notice) => notice.clone(),
                _ => DropNotice {
                    reason: SubscriptionDropReason::ConnectionClosed,
                    error: None,
                },
            };
        }
    }
}

/// Receives the events of a live or catch-up subscription.
///
/// Calls are sequential: the next call starts after the previous one
/// returned. Returning an error drops the subscription with
/// [`SubscriptionDropReason::EventHandlerException`].
#[async_trait]
pub trait EventHandler: Send + 'static {
    async fn event_appeared(&mut self, event: ResolvedEvent) -> anyhow::Result<()>;

    /// A filtered subscription scanned up to `position` without necessarily
    /// finding a match.
    async fn checkpoint_reached(&mut self, _position: Position) -> anyhow::Result<()> {
        Ok(())
    }

    /// A catch-up subscription finished history and switched to live events.
    async fn live_processing_started(&mut self) {}

    async fn subscription_dropped(
        &mut self,
        _reason: SubscriptionDropReason,
        _error: Option<&anyhow::Error>,
    ) {
    }
}

/// An [`EventHandler`] from a closure.
pub struct FnHandler<F> {
    f: F,
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: FnMut(ResolvedEvent) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: FnMut(ResolvedEvent) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn event_appeared(&mut self, event: ResolvedEvent) -> anyhow::Result<()> {
        (self.f)(event).await
    }
}

/// Maps an operation error to the reason a subscription drops with.
pub(crate) fn drop_reason_for(err: &crate::error::ClientError) -> SubscriptionDropReason {
    use crate::error::ClientError;
    match err {
        ClientError::AccessDenied(_) => SubscriptionDropReason::AccessDenied,
        ClientError::NotAuthenticated(_) => SubscriptionDropReason::NotAuthenticated,
        ClientError::SubscriptionRejected(reason) => *reason,
        ClientError::ConnectionClosed { .. }
        | ClientError::ConnectionDisposed
        | ClientError::DiscoveryFailed { .. } => SubscriptionDropReason::ConnectionClosed,
        _ => SubscriptionDropReason::SubscribingError,
    }
}

/// Tells the handler, then publishes the final state. Waiters on
/// [`Subscription::dropped`] wake only after the handler returned.
pub(crate) async fn report_drop<H: EventHandler>(
    handler: &mut H,
    state: &watch::Sender<SubscriptionState>,
    reason: SubscriptionDropReason,
    error: Option<anyhow::Error>,
) {
    let message = error.as_ref().map(|e| format!("{e:#}"));
    match &message {
        Some(message) => warn!(%reason, error = %message, "subscription dropped"),
        None => debug!(%reason, "subscription dropped"),
    }
    handler.subscription_dropped(reason, error.as_ref()).await;
    state.send_replace(SubscriptionState::Dropped(DropNotice {
        reason,
        error: message,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ClientError;

    #[tokio::test]
    async fn test_dropped_resolves_once_state_is_dropped() {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Live);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let sub = Subscription::new(Some("orders".to_string()), None, state_rx, control_tx);

        let waiter = tokio::spawn({
            let sub = sub.clone();
            async move { sub.unsubscribe().await }
        });

        assert!(matches!(control_rx.recv().await, Some(Control::Stop)));
        state_tx
            .send(SubscriptionState::Dropped(DropNotice {
                reason: SubscriptionDropReason::UserInitiated,
                error: None,
            }))
            .unwrap();

        let notice = waiter.await.unwrap();
        assert_eq!(notice.reason, SubscriptionDropReason::UserInitiated);
        assert!(sub.state().is_dropped());
    }

    #[tokio::test]
    async fn test_vanished_task_reads_as_connection_closed() {
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Subscribing);
        drop(state_tx);
        let notice = wait_dropped(state_rx).await;
        assert_eq!(notice.reason, SubscriptionDropReason::ConnectionClosed);
    }

    #[test]
    fn test_drop_reason_mapping() {
        assert_eq!(
            drop_reason_for(&ClientError::AccessDenied("x".to_string())),
            SubscriptionDropReason::AccessDenied
        );
        assert_eq!(
            drop_reason_for(&ClientError::ConnectionDisposed),
            SubscriptionDropReason::ConnectionClosed
        );
        assert_eq!(
            drop_reason_for(&ClientError::SubscriptionRejected(
                SubscriptionDropReason::MaxSubscribersReached
            )),
            SubscriptionDropReason::MaxSubscribersReached
        );
    }

    #[tokio::test]
    async fn test_handler_fn() {
        let mut handler = handler_fn(|event: ResolvedEvent| async move {
            anyhow::ensure!(event.original_event().event_type == "ok", "bad event");
            Ok(())
        });
        let event = |event_type: &str| {
            ResolvedEvent::from_event(
                cairn_types::RecordedEvent {
                    stream_id: "s".to_string(),
                    event_id: uuid::Uuid::new_v4(),
                    event_number: EventNumber::ZERO,
                    event_type: event_type.to_string(),
                    is_json: false,
                    data: bytes::Bytes::new(),
                    metadata: bytes::Bytes::new(),
                    created: cairn_types::Timestamp::EPOCH,
                },
                None,
            )
        };
        assert!(handler.event_appeared(event("ok")).await.is_ok());
        assert!(handler.event_appeared(event("nope")).await.is_err());
    }
}
