//! Persistent subscriptions.
//!
//! The server owns the checkpoint and hands each group member at most
//! `buffer_size` unacknowledged events. In automatic mode the client acks
//! after the handler returns and nacks if it fails. In manual mode the
//! caller acks or nacks through the [`PersistentSubscription`] handle, and
//! no further event reaches the handler while `buffer_size` events are
//! outstanding. More than `buffer_size` events waiting behind them drops the
//! subscription with `ProcessingQueueOverflow`.
//!
//! Losing the connection drops the subscription; reconnecting to the group
//! is a new [`crate::Connection::connect_to_persistent_subscription`] call.

use std::collections::{HashSet, VecDeque};
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use cairn_types::{EventNumber, ResolvedEvent};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::{
    Control, DropNotice, SubscriptionDropReason, SubscriptionInbox, SubscriptionMessage,
    SubscriptionState, wait_dropped,
};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::operation::{Command, MAX_READ_SIZE, Reply};
use crate::transport::{CorrelationId, Outbound};

/// What the server should do with a nacked event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum NackAction {
    /// Let the server decide.
    #[default]
    Unknown,
    /// Move the event to the group's parked stream.
    Park,
    /// Redeliver the event.
    Retry,
    /// Treat the event as processed.
    Skip,
    /// Stop the subscription.
    Stop,
}

impl Display for NackAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unknown => "unknown",
            Self::Park => "park",
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Stop => "stop",
        })
    }
}

/// How the server spreads a group's events over its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConsumerStrategy {
    #[default]
    RoundRobin,
    DispatchToSingle,
    Pinned,
}

impl ConsumerStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "RoundRobin",
            Self::DispatchToSingle => "DispatchToSingle",
            Self::Pinned => "Pinned",
        }
    }
}

impl Display for ConsumerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a new group starts reading its stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartFrom {
    Beginning,
    /// Only events written after the group was created.
    #[default]
    Current,
    Event(EventNumber),
}

/// Server-side settings of a persistent subscription group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentSubscriptionSettings {
    pub resolve_link_tos: bool,
    pub start_from: StartFrom,
    /// Time before an unacked event is redelivered.
    pub message_timeout: Duration,
    /// Redeliveries before an event is parked.
    pub max_retry_count: u32,
    pub live_buffer_size: u32,
    pub read_batch_size: u32,
    pub history_buffer_size: u32,
    pub checkpoint_after: Duration,
    pub min_checkpoint_count: u32,
    pub max_checkpoint_count: u32,
    /// 0 means unlimited.
    pub max_subscriber_count: u32,
    pub consumer_strategy: ConsumerStrategy,
}

impl Default for PersistentSubscriptionSettings {
    fn default() -> Self {
        Self {
            resolve_link_tos: false,
            start_from: StartFrom::Current,
            message_timeout: Duration::from_secs(30),
            max_retry_count: 10,
            live_buffer_size: 500,
            read_batch_size: 20,
            history_buffer_size: 500,
            checkpoint_after: Duration::from_secs(2),
            min_checkpoint_count: 10,
            max_checkpoint_count: 1000,
            max_subscriber_count: 0,
            consumer_strategy: ConsumerStrategy::RoundRobin,
        }
    }
}

impl PersistentSubscriptionSettings {
    pub fn with_start_from(mut self, start_from: StartFrom) -> Self {
        self.start_from = start_from;
        self
    }

    pub fn with_resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    pub fn with_consumer_strategy(mut self, strategy: ConsumerStrategy) -> Self {
        self.consumer_strategy = strategy;
        self
    }

    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        let invalid = |message: String| Err(ClientError::InvalidArgument(message));
        if self.read_batch_size == 0 || self.read_batch_size > MAX_READ_SIZE {
            return invalid(format!(
                "read batch size must be between 1 and {MAX_READ_SIZE}, got {}",
                self.read_batch_size
            ));
        }
        if self.live_buffer_size == 0 || self.history_buffer_size == 0 {
            return invalid("buffer sizes must be positive".to_string());
        }
        if self.min_checkpoint_count > self.max_checkpoint_count {
            return invalid(format!(
                "min checkpoint count {} exceeds max checkpoint count {}",
                self.min_checkpoint_count, self.max_checkpoint_count
            ));
        }
        Ok(())
    }
}

/// Receives the events of a persistent subscription.
#[async_trait]
pub trait PersistentEventHandler: Send + 'static {
    /// `retry_count` is how often the server redelivered the event, when
    /// it says so.
    async fn event_appeared(
        &mut self,
        subscription: &PersistentSubscription,
        event: ResolvedEvent,
        retry_count: Option<u32>,
    ) -> anyhow::Result<()>;

    async fn subscription_dropped(
        &mut self,
        _reason: SubscriptionDropReason,
        _error: Option<&anyhow::Error>,
    ) {
    }
}

/// Handle to a connected persistent subscription.
#[derive(Debug, Clone)]
pub struct PersistentSubscription {
    stream: String,
    group: String,
    subscription_id: String,
    state: watch::Receiver<SubscriptionState>,
    control: mpsc::UnboundedSender<Control>,
}

impl PersistentSubscription {
    pub fn stream_id(&self) -> &str {
        &self.stream
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    /// Identifier the server assigned to this member.
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    pub fn state(&self) -> SubscriptionState {
        self.state.borrow().clone()
    }

    pub fn ack(&self, event: &ResolvedEvent) {
        self.ack_many([event.original_event().event_id]);
    }

    pub fn ack_many(&self, event_ids: impl IntoIterator<Item = Uuid>) {
        let _ = self.control.send(Control::Ack(event_ids.into_iter().collect()));
    }

    pub fn nack(&self, event: &ResolvedEvent, action: NackAction, reason: impl Into<String>) {
        self.nack_many([event.original_event().event_id], action, reason);
    }

    pub fn nack_many(
        &self,
        event_ids: impl IntoIterator<Item = Uuid>,
        action: NackAction,
        reason: impl Into<String>,
    ) {
        let _ = self.control.send(Control::Nack {
            event_ids: event_ids.into_iter().collect(),
            action,
            reason: reason.into(),
        });
    }

    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    pub async fn unsubscribe(&self) -> DropNotice {
        self.stop();
        self.dropped().await
    }

    pub async fn dropped(&self) -> DropNotice {
        wait_dropped(self.state.clone()).await
    }
}

/// Connects to a group and spawns the task feeding `handler`.
pub(crate) async fn connect<H: PersistentEventHandler>(
    connection: &Connection,
    stream: String,
    group: String,
    handler: H,
    buffer_size: u32,
    auto_ack: bool,
) -> ClientResult<PersistentSubscription> {
    let opened = connection
        .open_subscription(Command::ConnectToPersistentSubscription {
            stream: stream.clone(),
            group: group.clone(),
            allowed_in_flight: buffer_size,
        })
        .await?;
    let subscription_id = match opened.reply {
        Reply::PersistentSubscriptionConfirmed {
            subscription_id, ..
        } => subscription_id,
        other => {
            connection.unsubscribe(opened.correlation_id);
            return Err(ClientError::Protocol(format!(
                "unexpected persistent subscription confirmation: {other:?}"
            )));
        }
    };
    debug!(%stream, %group, %subscription_id, buffer_size, auto_ack, "connected to persistent subscription");

    let (state_tx, state_rx) = watch::channel(SubscriptionState::Live);
    let (control_tx, control_rx) = mpsc::unbounded_channel();
    let handle = PersistentSubscription {
        stream,
        group,
        subscription_id: subscription_id.clone(),
        state: state_rx,
        control: control_tx,
    };

    let task = PersistentTask {
        connection: connection.clone(),
        correlation_id: opened.correlation_id,
        subscription_id,
        handle: handle.clone(),
        handler,
        inbox: opened.inbox,
        control: control_rx,
        state: state_tx,
        pending: VecDeque::new(),
        unacked: HashSet::new(),
        buffer_size: buffer_size.max(1) as usize,
        auto_ack,
    };
    tokio::spawn(task.run());
    Ok(handle)
}

type Stopped = (SubscriptionDropReason, Option<anyhow::Error>);

struct PersistentTask<H> {
    connection: Connection,
    correlation_id: CorrelationId,
    subscription_id: String,
    handle: PersistentSubscription,
    handler: H,
    inbox: SubscriptionInbox,
    control: mpsc::UnboundedReceiver<Control>,
    state: watch::Sender<SubscriptionState>,
    /// Received but not yet handed to the handler.
    pending: VecDeque<(ResolvedEvent, Option<u32>)>,
    /// Handed to the handler, awaiting a manual ack or nack.
    unacked: HashSet<Uuid>,
    buffer_size: usize,
    auto_ack: bool,
}

impl<H: PersistentEventHandler> PersistentTask<H> {
    async fn run(mut self) {
        let (reason, error) = self.pump().await;
        self.connection.unsubscribe(self.correlation_id);

        let message = error.as_ref().map(|e| format!("{e:#}"));
        debug!(subscription_id = %self.subscription_id, %reason, error = ?message, "persistent subscription dropped");
        self.handler.subscription_dropped(reason, error.as_ref()).await;
        self.state.send_replace(SubscriptionState::Dropped(DropNotice {
            reason,
            error: message,
        }));
    }

    async fn pump(&mut self) -> Stopped {
        let mut control_open = true;
        loop {
            tokio::select! {
                biased;

                command = self.control.recv(), if control_open => match command {
                    Some(Control::Stop) => return (SubscriptionDropReason::UserInitiated, None),
                    Some(Control::Ack(event_ids)) => self.ack(event_ids),
                    Some(Control::Nack { event_ids, action, reason }) => {
                        self.nack(event_ids, action, reason)
                    }
                    None => control_open = false,
                },
                message = self.inbox.recv() => match message {
                    Some(SubscriptionMessage::PersistentEvent { event, retry_count }) => {
                        if let Err(stopped) = self.enqueue(event, retry_count) {
                            return stopped;
                        }
                    }
                    Some(SubscriptionMessage::Event(event)) => {
                        if let Err(stopped) = self.enqueue(event, None) {
                            return stopped;
                        }
                    }
                    Some(SubscriptionMessage::Checkpoint(_)) => {}
                    Some(SubscriptionMessage::ServerDropped(reason)) => return (reason, None),
                    Some(SubscriptionMessage::ConnectionLost)
                    | Some(SubscriptionMessage::ConnectionClosed(_))
                    | None => return (SubscriptionDropReason::ConnectionClosed, None),
                },
            }

            if let Err(stopped) = self.deliver_pending().await {
                return stopped;
            }
        }
    }

    fn enqueue(&mut self, event: ResolvedEvent, retry_count: Option<u32>) -> Result<(), Stopped> {
        self.pending.push_back((event, retry_count));
        if !self.auto_ack && self.pending.len() > self.buffer_size {
            warn!(
                subscription_id = %self.subscription_id,
                pending = self.pending.len(),
                unacked = self.unacked.len(),
                "server exceeded the in-flight window"
            );
            return Err((SubscriptionDropReason::ProcessingQueueOverflow, None));
        }
        Ok(())
    }

    fn has_room(&self) -> bool {
        self.auto_ack || self.unacked.len() < self.buffer_size
    }

    async fn deliver_pending(&mut self) -> Result<(), Stopped> {
        while self.has_room() {
            let Some((event, retry_count)) = self.pending.pop_front() else {
                break;
            };
            let event_id = event.original_event().event_id;
            if !self.auto_ack {
                self.unacked.insert(event_id);
            }
            trace!(%event_id, ?retry_count, "delivering persistent event");

            match self
                .handler
                .event_appeared(&self.handle, event, retry_count)
                .await
            {
                Ok(()) if self.auto_ack => self.ack(vec![event_id]),
                Ok(()) => {}
                Err(err) => {
                    if self.auto_ack {
                        self.nack(vec![event_id], NackAction::Unknown, format!("{err:#}"));
                    }
                    return Err((SubscriptionDropReason::EventHandlerException, Some(err)));
                }
            }
        }
        Ok(())
    }

    fn ack(&mut self, event_ids: Vec<Uuid>) {
        if event_ids.is_empty() {
            return;
        }
        for id in &event_ids {
            self.unacked.remove(id);
        }
        self.connection.forward(Outbound::PersistentAck {
            correlation_id: self.correlation_id,
            subscription_id: self.subscription_id.clone(),
            event_ids,
        });
    }

    fn nack(&mut self, event_ids: Vec<Uuid>, action: NackAction, message: String) {
        if event_ids.is_empty() {
            return;
        }
        for id in &event_ids {
            self.unacked.remove(id);
        }
        self.connection.forward(Outbound::PersistentNack {
            correlation_id: self.correlation_id,
            subscription_id: self.subscription_id.clone(),
            event_ids,
            action,
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_default_settings() {
        let settings = PersistentSubscriptionSettings::default();
        assert_eq!(settings.start_from, StartFrom::Current);
        assert_eq!(settings.message_timeout, Duration::from_secs(30));
        assert_eq!(settings.consumer_strategy, ConsumerStrategy::RoundRobin);
        assert!(settings.validate().is_ok());
    }

    #[test_case(PersistentSubscriptionSettings { read_batch_size: 0, ..Default::default() } ; "zero batch")]
    #[test_case(PersistentSubscriptionSettings { live_buffer_size: 0, ..Default::default() } ; "zero live buffer")]
    #[test_case(PersistentSubscriptionSettings { min_checkpoint_count: 11, max_checkpoint_count: 10, ..Default::default() } ; "checkpoint bounds inverted")]
    fn test_invalid_settings(settings: PersistentSubscriptionSettings) {
        assert!(matches!(
            settings.validate(),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_strategy_names() {
        assert_eq!(ConsumerStrategy::DispatchToSingle.to_string(), "DispatchToSingle");
        assert_eq!(ConsumerStrategy::Pinned.as_str(), "Pinned");
    }

    #[tokio::test]
    async fn test_handle_sends_acks_and_nacks() {
        let (_state_tx, state_rx) = watch::channel(SubscriptionState::Live);
        let (control_tx, mut control_rx) = mpsc::unbounded_channel();
        let handle = PersistentSubscription {
            stream: "orders".to_string(),
            group: "billing".to_string(),
            subscription_id: "orders::billing".to_string(),
            state: state_rx,
            control: control_tx,
        };

        let id = Uuid::new_v4();
        handle.ack_many([id]);
        handle.nack_many([id], NackAction::Park, "poison");

        assert!(matches!(control_rx.recv().await, Some(Control::Ack(ids)) if ids == vec![id]));
        match control_rx.recv().await {
            Some(Control::Nack {
                event_ids,
                action,
                reason,
            }) => {
                assert_eq!(event_ids, vec![id]);
                assert_eq!(action, NackAction::Park);
                assert_eq!(reason, "poison");
            }
            other => panic!("unexpected control message {other:?}"),
        }
    }
}
