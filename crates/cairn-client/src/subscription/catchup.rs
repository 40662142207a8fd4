//! Catch-up subscriptions.
//!
//! A catch-up subscription reads history from a checkpoint in pages, opens
//! a live subscription, then keeps reading until it reaches the point the
//! live subscription was confirmed at. Live events arriving meanwhile are
//! buffered and replayed once history is done. Events are filtered by
//! "strictly after the last delivered event", so none is delivered twice
//! and none is skipped across the boundary.
//!
//! Losing the transport in any phase restarts the procedure from the last
//! delivered event once the connection is back.

use std::collections::VecDeque;

use cairn_types::{EventNumber, Position, ResolvedEvent};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use super::{
    Control, DropNotice, EventHandler, Subscription, SubscriptionDropReason, SubscriptionInbox,
    SubscriptionMessage, SubscriptionState, drop_reason_for, report_drop,
};
use crate::connection::Connection;
use crate::error::{ClientError, ClientResult};
use crate::filter::Filter;
use crate::operation::{Command, MAX_READ_SIZE, Reply};
use crate::results::SliceReadStatus;
use crate::transport::CorrelationId;

/// Tuning for a catch-up subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatchUpSettings {
    /// Live events buffered while history is still being read. Exceeding it
    /// drops the subscription with `ProcessingQueueOverflow`.
    pub max_live_queue_size: usize,
    /// Events per history read.
    pub read_batch_size: u32,
    pub resolve_link_tos: bool,
    /// Free-form name used in logs.
    pub subscription_name: String,
}

impl Default for CatchUpSettings {
    fn default() -> Self {
        Self {
            max_live_queue_size: 10_000,
            read_batch_size: 500,
            resolve_link_tos: false,
            subscription_name: String::new(),
        }
    }
}

impl CatchUpSettings {
    pub fn with_max_live_queue_size(mut self, size: usize) -> Self {
        self.max_live_queue_size = size;
        self
    }

    pub fn with_read_batch_size(mut self, size: u32) -> Self {
        self.read_batch_size = size;
        self
    }

    pub fn with_resolve_link_tos(mut self, resolve: bool) -> Self {
        self.resolve_link_tos = resolve;
        self
    }

    pub fn with_subscription_name(mut self, name: impl Into<String>) -> Self {
        self.subscription_name = name.into();
        self
    }

    pub(crate) fn validate(&self) -> ClientResult<()> {
        if self.read_batch_size == 0 || self.read_batch_size > MAX_READ_SIZE {
            return Err(ClientError::InvalidArgument(format!(
                "read batch size must be between 1 and {MAX_READ_SIZE}, got {}",
                self.read_batch_size
            )));
        }
        if self.max_live_queue_size == 0 {
            return Err(ClientError::InvalidArgument(
                "max live queue size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Handle to a running catch-up subscription.
#[derive(Debug, Clone)]
pub struct CatchUpSubscription {
    inner: Subscription,
    name: String,
}

impl CatchUpSubscription {
    /// The subscribed stream; `None` for `$all`.
    pub fn stream_id(&self) -> Option<&str> {
        self.inner.stream_id()
    }

    pub fn is_subscribed_to_all(&self) -> bool {
        self.inner.is_subscribed_to_all()
    }

    pub fn subscription_name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SubscriptionState {
        self.inner.state()
    }

    pub fn stop(&self) {
        self.inner.stop();
    }

    pub async fn unsubscribe(&self) -> DropNotice {
        self.inner.unsubscribe().await
    }

    pub async fn dropped(&self) -> DropNotice {
        self.inner.dropped().await
    }
}

/// What has been delivered so far.
#[derive(Debug, Clone)]
pub(crate) enum Cursor {
    Stream {
        stream: String,
        last: Option<EventNumber>,
    },
    All {
        filter: Option<Filter>,
        last: Option<Position>,
    },
}

impl Cursor {
    fn stream(&self) -> Option<&str> {
        match self {
            Self::Stream { stream, .. } => Some(stream),
            Self::All { .. } => None,
        }
    }

    /// True if `event` comes after everything delivered so far.
    fn is_new(&self, event: &ResolvedEvent) -> bool {
        match self {
            Self::Stream { last, .. } => last.is_none_or(|last| event.original_event_number() > last),
            Self::All { last, .. } => match (last, event.original_position()) {
                (Some(last), Some(position)) => position > *last,
                _ => true,
            },
        }
    }

    fn advance(&mut self, event: &ResolvedEvent) {
        match self {
            Self::Stream { last, .. } => *last = Some(event.original_event_number()),
            Self::All { last, .. } => {
                if let Some(position) = event.original_position() {
                    *last = Some(position);
                }
            }
        }
    }
}

/// Where the live subscription started, as reported in its confirmation.
#[derive(Debug, Clone, Copy)]
enum Tail {
    Stream(Option<EventNumber>),
    All(i64),
}

enum Halt {
    Restart,
    Drop(SubscriptionDropReason, Option<anyhow::Error>),
}

fn halt_on(err: ClientError) -> Halt {
    let reason = match drop_reason_for(&err) {
        SubscriptionDropReason::SubscribingError => SubscriptionDropReason::CatchUpError,
        reason => reason,
    };
    Halt::Drop(reason, Some(err.into()))
}

/// Live events held back while history is read.
struct LiveFeed {
    correlation_id: CorrelationId,
    inbox: SubscriptionInbox,
    queue: VecDeque<SubscriptionMessage>,
    capacity: usize,
}

impl LiveFeed {
    fn overflow(&self) -> Halt {
        Halt::Drop(
            SubscriptionDropReason::ProcessingQueueOverflow,
            Some(anyhow::anyhow!(
                "more than {} live events waiting",
                self.capacity
            )),
        )
    }

    /// Moves everything that arrived so far into the queue.
    fn buffer(&mut self) -> Result<(), Halt> {
        while let Ok(message) = self.inbox.try_recv() {
            if self.queue.len() >= self.capacity {
                return Err(self.overflow());
            }
            self.queue.push_back(message);
        }
        Ok(())
    }
}

/// Spawns a catch-up subscription. It starts after `cursor` and reports
/// failures through its drop notice, never as an error here.
pub(crate) fn start<H: EventHandler>(
    connection: &Connection,
    cursor: Cursor,
    settings: CatchUpSettings,
    handler: H,
) -> CatchUpSubscription {
    let stream = cursor.stream().map(str::to_string);
    let name = settings.subscription_name.clone();
    let (state_tx, state_rx) = watch::channel(SubscriptionState::Subscribing);
    let (control_tx, control_rx) = mpsc::unbounded_channel();

    let task = CatchUpTask {
        connection: connection.clone(),
        cursor,
        settings,
        handler,
        control: control_rx,
        control_open: true,
        state: state_tx,
    };
    tokio::spawn(task.run());

    CatchUpSubscription {
        inner: Subscription::new(stream, None, state_rx, control_tx),
        name,
    }
}

struct CatchUpTask<H> {
    connection: Connection,
    cursor: Cursor,
    settings: CatchUpSettings,
    handler: H,
    control: mpsc::UnboundedReceiver<Control>,
    control_open: bool,
    state: watch::Sender<SubscriptionState>,
}

impl<H: EventHandler> CatchUpTask<H> {
    async fn run(mut self) {
        let (reason, error) = loop {
            match self.run_once().await {
                Halt::Restart => {
                    info!(
                        subscription = %self.settings.subscription_name,
                        cursor = ?self.cursor,
                        "connection lost, catching up again"
                    );
                }
                Halt::Drop(reason, error) => break (reason, error),
            }
        };
        report_drop(&mut self.handler, &self.state, reason, error).await;
    }

    async fn run_once(&mut self) -> Halt {
        self.state.send_replace(SubscriptionState::CatchingUp);
        if let Err(halt) = self.read_history(None, None).await {
            return halt;
        }

        let opened = match self.connection.open_subscription(self.live_command()).await {
            Ok(opened) => opened,
            Err(err) => return halt_on(err),
        };
        let tail = match (&self.cursor, opened.reply) {
            (
                Cursor::Stream { .. },
                Reply::SubscriptionConfirmed {
                    last_event_number, ..
                },
            ) => Tail::Stream(last_event_number),
            (
                Cursor::All { .. },
                Reply::SubscriptionConfirmed {
                    last_commit_position,
                    ..
                },
            ) => Tail::All(last_commit_position),
            (_, other) => {
                self.connection.unsubscribe(opened.correlation_id);
                return Halt::Drop(
                    SubscriptionDropReason::SubscribingError,
                    Some(anyhow::anyhow!("unexpected subscription confirmation: {other:?}")),
                );
            }
        };
        debug!(subscription = %self.settings.subscription_name, ?tail, "live subscription confirmed");

        let mut feed = LiveFeed {
            correlation_id: opened.correlation_id,
            inbox: opened.inbox,
            queue: VecDeque::new(),
            capacity: self.settings.max_live_queue_size,
        };
        let halt = match self.read_history(Some(tail), Some(&mut feed)).await {
            Ok(()) => self.go_live(&mut feed).await,
            Err(halt) => halt,
        };
        self.connection.unsubscribe(feed.correlation_id);
        halt
    }

    fn live_command(&self) -> Command {
        let (stream, filter) = match &self.cursor {
            Cursor::Stream { stream, .. } => (Some(stream.clone()), None),
            Cursor::All { filter, .. } => (None, filter.clone()),
        };
        Command::SubscribeToStream {
            stream,
            resolve_link_tos: self.settings.resolve_link_tos,
            filter,
            checkpoint_interval: None,
        }
    }

    fn check_stop(&mut self) -> Result<(), Halt> {
        while self.control_open {
            match self.control.try_recv() {
                Ok(Control::Stop) => {
                    return Err(Halt::Drop(SubscriptionDropReason::UserInitiated, None));
                }
                Ok(_) => {}
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => self.control_open = false,
            }
        }
        Ok(())
    }

    async fn deliver(&mut self, event: ResolvedEvent) -> Result<(), Halt> {
        if !self.cursor.is_new(&event) {
            trace!(event_number = %event.original_event_number(), "skipping already delivered event");
            return Ok(());
        }
        self.cursor.advance(&event);
        self.handler
            .event_appeared(event)
            .await
            .map_err(|err| Halt::Drop(SubscriptionDropReason::EventHandlerException, Some(err)))
    }

    /// Reads pages until the end of history, or until `tail` once a live
    /// subscription is open.
    async fn read_history(
        &mut self,
        tail: Option<Tail>,
        mut feed: Option<&mut LiveFeed>,
    ) -> Result<(), Halt> {
        let batch = self.settings.read_batch_size;
        let resolve = self.settings.resolve_link_tos;
        loop {
            self.check_stop()?;

            let (events, done) = match self.cursor.clone() {
                Cursor::Stream { stream, last } => {
                    let from = last.map_or(EventNumber::ZERO, EventNumber::next);
                    let slice = self
                        .connection
                        .read_stream_events_forward(&stream, from, batch, resolve)
                        .await
                        .map_err(halt_on)?;
                    match slice.status {
                        SliceReadStatus::Success | SliceReadStatus::StreamNotFound => {}
                        SliceReadStatus::StreamDeleted => {
                            return Err(Halt::Drop(
                                SubscriptionDropReason::CatchUpError,
                                Some(ClientError::StreamDeleted(stream).into()),
                            ));
                        }
                    }
                    let past_tail = match (tail, slice.next_event_number) {
                        (Some(Tail::Stream(Some(tail))), Some(next)) => next > tail,
                        _ => false,
                    };
                    (slice.events, slice.is_end_of_stream || past_tail)
                }
                Cursor::All { filter, last } => {
                    let from = last.unwrap_or(Position::START);
                    let slice = match filter {
                        Some(filter) => {
                            self.connection
                                .filtered_read_all_events_forward(from, batch, resolve, filter, None)
                                .await
                        }
                        None => {
                            self.connection
                                .read_all_events_forward(from, batch, resolve)
                                .await
                        }
                    }
                    .map_err(halt_on)?;
                    let past_tail = match tail {
                        Some(Tail::All(tail)) => slice.next_position >= Position::new(tail, tail),
                        _ => false,
                    };
                    let done = slice.is_end_of_stream || past_tail;
                    for event in slice.events {
                        self.deliver(event).await?;
                    }
                    if matches!(&self.cursor, Cursor::All { filter: Some(_), .. }) {
                        self.handler
                            .checkpoint_reached(slice.next_position)
                            .await
                            .map_err(|err| {
                                Halt::Drop(SubscriptionDropReason::EventHandlerException, Some(err))
                            })?;
                    }
                    (Vec::new(), done)
                }
            };

            for event in events {
                self.deliver(event).await?;
            }
            if let Some(feed) = feed.as_deref_mut() {
                feed.buffer()?;
            }
            if done {
                return Ok(());
            }
        }
    }

    async fn go_live(&mut self, feed: &mut LiveFeed) -> Halt {
        self.state.send_replace(SubscriptionState::Live);
        info!(subscription = %self.settings.subscription_name, "caught up, processing live events");
        self.handler.live_processing_started().await;

        while let Some(message) = feed.queue.pop_front() {
            if let Err(halt) = self.process(message).await {
                return halt;
            }
        }

        loop {
            tokio::select! {
                biased;

                command = self.control.recv(), if self.control_open => match command {
                    Some(Control::Stop) => {
                        return Halt::Drop(SubscriptionDropReason::UserInitiated, None);
                    }
                    Some(_) => {}
                    None => self.control_open = false,
                },
                message = feed.inbox.recv() => {
                    let Some(message) = message else {
                        return Halt::Drop(SubscriptionDropReason::ConnectionClosed, None);
                    };
                    if feed.inbox.len() >= feed.capacity {
                        return feed.overflow();
                    }
                    if let Err(halt) = self.process(message).await {
                        return halt;
                    }
                }
            }
        }
    }

    async fn process(&mut self, message: SubscriptionMessage) -> Result<(), Halt> {
        match message {
            SubscriptionMessage::Event(event)
            | SubscriptionMessage::PersistentEvent { event, .. } => self.deliver(event).await,
            SubscriptionMessage::Checkpoint(position) => self
                .handler
                .checkpoint_reached(position)
                .await
                .map_err(|err| Halt::Drop(SubscriptionDropReason::EventHandlerException, Some(err))),
            SubscriptionMessage::ServerDropped(reason) => Err(Halt::Drop(reason, None)),
            SubscriptionMessage::ConnectionLost => Err(Halt::Restart),
            SubscriptionMessage::ConnectionClosed(_) => {
                Err(Halt::Drop(SubscriptionDropReason::ConnectionClosed, None))
            }
        }
    }
}
