//! The public connection handle.
//!
//! [`Connection`] is cheap to clone; every clone talks to the same actor.
//! Operations are validated and admitted here, then handed to the actor,
//! which queues, sends, retries and completes them.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use cairn_config::ConnectionSettings;
use cairn_types::{
    Credentials, EventData, EventNumber, ExpectedVersion, METADATA_EVENT_TYPE, NodeEndpoints,
    Position, metastream_of,
};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, instrument};

use crate::actor::{ActorMessage, ConnectionActor, Shared};
use crate::admission::Admission;
use crate::discovery::{EndpointDiscoverer, discoverer_for};
use crate::dispatcher::{Delivered, Operation, OperationId};
use crate::error::{ClientError, ClientResult};
use crate::filter::Filter;
use crate::gossip::GossipClient;
use crate::notification::ConnectionEvent;
use crate::operation::{Command, MAX_READ_SIZE, ReadDirection, Reply};
use crate::results::{
    AllEventsSlice, ConditionalWriteResult, DeleteResult, EventReadResult,
    RawStreamMetadataResult, StreamEventsSlice, WriteResult,
};
use crate::state::ConnectionState;
use crate::subscription::catchup::{self, CatchUpSettings, CatchUpSubscription, Cursor};
use crate::subscription::persistent::{
    self, PersistentEventHandler, PersistentSubscription, PersistentSubscriptionSettings,
};
use crate::subscription::{EventHandler, Subscription, SubscriptionInbox, live};
use crate::transport::{Connector, CorrelationId, Outbound};

struct Inner {
    name: String,
    settings: ConnectionSettings,
    actor: mpsc::UnboundedSender<ActorMessage>,
    shared: Arc<Shared>,
}

/// Per-handle overrides applied to every operation started through it.
#[derive(Debug, Clone, Default)]
struct OperationOptions {
    credentials: Option<Credentials>,
    deadline: Option<Duration>,
}

/// A connection to a single node or a cluster.
///
/// The connection opens lazily on the first operation or on
/// [`Connection::connect`], reconnects on its own after transport loss, and
/// stays usable until [`Connection::close`] or until its reconnection budget
/// is spent.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
    options: OperationOptions,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .finish()
    }
}

/// An operation submitted to the connection.
///
/// Resolves to the accepted reply. Dropping it before completion cancels the
/// operation.
pub struct PendingOperation {
    id: OperationId,
    result: oneshot::Receiver<ClientResult<Delivered>>,
    actor: mpsc::UnboundedSender<ActorMessage>,
    finished: bool,
}

impl PendingOperation {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Completes the operation with [`ClientError::Cancelled`] unless it
    /// already finished.
    pub fn cancel(&self) {
        let _ = self.actor.send(ActorMessage::Cancel(self.id));
    }
}

impl Future for PendingOperation {
    type Output = ClientResult<Delivered>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        match Pin::new(&mut this.result).poll(cx) {
            Poll::Ready(result) => {
                this.finished = true;
                Poll::Ready(result.unwrap_or(Err(ClientError::ConnectionDisposed)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingOperation {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

/// A confirmed subscription request, before a task takes it over.
pub(crate) struct OpenedSubscription {
    pub correlation_id: CorrelationId,
    pub reply: Reply,
    pub inbox: SubscriptionInbox,
}

fn check_stream(stream: &str) -> ClientResult<()> {
    if stream.is_empty() {
        return Err(ClientError::InvalidArgument(
            "stream name must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn check_expected(expected_version: ExpectedVersion) -> ClientResult<()> {
    expected_version.to_wire()?;
    Ok(())
}

fn check_count(count: u32) -> ClientResult<()> {
    if count == 0 || count > MAX_READ_SIZE {
        return Err(ClientError::InvalidArgument(format!(
            "count must be between 1 and {MAX_READ_SIZE}, got {count}"
        )));
    }
    Ok(())
}

fn check_group(group: &str) -> ClientResult<()> {
    if group.is_empty() {
        return Err(ClientError::InvalidArgument(
            "group name must not be empty".to_string(),
        ));
    }
    Ok(())
}

impl Connection {
    /// Creates a connection and starts its actor. Nothing is dialled until
    /// the first operation or [`Connection::connect`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        settings: ConnectionSettings,
        discoverer: Arc<dyn EndpointDiscoverer>,
        connector: Arc<dyn Connector>,
    ) -> ClientResult<Self> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ClientError::InvalidArgument("a connection must be created inside a Tokio runtime".to_string())
        })?;

        let name = settings.connection_name();
        let shared = Arc::new(Shared::new(settings.max_queue_size()));
        let (actor_tx, actor_rx) = mpsc::unbounded_channel();
        let actor = ConnectionActor::new(
            name.clone(),
            settings.clone(),
            discoverer,
            connector,
            Arc::clone(&shared),
            actor_rx,
        );
        runtime.spawn(actor.run());
        debug!(connection = %name, "connection created");

        Ok(Self {
            inner: Arc::new(Inner {
                name,
                settings,
                actor: actor_tx,
                shared,
            }),
            options: OperationOptions::default(),
        })
    }

    /// Creates a connection whose discoverer follows the configured endpoint
    /// source. Cluster sources need `gossip`.
    pub fn from_settings(
        settings: ConnectionSettings,
        connector: Arc<dyn Connector>,
        gossip: Option<Arc<dyn GossipClient>>,
    ) -> ClientResult<Self> {
        let discoverer = discoverer_for(&settings, gossip)?;
        Self::new(settings, discoverer, connector)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.shared.state.borrow()
    }

    /// A watch on the lifecycle state.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.shared.state.subscribe()
    }

    /// The node currently connected to.
    pub fn current_endpoints(&self) -> Option<NodeEndpoints> {
        self.inner.shared.endpoint.borrow().clone()
    }

    /// Lifecycle notifications. Slow receivers miss the oldest events.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.shared.events.subscribe()
    }

    /// Operations admitted but not yet sent.
    pub fn queued_operations(&self) -> usize {
        self.inner.shared.gauge.len()
    }

    /// A handle whose operations run with `credentials` instead of the
    /// connection's default credentials.
    pub fn with_credentials(&self, credentials: Credentials) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            options: OperationOptions {
                credentials: Some(credentials),
                ..self.options.clone()
            },
        }
    }

    /// A handle whose operations fail with `OperationTimedOut` once
    /// `deadline` has passed since they were submitted, retries included.
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            options: OperationOptions {
                deadline: Some(deadline),
                ..self.options.clone()
            },
        }
    }

    /// Opens the connection and waits until a node accepted it.
    #[instrument(skip_all, fields(connection = %self.inner.name))]
    pub async fn connect(&self) -> ClientResult<()> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .actor
            .send(ActorMessage::Connect(tx))
            .map_err(|_| ClientError::ConnectionDisposed)?;
        rx.await.map_err(|_| ClientError::ConnectionDisposed)?
    }

    /// Closes the connection. Pending operations fail with
    /// `ConnectionClosed`, later ones with `ConnectionDisposed`. Idempotent.
    pub async fn close(&self) {
        let (done, finished) = oneshot::channel();
        let message = ActorMessage::Close {
            reason: "closed by user".to_string(),
            done,
        };
        if self.inner.actor.send(message).is_ok() {
            let _ = finished.await;
        }
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Admits `command` and hands it to the actor.
    ///
    /// Fails at once with `QueueFull` when `max_queue_size` operations are
    /// already waiting, and with `ConnectionDisposed` once closed.
    pub fn submit(&self, command: Command) -> ClientResult<PendingOperation> {
        self.submit_routed(command, None)
    }

    fn submit_routed(
        &self,
        command: Command,
        route: Option<crate::subscription::SubscriptionRoute>,
    ) -> ClientResult<PendingOperation> {
        let shared = &self.inner.shared;
        if shared.is_closed() {
            return Err(ClientError::ConnectionDisposed);
        }
        if shared.gauge.try_admit() == Admission::Backpressure {
            return Err(ClientError::QueueFull {
                capacity: shared.gauge.capacity(),
            });
        }

        let settings = &self.inner.settings;
        let now = Instant::now();
        let id = OperationId::new(shared.next_operation.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        let operation = Operation {
            id,
            require_leader: command.requires_leader(settings.require_leader()),
            credentials: self
                .options
                .credentials
                .clone()
                .or_else(|| settings.default_credentials().cloned()),
            deadline: self.options.deadline.map(|d| now + d),
            retry_count: 0,
            queued_at: now,
            sent_at: None,
            route,
            result: tx,
            command,
        };

        if self.inner.actor.send(ActorMessage::Enqueue(operation)).is_err() {
            shared.gauge.release();
            return Err(ClientError::ConnectionDisposed);
        }
        Ok(PendingOperation {
            id,
            result: rx,
            actor: self.inner.actor.clone(),
            finished: false,
        })
    }

    async fn execute(&self, command: Command) -> ClientResult<Reply> {
        Ok(self.submit(command)?.await?.reply)
    }

    pub(crate) async fn open_subscription(&self, command: Command) -> ClientResult<OpenedSubscription> {
        let (route, inbox) = mpsc::unbounded_channel();
        let delivered = self.submit_routed(command, Some(route))?.await?;
        Ok(OpenedSubscription {
            correlation_id: delivered.correlation_id,
            reply: delivered.reply,
            inbox,
        })
    }

    pub(crate) fn forward(&self, outbound: Outbound) {
        let _ = self.inner.actor.send(ActorMessage::Forward(outbound));
    }

    pub(crate) fn unsubscribe(&self, correlation_id: CorrelationId) {
        let _ = self
            .inner
            .actor
            .send(ActorMessage::Unsubscribe(correlation_id));
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Appends `events` to `stream` if it is at `expected_version`.
    pub async fn append_to_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    ) -> ClientResult<WriteResult> {
        check_stream(stream)?;
        check_expected(expected_version)?;
        let reply = self
            .execute(Command::AppendToStream {
                stream: stream.to_string(),
                expected_version,
                events,
            })
            .await?;
        WriteResult::from_reply(reply)
    }

    /// Like [`Connection::append_to_stream`], but a version mismatch or a
    /// deleted stream is reported in the result status.
    pub async fn conditional_append_to_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        events: Vec<EventData>,
    ) -> ClientResult<ConditionalWriteResult> {
        check_stream(stream)?;
        check_expected(expected_version)?;
        let reply = self
            .execute(Command::ConditionalAppendToStream {
                stream: stream.to_string(),
                expected_version,
                events,
            })
            .await?;
        ConditionalWriteResult::from_reply(reply)
    }

    /// Deletes `stream`. A hard delete is permanent; the stream name cannot
    /// be reused.
    pub async fn delete_stream(
        &self,
        stream: &str,
        expected_version: ExpectedVersion,
        hard_delete: bool,
    ) -> ClientResult<DeleteResult> {
        check_stream(stream)?;
        check_expected(expected_version)?;
        let reply = self
            .execute(Command::DeleteStream {
                stream: stream.to_string(),
                expected_version,
                hard_delete,
            })
            .await?;
        DeleteResult::from_reply(reply)
    }

    /// Replaces the metadata of `stream` with `metadata` (JSON bytes).
    ///
    /// `expected_metastream_version` applies to the metastream.
    pub async fn set_stream_metadata(
        &self,
        stream: &str,
        expected_metastream_version: ExpectedVersion,
        metadata: impl Into<Bytes>,
    ) -> ClientResult<WriteResult> {
        check_stream(stream)?;
        check_expected(expected_metastream_version)?;
        let event = EventData::json(METADATA_EVENT_TYPE, metadata);
        let reply = self
            .execute(Command::AppendToStream {
                stream: metastream_of(stream),
                expected_version: expected_metastream_version,
                events: vec![event],
            })
            .await?;
        WriteResult::from_reply(reply)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    /// Reads one event; `None` reads the last event of the stream.
    pub async fn read_event(
        &self,
        stream: &str,
        event_number: Option<EventNumber>,
        resolve_link_tos: bool,
    ) -> ClientResult<EventReadResult> {
        check_stream(stream)?;
        let reply = self
            .execute(Command::ReadEvent {
                stream: stream.to_string(),
                event_number,
                resolve_link_tos,
            })
            .await?;
        EventReadResult::from_reply(stream.to_string(), event_number, reply)
    }

    /// Reads the raw metadata of `stream`.
    pub async fn get_stream_metadata_raw(&self, stream: &str) -> ClientResult<RawStreamMetadataResult> {
        check_stream(stream)?;
        let read = self.read_event(&metastream_of(stream), None, false).await?;
        Ok(RawStreamMetadataResult::from_metastream_read(
            stream.to_string(),
            read,
        ))
    }

    async fn read_stream(
        &self,
        stream: &str,
        from: Option<EventNumber>,
        count: u32,
        direction: ReadDirection,
        resolve_link_tos: bool,
    ) -> ClientResult<StreamEventsSlice> {
        check_stream(stream)?;
        check_count(count)?;
        let reply = self
            .execute(Command::ReadStreamEvents {
                stream: stream.to_string(),
                from,
                max_count: count,
                direction,
                resolve_link_tos,
            })
            .await?;
        StreamEventsSlice::from_reply(stream.to_string(), from, direction, reply)
    }

    pub async fn read_stream_events_forward(
        &self,
        stream: &str,
        start: EventNumber,
        count: u32,
        resolve_link_tos: bool,
    ) -> ClientResult<StreamEventsSlice> {
        self.read_stream(stream, Some(start), count, ReadDirection::Forward, resolve_link_tos)
            .await
    }

    /// Reads backwards from `start`, or from the end of the stream when
    /// `start` is `None`.
    pub async fn read_stream_events_backward(
        &self,
        stream: &str,
        start: Option<EventNumber>,
        count: u32,
        resolve_link_tos: bool,
    ) -> ClientResult<StreamEventsSlice> {
        self.read_stream(stream, start, count, ReadDirection::Backward, resolve_link_tos)
            .await
    }

    async fn read_all(
        &self,
        position: Position,
        count: u32,
        direction: ReadDirection,
        resolve_link_tos: bool,
        filter: Option<Filter>,
        max_search_window: Option<u32>,
    ) -> ClientResult<AllEventsSlice> {
        check_count(count)?;
        if let Some(filter) = &filter {
            filter.validate()?;
        }
        if let Some(window) = max_search_window
            && window < count
        {
            return Err(ClientError::InvalidArgument(format!(
                "max search window {window} is smaller than count {count}"
            )));
        }
        let reply = self
            .execute(Command::ReadAllEvents {
                position,
                max_count: count,
                direction,
                resolve_link_tos,
                filter,
                max_search_window,
            })
            .await?;
        AllEventsSlice::from_reply(direction, reply)
    }

    pub async fn read_all_events_forward(
        &self,
        position: Position,
        count: u32,
        resolve_link_tos: bool,
    ) -> ClientResult<AllEventsSlice> {
        self.read_all(position, count, ReadDirection::Forward, resolve_link_tos, None, None)
            .await
    }

    /// Reads `$all` backwards from `position`; [`Position::END`] starts at
    /// the head of the log.
    pub async fn read_all_events_backward(
        &self,
        position: Position,
        count: u32,
        resolve_link_tos: bool,
    ) -> ClientResult<AllEventsSlice> {
        self.read_all(position, count, ReadDirection::Backward, resolve_link_tos, None, None)
            .await
    }

    /// Reads `$all` forwards, keeping only events matching `filter`. The
    /// server scans at most `max_search_window` events per call.
    pub async fn filtered_read_all_events_forward(
        &self,
        position: Position,
        count: u32,
        resolve_link_tos: bool,
        filter: Filter,
        max_search_window: Option<u32>,
    ) -> ClientResult<AllEventsSlice> {
        self.read_all(
            position,
            count,
            ReadDirection::Forward,
            resolve_link_tos,
            Some(filter),
            max_search_window,
        )
        .await
    }

    pub async fn filtered_read_all_events_backward(
        &self,
        position: Position,
        count: u32,
        resolve_link_tos: bool,
        filter: Filter,
        max_search_window: Option<u32>,
    ) -> ClientResult<AllEventsSlice> {
        self.read_all(
            position,
            count,
            ReadDirection::Backward,
            resolve_link_tos,
            Some(filter),
            max_search_window,
        )
        .await
    }

    // ------------------------------------------------------------------------
    // Persistent subscription groups
    // ------------------------------------------------------------------------

    pub async fn create_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
    ) -> ClientResult<()> {
        check_stream(stream)?;
        check_group(group)?;
        settings.validate()?;
        self.execute(Command::CreatePersistentSubscription {
            stream: stream.to_string(),
            group: group.to_string(),
            settings,
        })
        .await
        .map(drop)
    }

    pub async fn update_persistent_subscription(
        &self,
        stream: &str,
        group: &str,
        settings: PersistentSubscriptionSettings,
    ) -> ClientResult<()> {
        check_stream(stream)?;
        check_group(group)?;
        settings.validate()?;
        self.execute(Command::UpdatePersistentSubscription {
            stream: stream.to_string(),
            group: group.to_string(),
            settings,
        })
        .await
        .map(drop)
    }

    pub async fn delete_persistent_subscription(&self, stream: &str, group: &str) -> ClientResult<()> {
        check_stream(stream)?;
        check_group(group)?;
        self.execute(Command::DeletePersistentSubscription {
            stream: stream.to_string(),
            group: group.to_string(),
        })
        .await
        .map(drop)
    }

    // ------------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------------

    /// Subscribes to new events of `stream`. Resolves once the server
    /// confirmed.
    pub async fn subscribe_to_stream<H: EventHandler>(
        &self,
        stream: &str,
        resolve_link_tos: bool,
        handler: H,
    ) -> ClientResult<Subscription> {
        check_stream(stream)?;
        let command = Command::SubscribeToStream {
            stream: Some(stream.to_string()),
            resolve_link_tos,
            filter: None,
            checkpoint_interval: None,
        };
        live::subscribe(self, command, handler).await
    }

    pub async fn subscribe_to_all<H: EventHandler>(
        &self,
        resolve_link_tos: bool,
        handler: H,
    ) -> ClientResult<Subscription> {
        let command = Command::SubscribeToStream {
            stream: None,
            resolve_link_tos,
            filter: None,
            checkpoint_interval: None,
        };
        live::subscribe(self, command, handler).await
    }

    /// Subscribes to new events in `$all` matching `filter`. The handler's
    /// `checkpoint_reached` is called every `checkpoint_interval` scanned
    /// windows.
    pub async fn filtered_subscribe_to_all<H: EventHandler>(
        &self,
        filter: Filter,
        checkpoint_interval: u32,
        resolve_link_tos: bool,
        handler: H,
    ) -> ClientResult<Subscription> {
        filter.validate()?;
        if checkpoint_interval == 0 {
            return Err(ClientError::InvalidArgument(
                "checkpoint interval must be positive".to_string(),
            ));
        }
        let command = Command::SubscribeToStream {
            stream: None,
            resolve_link_tos,
            filter: Some(filter),
            checkpoint_interval: Some(checkpoint_interval),
        };
        live::subscribe(self, command, handler).await
    }

    fn start_catch_up<H: EventHandler>(
        &self,
        cursor: Cursor,
        settings: CatchUpSettings,
        handler: H,
    ) -> ClientResult<CatchUpSubscription> {
        if self.inner.shared.is_closed() {
            return Err(ClientError::ConnectionDisposed);
        }
        settings.validate()?;
        Ok(catchup::start(self, cursor, settings, handler))
    }

    /// Delivers the events of `stream` after `last_checkpoint` (from the
    /// beginning when `None`), then switches to live events.
    ///
    /// Returns at once; failures show up as the subscription's drop notice.
    pub fn subscribe_to_stream_from<H: EventHandler>(
        &self,
        stream: &str,
        last_checkpoint: Option<EventNumber>,
        settings: CatchUpSettings,
        handler: H,
    ) -> ClientResult<CatchUpSubscription> {
        check_stream(stream)?;
        let cursor = Cursor::Stream {
            stream: stream.to_string(),
            last: last_checkpoint,
        };
        self.start_catch_up(cursor, settings, handler)
    }

    pub fn subscribe_to_all_from<H: EventHandler>(
        &self,
        last_checkpoint: Option<Position>,
        settings: CatchUpSettings,
        handler: H,
    ) -> ClientResult<CatchUpSubscription> {
        let cursor = Cursor::All {
            filter: None,
            last: last_checkpoint,
        };
        self.start_catch_up(cursor, settings, handler)
    }

    pub fn filtered_subscribe_to_all_from<H: EventHandler>(
        &self,
        last_checkpoint: Option<Position>,
        filter: Filter,
        settings: CatchUpSettings,
        handler: H,
    ) -> ClientResult<CatchUpSubscription> {
        filter.validate()?;
        let cursor = Cursor::All {
            filter: Some(filter),
            last: last_checkpoint,
        };
        self.start_catch_up(cursor, settings, handler)
    }

    /// Joins the persistent subscription group `group` on `stream`.
    ///
    /// At most `buffer_size` events are outstanding at a time. With
    /// `auto_ack`, each event is acked when the handler returns; otherwise
    /// the handler acks through the [`PersistentSubscription`] it receives.
    pub async fn connect_to_persistent_subscription<H: PersistentEventHandler>(
        &self,
        stream: &str,
        group: &str,
        handler: H,
        buffer_size: u32,
        auto_ack: bool,
    ) -> ClientResult<PersistentSubscription> {
        check_stream(stream)?;
        check_group(group)?;
        if buffer_size == 0 {
            return Err(ClientError::InvalidArgument(
                "buffer size must be positive".to_string(),
            ));
        }
        persistent::connect(
            self,
            stream.to_string(),
            group.to_string(),
            handler,
            buffer_size,
            auto_ack,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::StaticEndpointDiscoverer;
    use crate::transport::{Handshake, TransportError, TransportHandle};
    use async_trait::async_trait;
    use cairn_config::ConnectionOptions;
    use cairn_types::Endpoint;

    struct Unreachable;

    #[async_trait]
    impl Connector for Unreachable {
        async fn connect(
            &self,
            endpoint: &Endpoint,
            _handshake: &Handshake,
        ) -> Result<TransportHandle, TransportError> {
            Err(TransportError::Refused {
                endpoint: endpoint.clone(),
            })
        }
    }

    fn connection(options: ConnectionOptions) -> Connection {
        let settings = ConnectionSettings::from_options(&options).unwrap();
        let discoverer = Arc::new(StaticEndpointDiscoverer::new(NodeEndpoints::plain(
            Endpoint::new("127.0.0.1", 1113),
        )));
        Connection::new(settings, discoverer, Arc::new(Unreachable)).unwrap()
    }

    #[test]
    fn test_new_outside_runtime_fails() {
        let settings = ConnectionSettings::from_options(&ConnectionOptions::development()).unwrap();
        let discoverer = Arc::new(StaticEndpointDiscoverer::new(NodeEndpoints::plain(
            Endpoint::new("127.0.0.1", 1113),
        )));
        let err = Connection::new(settings, discoverer, Arc::new(Unreachable)).unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_before_queueing() {
        let conn = connection(ConnectionOptions::development());

        let err = conn
            .append_to_stream("", ExpectedVersion::Any, Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = conn
            .read_stream_events_forward("orders", EventNumber::ZERO, 0, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = conn
            .delete_stream("orders", ExpectedVersion::exact(u64::MAX), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = conn
            .read_all_events_forward(Position::START, MAX_READ_SIZE + 1, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        let err = conn
            .filtered_read_all_events_forward(
                Position::START,
                100,
                false,
                Filter::exclude_system_events(),
                Some(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));

        assert_eq!(conn.state(), ConnectionState::Init);
        assert_eq!(conn.queued_operations(), 0);
    }

    #[tokio::test]
    async fn test_operations_after_close_are_disposed() {
        let conn = connection(ConnectionOptions::development());
        conn.close().await;
        conn.close().await;
        assert_eq!(conn.state(), ConnectionState::Closed);

        let err = conn
            .read_event("orders", None, false)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::ConnectionDisposed));
        assert!(matches!(
            conn.connect().await,
            Err(ClientError::ConnectionDisposed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_node_exhausts_reconnections() {
        let options = ConnectionOptions {
            max_reconnections: 2,
            ..ConnectionOptions::development()
        };
        let conn = connection(options);
        let mut events = conn.events();

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectionClosed { .. }));
        assert_eq!(conn.state(), ConnectionState::Closed);

        let mut reconnecting = 0;
        while let Ok(event) = events.try_recv() {
            if event == ConnectionEvent::Reconnecting {
                reconnecting += 1;
            }
        }
        assert_eq!(reconnecting, 2);
    }
}
