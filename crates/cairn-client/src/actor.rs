//! The connection actor.
//!
//! One task per connection owns the lifecycle state, the active transport,
//! the operation dispatcher, the subscription routes and the timers. Every
//! input (caller messages, connect results, transport traffic, ticks) is
//! handled by the same loop, one at a time, so no state is shared with other
//! tasks except through [`Shared`]: atomics and watch cells with a single
//! writer.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use cairn_config::ConnectionSettings;
use cairn_types::NodeEndpoints;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tracing::{Instrument, debug, error, info, info_span, trace, warn};

use crate::admission::QueueGauge;
use crate::discovery::EndpointDiscoverer;
use crate::dispatcher::{Completion, DispatchLimits, Operation, OperationDispatcher, OperationId};
use crate::error::{ClientError, ClientResult};
use crate::notification::{ConnectionEvent, ConnectionEvents};
use crate::state::ConnectionState;
use crate::subscription::{SubscriptionMessage, SubscriptionRoute};
use crate::transport::{
    Connector, CorrelationId, Handshake, Inbound, Outbound, Push, TransportError, TransportHandle,
};

/// Messages from connection handles and subscription tasks.
pub(crate) enum ActorMessage {
    Connect(oneshot::Sender<ClientResult<()>>),
    Enqueue(Operation),
    Cancel(OperationId),
    /// Sent on the active transport as-is (acks, nacks).
    Forward(Outbound),
    Unsubscribe(CorrelationId),
    Close {
        reason: String,
        done: oneshot::Sender<()>,
    },
}

/// State readable outside the actor.
pub(crate) struct Shared {
    pub gauge: Arc<QueueGauge>,
    pub closed: AtomicBool,
    pub next_operation: AtomicU64,
    pub events: ConnectionEvents,
    pub state: watch::Sender<ConnectionState>,
    pub endpoint: watch::Sender<Option<NodeEndpoints>>,
}

impl Shared {
    pub fn new(max_queue_size: usize) -> Self {
        Self {
            gauge: Arc::new(QueueGauge::new(max_queue_size)),
            closed: AtomicBool::new(false),
            next_operation: AtomicU64::new(1),
            events: ConnectionEvents::default(),
            state: watch::Sender::new(ConnectionState::Init),
            endpoint: watch::Sender::new(None),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

struct ConnectFailure {
    error: ClientError,
    /// Discovery gave up; the connection cannot recover.
    terminal: bool,
    endpoints: Option<NodeEndpoints>,
}

enum Internal {
    Established {
        attempt: u64,
        endpoints: NodeEndpoints,
        transport: TransportHandle,
    },
    ConnectFailed {
        attempt: u64,
        failure: ConnectFailure,
    },
    ReconnectDue {
        attempt: u64,
    },
}

struct ActiveTransport {
    endpoints: NodeEndpoints,
    outbound: mpsc::UnboundedSender<Outbound>,
    inbound: mpsc::UnboundedReceiver<Inbound>,
}

struct Heartbeat {
    last_inbound: Instant,
    probe_sent: Option<Instant>,
}

pub(crate) struct ConnectionActor {
    name: String,
    settings: ConnectionSettings,
    discoverer: Arc<dyn EndpointDiscoverer>,
    connector: Arc<dyn Connector>,
    shared: Arc<Shared>,
    inbox: mpsc::UnboundedReceiver<ActorMessage>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    dispatcher: OperationDispatcher,
    state: ConnectionState,
    transport: Option<ActiveTransport>,
    subscriptions: HashMap<CorrelationId, SubscriptionRoute>,
    connect_waiters: Vec<oneshot::Sender<ClientResult<()>>>,
    /// Bumped whenever an in-progress connect or reconnect delay becomes
    /// stale; results tagged with an older value are discarded.
    attempt: u64,
    connect_task: Option<JoinHandle<()>>,
    reconnections: u32,
    failed_endpoint: Option<NodeEndpoints>,
    /// A leader redirect is resolving; dispatch is paused.
    redirecting: bool,
    heartbeat: Heartbeat,
}

impl ConnectionActor {
    pub fn new(
        name: String,
        settings: ConnectionSettings,
        discoverer: Arc<dyn EndpointDiscoverer>,
        connector: Arc<dyn Connector>,
        shared: Arc<Shared>,
        inbox: mpsc::UnboundedReceiver<ActorMessage>,
    ) -> Self {
        let limits = DispatchLimits {
            max_concurrent: settings.max_concurrent_items(),
            max_retries: settings.max_retries(),
            operation_timeout: settings.operation_timeout(),
            queue_timeout: settings.queue_timeout(),
            fail_on_no_server_response: settings.fail_on_no_server_response(),
            verbose: settings.verbose_logging(),
        };
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        Self {
            name,
            dispatcher: OperationDispatcher::new(limits, Arc::clone(&shared.gauge)),
            settings,
            discoverer,
            connector,
            shared,
            inbox,
            internal_tx,
            internal_rx,
            state: ConnectionState::Init,
            transport: None,
            subscriptions: HashMap::new(),
            connect_waiters: Vec::new(),
            attempt: 0,
            connect_task: None,
            reconnections: 0,
            failed_endpoint: None,
            redirecting: false,
            heartbeat: Heartbeat {
                last_inbound: Instant::now(),
                probe_sent: None,
            },
        }
    }

    pub async fn run(mut self) {
        let mut timeouts = interval(self.settings.operation_timeout_check_period());
        timeouts.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut heartbeats = interval(
            self.settings
                .heartbeat_interval()
                .min(self.settings.heartbeat_timeout()),
        );
        heartbeats.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = self.inbox.recv() => match message {
                    Some(message) => self.handle_message(message),
                    None => self.close("all connection handles dropped".to_string(), None),
                },
                Some(internal) = self.internal_rx.recv() => self.handle_internal(internal),
                inbound = next_inbound(&mut self.transport) => self.handle_inbound(inbound),
                _ = timeouts.tick() => {
                    self.dispatcher.check_timeouts(Instant::now());
                    self.pump();
                }
                _ = heartbeats.tick() => self.check_heartbeat(),
            }

            if self.state.is_closed() {
                break;
            }
        }

        self.inbox.close();
        while let Ok(message) = self.inbox.try_recv() {
            reject_after_close(message, &self.shared);
        }
        debug!(connection = %self.name, "connection actor stopped");
    }

    // ------------------------------------------------------------------------
    // Caller messages
    // ------------------------------------------------------------------------

    fn handle_message(&mut self, message: ActorMessage) {
        match message {
            ActorMessage::Connect(waiter) => match self.state {
                ConnectionState::Init => {
                    self.connect_waiters.push(waiter);
                    self.begin_connect();
                }
                ConnectionState::Connecting | ConnectionState::Reconnecting => {
                    self.connect_waiters.push(waiter);
                }
                ConnectionState::Connected => {
                    let _ = waiter.send(Ok(()));
                }
                ConnectionState::Closed => {
                    let _ = waiter.send(Err(ClientError::ConnectionDisposed));
                }
            },
            ActorMessage::Enqueue(operation) => {
                if self.state.is_closed() {
                    reject_after_close(ActorMessage::Enqueue(operation), &self.shared);
                    return;
                }
                self.dispatcher.enqueue(operation);
                if self.state == ConnectionState::Init {
                    self.begin_connect();
                }
                self.pump();
            }
            ActorMessage::Cancel(id) => {
                if self.dispatcher.cancel(id) {
                    debug!(operation = ?id, "cancelled");
                }
                self.pump();
            }
            ActorMessage::Forward(outbound) => self.send_outbound(outbound),
            ActorMessage::Unsubscribe(correlation_id) => {
                if self.subscriptions.remove(&correlation_id).is_some() {
                    debug!(%correlation_id, "unsubscribing");
                    self.send_outbound(Outbound::Unsubscribe { correlation_id });
                }
            }
            ActorMessage::Close { reason, done } => {
                self.close(reason, None);
                let _ = done.send(());
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------------

    fn set_state(&mut self, next: ConnectionState) -> bool {
        if !self.state.can_transition_to(next) {
            debug!(from = %self.state, to = %next, "ignoring invalid state transition");
            return false;
        }
        info!(connection = %self.name, from = %self.state, to = %next, "connection state changed");
        self.state = next;
        self.shared.state.send_replace(next);
        true
    }

    fn begin_connect(&mut self) {
        if self.set_state(ConnectionState::Connecting) {
            self.start_connecting(None);
        }
    }

    fn handshake(&self) -> Handshake {
        Handshake {
            connection_name: self.name.clone(),
            use_tls: self.settings.use_tls(),
            validate_server: self.settings.validate_server(),
            credentials: self.settings.default_credentials().cloned(),
        }
    }

    /// Spawns discovery plus transport establishment. With a `hint` the
    /// discovery step is skipped.
    fn start_connecting(&mut self, hint: Option<NodeEndpoints>) {
        self.attempt += 1;
        let attempt = self.attempt;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }

        let discoverer = Arc::clone(&self.discoverer);
        let connector = Arc::clone(&self.connector);
        let failed = self.failed_endpoint.clone();
        let handshake = self.handshake();
        let timeout = self.settings.client_connection_timeout();
        let use_tls = self.settings.use_tls();
        let internal = self.internal_tx.clone();
        let span = info_span!("connect", connection = %self.name, attempt);

        self.connect_task = Some(tokio::spawn(
            async move {
                let message = match establish(
                    discoverer.as_ref(),
                    connector.as_ref(),
                    hint,
                    failed,
                    &handshake,
                    timeout,
                    use_tls,
                )
                .await
                {
                    Ok((endpoints, transport)) => Internal::Established {
                        attempt,
                        endpoints,
                        transport,
                    },
                    Err(failure) => Internal::ConnectFailed { attempt, failure },
                };
                let _ = internal.send(message);
            }
            .instrument(span),
        ));
    }

    fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Established {
                attempt,
                endpoints,
                transport,
            } => {
                if attempt != self.attempt {
                    debug!(%endpoints, "discarding transport from a stale attempt");
                    return;
                }
                self.connect_task = None;
                match self.state {
                    ConnectionState::Connecting => self.on_connected(endpoints, transport),
                    ConnectionState::Connected if self.redirecting => {
                        self.swap_transport(endpoints, transport)
                    }
                    _ => debug!(%endpoints, state = %self.state, "discarding unexpected transport"),
                }
            }
            Internal::ConnectFailed { attempt, failure } => {
                if attempt != self.attempt {
                    return;
                }
                self.connect_task = None;
                self.on_connect_failed(failure);
            }
            Internal::ReconnectDue { attempt } => {
                if attempt != self.attempt || self.state != ConnectionState::Reconnecting {
                    return;
                }
                self.reconnections += 1;
                if self.set_state(ConnectionState::Connecting) {
                    self.start_connecting(None);
                }
            }
        }
    }

    fn install(&mut self, endpoints: NodeEndpoints, transport: TransportHandle) {
        self.transport = Some(ActiveTransport {
            endpoints: endpoints.clone(),
            outbound: transport.outbound,
            inbound: transport.inbound,
        });
        self.heartbeat = Heartbeat {
            last_inbound: Instant::now(),
            probe_sent: None,
        };
        self.shared.endpoint.send_replace(Some(endpoints.clone()));
        self.shared
            .events
            .send(ConnectionEvent::Connected { endpoints });
    }

    fn on_connected(&mut self, endpoints: NodeEndpoints, transport: TransportHandle) {
        info!(connection = %self.name, %endpoints, "connected");
        self.reconnections = 0;
        self.failed_endpoint = None;
        self.set_state(ConnectionState::Connected);
        self.install(endpoints, transport);
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        self.pump();
    }

    fn on_connect_failed(&mut self, failure: ConnectFailure) {
        let message = failure.error.to_string();
        warn!(connection = %self.name, error = %message, terminal = failure.terminal, "connection attempt failed");
        if let ClientError::Transport(TransportError::AuthenticationFailed(reason)) = &failure.error
        {
            self.shared
                .events
                .send(ConnectionEvent::AuthenticationFailed {
                    reason: reason.clone(),
                });
        }
        self.shared
            .events
            .send(ConnectionEvent::ErrorOccurred { message });

        if failure.terminal {
            error!(connection = %self.name, error = %failure.error, "giving up on the cluster");
            self.close(failure.error.to_string(), Some(failure.error));
            return;
        }
        if self.redirecting {
            self.redirecting = false;
            self.transport_lost("leader redirect failed");
            return;
        }
        self.failed_endpoint = failure.endpoints;
        self.schedule_reconnect();
    }

    fn schedule_reconnect(&mut self) {
        let limit = self.settings.max_reconnections();
        if limit.is_exhausted(self.reconnections) {
            error!(connection = %self.name, reconnections = self.reconnections, "reconnection limit reached");
            self.close(
                format!(
                    "reconnection limit reached after {} attempt(s)",
                    self.reconnections
                ),
                None,
            );
            return;
        }
        if !self.set_state(ConnectionState::Reconnecting) {
            return;
        }
        self.shared.events.send(ConnectionEvent::Reconnecting);

        self.attempt += 1;
        let attempt = self.attempt;
        let delay = self.settings.reconnection_delay();
        let internal = self.internal_tx.clone();
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        self.connect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(Internal::ReconnectDue { attempt });
        }));
    }

    /// Re-resolves the node to send to after a not-leader or server-error
    /// reply, keeping the current transport until the new one is up.
    fn start_redirect(&mut self, hint: Option<NodeEndpoints>) {
        if self.redirecting || self.state != ConnectionState::Connected {
            return;
        }
        let current = self.transport.as_ref().map(|t| t.endpoints.clone());
        if hint.is_some() && hint == current {
            return;
        }
        info!(connection = %self.name, hint = ?hint, "re-resolving endpoint");
        self.redirecting = true;
        self.failed_endpoint = current;
        self.start_connecting(hint);
    }

    fn swap_transport(&mut self, endpoints: NodeEndpoints, transport: TransportHandle) {
        self.redirecting = false;
        if let Some(old) = self.transport.take() {
            info!(connection = %self.name, from = %old.endpoints, to = %endpoints, "switching node");
            self.shared.events.send(ConnectionEvent::Disconnected {
                endpoints: old.endpoints,
            });
        }
        self.dispatcher
            .requeue_in_flight("switched node", Instant::now());
        self.lose_subscriptions();
        self.failed_endpoint = None;
        self.install(endpoints, transport);
        self.pump();
    }

    fn transport_lost(&mut self, reason: &str) {
        let Some(old) = self.transport.take() else {
            return;
        };
        warn!(connection = %self.name, endpoints = %old.endpoints, reason, "transport lost");
        self.shared.events.send(ConnectionEvent::Disconnected {
            endpoints: old.endpoints.clone(),
        });
        self.failed_endpoint = Some(old.endpoints);
        self.redirecting = false;
        self.heartbeat.probe_sent = None;
        self.shared.endpoint.send_replace(None);

        self.dispatcher.requeue_in_flight(reason, Instant::now());
        self.lose_subscriptions();
        self.schedule_reconnect();
    }

    fn lose_subscriptions(&mut self) {
        for (_, route) in self.subscriptions.drain() {
            let _ = route.send(SubscriptionMessage::ConnectionLost);
        }
    }

    /// Moves to `Closed`. Idempotent; the transport is released once.
    fn close(&mut self, reason: String, cause: Option<ClientError>) {
        if self.state.is_closed() {
            return;
        }
        info!(connection = %self.name, %reason, "closing connection");
        self.shared.closed.store(true, Ordering::Release);
        self.attempt += 1;
        if let Some(task) = self.connect_task.take() {
            task.abort();
        }
        if let Some(old) = self.transport.take() {
            self.shared.events.send(ConnectionEvent::Disconnected {
                endpoints: old.endpoints,
            });
        }
        self.set_state(ConnectionState::Closed);
        self.shared.endpoint.send_replace(None);

        let err = ClientError::ConnectionClosed {
            reason: reason.clone(),
        };
        self.dispatcher.fail_all(&err);
        for (_, route) in self.subscriptions.drain() {
            let _ = route.send(SubscriptionMessage::ConnectionClosed(reason.clone()));
        }
        for waiter in self.connect_waiters.drain(..) {
            let _ = waiter.send(Err(cause.clone().unwrap_or_else(|| err.clone())));
        }
        self.shared
            .events
            .send(ConnectionEvent::Closed { reason });
    }

    // ------------------------------------------------------------------------
    // Transport traffic
    // ------------------------------------------------------------------------

    fn pump(&mut self) {
        if self.state != ConnectionState::Connected || self.redirecting {
            return;
        }
        let Some(transport) = &self.transport else {
            return;
        };
        let outbound = &transport.outbound;
        self.dispatcher
            .dispatch(Instant::now(), &mut |message| outbound.send(message).is_ok());
    }

    fn send_outbound(&mut self, message: Outbound) {
        match &self.transport {
            Some(transport) => {
                let _ = transport.outbound.send(message);
            }
            None => trace!(?message, "no transport; dropping outbound message"),
        }
    }

    fn handle_inbound(&mut self, inbound: Option<Inbound>) {
        let Some(inbound) = inbound else {
            self.transport_lost("transport closed");
            return;
        };
        let now = Instant::now();
        self.heartbeat.last_inbound = now;
        self.heartbeat.probe_sent = None;

        match inbound {
            Inbound::Reply {
                correlation_id,
                reply,
            } => match self.dispatcher.complete(correlation_id, reply, now) {
                Completion::Unknown | Completion::Done | Completion::Retried => {}
                Completion::Redirect(hint) => self.start_redirect(hint),
                Completion::Subscribed {
                    correlation_id,
                    route,
                } => {
                    debug!(%correlation_id, "subscription confirmed");
                    self.subscriptions.insert(correlation_id, route);
                }
                Completion::Orphaned(correlation_id) => {
                    self.send_outbound(Outbound::Unsubscribe { correlation_id });
                }
            },
            Inbound::Push {
                correlation_id,
                push,
            } => self.route_push(correlation_id, push),
            Inbound::HeartbeatResponse { correlation_id } => {
                trace!(%correlation_id, "heartbeat response");
            }
            Inbound::Closed { reason } => {
                self.transport_lost(&format!("closed by server: {reason}"));
            }
        }
        self.pump();
    }

    fn route_push(&mut self, correlation_id: CorrelationId, push: Push) {
        let Some(route) = self.subscriptions.get(&correlation_id) else {
            trace!(%correlation_id, "push for unknown subscription discarded");
            return;
        };
        let (message, finished) = match push {
            Push::EventAppeared(event) => (SubscriptionMessage::Event(event), false),
            Push::PersistentEventAppeared { event, retry_count } => (
                SubscriptionMessage::PersistentEvent { event, retry_count },
                false,
            ),
            Push::CheckpointReached(position) => (SubscriptionMessage::Checkpoint(position), false),
            Push::Dropped(reason) => (SubscriptionMessage::ServerDropped(reason), true),
        };
        let delivered = route.send(message).is_ok();
        if finished {
            self.subscriptions.remove(&correlation_id);
        } else if !delivered {
            debug!(%correlation_id, "subscription gone; unsubscribing");
            self.subscriptions.remove(&correlation_id);
            self.send_outbound(Outbound::Unsubscribe { correlation_id });
        }
    }

    fn check_heartbeat(&mut self) {
        if self.state != ConnectionState::Connected || self.transport.is_none() {
            return;
        }
        let now = Instant::now();
        match self.heartbeat.probe_sent {
            Some(sent) if now.saturating_duration_since(sent) >= self.settings.heartbeat_timeout() => {
                self.transport_lost("heartbeat timeout");
            }
            Some(_) => {}
            None => {
                let idle = now.saturating_duration_since(self.heartbeat.last_inbound);
                if idle >= self.settings.heartbeat_interval() {
                    let correlation_id = self.dispatcher.next_correlation_id();
                    trace!(%correlation_id, "sending heartbeat");
                    self.send_outbound(Outbound::Heartbeat { correlation_id });
                    self.heartbeat.probe_sent = Some(now);
                }
            }
        }
    }
}

async fn next_inbound(transport: &mut Option<ActiveTransport>) -> Option<Inbound> {
    match transport {
        Some(transport) => transport.inbound.recv().await,
        None => std::future::pending().await,
    }
}

fn reject_after_close(message: ActorMessage, shared: &Shared) {
    match message {
        ActorMessage::Enqueue(operation) => {
            shared.gauge.release();
            operation.finish(Err(ClientError::ConnectionDisposed));
        }
        ActorMessage::Connect(waiter) => {
            let _ = waiter.send(Err(ClientError::ConnectionDisposed));
        }
        ActorMessage::Close { done, .. } => {
            let _ = done.send(());
        }
        ActorMessage::Cancel(_) | ActorMessage::Forward(_) | ActorMessage::Unsubscribe(_) => {}
    }
}

async fn establish(
    discoverer: &dyn EndpointDiscoverer,
    connector: &dyn Connector,
    hint: Option<NodeEndpoints>,
    failed: Option<NodeEndpoints>,
    handshake: &Handshake,
    timeout: Duration,
    use_tls: bool,
) -> Result<(NodeEndpoints, TransportHandle), ConnectFailure> {
    let endpoints = match hint {
        Some(endpoints) => endpoints,
        None => discoverer
            .discover(failed.as_ref())
            .await
            .map_err(|error| ConnectFailure {
                terminal: matches!(error, ClientError::DiscoveryFailed { .. }),
                error,
                endpoints: None,
            })?,
    };

    let target = endpoints.connect_target(use_tls).clone();
    debug!(%target, "opening transport");
    let result = match tokio::time::timeout(timeout, connector.connect(&target, handshake)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout { endpoint: target }),
    };
    match result {
        Ok(transport) => Ok((endpoints, transport)),
        Err(error) => Err(ConnectFailure {
            error: error.into(),
            terminal: false,
            endpoints: Some(endpoints),
        }),
    }
}
