//! The fake cluster: a [`Connector`] and [`GossipClient`] backed by
//! in-process nodes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use cairn_client::transport::{Inbound, Outbound};
use cairn_client::{
    ClientError, ClientResult, Connection, ConnectionOptions, ConnectionSettings, Connector,
    GossipClient, GossipDocument, Handshake, TransportError, TransportHandle,
};
use cairn_types::{ClusterMember, Credentials, Endpoint, MemberRole, NodeEndpoints};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info};

use crate::server::{ClusterState, ConnectionEntry, Node, Stats};
use crate::store::EventStore;

/// Client port of every fake node.
pub const NODE_TCP_PORT: u16 = 1113;

/// Gossip port of every fake node.
pub const NODE_HTTP_PORT: u16 = 2113;

/// An in-process cluster of `n` nodes sharing one event log.
///
/// Node `i` listens on `node{i}:1113` and gossips on `node{i}:2113`. Node 0
/// starts as the leader, every other node as a follower.
#[derive(Debug, Clone)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new(nodes: usize) -> Self {
        let nodes = (0..nodes)
            .map(|i| Node {
                endpoints: NodeEndpoints::plain(Endpoint::new(format!("node{i}"), NODE_TCP_PORT))
                    .with_http(Endpoint::new(format!("node{i}"), NODE_HTTP_PORT)),
                role: if i == 0 {
                    MemberRole::Leader
                } else {
                    MemberRole::Follower
                },
                alive: true,
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(ClusterState::with_nodes(nodes))),
        }
    }

    /// A one-node cluster.
    pub fn single() -> Self {
        Self::new(1)
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Client wiring
    // ------------------------------------------------------------------------

    pub fn tcp_endpoint(&self, node: usize) -> Endpoint {
        Endpoint::new(format!("node{node}"), NODE_TCP_PORT)
    }

    /// Gossip seeds for every node, as connection options expect them.
    pub fn gossip_seeds(&self) -> Vec<String> {
        (0..self.lock().nodes.len())
            .map(|i| format!("node{i}:{NODE_HTTP_PORT}"))
            .collect()
    }

    /// Options pointing at node 0, with short timers for tests.
    pub fn single_node_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            connect_to: Some(format!("tcp://node0:{NODE_TCP_PORT}")),
            ..Self::base_options()
        }
    }

    /// Options that discover the cluster through gossip.
    pub fn cluster_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            gossip_seeds: self.gossip_seeds(),
            ..Self::base_options()
        }
    }

    fn base_options() -> ConnectionOptions {
        ConnectionOptions {
            use_tls: false,
            reconnection_delay_ms: 50,
            operation_timeout_ms: 1000,
            operation_timeout_check_period_ms: 100,
            heartbeat_interval_ms: 500,
            heartbeat_timeout_ms: 1000,
            client_connection_timeout_ms: 500,
            gossip_timeout_ms: 500,
            max_discover_attempts: 3,
            ..ConnectionOptions::default()
        }
    }

    /// Opens a client [`Connection`] wired to this cluster.
    pub fn connection(&self, options: &ConnectionOptions) -> ClientResult<Connection> {
        let settings = ConnectionSettings::from_options(options)
            .map_err(|e| ClientError::InvalidArgument(e.to_string()))?;
        Connection::from_settings(
            settings,
            Arc::new(self.clone()),
            Some(Arc::new(self.clone())),
        )
    }

    // ------------------------------------------------------------------------
    // Topology and faults
    // ------------------------------------------------------------------------

    pub fn leader(&self) -> Option<usize> {
        self.lock().leader()
    }

    /// Makes `node` the leader; the previous leader becomes a follower.
    pub fn set_leader(&self, node: usize) {
        let mut state = self.lock();
        for (i, n) in state.nodes.iter_mut().enumerate() {
            n.role = if i == node {
                MemberRole::Leader
            } else if n.role == MemberRole::Leader {
                MemberRole::Follower
            } else {
                n.role
            };
        }
        info!(node, "leader changed");
    }

    pub fn set_role(&self, node: usize, role: MemberRole) {
        self.lock().nodes[node].role = role;
    }

    /// Takes a node down (dropping its connections) or brings it back.
    pub fn set_node_alive(&self, node: usize, alive: bool) {
        self.lock().nodes[node].alive = alive;
        if !alive {
            self.kill_connections_to(node);
        }
    }

    /// Closes every open transport to `node`.
    pub fn kill_connections_to(&self, node: usize) {
        let ids: Vec<u64> = {
            let state = self.lock();
            state
                .connections
                .iter()
                .filter(|(_, c)| c.node == node)
                .map(|(id, _)| *id)
                .collect()
        };
        for id in ids {
            self.kill_connection(id);
        }
    }

    /// Closes every open transport.
    pub fn kill_connections(&self) {
        let ids: Vec<u64> = self.lock().connections.keys().copied().collect();
        for id in ids {
            self.kill_connection(id);
        }
    }

    fn kill_connection(&self, id: u64) {
        let entry = self.lock().disconnect(id);
        if let Some(entry) = entry {
            debug!(connection = id, node = entry.node, "killing connection");
            let _ = entry.responses.send(Inbound::Closed {
                reason: "connection reset".to_string(),
            });
            if let Some(task) = entry.task {
                task.abort();
            }
        }
    }

    /// Refuses the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.lock().faults.fail_next_connects = count;
    }

    /// Delays every reply by `delay`.
    pub fn set_response_delay(&self, delay: Duration) {
        self.lock().faults.response_delay = delay;
    }

    /// Swallows every request and heartbeat without answering.
    pub fn set_black_hole(&self, on: bool) {
        self.lock().faults.black_hole = on;
    }

    pub fn set_gossip_unavailable(&self, on: bool) {
        self.lock().faults.gossip_unavailable = on;
    }

    /// Rejects requests whose credentials differ from `credentials`.
    pub fn require_credentials(&self, credentials: Credentials) {
        self.lock().faults.required_credentials = Some(credentials);
    }

    /// Only `user` may touch `stream`.
    pub fn restrict_stream(&self, stream: &str, user: &str) {
        self.lock()
            .faults
            .restricted_streams
            .insert(stream.to_string(), user.to_string());
    }

    /// Re-pushes the last `count` existing events right after a live
    /// subscription is confirmed.
    pub fn redeliver_on_subscribe(&self, count: usize) {
        self.lock().faults.redeliver_on_subscribe = count;
    }

    /// Pushes persistent events regardless of the window a member asked for.
    pub fn ignore_in_flight_limit(&self, on: bool) {
        self.lock().faults.ignore_in_flight_limit = on;
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    pub fn stats(&self) -> Stats {
        self.lock().stats.clone()
    }

    pub fn open_connections(&self) -> usize {
        self.lock().connections.len()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.lock().live_subscriptions()
    }

    /// Events delivered to the group and not yet acknowledged.
    pub fn persistent_in_flight(&self, stream: &str, group: &str) -> usize {
        self.lock().persistent_in_flight(stream, group)
    }

    /// Event numbers parked by the group.
    pub fn parked(&self, stream: &str, group: &str) -> Vec<u64> {
        self.lock().parked(stream, group)
    }

    pub fn group_member_count(&self, stream: &str, group: &str) -> usize {
        self.lock().group_members(stream, group).len()
    }

    /// Runs `f` against the shared event log.
    pub fn with_store<T>(&self, f: impl FnOnce(&mut EventStore) -> T) -> T {
        f(&mut self.lock().store)
    }

    fn node_by(&self, matches: impl Fn(&NodeEndpoints) -> bool) -> Option<usize> {
        self.lock().nodes.iter().position(|n| matches(&n.endpoints))
    }
}

// ============================================================================
// Transport
// ============================================================================

#[async_trait]
impl Connector for FakeCluster {
    async fn connect(
        &self,
        endpoint: &Endpoint,
        handshake: &Handshake,
    ) -> Result<TransportHandle, TransportError> {
        let node = self
            .node_by(|e| e.tcp() == Some(endpoint) || e.secure_tcp() == Some(endpoint))
            .ok_or_else(|| TransportError::Refused {
                endpoint: endpoint.clone(),
            })?;

        let (handle, peer) = TransportHandle::channel();
        let id = {
            let mut state = self.lock();
            if !state.nodes[node].alive {
                return Err(TransportError::Refused {
                    endpoint: endpoint.clone(),
                });
            }
            if state.faults.fail_next_connects > 0 {
                state.faults.fail_next_connects -= 1;
                return Err(TransportError::Refused {
                    endpoint: endpoint.clone(),
                });
            }
            if let Some(required) = &state.faults.required_credentials
                && handshake.credentials.as_ref().is_some_and(|c| c != required)
            {
                return Err(TransportError::AuthenticationFailed(
                    "invalid credentials".to_string(),
                ));
            }

            state.stats.connects += 1;
            state
                .stats
                .connection_names
                .push(handshake.connection_name.clone());
            let id = state.next_connection;
            state.next_connection += 1;
            state.connections.insert(
                id,
                ConnectionEntry {
                    node,
                    responses: peer.responses,
                    credentials: handshake.credentials.clone(),
                    task: None,
                },
            );
            id
        };

        let task = tokio::spawn(serve(self.clone(), id, peer.requests));
        if let Some(entry) = self.lock().connections.get_mut(&id) {
            entry.task = Some(task.abort_handle());
        }
        debug!(connection = id, node, name = %handshake.connection_name, "accepted");
        Ok(handle)
    }
}

async fn serve(cluster: FakeCluster, id: u64, mut requests: UnboundedReceiver<Outbound>) {
    while let Some(message) = requests.recv().await {
        match message {
            Outbound::Request {
                correlation_id,
                require_leader,
                credentials,
                command,
            } => {
                let delay = {
                    let mut state = cluster.lock();
                    state.receive(id, correlation_id, &command);
                    state.faults.response_delay
                };
                if delay.is_zero() {
                    cluster
                        .lock()
                        .complete(id, correlation_id, require_leader, credentials, command);
                } else {
                    let cluster = cluster.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        cluster.lock().complete(
                            id,
                            correlation_id,
                            require_leader,
                            credentials,
                            command,
                        );
                    });
                }
            }
            other => cluster.lock().handle(id, other),
        }
    }
    debug!(connection = id, "client closed transport");
    cluster.lock().disconnect(id);
}

// ============================================================================
// Gossip
// ============================================================================

#[async_trait]
impl GossipClient for FakeCluster {
    async fn fetch_members(
        &self,
        seed: &Endpoint,
        _timeout: Duration,
    ) -> Result<Vec<ClusterMember>, TransportError> {
        let refused = || TransportError::Refused {
            endpoint: seed.clone(),
        };
        let node = self
            .node_by(|e| e.http() == Some(seed) || e.tcp() == Some(seed))
            .ok_or_else(refused)?;

        let body = {
            let state = self.lock();
            if state.faults.gossip_unavailable || !state.nodes[node].alive {
                return Err(refused());
            }
            GossipDocument::new(state.nodes.iter().map(Node::as_member).collect()).encode()?
        };
        Ok(GossipDocument::decode(&body)?.members)
    }
}
