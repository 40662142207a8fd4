//! Request handling of the fake cluster.
//!
//! Every node shares one [`EventStore`]; a node differs only in its role and
//! whether it is reachable. All handling is synchronous under the cluster
//! lock, so a reply and the pushes it causes leave in one step, reply first.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use cairn_client::operation::{
    Command, NotHandled, PersistentOutcome, ReadAllOutcome, ReadEventOutcome, ReadStreamOutcome,
    Reply, WriteOutcome,
};
use cairn_client::subscription::{
    NackAction, PersistentSubscriptionSettings, StartFrom, SubscriptionDropReason,
};
use cairn_client::transport::{CorrelationId, Inbound, Outbound, Push};
use cairn_client::{ALL_STREAM, Filter, OperationKind};
use cairn_types::{ClusterMember, Credentials, MemberRole, NodeEndpoints};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::AbortHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::store::{EventStore, matches_filter};

// ============================================================================
// Topology
// ============================================================================

#[derive(Debug)]
pub(crate) struct Node {
    pub(crate) endpoints: NodeEndpoints,
    pub(crate) role: MemberRole,
    pub(crate) alive: bool,
}

impl Node {
    pub(crate) fn as_member(&self) -> ClusterMember {
        let member = ClusterMember::new(self.endpoints.clone(), self.role);
        if self.alive { member } else { member.dead() }
    }
}

/// One open transport, server side.
#[derive(Debug)]
pub(crate) struct ConnectionEntry {
    pub(crate) node: usize,
    pub(crate) responses: UnboundedSender<Inbound>,
    pub(crate) credentials: Option<Credentials>,
    pub(crate) task: Option<AbortHandle>,
}

// ============================================================================
// Subscriptions
// ============================================================================

#[derive(Debug)]
struct LiveSubscription {
    connection: u64,
    correlation_id: CorrelationId,
    /// `None` follows `$all`.
    stream: Option<String>,
    filter: Option<Filter>,
    checkpoint_interval: Option<u32>,
    scanned: u32,
}

impl LiveSubscription {
    fn follows(&self, stream: &str) -> bool {
        self.stream.as_deref().is_none_or(|s| s == stream)
    }
}

#[derive(Debug)]
struct Member {
    connection: u64,
    correlation_id: CorrelationId,
    allowed_in_flight: u32,
    /// Delivered, unacknowledged events: id to (event number, retry count).
    in_flight: HashMap<Uuid, (u64, u32)>,
}

#[derive(Debug)]
struct Group {
    settings: PersistentSubscriptionSettings,
    members: Vec<Member>,
    next_member: usize,
    /// Next event number of the stream to hand out.
    cursor: u64,
    retries: VecDeque<(u64, u32)>,
    parked: Vec<u64>,
}

impl Group {
    fn has_capacity(&self) -> bool {
        self.members
            .iter()
            .any(|m| (m.in_flight.len() as u32) < m.allowed_in_flight)
    }

    /// Next member with room, round robin.
    fn pick_member(&mut self) -> Option<usize> {
        let count = self.members.len();
        for offset in 0..count {
            let index = (self.next_member + offset) % count;
            let member = &self.members[index];
            if (member.in_flight.len() as u32) < member.allowed_in_flight {
                self.next_member = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }
}

type GroupKey = (String, String);

// ============================================================================
// Faults and statistics
// ============================================================================

#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub(crate) fail_next_connects: u32,
    pub(crate) response_delay: Duration,
    pub(crate) black_hole: bool,
    pub(crate) gossip_unavailable: bool,
    pub(crate) required_credentials: Option<Credentials>,
    /// Stream to the only user allowed to touch it.
    pub(crate) restricted_streams: HashMap<String, String>,
    pub(crate) redeliver_on_subscribe: usize,
    /// Persistent members get an unlimited in-flight window.
    pub(crate) ignore_in_flight_limit: bool,
}

/// A request as the cluster received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRecord {
    pub node: usize,
    pub correlation_id: CorrelationId,
    pub kind: OperationKind,
}

/// Counters kept by the fake cluster.
#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub connects: usize,
    pub requests: Vec<RequestRecord>,
    pub connection_names: Vec<String>,
    pub in_flight: usize,
    pub max_in_flight: usize,
}

impl Stats {
    /// Requests seen for `kind`.
    pub fn count(&self, kind: OperationKind) -> usize {
        self.requests.iter().filter(|r| r.kind == kind).count()
    }

    pub fn nodes_for(&self, kind: OperationKind) -> Vec<usize> {
        self.requests
            .iter()
            .filter(|r| r.kind == kind)
            .map(|r| r.node)
            .collect()
    }
}

// ============================================================================
// Cluster state
// ============================================================================

/// Work to do after a reply has been sent.
enum FollowUp {
    Nothing,
    Appended(Vec<usize>),
    Subscribed {
        connection: u64,
        correlation_id: CorrelationId,
    },
    Dispatch(GroupKey),
}

#[derive(Debug, Default)]
pub(crate) struct ClusterState {
    pub(crate) nodes: Vec<Node>,
    pub(crate) store: EventStore,
    pub(crate) connections: HashMap<u64, ConnectionEntry>,
    pub(crate) next_connection: u64,
    pub(crate) faults: Faults,
    pub(crate) stats: Stats,
    live: Vec<LiveSubscription>,
    groups: HashMap<GroupKey, Group>,
}

impl ClusterState {
    pub(crate) fn with_nodes(nodes: Vec<Node>) -> Self {
        Self {
            nodes,
            ..Self::default()
        }
    }

    pub(crate) fn leader(&self) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.alive && n.role == MemberRole::Leader)
    }

    fn send(&self, connection: u64, inbound: Inbound) {
        if let Some(entry) = self.connections.get(&connection) {
            // The client may already be gone.
            let _ = entry.responses.send(inbound);
        }
    }

    fn push(&self, connection: u64, correlation_id: CorrelationId, push: Push) {
        self.send(connection, Inbound::Push { correlation_id, push });
    }

    /// Records an arriving request. Every recorded request is later passed
    /// to [`ClusterState::complete`].
    pub(crate) fn receive(&mut self, connection: u64, correlation_id: CorrelationId, command: &Command) {
        let node = self.connections.get(&connection).map_or(usize::MAX, |c| c.node);
        self.stats.requests.push(RequestRecord {
            node,
            correlation_id,
            kind: command.kind(),
        });
        self.stats.in_flight += 1;
        self.stats.max_in_flight = self.stats.max_in_flight.max(self.stats.in_flight);
    }

    pub(crate) fn complete(
        &mut self,
        connection: u64,
        correlation_id: CorrelationId,
        require_leader: bool,
        credentials: Option<Credentials>,
        command: Command,
    ) {
        self.stats.in_flight = self.stats.in_flight.saturating_sub(1);
        let Some(entry) = self.connections.get(&connection) else {
            return;
        };
        if self.faults.black_hole {
            trace!(%correlation_id, "request swallowed");
            return;
        }

        let credentials = credentials.or_else(|| entry.credentials.clone());
        let node = entry.node;
        let (reply, follow_up) = if let Some(required) = &self.faults.required_credentials
            && credentials.as_ref() != Some(required)
        {
            (Reply::NotAuthenticated("invalid credentials".to_string()), FollowUp::Nothing)
        } else if require_leader && self.nodes[node].role != MemberRole::Leader {
            let leader = self.leader().map(|i| self.nodes[i].endpoints.clone());
            (Reply::NotHandled(NotHandled::NotLeader { leader }), FollowUp::Nothing)
        } else {
            self.execute(connection, correlation_id, credentials.as_ref(), command)
        };

        debug!(node, %correlation_id, ?reply, "reply");
        self.send(connection, Inbound::Reply { correlation_id, reply });

        match follow_up {
            FollowUp::Nothing => {}
            FollowUp::Appended(written) => self.publish(&written),
            FollowUp::Subscribed {
                connection,
                correlation_id,
            } => self.redeliver(connection, correlation_id),
            FollowUp::Dispatch(key) => self.dispatch(&key),
        }
    }

    /// Handles everything but requests.
    pub(crate) fn handle(&mut self, connection: u64, message: Outbound) {
        match message {
            Outbound::Request { .. } => {}
            Outbound::Heartbeat { correlation_id } => {
                if !self.faults.black_hole {
                    self.send(connection, Inbound::HeartbeatResponse { correlation_id });
                }
            }
            Outbound::Unsubscribe { correlation_id } => {
                self.live
                    .retain(|s| !(s.connection == connection && s.correlation_id == correlation_id));
                self.remove_members(|m| m.connection == connection && m.correlation_id == correlation_id);
            }
            Outbound::PersistentAck {
                correlation_id,
                event_ids,
                ..
            } => self.settle(connection, correlation_id, &event_ids, None),
            Outbound::PersistentNack {
                correlation_id,
                event_ids,
                action,
                ..
            } => self.settle(connection, correlation_id, &event_ids, Some(action)),
        }
    }

    /// Forgets a transport and everything attached to it.
    pub(crate) fn disconnect(&mut self, connection: u64) -> Option<ConnectionEntry> {
        self.live.retain(|s| s.connection != connection);
        self.remove_members(|m| m.connection == connection);
        self.connections.remove(&connection)
    }

    fn allowed(&self, stream: &str, credentials: Option<&Credentials>) -> bool {
        match self.faults.restricted_streams.get(stream) {
            Some(user) => credentials.is_some_and(|c| &c.username == user),
            None => true,
        }
    }

    fn execute(
        &mut self,
        connection: u64,
        correlation_id: CorrelationId,
        credentials: Option<&Credentials>,
        command: Command,
    ) -> (Reply, FollowUp) {
        match command {
            Command::AppendToStream {
                stream,
                expected_version,
                events,
            }
            | Command::ConditionalAppendToStream {
                stream,
                expected_version,
                events,
            } => {
                if !self.allowed(&stream, credentials) {
                    return (Reply::Write(WriteOutcome::AccessDenied), FollowUp::Nothing);
                }
                let (outcome, written) = self.store.append(&stream, expected_version, &events);
                (Reply::Write(outcome), FollowUp::Appended(written))
            }
            Command::DeleteStream {
                stream,
                expected_version,
                hard_delete,
            } => {
                if !self.allowed(&stream, credentials) {
                    return (Reply::Delete(WriteOutcome::AccessDenied), FollowUp::Nothing);
                }
                let outcome = self.store.delete(&stream, expected_version, hard_delete);
                (Reply::Delete(outcome), FollowUp::Nothing)
            }
            Command::ReadEvent {
                stream,
                event_number,
                ..
            } => {
                let outcome = if self.allowed(&stream, credentials) {
                    self.store.read_event(&stream, event_number)
                } else {
                    ReadEventOutcome::AccessDenied
                };
                (Reply::ReadEvent(outcome), FollowUp::Nothing)
            }
            Command::ReadStreamEvents {
                stream,
                from,
                max_count,
                direction,
                ..
            } => {
                let outcome = if self.allowed(&stream, credentials) {
                    self.store.read_stream(&stream, from, max_count, direction)
                } else {
                    ReadStreamOutcome::AccessDenied
                };
                (Reply::ReadStream(outcome), FollowUp::Nothing)
            }
            Command::ReadAllEvents {
                position,
                max_count,
                direction,
                filter,
                max_search_window,
                ..
            } => {
                let outcome = if self.allowed(ALL_STREAM, credentials) {
                    self.store.read_all(
                        position,
                        max_count,
                        direction,
                        filter.as_ref(),
                        max_search_window,
                    )
                } else {
                    ReadAllOutcome::AccessDenied
                };
                (Reply::ReadAll(outcome), FollowUp::Nothing)
            }
            Command::CreatePersistentSubscription {
                stream,
                group,
                settings,
            } => {
                let outcome = if !self.allowed(&stream, credentials) {
                    PersistentOutcome::AccessDenied
                } else if self.groups.contains_key(&(stream.clone(), group.clone())) {
                    PersistentOutcome::AlreadyExists
                } else {
                    let cursor = match settings.start_from {
                        StartFrom::Beginning => 0,
                        StartFrom::Current => self.store.next_event_number(&stream),
                        StartFrom::Event(number) => number.as_u64(),
                    };
                    self.groups.insert(
                        (stream, group),
                        Group {
                            settings,
                            members: Vec::new(),
                            next_member: 0,
                            cursor,
                            retries: VecDeque::new(),
                            parked: Vec::new(),
                        },
                    );
                    PersistentOutcome::Success
                };
                (Reply::Persistent(outcome), FollowUp::Nothing)
            }
            Command::UpdatePersistentSubscription {
                stream,
                group,
                settings,
            } => {
                let outcome = match self.groups.get_mut(&(stream, group)) {
                    Some(existing) => {
                        existing.settings = settings;
                        PersistentOutcome::Success
                    }
                    None => PersistentOutcome::DoesNotExist,
                };
                (Reply::Persistent(outcome), FollowUp::Nothing)
            }
            Command::DeletePersistentSubscription { stream, group } => {
                let outcome = match self.groups.remove(&(stream, group)) {
                    Some(removed) => {
                        for member in removed.members {
                            self.push(
                                member.connection,
                                member.correlation_id,
                                Push::Dropped(SubscriptionDropReason::PersistentSubscriptionDeleted),
                            );
                        }
                        PersistentOutcome::Success
                    }
                    None => PersistentOutcome::DoesNotExist,
                };
                (Reply::Persistent(outcome), FollowUp::Nothing)
            }
            Command::SubscribeToStream {
                stream,
                filter,
                checkpoint_interval,
                ..
            } => {
                let target = stream.as_deref().unwrap_or(ALL_STREAM);
                if !self.allowed(target, credentials) {
                    return (
                        Reply::SubscriptionDropped(SubscriptionDropReason::AccessDenied),
                        FollowUp::Nothing,
                    );
                }
                let reply = Reply::SubscriptionConfirmed {
                    last_commit_position: self.store.last_commit_position(),
                    last_event_number: stream
                        .as_deref()
                        .and_then(|s| self.store.last_event_number(s)),
                };
                self.live.push(LiveSubscription {
                    connection,
                    correlation_id,
                    stream,
                    filter,
                    checkpoint_interval,
                    scanned: 0,
                });
                (
                    reply,
                    FollowUp::Subscribed {
                        connection,
                        correlation_id,
                    },
                )
            }
            Command::ConnectToPersistentSubscription {
                stream,
                group,
                allowed_in_flight,
            } => {
                let key = (stream, group);
                let Some(existing) = self.groups.get_mut(&key) else {
                    return (
                        Reply::SubscriptionDropped(SubscriptionDropReason::NotFound),
                        FollowUp::Nothing,
                    );
                };
                let limit = existing.settings.max_subscriber_count as usize;
                if limit > 0 && existing.members.len() >= limit {
                    return (
                        Reply::SubscriptionDropped(SubscriptionDropReason::MaxSubscribersReached),
                        FollowUp::Nothing,
                    );
                }
                let allowed_in_flight = if self.faults.ignore_in_flight_limit {
                    u32::MAX
                } else {
                    allowed_in_flight
                };
                existing.members.push(Member {
                    connection,
                    correlation_id,
                    allowed_in_flight,
                    in_flight: HashMap::new(),
                });
                let reply = Reply::PersistentSubscriptionConfirmed {
                    subscription_id: format!("{}::{}", key.0, key.1),
                    last_commit_position: self.store.last_commit_position(),
                    last_event_number: self.store.last_event_number(&key.0),
                };
                (reply, FollowUp::Dispatch(key))
            }
        }
    }

    // ------------------------------------------------------------------------
    // Live pushes
    // ------------------------------------------------------------------------

    fn publish(&mut self, written: &[usize]) {
        for &index in written {
            let Some(event) = self.store.resolved(index) else {
                continue;
            };
            let stream = event.original_stream_id().to_string();

            let mut pushes = Vec::new();
            for sub in &mut self.live {
                if !sub.follows(&stream) {
                    continue;
                }
                let passes = sub
                    .filter
                    .as_ref()
                    .is_none_or(|f| matches_filter(f, event.original_event()));
                if passes {
                    pushes.push((sub.connection, sub.correlation_id, Push::EventAppeared(event.clone())));
                }
                if let (Some(_), Some(interval)) = (&sub.filter, sub.checkpoint_interval) {
                    sub.scanned += 1;
                    if interval > 0
                        && sub.scanned % interval == 0
                        && let Some(position) = event.original_position()
                    {
                        pushes.push((
                            sub.connection,
                            sub.correlation_id,
                            Push::CheckpointReached(position),
                        ));
                    }
                }
            }
            for (connection, correlation_id, push) in pushes {
                self.push(connection, correlation_id, push);
            }

            let keys: Vec<GroupKey> = self
                .groups
                .keys()
                .filter(|(s, _)| *s == stream)
                .cloned()
                .collect();
            for key in keys {
                self.dispatch(&key);
            }
        }
    }

    /// Pushes the last few existing events again right after a subscription
    /// is confirmed, the way a server racing an append can.
    fn redeliver(&mut self, connection: u64, correlation_id: CorrelationId) {
        let count = self.faults.redeliver_on_subscribe;
        if count == 0 {
            return;
        }
        let Some(sub) = self
            .live
            .iter()
            .find(|s| s.connection == connection && s.correlation_id == correlation_id)
        else {
            return;
        };
        let events: Vec<_> = (0..self.store.len())
            .rev()
            .filter_map(|i| self.store.resolved(i))
            .filter(|e| sub.follows(e.original_stream_id()))
            .take(count)
            .collect();
        for event in events.into_iter().rev() {
            self.push(connection, correlation_id, Push::EventAppeared(event));
        }
    }

    // ------------------------------------------------------------------------
    // Persistent groups
    // ------------------------------------------------------------------------

    fn dispatch(&mut self, key: &GroupKey) {
        let Some(group) = self.groups.get_mut(key) else {
            return;
        };
        let mut pushes = Vec::new();
        while group.has_capacity() {
            let (number, retry_count) = if let Some(next) = group.retries.pop_front() {
                next
            } else if group.cursor < self.store.next_event_number(&key.0) {
                group.cursor += 1;
                (group.cursor - 1, 0)
            } else {
                break;
            };
            let Some(event) = self.store.stream_event(&key.0, number) else {
                continue;
            };
            if retry_count > group.settings.max_retry_count {
                group.parked.push(number);
                continue;
            }
            let Some(index) = group.pick_member() else {
                break;
            };
            let member = &mut group.members[index];
            member
                .in_flight
                .insert(event.original_event().event_id, (number, retry_count));
            pushes.push((
                member.connection,
                member.correlation_id,
                Push::PersistentEventAppeared {
                    event,
                    retry_count: Some(retry_count),
                },
            ));
        }
        for (connection, correlation_id, push) in pushes {
            self.push(connection, correlation_id, push);
        }
    }

    fn settle(
        &mut self,
        connection: u64,
        correlation_id: CorrelationId,
        event_ids: &[Uuid],
        nack: Option<NackAction>,
    ) {
        let mut touched = None;
        for (key, group) in &mut self.groups {
            let Some(member) = group
                .members
                .iter_mut()
                .find(|m| m.connection == connection && m.correlation_id == correlation_id)
            else {
                continue;
            };
            for id in event_ids {
                let Some((number, retry_count)) = member.in_flight.remove(id) else {
                    continue;
                };
                match nack {
                    None | Some(NackAction::Skip | NackAction::Stop) => {}
                    Some(NackAction::Retry | NackAction::Unknown) => {
                        group.retries.push_back((number, retry_count + 1));
                    }
                    Some(NackAction::Park) => group.parked.push(number),
                }
            }
            touched = Some(key.clone());
            break;
        }
        if let Some(key) = touched {
            self.dispatch(&key);
        }
    }

    /// Removes matching members and hands their unacknowledged events back
    /// to the group.
    fn remove_members(&mut self, matches: impl Fn(&Member) -> bool) {
        let mut touched = Vec::new();
        for (key, group) in &mut self.groups {
            let before = group.members.len();
            let mut requeued = Vec::new();
            group.members.retain(|m| {
                if matches(m) {
                    requeued.extend(m.in_flight.values().copied());
                    false
                } else {
                    true
                }
            });
            if group.members.len() != before {
                requeued.sort_unstable();
                group.retries.extend(requeued);
                group.next_member = 0;
                touched.push(key.clone());
            }
        }
        for key in touched {
            self.dispatch(&key);
        }
    }

    pub(crate) fn persistent_in_flight(&self, stream: &str, group: &str) -> usize {
        self.groups
            .get(&(stream.to_string(), group.to_string()))
            .map_or(0, |g| g.members.iter().map(|m| m.in_flight.len()).sum())
    }

    pub(crate) fn parked(&self, stream: &str, group: &str) -> Vec<u64> {
        self.groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.parked.clone())
            .unwrap_or_default()
    }

    pub(crate) fn live_subscriptions(&self) -> usize {
        self.live.len()
    }

    pub(crate) fn group_members(&self, stream: &str, group: &str) -> HashSet<u64> {
        self.groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|g| g.members.iter().map(|m| m.connection).collect())
            .unwrap_or_default()
    }
}
