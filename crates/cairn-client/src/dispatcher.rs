//! Operation dispatcher.
//!
//! Owns every operation from the moment the connection actor accepts it
//! until its result is delivered. Operations wait in a FIFO queue, move to
//! the in-flight map when sent (keyed by correlation id), and leave it when
//! a reply is inspected, a timeout fires, they are cancelled, or the
//! connection closes.
//!
//! The dispatcher does no I/O and keeps no clock: the actor passes `now` and
//! a send function in. That keeps every rule here testable without a
//! runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use cairn_config::Limit;
use cairn_types::{Credentials, NodeEndpoints};
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::admission::QueueGauge;
use crate::error::{ClientError, ClientResult};
use crate::operation::{Command, Inspection, Reply, inspect};
use crate::subscription::SubscriptionRoute;
use crate::transport::{CorrelationId, Outbound};

/// Identifies an operation across retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OperationId(u64);

impl OperationId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

/// A reply accepted by inspection, with the correlation id of the attempt
/// that produced it.
#[derive(Debug)]
pub struct Delivered {
    pub correlation_id: CorrelationId,
    pub reply: Reply,
}

pub(crate) type ResultSender = oneshot::Sender<ClientResult<Delivered>>;

pub(crate) struct Operation {
    pub id: OperationId,
    pub command: Command,
    pub credentials: Option<Credentials>,
    pub require_leader: bool,
    /// Caller deadline covering queueing, retries and the wire.
    pub deadline: Option<Instant>,
    pub retry_count: u32,
    pub queued_at: Instant,
    pub sent_at: Option<Instant>,
    /// Where pushes go once a subscription is confirmed.
    pub route: Option<SubscriptionRoute>,
    pub result: ResultSender,
}

impl Operation {
    pub(crate) fn finish(self, result: ClientResult<Delivered>) {
        // The caller may have stopped waiting.
        let _ = self.result.send(result);
    }

    fn is_abandoned(&self) -> bool {
        self.result.is_closed()
    }
}

/// Limits the dispatcher enforces.
#[derive(Debug, Clone)]
pub(crate) struct DispatchLimits {
    pub max_concurrent: usize,
    pub max_retries: Limit,
    pub operation_timeout: Duration,
    pub queue_timeout: Option<Duration>,
    pub fail_on_no_server_response: bool,
    pub verbose: bool,
}

/// Why an operation goes back to the queue.
#[derive(Debug, Clone)]
pub(crate) enum RetryCause {
    Timeout,
    Transient(String),
    NotLeader(Option<NodeEndpoints>),
    ConnectionLost(String),
}

/// What handling a reply did.
#[derive(Debug)]
pub(crate) enum Completion {
    /// No in-flight operation has this correlation id.
    Unknown,
    /// The operation finished, successfully or not.
    Done,
    /// The operation was queued again.
    Retried,
    /// The operation was queued again and the endpoint should be re-resolved,
    /// towards the hinted node if there is one.
    Redirect(Option<NodeEndpoints>),
    /// A subscription was confirmed; pushes for it go to `route`.
    Subscribed {
        correlation_id: CorrelationId,
        route: SubscriptionRoute,
    },
    /// A subscription was confirmed but nobody is waiting for it anymore.
    Orphaned(CorrelationId),
}

pub(crate) struct OperationDispatcher {
    limits: DispatchLimits,
    gauge: Arc<QueueGauge>,
    waiting: VecDeque<Operation>,
    in_flight: HashMap<CorrelationId, Operation>,
    next_correlation: u64,
}

impl OperationDispatcher {
    pub fn new(limits: DispatchLimits, gauge: Arc<QueueGauge>) -> Self {
        Self {
            limits,
            gauge,
            waiting: VecDeque::new(),
            in_flight: HashMap::new(),
            next_correlation: 0,
        }
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Hands out a correlation id that was never used on this connection.
    pub fn next_correlation_id(&mut self) -> CorrelationId {
        self.next_correlation += 1;
        CorrelationId::new(self.next_correlation)
    }

    /// Queues an admitted operation. The gauge slot it holds is released
    /// when it leaves the queue.
    pub fn enqueue(&mut self, operation: Operation) {
        if self.limits.verbose {
            debug!(operation = %operation.command.kind(), id = operation.id.0, "queued");
        } else {
            trace!(operation = %operation.command.kind(), id = operation.id.0, "queued");
        }
        self.waiting.push_back(operation);
    }

    fn dequeue(&mut self) -> Option<Operation> {
        let operation = self.waiting.pop_front()?;
        self.gauge.release();
        Some(operation)
    }

    /// Sends queued operations while fewer than `max_concurrent` are in
    /// flight. `send` returns false when the transport refused the message;
    /// the operation then stays first in line.
    pub fn dispatch(&mut self, now: Instant, send: &mut dyn FnMut(Outbound) -> bool) -> usize {
        let mut sent = 0;
        while self.in_flight.len() < self.limits.max_concurrent {
            let Some(mut operation) = self.dequeue() else {
                break;
            };
            if operation.is_abandoned() {
                trace!(id = operation.id.0, "skipping abandoned operation");
                continue;
            }
            if let Some(err) = self.expired_in_queue(&operation, now) {
                operation.finish(Err(err));
                continue;
            }

            let correlation_id = self.next_correlation_id();
            let request = Outbound::Request {
                correlation_id,
                require_leader: operation.require_leader,
                credentials: operation.credentials.clone(),
                command: operation.command.clone(),
            };
            if !send(request) {
                self.gauge.readmit();
                self.waiting.push_front(operation);
                break;
            }

            if self.limits.verbose {
                debug!(%correlation_id, operation = %operation.command.kind(), retry = operation.retry_count, "sent");
            } else {
                trace!(%correlation_id, operation = %operation.command.kind(), retry = operation.retry_count, "sent");
            }
            operation.sent_at = Some(now);
            self.in_flight.insert(correlation_id, operation);
            sent += 1;
        }
        sent
    }

    fn expired_in_queue(&self, operation: &Operation, now: Instant) -> Option<ClientError> {
        let past_deadline = operation.deadline.is_some_and(|d| now >= d);
        let queued_too_long = self
            .limits
            .queue_timeout
            .is_some_and(|t| now.saturating_duration_since(operation.queued_at) >= t);
        (past_deadline || queued_too_long).then(|| ClientError::OperationTimedOut {
            operation: operation.command.kind(),
            attempts: operation.retry_count,
        })
    }

    /// Applies a reply to the in-flight operation it answers.
    pub fn complete(&mut self, correlation_id: CorrelationId, reply: Reply, now: Instant) -> Completion {
        let Some(operation) = self.in_flight.remove(&correlation_id) else {
            trace!(%correlation_id, "reply for unknown correlation id discarded");
            return Completion::Unknown;
        };

        match inspect(&operation.command, &reply) {
            Inspection::Succeed => {
                let route = operation.route.clone();
                let abandoned = operation.is_abandoned();
                operation.finish(Ok(Delivered {
                    correlation_id,
                    reply,
                }));
                match route {
                    Some(_) if abandoned => Completion::Orphaned(correlation_id),
                    Some(route) => Completion::Subscribed {
                        correlation_id,
                        route,
                    },
                    None => Completion::Done,
                }
            }
            Inspection::Retry(reason) => {
                if self.retry(operation, RetryCause::Transient(reason), now) {
                    Completion::Retried
                } else {
                    Completion::Done
                }
            }
            Inspection::Reconnect(hint) => {
                self.retry(operation, RetryCause::NotLeader(hint.clone()), now);
                Completion::Redirect(hint)
            }
            Inspection::Fail(err) => {
                debug!(%correlation_id, operation = %operation.command.kind(), error = %err, "failed");
                operation.finish(Err(err));
                Completion::Done
            }
        }
    }

    /// Puts an operation back at the front of the queue, or fails it once the
    /// retry budget is spent. Returns true if it was queued again.
    pub fn retry(&mut self, mut operation: Operation, cause: RetryCause, now: Instant) -> bool {
        let kind = operation.command.kind();
        let attempts = operation.retry_count + 1;

        if self.limits.max_retries.is_exhausted(operation.retry_count) {
            let err = match cause {
                RetryCause::Timeout => ClientError::OperationTimedOut {
                    operation: kind,
                    attempts,
                },
                RetryCause::NotLeader(leader) => ClientError::NotLeader { leader },
                RetryCause::Transient(reason) | RetryCause::ConnectionLost(reason) => {
                    ClientError::RetriesExhausted {
                        operation: kind,
                        attempts,
                        reason,
                    }
                }
            };
            warn!(operation = %kind, attempts, error = %err, "retry budget exhausted");
            operation.finish(Err(err));
            return false;
        }

        debug!(operation = %kind, retry = attempts, cause = ?cause, "retrying");
        operation.retry_count += 1;
        operation.sent_at = None;
        operation.queued_at = now;
        self.gauge.readmit();
        self.waiting.push_front(operation);
        true
    }

    /// Fails or retries operations whose time ran out.
    ///
    /// In flight: past `operation_timeout` since sending, the operation is
    /// retried, or failed outright with `fail_on_no_server_response`.
    /// Queued: past `queue_timeout` since queueing. Either: past the caller's
    /// deadline.
    pub fn check_timeouts(&mut self, now: Instant) {
        let timed_out: Vec<CorrelationId> = self
            .in_flight
            .iter()
            .filter(|(_, op)| {
                op.deadline.is_some_and(|d| now >= d)
                    || op.sent_at.is_some_and(|sent| {
                        now.saturating_duration_since(sent) >= self.limits.operation_timeout
                    })
            })
            .map(|(cid, _)| *cid)
            .collect();

        for correlation_id in timed_out {
            let Some(operation) = self.in_flight.remove(&correlation_id) else {
                continue;
            };
            let past_deadline = operation.deadline.is_some_and(|d| now >= d);
            warn!(%correlation_id, operation = %operation.command.kind(), past_deadline, "no response in time");
            if past_deadline || self.limits.fail_on_no_server_response {
                let err = ClientError::OperationTimedOut {
                    operation: operation.command.kind(),
                    attempts: operation.retry_count + 1,
                };
                operation.finish(Err(err));
            } else {
                self.retry(operation, RetryCause::Timeout, now);
            }
        }

        let mut kept = VecDeque::with_capacity(self.waiting.len());
        while let Some(operation) = self.waiting.pop_front() {
            if operation.is_abandoned() {
                self.gauge.release();
                continue;
            }
            match self.expired_in_queue(&operation, now) {
                Some(err) => {
                    self.gauge.release();
                    operation.finish(Err(err));
                }
                None => kept.push_back(operation),
            }
        }
        self.waiting = kept;
    }

    /// Removes an operation wherever it is and completes it as cancelled. A
    /// request already on the wire is not recalled; its reply is discarded.
    pub fn cancel(&mut self, id: OperationId) -> bool {
        if let Some(index) = self.waiting.iter().position(|op| op.id == id)
            && let Some(operation) = self.waiting.remove(index)
        {
            self.gauge.release();
            operation.finish(Err(ClientError::Cancelled));
            return true;
        }

        let in_flight = self
            .in_flight
            .iter()
            .find(|(_, op)| op.id == id)
            .map(|(cid, _)| *cid);
        if let Some(operation) = in_flight.and_then(|cid| self.in_flight.remove(&cid)) {
            operation.finish(Err(ClientError::Cancelled));
            return true;
        }
        false
    }

    /// Queues every in-flight operation again after the transport they were
    /// sent on went away, keeping their original order.
    pub fn requeue_in_flight(&mut self, reason: &str, now: Instant) {
        let mut operations: Vec<Operation> = self.in_flight.drain().map(|(_, op)| op).collect();
        operations.sort_by_key(|op| std::cmp::Reverse(op.id));
        for operation in operations {
            self.retry(operation, RetryCause::ConnectionLost(reason.to_string()), now);
        }
    }

    /// Fails everything, queued and in flight.
    pub fn fail_all(&mut self, err: &ClientError) {
        while let Some(operation) = self.dequeue() {
            operation.finish(Err(err.clone()));
        }
        for (_, operation) in self.in_flight.drain() {
            operation.finish(Err(err.clone()));
        }
    }
}
