//! Connection lifecycle notifications.

use cairn_types::NodeEndpoints;
use tokio::sync::broadcast;

/// Events emitted as a connection moves through its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A transport to `endpoints` was established.
    Connected { endpoints: NodeEndpoints },
    /// The transport to `endpoints` was released.
    Disconnected { endpoints: NodeEndpoints },
    /// Waiting before the next connection attempt.
    Reconnecting,
    /// The connection closed for good.
    Closed { reason: String },
    /// A non-fatal error, such as a failed connection attempt.
    ErrorOccurred { message: String },
    /// The server rejected the connection's credentials.
    AuthenticationFailed { reason: String },
}

/// Fans connection events out to every subscriber.
#[derive(Debug, Clone)]
pub struct ConnectionEvents {
    tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionEvents {
    /// Creates a broadcaster buffering `buffer_size` events for slow
    /// subscribers.
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Sends an event to all subscribers.
    ///
    /// Returns the number of subscribers that received it. Subscribers that
    /// fall behind see `RecvError::Lagged`.
    pub fn send(&self, event: ConnectionEvent) -> usize {
        self.tx.send(event).unwrap_or_default()
    }

    /// Subscribes to events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ConnectionEvents {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_types::Endpoint;

    fn endpoints() -> NodeEndpoints {
        NodeEndpoints::plain(Endpoint::new("127.0.0.1", 1113))
    }

    #[test]
    fn test_send_without_subscribers() {
        let events = ConnectionEvents::new(4);
        assert_eq!(events.send(ConnectionEvent::Reconnecting), 0);
    }

    #[test]
    fn test_multiple_subscribers() {
        let events = ConnectionEvents::new(16);
        let mut rx1 = events.subscribe();
        let mut rx2 = events.subscribe();
        assert_eq!(events.receiver_count(), 2);

        let sent = events.send(ConnectionEvent::Connected {
            endpoints: endpoints(),
        });
        assert_eq!(sent, 2);

        assert_eq!(
            rx1.try_recv().unwrap(),
            ConnectionEvent::Connected {
                endpoints: endpoints()
            }
        );
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn test_lagging_subscriber() {
        let events = ConnectionEvents::new(2);
        let mut rx = events.subscribe();

        for i in 0..5 {
            events.send(ConnectionEvent::ErrorOccurred {
                message: format!("attempt {i} failed"),
            });
        }

        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(n)) => assert!(n > 0),
            other => panic!("expected lagged error, got {other:?}"),
        }
    }
}
