//! Connection lifecycle states.

use std::fmt::Display;

/// Where a connection is in its lifecycle.
///
/// ```text
/// Init -> Connecting -> Connected -> Reconnecting -> Connecting -> ...
///            |              |             |
///            +--------------+-------------+--> Closed
/// ```
///
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Created, `connect` not yet called.
    Init,
    /// Discovering an endpoint and opening a transport.
    Connecting,
    /// A transport is established and operations are flowing.
    Connected,
    /// The transport was lost; waiting before the next attempt.
    Reconnecting,
    /// Permanently closed.
    Closed,
}

impl ConnectionState {
    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::{Closed, Connected, Connecting, Init, Reconnecting};
        matches!(
            (self, next),
            (Init | Connecting | Connected | Reconnecting, Closed)
                | (Init | Reconnecting, Connecting)
                | (Connecting, Connected | Reconnecting)
                | (Connected, Reconnecting)
        )
    }

    pub fn is_closed(self) -> bool {
        self == ConnectionState::Closed
    }
}

impl Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use test_case::test_case;

    const ALL: [ConnectionState; 5] = [
        ConnectionState::Init,
        ConnectionState::Connecting,
        ConnectionState::Connected,
        ConnectionState::Reconnecting,
        ConnectionState::Closed,
    ];

    #[test_case(ConnectionState::Init, ConnectionState::Connecting; "first connect")]
    #[test_case(ConnectionState::Connecting, ConnectionState::Connected; "established")]
    #[test_case(ConnectionState::Connecting, ConnectionState::Reconnecting; "attempt failed")]
    #[test_case(ConnectionState::Connected, ConnectionState::Reconnecting; "transport lost")]
    #[test_case(ConnectionState::Reconnecting, ConnectionState::Connecting; "retry")]
    #[test_case(ConnectionState::Connected, ConnectionState::Closed; "closed")]
    fn test_allowed(from: ConnectionState, to: ConnectionState) {
        assert!(from.can_transition_to(to));
    }

    #[test_case(ConnectionState::Connected, ConnectionState::Connecting; "connected to connecting")]
    #[test_case(ConnectionState::Reconnecting, ConnectionState::Connected; "skips connecting")]
    #[test_case(ConnectionState::Init, ConnectionState::Connected; "skips discovery")]
    #[test_case(ConnectionState::Connected, ConnectionState::Init; "back to init")]
    fn test_rejected(from: ConnectionState, to: ConnectionState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn test_closed_is_terminal() {
        for next in ALL {
            assert!(!ConnectionState::Closed.can_transition_to(next));
        }
    }

    proptest! {
        #[test]
        fn prop_never_leaves_closed(steps in proptest::collection::vec(0usize..5, 0..64)) {
            let mut state = ConnectionState::Init;
            let mut closed = false;
            for step in steps {
                let next = ALL[step];
                if state.can_transition_to(next) {
                    state = next;
                }
                if state.is_closed() {
                    closed = true;
                }
                prop_assert!(!closed || state.is_closed());
                prop_assert!(state != ConnectionState::Init || !closed);
            }
        }
    }
}
