// ── Connection state machine ──
//
// Disconnected → Connecting → Connected → Disconnected → ReconnectScheduled
// → Connecting ... ShuttingDown is reachable from anywhere and never left.

use strum::Display;

/// Lifecycle state of one transport instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
    ShuttingDown,
}

impl ConnectionState {
    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectionState::{
            Connected, Connecting, Disconnected, ReconnectScheduled, ShuttingDown,
        };

        match (self, next) {
            (ShuttingDown, _) => false,
            (_, ShuttingDown) => true,
            (Disconnected, Connecting | ReconnectScheduled)
            | (Connecting, Connected | Disconnected)
            | (Connected, Disconnected)
            | (ReconnectScheduled, Connecting) => true,
            _ => false,
        }
    }

    /// `Connecting` or `Connected`: the instance owns a live or opening link.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::ShuttingDown
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionState::{
        Connected, Connecting, Disconnected, ReconnectScheduled, ShuttingDown,
    };
    use super::*;

    const ALL: [ConnectionState; 5] = [
        Disconnected,
        Connecting,
        Connected,
        ReconnectScheduled,
        ShuttingDown,
    ];

    #[test]
    fn happy_path_and_reconnect_cycle() {
        assert!(Disconnected.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Connected));
        assert!(Connected.can_transition_to(Disconnected));
        assert!(Disconnected.can_transition_to(ReconnectScheduled));
        assert!(ReconnectScheduled.can_transition_to(Connecting));
        assert!(Connecting.can_transition_to(Disconnected));
    }

    #[test]
    fn shutting_down_is_reachable_and_terminal() {
        for state in ALL {
            assert!(state.can_transition_to(ShuttingDown) || state == ShuttingDown);
            assert!(!ShuttingDown.can_transition_to(state));
        }
        assert!(ShuttingDown.is_terminal());
    }

    #[test]
    fn no_shortcuts() {
        assert!(!Disconnected.can_transition_to(Connected));
        assert!(!Connected.can_transition_to(Connecting));
        assert!(!Connected.can_transition_to(ReconnectScheduled));
        assert!(!ReconnectScheduled.can_transition_to(Connected));
        assert!(!ReconnectScheduled.can_transition_to(Disconnected));
    }

    #[test]
    fn display_is_snake_case() {
        assert_eq!(ReconnectScheduled.to_string(), "reconnect_scheduled");
        assert!(Connecting.is_active());
        assert!(!ReconnectScheduled.is_active());
    }
}
