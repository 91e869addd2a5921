//! Connection state machine.
//!
//! ```text
//! Connecting -> Handshaking -> Open -> Closing -> Closed
//!                    |           |________________^
//!                    |_______________________________^
//! ```

/// Lifecycle state of a server-side connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[non_exhaustive]
pub enum ConnectionState {
    /// Accepted, no bytes read yet.
    #[default]
    Connecting,
    /// Waiting for a complete upgrade request.
    Handshaking,
    /// Upgrade done, frames flow both ways.
    Open,
    /// A close frame was received or sent.
    Closing,
    /// Socket closed; the registry entry is gone.
    Closed,
}

impl ConnectionState {
    /// Whether `self -> next` is a legal edge.
    #[must_use]
    pub const fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (*self, next),
            (Connecting, Handshaking)
                | (Connecting, Closed)
                | (Handshaking, Open)
                | (Handshaking, Closed)
                | (Open, Closing)
                | (Open, Closed)
                | (Closing, Closed)
        )
    }

    /// Returns `true` for every state but `Closed`.
    #[must_use]
    #[inline]
    pub const fn is_active(&self) -> bool {
        !matches!(self, ConnectionState::Closed)
    }

    /// Only `Open` connections accept outgoing messages.
    #[must_use]
    #[inline]
    pub const fn can_send(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Frames are still read in `Open` and `Closing`.
    #[must_use]
    #[inline]
    pub const fn can_receive(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Closing)
    }

    /// Whether the upgrade has completed at some point.
    #[must_use]
    #[inline]
    pub const fn was_opened(&self) -> bool {
        matches!(self, ConnectionState::Open | ConnectionState::Closing)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Handshaking => write!(f, "Handshaking"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Closing => write!(f, "Closing"),
            ConnectionState::Closed => write!(f, "Closed"),
        }
    }
}
