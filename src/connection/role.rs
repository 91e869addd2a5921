//! Which end of a connection this process plays.

use crate::error::Error;

/// The end of a WebSocket connection a codec works for.
///
/// RFC 6455 Section 5.1: frames travelling client to server are masked,
/// frames travelling server to client are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    /// The other end.
    #[must_use]
    pub const fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }

    /// Whether frames written by this end carry a masking key.
    #[inline]
    #[must_use]
    pub const fn masks_outgoing(self) -> bool {
        matches!(self, Role::Client)
    }

    /// The error for a received frame whose mask bit is wrong for this end,
    /// or `None` when the bit is as expected.
    #[must_use]
    pub fn mask_violation(self, masked: bool) -> Option<Error> {
        if masked == self.peer().masks_outgoing() {
            return None;
        }
        Some(match self {
            Role::Server => Error::UnmaskedClientFrame,
            Role::Client => Error::MaskedServerFrame,
        })
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Role::Client => "client",
            Role::Server => "server",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_clients_mask() {
        assert!(Role::Client.masks_outgoing());
        assert!(!Role::Server.masks_outgoing());
        assert_eq!(Role::Client.peer(), Role::Server);
        assert_eq!(Role::Server.peer().peer(), Role::Server);
    }

    #[test]
    fn test_mask_violation() {
        assert_eq!(Role::Server.mask_violation(true), None);
        assert_eq!(Role::Server.mask_violation(false), Some(Error::UnmaskedClientFrame));
        assert_eq!(Role::Client.mask_violation(false), None);
        assert_eq!(Role::Client.mask_violation(true), Some(Error::MaskedServerFrame));
    }

    #[test]
    fn test_display_is_lowercase() {
        assert_eq!(format!("{} -> {}", Role::Client, Role::Server), "client -> server");
    }
}
