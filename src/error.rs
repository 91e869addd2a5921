//! Error types for the WebSocket server.
//!
//! This module defines every error condition the protocol engine, the
//! transport drivers and the worker supervisor can report.

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::message::CloseCode;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while serving WebSocket connections.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// Invalid frame structure or header.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Protocol violation detected.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid UTF-8 in text message.
    #[error("Invalid UTF-8 in text message")]
    InvalidUtf8,

    /// Frame size exceeds configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size.
        size: u64,
        /// Maximum allowed size.
        max: usize,
    },

    /// Message size exceeds configured maximum.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Too many fragments in a single message.
    #[error("Too many fragments: {count} (max: {max})")]
    TooManyFragments {
        /// Actual fragment count.
        count: usize,
        /// Maximum allowed fragments.
        max: usize,
    },

    /// The buffer does not yet hold a complete frame.
    ///
    /// This is a "need more bytes" signal, not a malformed frame: the caller
    /// keeps the bytes and retries once more data has arrived.
    #[error("Short buffer: need {needed} more bytes")]
    ShortBuffer {
        /// Minimum number of additional bytes needed.
        needed: usize,
    },

    /// Reserved opcode used.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Invalid opcode value.
    #[error("Invalid opcode: {0:#x}")]
    InvalidOpcode(u8),

    /// Control frame fragmented.
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload too large (>125 bytes).
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Unmasked client frame.
    #[error("Client frame must be masked")]
    UnmaskedClientFrame,

    /// Masked server frame.
    #[error("Server frame must not be masked")]
    MaskedServerFrame,

    /// Reserved bits set without extension.
    #[error("Reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// Invalid WebSocket handshake.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// The client asked for a protocol version other than 13.
    #[error("Unsupported WebSocket version: {0} (expected 13)")]
    UnsupportedVersion(u16),

    /// Handshake request exceeds the configured size limit.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Bytes received so far.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// The handshake hook declined the upgrade.
    #[error("Handshake rejected with status {status}")]
    HandshakeRejected {
        /// HTTP status sent instead of 101.
        status: u16,
    },

    /// Origin header not in the allow-list.
    #[error("Origin not allowed: {origin}")]
    OriginNotAllowed {
        /// The rejected origin.
        origin: String,
    },

    /// Header value would break the response framing.
    #[error("Invalid value for header {header}: {reason}")]
    InvalidHeaderValue {
        /// Header name.
        header: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// Server answered with an unexpected `Sec-WebSocket-Accept`.
    #[error("Sec-WebSocket-Accept mismatch: expected {expected}, got {actual}")]
    AcceptKeyMismatch {
        /// Value computed from our key.
        expected: String,
        /// Value the server sent.
        actual: String,
    },

    /// Connection has been closed.
    #[error("Connection closed: {0:?}")]
    ConnectionClosed(Option<u16>),

    /// The connection state machine forbids this edge.
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition {
        /// Current state.
        from: ConnectionState,
        /// Requested state.
        to: ConnectionState,
    },

    /// Invalid close code.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// I/O error, with the OS error code when one is available.
    #[error("I/O error ({code}): {message}")]
    Io {
        /// OS error code, or -1 when the error did not come from the OS.
        code: i32,
        /// Human-readable description.
        message: String,
    },

    /// An application callback panicked.
    #[error("Handler panicked in {callback}")]
    HandlerPanicked {
        /// Name of the callback.
        callback: String,
    },

    /// No handle with this id is known to the driver.
    #[error("Unknown transport handle: {0}")]
    UnknownHandle(u64),

    /// The requested transport driver is not available on this system.
    #[error("Transport driver not supported: {0}")]
    DriverUnsupported(String),

    /// A worker process could not be started.
    #[error("Failed to spawn worker for slot {slot}: {message}")]
    Spawn {
        /// Worker slot index.
        slot: usize,
        /// Underlying failure.
        message: String,
    },

    /// A signal could not be delivered or registered.
    #[error("Signal error: {0}")]
    Signal(String),
}

impl Error {
    /// Returns `true` if this is the "need more bytes" signal.
    #[inline]
    #[must_use]
    pub const fn is_short_buffer(&self) -> bool {
        matches!(self, Error::ShortBuffer { .. })
    }

    /// OS error code carried by an I/O error, if any.
    #[must_use]
    pub const fn os_code(&self) -> Option<i32> {
        match self {
            Error::Io { code, .. } => Some(*code),
            _ => None,
        }
    }

    /// Close status to send to the peer when this error ends a session.
    #[must_use]
    pub const fn close_code(&self) -> CloseCode {
        match self {
            Error::InvalidUtf8 => CloseCode::InvalidPayload,
            Error::FrameTooLarge { .. }
            | Error::MessageTooLarge { .. }
            | Error::TooManyFragments { .. } => CloseCode::MessageTooBig,
            Error::Io { .. } | Error::UnknownHandle(_) | Error::HandlerPanicked { .. } => {
                CloseCode::InternalError
            }
            _ => CloseCode::ProtocolError,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            code: err.raw_os_error().unwrap_or(-1),
            message: err.to_string(),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}
