//! Application callbacks.

use std::net::SocketAddr;

use crate::connection::{Connection, ConnectionId};
use crate::error::Error;
use crate::message::Message;
use crate::protocol::{HandshakeRequest, HandshakeResponse};
use crate::server::Router;

/// Lifecycle hooks invoked by the dispatch loop.
///
/// Every method has a no-op default. Calls happen on the worker's loop
/// thread, one at a time; a panic inside a callback closes only the
/// connection it was called for.
pub trait Handler {
    /// A TCP connection was accepted. No bytes have been read yet.
    fn on_connect(&mut self, _id: ConnectionId, _remote: Option<SocketAddr>) {}

    /// Decide on an upgrade request.
    ///
    /// `response` is a prepared 101. Return `false` to refuse; whatever
    /// status and body were set on `response` are sent instead (403 if the
    /// status was left at 101).
    fn on_handshake(
        &mut self,
        _id: ConnectionId,
        _request: &HandshakeRequest,
        _response: &mut HandshakeResponse,
    ) -> bool {
        true
    }

    /// The 101 went out and the connection is open.
    fn on_open(&mut self, _id: ConnectionId, _router: &mut Router<'_>) {}

    /// A complete data message arrived.
    fn on_message(&mut self, _id: ConnectionId, _message: Message, _router: &mut Router<'_>) {}

    /// An opened connection is gone. Fires exactly once per opened
    /// connection; `connection` carries its final metadata and is no longer
    /// in the registry.
    fn on_close(&mut self, _id: ConnectionId, _connection: &Connection, _router: &mut Router<'_>) {}

    /// A connection is being dropped because of `error`.
    fn on_error(&mut self, _id: ConnectionId, _error: &Error) {}
}
