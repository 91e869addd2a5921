//! Outbound path: send to one connection, or frame once and fan out.

use crate::connection::{Connection, ConnectionId, ConnectionState, Registry};
use crate::message::{CloseCode, CloseFrame, Message};
use crate::protocol::{OpCode, encode};
use crate::transport::Transport;

/// Result of writing to one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Fully handed to the driver.
    Sent,
    /// Partly or wholly queued behind earlier output.
    Queued,
    /// Nothing to do: empty payload or the reserved id 0.
    Skipped,
    /// Unknown id, or the connection is not open.
    NotConnected,
    /// The driver failed with this error code.
    Failed { code: i32 },
}

impl Delivery {
    /// 0 unless the write failed.
    pub const fn code(self) -> i32 {
        match self {
            Delivery::Failed { code } => code,
            _ => 0,
        }
    }

    pub const fn is_delivered(self) -> bool {
        matches!(self, Delivery::Sent | Delivery::Queued)
    }
}

/// Outcome of one broadcast call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Broadcast {
    /// Connections written to or queued for, in write order.
    pub delivered: Vec<ConnectionId>,
    /// Connections whose write failed, with the error code.
    pub failed: Vec<(ConnectionId, i32)>,
}

impl Broadcast {
    pub fn is_ok(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Borrowed view of a worker's connections for sending.
///
/// Handed to callbacks; the dispatch loop owns the transport and registry.
pub struct Router<'a> {
    transport: &'a mut dyn Transport,
    registry: &'a mut Registry,
    mask: bool,
}

impl<'a> Router<'a> {
    pub fn new(transport: &'a mut dyn Transport, registry: &'a mut Registry, mask: bool) -> Self {
        Self {
            transport,
            registry,
            mask,
        }
    }

    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.registry.get(id)
    }

    pub fn open_ids(&self) -> Vec<ConnectionId> {
        self.registry.open_ids()
    }

    /// Frame `message` and write it to one open connection.
    pub fn send_to(&mut self, id: ConnectionId, message: &Message) -> Delivery {
        if id < 1 || message.is_empty() {
            return Delivery::Skipped;
        }
        if !self.registry.get(id).is_some_and(Connection::is_open) {
            return Delivery::NotConnected;
        }
        let bytes = encode(message.payload(), message.opcode(), self.mask, true);
        self.write_raw(id, &bytes)
    }

    /// Frame `message` once and write it to a set of connections.
    ///
    /// - exactly one receiver: same as [`send_to`](Self::send_to)
    /// - no receivers, no exclusions: every open connection
    /// - receivers given: those of them that are registered
    /// - only exclusions: every open connection not excluded
    ///
    /// Writes go out in ascending id order. `sender` is informational.
    pub fn broadcast(
        &mut self,
        message: &Message,
        receivers: &[ConnectionId],
        excluded: &[ConnectionId],
        sender: ConnectionId,
    ) -> Broadcast {
        let mut result = Broadcast::default();
        if message.is_empty() {
            return result;
        }

        if let [only] = receivers {
            match self.send_to(*only, message) {
                Delivery::Failed { code } => result.failed.push((*only, code)),
                d if d.is_delivered() => result.delivered.push(*only),
                _ => {}
            }
            return result;
        }

        let targets: Vec<ConnectionId> = if receivers.is_empty() {
            self.registry
                .open_ids()
                .into_iter()
                .filter(|id| !excluded.contains(id))
                .collect()
        } else {
            self.registry
                .open_ids()
                .into_iter()
                .filter(|id| receivers.contains(id))
                .collect()
        };

        log::trace!(
            "broadcast from {} to {} connection(s)",
            sender,
            targets.len()
        );

        let bytes = encode(message.payload(), message.opcode(), self.mask, true);
        for id in targets {
            match self.write_raw(id, &bytes) {
                Delivery::Failed { code } => result.failed.push((id, code)),
                d if d.is_delivered() => result.delivered.push(id),
                _ => {}
            }
        }
        result
    }

    /// Start closing an open connection: send a Close frame and move it to
    /// `Closing`. The dispatch loop drops it once the frame is flushed.
    pub fn close(&mut self, id: ConnectionId, code: CloseCode, reason: &str) -> Delivery {
        match self.registry.get(id) {
            Some(conn) if conn.is_open() && !conn.close_sent => {}
            _ => return Delivery::NotConnected,
        }
        let delivery = self.send_close(id, &CloseFrame::new(code, reason));
        if let Some(conn) = self.registry.get_mut(id) {
            let _ = conn.transition(ConnectionState::Closing);
        }
        delivery
    }

    /// Queue a Close frame without touching the state.
    pub(crate) fn send_close(&mut self, id: ConnectionId, frame: &CloseFrame) -> Delivery {
        let bytes = encode(&frame.to_payload(), OpCode::Close, self.mask, true);
        let delivery = self.write_raw(id, &bytes);
        if let Some(conn) = self.registry.get_mut(id) {
            conn.close_sent = true;
        }
        delivery
    }

    pub(crate) fn send_control(&mut self, id: ConnectionId, opcode: OpCode, payload: &[u8]) -> Delivery {
        match self.registry.get(id) {
            Some(conn) if !conn.close_sent => {}
            _ => return Delivery::NotConnected,
        }
        let bytes = encode(payload, opcode, self.mask, true);
        self.write_raw(id, &bytes)
    }

    /// Write bytes in any state, behind anything already queued.
    pub(crate) fn write_raw(&mut self, id: ConnectionId, bytes: &[u8]) -> Delivery {
        let Some(conn) = self.registry.get_mut(id) else {
            return Delivery::NotConnected;
        };
        if conn.write_failed {
            return Delivery::Failed { code: -1 };
        }
        if !conn.write_queue.is_empty() {
            conn.write_queue.extend_from_slice(bytes);
            return Delivery::Queued;
        }
        match self.transport.write(conn.handle(), bytes) {
            Ok(n) => {
                conn.bytes_sent += n as u64;
                if n == bytes.len() {
                    Delivery::Sent
                } else {
                    conn.write_queue.extend_from_slice(&bytes[n..]);
                    Delivery::Queued
                }
            }
            Err(err) => {
                let code = err
                    .os_code()
                    .or_else(|| self.transport.last_error().map(|(code, _)| code))
                    .unwrap_or(-1);
                log::debug!("write to connection {} failed: {}", id, err);
                conn.write_failed = true;
                Delivery::Failed { code }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::{Error, Result};
    use crate::protocol::decode;
    use crate::transport::{Accepted, DriverKind, Handle, ReadOutcome, Readiness};
    use std::collections::HashMap;
    use std::net::{SocketAddr, TcpListener};
    use std::time::Duration;

    /// Records writes per handle; can be told to accept only part of a write
    /// or to fail.
    #[derive(Default)]
    struct MockTransport {
        written: HashMap<Handle, Vec<u8>>,
        order: Vec<Handle>,
        accept_limit: Option<usize>,
        fail: bool,
    }

    impl Transport for MockTransport {
        fn kind(&self) -> DriverKind {
            DriverKind::Sockets
        }
        fn is_supported() -> bool {
            true
        }
        fn adopt(&mut self, _listener: TcpListener) -> Result<()> {
            Ok(())
        }
        fn local_addr(&self) -> Result<SocketAddr> {
            Err(Error::DriverUnsupported("mock".into()))
        }
        fn accept(&mut self) -> Result<Option<Accepted>> {
            Ok(None)
        }
        fn poll_readable(&mut self, _: &[Handle], _: Option<Duration>) -> Result<Readiness> {
            Ok(Readiness::default())
        }
        fn read(&mut self, _: Handle, _: usize) -> Result<ReadOutcome> {
            Ok(ReadOutcome::WouldBlock)
        }
        fn write(&mut self, handle: Handle, bytes: &[u8]) -> Result<usize> {
            if self.fail {
                return Err(Error::Io {
                    code: libc::EPIPE,
                    message: "broken pipe".into(),
                });
            }
            let n = self.accept_limit.map_or(bytes.len(), |limit| limit.min(bytes.len()));
            self.written.entry(handle).or_default().extend_from_slice(&bytes[..n]);
            self.order.push(handle);
            Ok(n)
        }
        fn close(&mut self, _: Handle) {}
        fn last_error(&self) -> Option<(i32, String)> {
            None
        }
    }

    /// Registry with `n` connections on handles 1..=n, all open.
    fn open_registry(n: u64) -> Registry {
        let mut registry = Registry::new();
        for raw in 1..=n {
            let id = registry.insert(Handle::new(raw), None, &Config::server());
            let conn = registry.get_mut(id).unwrap();
            conn.transition(ConnectionState::Handshaking).unwrap();
            conn.open("/", None).unwrap();
        }
        registry
    }

    fn decoded(bytes: &[u8]) -> Vec<u8> {
        decode(bytes).unwrap().0.into_payload()
    }

    #[test]
    fn test_send_to_open_connection() {
        let mut transport = MockTransport::default();
        let mut registry = open_registry(1);
        let mut router = Router::new(&mut transport, &mut registry, false);

        assert_eq!(router.send_to(1, &Message::text("hi")), Delivery::Sent);
        assert_eq!(decoded(&transport.written[&Handle::new(1)]), b"hi");
    }

    #[test]
    fn test_send_to_noops() {
        let mut transport = MockTransport::default();
        let mut registry = open_registry(1);
        registry.insert(Handle::new(9), None, &Config::server());
        let mut router = Router::new(&mut transport, &mut registry, false);

        assert_eq!(router.send_to(0, &Message::text("x")), Delivery::Skipped);
        assert_eq!(router.send_to(1, &Message::text("")), Delivery::Skipped);
        assert_eq!(router.send_to(7, &Message::text("x")), Delivery::NotConnected);
        // Registered but still connecting.
        assert_eq!(router.send_to(2, &Message::text("x")), Delivery::NotConnected);
        assert_eq!(Delivery::NotConnected.code(), 0);
        assert!(transport.written.is_empty());
    }

    #[test]
    fn test_partial_write_is_queued_in_order() {
        let mut transport = MockTransport {
            accept_limit: Some(3),
            ..Default::default()
        };
        let mut registry = open_registry(1);
        let mut router = Router::new(&mut transport, &mut registry, false);

        assert_eq!(router.send_to(1, &Message::text("hello")), Delivery::Queued);
        assert_eq!(router.send_to(1, &Message::text("again")), Delivery::Queued);

        let conn = registry.get(1).unwrap();
        // 7 bytes of "hello" frame minus 3 written, plus the whole second frame.
        assert_eq!(conn.pending_output(), 4 + 7);
    }

    #[test]
    fn test_write_failure_reports_code() {
        let mut transport = MockTransport {
            fail: true,
            ..Default::default()
        };
        let mut registry = open_registry(1);
        let mut router = Router::new(&mut transport, &mut registry, false);

        let delivery = router.send_to(1, &Message::binary(vec![1, 2, 3]));
        assert_eq!(delivery, Delivery::Failed { code: libc::EPIPE });
        assert_eq!(delivery.code(), libc::EPIPE);
    }

    #[test]
    fn test_full_broadcast_frames_once_in_id_order() {
        let mut transport = MockTransport::default();
        let mut registry = open_registry(3);
        let mut router = Router::new(&mut transport, &mut registry, false);

        let result = router.broadcast(&Message::text("all"), &[], &[], 0);
        assert!(result.is_ok());
        assert_eq!(result.delivered, vec![1, 2, 3]);
        assert_eq!(
            transport.order,
            vec![Handle::new(1), Handle::new(2), Handle::new(3)]
        );
        let first = &transport.written[&Handle::new(1)];
        assert!(transport.written.values().all(|bytes| bytes == first));
    }

    #[test]
    fn test_broadcast_to_receivers() {
        let mut transport = MockTransport::default();
        let mut registry = open_registry(4);
        let mut router = Router::new(&mut transport, &mut registry, false);

        let result = router.broadcast(&Message::text("x"), &[3, 1, 99], &[], 2);
        assert_eq!(result.delivered, vec![1, 3]);
        assert!(!transport.written.contains_key(&Handle::new(2)));
        assert!(!transport.written.contains_key(&Handle::new(4)));
    }

    #[test]
    fn test_broadcast_with_exclusions() {
        let mut transport = MockTransport::default();
        let mut registry = open_registry(4);
        let mut router = Router::new(&mut transport, &mut registry, false);

        let result = router.broadcast(&Message::text("x"), &[], &[2, 4], 2);
        assert_eq!(result.delivered, vec![1, 3]);
    }

    #[test]
    fn test_broadcast_single_receiver_is_send_to() {
        let mut transport = MockTransport::default();
        let mut registry = open_registry(2);
        let mut router = Router::new(&mut transport, &mut registry, false);

        let result = router.broadcast(&Message::text("x"), &[2], &[], 1);
        assert_eq!(result.delivered, vec![2]);
        let result = router.broadcast(&Message::text("x"), &[5], &[], 1);
        assert!(result.delivered.is_empty());
        assert!(result.is_ok());
    }

    #[test]
    fn test_close_moves_to_closing_and_blocks_sends() {
        let mut transport = MockTransport::default();
        let mut registry = open_registry(1);
        let mut router = Router::new(&mut transport, &mut registry, false);

        assert_eq!(router.close(1, CloseCode::Normal, "bye"), Delivery::Sent);
        assert_eq!(
            router.connection(1).unwrap().state(),
            ConnectionState::Closing
        );
        assert_eq!(router.send_to(1, &Message::text("late")), Delivery::NotConnected);
        assert_eq!(router.close(1, CloseCode::Normal, "again"), Delivery::NotConnected);

        let frame = decode(&transport.written[&Handle::new(1)]).unwrap().0;
        assert_eq!(frame.opcode, OpCode::Close);
        let close = CloseFrame::from_payload(frame.payload());
        assert_eq!(close.code, CloseCode::Normal);
        assert_eq!(close.reason, "bye");
    }
}
