//! The dispatch loop run by each worker.
//!
//! One loop owns one transport driver and one registry. Each iteration:
//!
//! 1. flushes queued output
//! 2. polls the listener and every registered handle
//! 3. accepts pending connections
//! 4. services each readable handle: handshake, frame decoding, callbacks
//! 5. sweeps timed-out and finished connections
//!
//! Nothing here is shared across threads; the registry is only touched
//! from the loop.

mod handler;
mod router;

pub use handler::Handler;
pub use router::{Broadcast, Delivery, Router};

use std::net::{SocketAddr, TcpListener};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use bytes::Buf;

use crate::config::ServerConfig;
use crate::connection::{ConnectionId, ConnectionState, Registry, Role};
use crate::error::{Error, Result};
use crate::message::{CloseCode, CloseFrame};
use crate::protocol::handshake::find_request_end;
use crate::protocol::{FrameDecoder, HandshakeResponse, Negotiation, OpCode, negotiate};
use crate::transport::{DriverKind, ReadOutcome, Transport};

/// A first read shorter than this on a fresh connection is treated as
/// garbage: no valid request line fits in fewer bytes.
const MIN_FIRST_READ: usize = 7;

/// Run a callback, turning a panic into an error.
fn guarded<R>(id: ConnectionId, callback: &str, f: impl FnOnce() -> R) -> Result<R> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|_| {
        log::error!("handler panicked in {} for connection {}", callback, id);
        Error::HandlerPanicked {
            callback: callback.to_string(),
        }
    })
}

/// Borrow the transport and registry as a router, leaving the handler free.
macro_rules! router {
    ($server:ident) => {
        Router::new(
            &mut $server.transport,
            &mut $server.registry,
            $server.config.protocol.mask_frames,
        )
    };
}

/// A worker's WebSocket server.
pub struct Server<T: Transport, H: Handler> {
    transport: T,
    handler: H,
    registry: Registry,
    decoder: FrameDecoder,
    config: ServerConfig,
}

impl<H: Handler> Server<Box<dyn Transport>, H> {
    /// Pick the configured (or probed) driver and listen on `host:port`.
    ///
    /// # Errors
    /// No usable driver, or the bind failed.
    pub fn bind(handler: H, config: ServerConfig) -> Result<Self> {
        let kind = match config.driver {
            Some(kind) => kind,
            None => DriverKind::probe()?,
        };
        let mut transport = kind.create()?;
        transport.listen(&config.host, config.port, config.backlog)?;
        log::info!(
            "listening on {} with the {} driver",
            transport.local_addr()?,
            kind
        );
        Ok(Self::new(transport, handler, config))
    }

    /// Serve on an already listening socket, e.g. one inherited from the
    /// supervisor.
    ///
    /// # Errors
    /// No usable driver, or the driver could not adopt the socket.
    pub fn from_listener(listener: TcpListener, handler: H, config: ServerConfig) -> Result<Self> {
        let kind = match config.driver {
            Some(kind) => kind,
            None => DriverKind::probe()?,
        };
        let mut transport = kind.create()?;
        transport.adopt(listener)?;
        log::debug!("adopted listener with the {} driver", kind);
        Ok(Self::new(transport, handler, config))
    }
}

impl<T: Transport, H: Handler> Server<T, H> {
    /// Wrap a driver that is already listening.
    pub fn new(transport: T, handler: H, config: ServerConfig) -> Self {
        let decoder = FrameDecoder::new(
            Role::Server,
            config.protocol.limits.clone(),
            config.protocol.accept_unmasked_frames,
        );
        Self {
            transport,
            handler,
            registry: Registry::new(),
            decoder,
            config,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.transport.local_addr()
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    /// Swap in a fresh handler, keeping every connection. Returns the old one.
    pub fn replace_handler(&mut self, handler: H) -> H {
        std::mem::replace(&mut self.handler, handler)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Send from outside a callback.
    pub fn router(&mut self) -> Router<'_> {
        router!(self)
    }

    /// Loop until `stop` is set, then close every connection.
    ///
    /// # Errors
    /// Fatal failure of the driver's readiness poll.
    pub fn run(&mut self, stop: &AtomicBool) -> Result<()> {
        self.run_with(stop, |_| {})
    }

    /// Like [`run`](Self::run), calling `between` at the top of every
    /// iteration.
    ///
    /// # Errors
    /// Fatal failure of the driver's readiness poll.
    pub fn run_with(&mut self, stop: &AtomicBool, mut between: impl FnMut(&mut Self)) -> Result<()> {
        log::info!("dispatch loop started ({} driver)", self.transport.kind());
        let result = loop {
            if stop.load(Ordering::SeqCst) {
                break Ok(());
            }
            between(self);
            match self.tick(self.config.poll_timeout) {
                Ok(true) => {}
                Ok(false) => {
                    if !self.config.idle_sleep.is_zero() {
                        thread::sleep(self.config.idle_sleep);
                    }
                }
                Err(err) => break Err(err),
            }
        };
        self.shutdown();
        log::info!("dispatch loop stopped");
        result
    }

    /// One loop iteration. Returns whether anything was ready.
    ///
    /// # Errors
    /// Fatal failure of the driver's readiness poll.
    pub fn tick(&mut self, timeout: Option<Duration>) -> Result<bool> {
        self.flush_pending();

        let timeout = if self.has_pending_output() {
            Some(Duration::ZERO)
        } else {
            timeout
        };
        let handles = self.registry.handles();
        let readiness = self.transport.poll_readable(&handles, timeout)?;

        if readiness.listener {
            self.accept_pending();
        }
        for handle in &readiness.handles {
            if let Some(id) = self.registry.id_for(*handle) {
                self.service(id);
            }
        }

        self.sweep(Instant::now());
        debug_assert!(self.registry.check_invariants());
        Ok(!readiness.is_empty())
    }

    /// Send Close 1001 to every open connection and drop them all.
    pub fn shutdown(&mut self) {
        let open = self.registry.open_ids();
        if !open.is_empty() {
            log::info!("closing {} open connection(s)", open.len());
        }
        for id in open {
            router!(self).close(id, CloseCode::GoingAway, "server shutting down");
        }
        self.flush_pending();
        for id in self.registry.ids() {
            self.close_connection(id);
        }
    }

    fn has_pending_output(&self) -> bool {
        self.registry.iter().any(|c| c.pending_output() > 0)
    }

    fn flush_pending(&mut self) {
        for id in self.registry.ids() {
            let Some(conn) = self.registry.get_mut(id) else {
                continue;
            };
            if conn.write_queue.is_empty() || conn.write_failed {
                continue;
            }
            match self.transport.write(conn.handle(), &conn.write_queue) {
                Ok(n) => {
                    conn.write_queue.advance(n);
                    conn.bytes_sent += n as u64;
                }
                Err(err) => {
                    log::debug!("flush to connection {} failed: {}", id, err);
                    conn.write_failed = true;
                }
            }
        }
    }

    fn accept_pending(&mut self) {
        loop {
            let accepted = match self.transport.accept() {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("accept failed: {}", err);
                    break;
                }
            };

            let id = self
                .registry
                .insert(accepted.handle, accepted.remote, &self.config.protocol);
            if let Some(conn) = self.registry.get_mut(id) {
                let _ = conn.transition(ConnectionState::Handshaking);
            }
            log::debug!("accepted connection {} from {:?}", id, accepted.remote);

            let handler = &mut self.handler;
            let remote = accepted.remote;
            if let Err(err) = guarded(id, "on_connect", || handler.on_connect(id, remote)) {
                self.abort(id, err);
            }
        }
    }

    fn service(&mut self, id: ConnectionId) {
        let Some(handle) = self.registry.get(id).map(|c| c.handle()) else {
            return;
        };

        let bytes = match self.transport.read(handle, self.config.protocol.read_buffer_size) {
            Ok(ReadOutcome::Data(bytes)) => bytes,
            Ok(ReadOutcome::WouldBlock) => return,
            Ok(ReadOutcome::Closed) => {
                log::debug!("connection {} closed by peer", id);
                self.close_connection(id);
                return;
            }
            Err(err) => {
                log::debug!("read from connection {} failed: {}", id, err);
                self.abort(id, err);
                return;
            }
        };

        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        conn.last_activity = Instant::now();
        conn.bytes_received += bytes.len() as u64;

        match conn.state() {
            ConnectionState::Handshaking => {
                if conn.read_buf.is_empty() && bytes.len() < MIN_FIRST_READ {
                    log::debug!(
                        "connection {}: {} byte first read, dropping",
                        id,
                        bytes.len()
                    );
                    self.close_connection(id);
                    return;
                }
                conn.read_buf.extend_from_slice(&bytes);
                self.continue_handshake(id);
            }
            state if state.can_receive() => {
                conn.read_buf.extend_from_slice(&bytes);
                self.process_frames(id);
            }
            _ => {}
        }
    }

    fn continue_handshake(&mut self, id: ConnectionId) {
        let max = self.config.protocol.limits.max_handshake_size;
        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };

        let head = match find_request_end(&conn.read_buf) {
            Some(end) => conn.read_buf.split_to(end),
            None if conn.read_buf.len() > max => {
                let err = Error::HandshakeTooLarge {
                    size: conn.read_buf.len(),
                    max,
                };
                self.reject(id, HandshakeResponse::error(431, err.to_string()), err);
                return;
            }
            None => return,
        };

        let handler = &mut self.handler;
        let negotiation = negotiate(&head, &self.config.protocol, |request, response| {
            match guarded(id, "on_handshake", || handler.on_handshake(id, request, response)) {
                Ok(accepted) => accepted,
                Err(_) => {
                    *response = HandshakeResponse::error(500, "Internal Server Error");
                    false
                }
            }
        });

        let (request, response) = match negotiation {
            Negotiation::Accepted { request, response } => (request, response),
            Negotiation::Rejected { response, reason } => {
                self.reject(id, response, reason);
                return;
            }
        };

        let mut bytes = Vec::new();
        if let Err(err) = response.write(&mut bytes) {
            self.reject(id, HandshakeResponse::error(500, "Internal Server Error"), err);
            return;
        }
        router!(self).write_raw(id, &bytes);

        let Some(conn) = self.registry.get_mut(id) else {
            return;
        };
        if let Err(err) = conn.open(&request.path, response.protocol().map(str::to_string)) {
            log::warn!("connection {}: {}", id, err);
            self.close_connection(id);
            return;
        }
        log::info!("connection {} open on {}", id, request.path);

        let handler = &mut self.handler;
        let mut router = router!(self);
        if let Err(err) = guarded(id, "on_open", || handler.on_open(id, &mut router)) {
            self.abort(id, err);
            return;
        }

        if self
            .registry
            .get(id)
            .is_some_and(|c| !c.read_buf.is_empty())
        {
            self.process_frames(id);
        }
    }

    /// Send an HTTP error response and drop the connection.
    fn reject(&mut self, id: ConnectionId, response: HandshakeResponse, reason: Error) {
        match reason {
            Error::HandshakeRejected { status } => {
                log::info!("connection {}: handshake refused with {}", id, status);
            }
            ref err => {
                log::warn!("connection {}: handshake failed: {}", id, err);
                let handler = &mut self.handler;
                let _ = guarded(id, "on_error", || handler.on_error(id, err));
            }
        }

        let mut bytes = Vec::new();
        if response.write(&mut bytes).is_err() {
            bytes.clear();
            let _ = HandshakeResponse::error(500, "").write(&mut bytes);
        }
        router!(self).write_raw(id, &bytes);
        self.close_connection(id);
    }

    fn process_frames(&mut self, id: ConnectionId) {
        loop {
            let Some(conn) = self.registry.get_mut(id) else {
                return;
            };
            if !conn.state().can_receive() || conn.close_sent {
                return;
            }
            let frame = match self.decoder.decode(&conn.read_buf) {
                Ok((frame, used)) => {
                    conn.read_buf.advance(used);
                    frame
                }
                Err(err) if err.is_short_buffer() => return,
                Err(err) => {
                    self.abort(id, err);
                    return;
                }
            };

            match frame.opcode {
                OpCode::Ping => {
                    router!(self).send_control(id, OpCode::Pong, frame.payload());
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    self.handle_close_frame(id, frame.payload());
                    return;
                }
                _ => {
                    let message = match conn.assembler.push(frame) {
                        Ok(Some(message)) => message,
                        Ok(None) => continue,
                        Err(err) => {
                            self.abort(id, err);
                            return;
                        }
                    };
                    conn.messages_received += 1;

                    let handler = &mut self.handler;
                    let mut router = router!(self);
                    if let Err(err) =
                        guarded(id, "on_message", || handler.on_message(id, message, &mut router))
                    {
                        self.abort(id, err);
                        return;
                    }
                }
            }
        }
    }

    /// Echo the peer's Close and drop the connection.
    fn handle_close_frame(&mut self, id: ConnectionId, payload: &[u8]) {
        let close = CloseFrame::from_payload(payload);
        log::debug!("connection {} sent close {} {:?}", id, close.code, close.reason);

        // An empty Close gets an empty one back; anything unsendable has
        // already decoded as a protocol error.
        let reply = match close.code {
            CloseCode::NoStatus => CloseFrame::new(CloseCode::NoStatus, ""),
            code if code.is_valid_on_wire() => CloseFrame::new(code, ""),
            _ => CloseFrame::new(CloseCode::ProtocolError, ""),
        };
        router!(self).send_close(id, &reply);

        if let Some(conn) = self.registry.get_mut(id) {
            let _ = conn.transition(ConnectionState::Closing);
        }
        self.close_connection(id);
    }

    /// Report `err`, send a Close with the matching status when the socket
    /// is still usable, and drop the connection.
    fn abort(&mut self, id: ConnectionId, err: Error) {
        if matches!(err, Error::Io { .. }) {
            log::debug!("connection {}: {}", id, err);
        } else {
            log::warn!("connection {}: {}", id, err);
        }
        let handler = &mut self.handler;
        let _ = guarded(id, "on_error", || handler.on_error(id, &err));

        let can_close = !matches!(err, Error::Io { .. })
            && self
                .registry
                .get(id)
                .is_some_and(|c| c.is_open() && !c.close_sent);
        if can_close {
            router!(self).send_close(id, &CloseFrame::new(err.close_code(), err.to_string()));
        }
        if let Some(conn) = self.registry.get_mut(id) {
            if conn.is_open() {
                let _ = conn.transition(ConnectionState::Closing);
            }
        }
        self.close_connection(id);
    }

    /// Remove the entry, close the socket and fire `on_close` if the
    /// connection ever opened.
    fn close_connection(&mut self, id: ConnectionId) {
        let Some(mut conn) = self.registry.remove(id) else {
            return;
        };
        if !conn.write_queue.is_empty() && !conn.write_failed {
            let _ = self.transport.write(conn.handle(), &conn.write_queue);
        }
        self.transport.close(conn.handle());

        let opened = conn.state().was_opened();
        if let Err(err) = conn.transition(ConnectionState::Closed) {
            log::trace!("connection {}: {}", id, err);
        }
        log::debug!(
            "connection {} closed after {:?} ({} bytes in, {} bytes out)",
            id,
            conn.connected_at.elapsed(),
            conn.bytes_received,
            conn.bytes_sent
        );

        if opened {
            let handler = &mut self.handler;
            let mut router = router!(self);
            let _ = guarded(id, "on_close", || handler.on_close(id, &conn, &mut router));
        }
    }

    fn sweep(&mut self, now: Instant) {
        let timeouts = self.config.protocol.timeouts.clone();
        let mut stale_handshakes = Vec::new();
        let mut idle = Vec::new();
        let mut finished = Vec::new();

        for conn in self.registry.iter() {
            let id = conn.id();
            if conn.write_failed {
                finished.push(id);
                continue;
            }
            match conn.state() {
                ConnectionState::Handshaking
                    if timeouts.as_ref().is_some_and(|t| {
                        now.saturating_duration_since(conn.connected_at) > t.handshake
                    }) =>
                {
                    stale_handshakes.push(id);
                }
                ConnectionState::Open
                    if timeouts
                        .as_ref()
                        .is_some_and(|t| conn.idle_for(now) > t.idle) =>
                {
                    idle.push(id);
                }
                ConnectionState::Closing if conn.close_sent && conn.pending_output() == 0 => {
                    finished.push(id);
                }
                _ => {}
            }
        }

        for id in stale_handshakes {
            log::debug!("connection {}: handshake timed out", id);
            self.close_connection(id);
        }
        for id in idle {
            log::debug!("connection {}: idle timeout", id);
            router!(self).close(id, CloseCode::GoingAway, "idle timeout");
            self.close_connection(id);
        }
        for id in finished {
            self.close_connection(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Timeouts};
    use crate::connection::Connection;
    use crate::message::Message;
    use crate::protocol::{HandshakeRequest, decode, encode_with_mask};
    use crate::transport::SocketDriver;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    const KEY: &str = "x3JJHMbDL1EzLkh9GBhXDw==";
    const MASK: [u8; 4] = [0x37, 0xfa, 0x21, 0x3d];

    #[derive(Default)]
    struct Recorder {
        connected: Vec<ConnectionId>,
        opened: Vec<ConnectionId>,
        messages: Vec<(ConnectionId, Message)>,
        closed: Vec<(ConnectionId, String)>,
        errors: Vec<Error>,
        refuse_with: Option<u16>,
        echo: bool,
    }

    impl Handler for Recorder {
        fn on_connect(&mut self, id: ConnectionId, _remote: Option<SocketAddr>) {
            self.connected.push(id);
        }

        fn on_handshake(
            &mut self,
            _id: ConnectionId,
            _request: &HandshakeRequest,
            response: &mut HandshakeResponse,
        ) -> bool {
            match self.refuse_with {
                Some(status) => {
                    response.set_status(status);
                    response.set_body("go away");
                    false
                }
                None => true,
            }
        }

        fn on_open(&mut self, id: ConnectionId, _router: &mut Router<'_>) {
            self.opened.push(id);
        }

        fn on_message(&mut self, id: ConnectionId, message: Message, router: &mut Router<'_>) {
            if message.as_text() == Some("boom") {
                panic!("handler failure");
            }
            if self.echo {
                router.send_to(id, &message);
            }
            self.messages.push((id, message));
        }

        fn on_close(&mut self, id: ConnectionId, connection: &Connection, _router: &mut Router<'_>) {
            self.closed.push((id, connection.path.clone()));
        }

        fn on_error(&mut self, _id: ConnectionId, error: &Error) {
            self.errors.push(error.clone());
        }
    }

    fn server(recorder: Recorder) -> Server<SocketDriver, Recorder> {
        let mut transport = SocketDriver::new();
        transport.listen("127.0.0.1", 0, 16).unwrap();
        let config = ServerConfig::new("127.0.0.1", 0).with_idle_sleep(Duration::ZERO);
        Server::new(transport, recorder, config)
    }

    fn pump<T: Transport, H: Handler>(server: &mut Server<T, H>) {
        for _ in 0..4 {
            server.tick(Some(Duration::from_millis(20))).unwrap();
        }
    }

    fn connect<T: Transport, H: Handler>(server: &Server<T, H>) -> TcpStream {
        let client = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        client
    }

    fn request(path: &str) -> String {
        format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
             Connection: Upgrade\r\nSec-WebSocket-Key: {}\r\n\
             Sec-WebSocket-Version: 13\r\n\r\n",
            path, KEY
        )
    }

    fn read_head(client: &mut TcpStream) -> String {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if client.read(&mut byte).unwrap() == 0 {
                break;
            }
            head.push(byte[0]);
        }
        String::from_utf8(head).unwrap()
    }

    fn open_client<T: Transport, H: Handler>(server: &mut Server<T, H>, path: &str) -> TcpStream {
        let mut client = connect(server);
        client.write_all(request(path).as_bytes()).unwrap();
        pump(server);
        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 101"), "{}", head);
        client
    }

    fn read_frame(client: &mut TcpStream) -> crate::protocol::Frame {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 256];
        loop {
            match decode(&buf) {
                Ok((frame, _)) => return frame,
                Err(err) if err.is_short_buffer() => {
                    let n = client.read(&mut chunk).unwrap();
                    assert!(n > 0, "connection closed before a full frame");
                    buf.extend_from_slice(&chunk[..n]);
                }
                Err(err) => panic!("bad frame: {}", err),
            }
        }
    }

    #[test]
    fn test_handshake_then_masked_text() {
        let mut server = server(Recorder::default());
        let mut client = connect(&server);
        client.write_all(request("/chat").as_bytes()).unwrap();
        pump(&mut server);

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(head.contains("Sec-WebSocket-Accept: HSmrc0sMlYUkAGmm5OPpG2HaGWk=\r\n"));

        client
            .write_all(&encode_with_mask(b"hi", OpCode::Text, Some(MASK), true))
            .unwrap();
        pump(&mut server);

        let recorder = server.handler();
        assert_eq!(recorder.connected, vec![1]);
        assert_eq!(recorder.opened, vec![1]);
        assert_eq!(recorder.messages, vec![(1, Message::text("hi"))]);
        let conn = server.registry().get(1).unwrap();
        assert_eq!(conn.path, "/chat");
        assert!(server.registry().check_invariants());
    }

    #[test]
    fn test_request_and_first_frame_in_one_read() {
        let mut server = server(Recorder::default());
        let mut client = connect(&server);
        let mut bytes = request("/").into_bytes();
        bytes.extend(encode_with_mask(b"early", OpCode::Text, Some(MASK), true));
        client.write_all(&bytes).unwrap();
        pump(&mut server);

        assert!(read_head(&mut client).starts_with("HTTP/1.1 101"));
        assert_eq!(server.handler().messages, vec![(1, Message::text("early"))]);
    }

    #[test]
    fn test_short_first_read_is_dropped_without_on_close() {
        let mut server = server(Recorder::default());
        let mut client = connect(&server);
        client.write_all(b"abc").unwrap();
        pump(&mut server);

        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        assert!(server.registry().is_empty());
        assert!(server.handler().closed.is_empty());
        assert!(server.handler().opened.is_empty());
    }

    #[test]
    fn test_missing_key_gets_400() {
        let mut server = server(Recorder::default());
        let mut client = connect(&server);
        client
            .write_all(b"GET / HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Version: 13\r\n\r\n")
            .unwrap();
        pump(&mut server);

        assert!(read_head(&mut client).starts_with("HTTP/1.1 400 Bad Request"));
        assert!(server.handler().opened.is_empty());
        assert_eq!(server.handler().errors.len(), 1);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_handler_refusal_sends_its_status() {
        let mut server = server(Recorder {
            refuse_with: Some(404),
            ..Default::default()
        });
        let mut client = connect(&server);
        client.write_all(request("/nowhere").as_bytes()).unwrap();
        pump(&mut server);

        let head = read_head(&mut client);
        assert!(head.starts_with("HTTP/1.1 404 Not Found"), "{}", head);
        assert!(server.handler().opened.is_empty());
        assert!(server.handler().errors.is_empty());
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_ping_answered_with_pong() {
        let mut server = server(Recorder::default());
        let mut client = open_client(&mut server, "/");

        client
            .write_all(&encode_with_mask(b"are you there", OpCode::Ping, Some(MASK), true))
            .unwrap();
        pump(&mut server);

        let pong = read_frame(&mut client);
        assert_eq!(pong.opcode, OpCode::Pong);
        assert_eq!(pong.payload(), b"are you there");
        assert!(server.handler().messages.is_empty());
    }

    #[test]
    fn test_close_frame_is_echoed_and_on_close_fires_once() {
        let mut server = server(Recorder::default());
        let mut client = open_client(&mut server, "/room");

        let payload = CloseFrame::new(CloseCode::Normal, "bye").to_payload();
        client
            .write_all(&encode_with_mask(&payload, OpCode::Close, Some(MASK), true))
            .unwrap();
        pump(&mut server);

        let echo = read_frame(&mut client);
        assert_eq!(echo.opcode, OpCode::Close);
        assert_eq!(CloseFrame::from_payload(echo.payload()).code, CloseCode::Normal);
        assert_eq!(server.handler().closed, vec![(1, "/room".to_string())]);
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_unsendable_close_codes_are_answered_with_protocol_error() {
        for code in [1005u16, 2999, 1016, 5000] {
            let mut server = server(Recorder::default());
            let mut client = open_client(&mut server, "/");

            client
                .write_all(&encode_with_mask(&code.to_be_bytes(), OpCode::Close, Some(MASK), true))
                .unwrap();
            pump(&mut server);

            let reply = read_frame(&mut client);
            assert_eq!(reply.opcode, OpCode::Close);
            assert_eq!(reply.payload(), &1002u16.to_be_bytes(), "close code {}", code);
            assert!(server.registry().is_empty());
        }
    }

    #[test]
    fn test_empty_close_is_answered_with_empty_close() {
        let mut server = server(Recorder::default());
        let mut client = open_client(&mut server, "/");

        client
            .write_all(&encode_with_mask(&[], OpCode::Close, Some(MASK), true))
            .unwrap();
        pump(&mut server);

        let reply = read_frame(&mut client);
        assert_eq!(reply.opcode, OpCode::Close);
        assert!(reply.payload().is_empty());
    }

    #[test]
    fn test_reserved_bits_close_with_protocol_error() {
        let mut server = server(Recorder::default());
        let mut client = open_client(&mut server, "/");

        let mut frame = encode_with_mask(b"x", OpCode::Text, Some(MASK), true);
        frame[0] |= 0x40;
        client.write_all(&frame).unwrap();
        pump(&mut server);

        let close = read_frame(&mut client);
        assert_eq!(close.opcode, OpCode::Close);
        assert_eq!(
            CloseFrame::from_payload(close.payload()).code,
            CloseCode::ProtocolError
        );
        assert_eq!(server.handler().errors, vec![Error::ReservedBitsSet]);
        assert_eq!(server.handler().closed.len(), 1);
    }

    #[test]
    fn test_handler_panic_closes_only_that_connection() {
        let mut server = server(Recorder {
            echo: true,
            ..Default::default()
        });
        let mut bad = open_client(&mut server, "/");
        let mut good = open_client(&mut server, "/");

        bad.write_all(&encode_with_mask(b"boom", OpCode::Text, Some(MASK), true))
            .unwrap();
        pump(&mut server);

        let close = read_frame(&mut bad);
        assert_eq!(
            CloseFrame::from_payload(close.payload()).code,
            CloseCode::InternalError
        );
        assert_eq!(server.registry().ids(), vec![2]);

        good.write_all(&encode_with_mask(b"still here", OpCode::Text, Some(MASK), true))
            .unwrap();
        pump(&mut server);
        let echo = read_frame(&mut good);
        assert_eq!(echo.payload(), b"still here");
    }

    #[test]
    fn test_shutdown_sends_going_away() {
        let mut server = server(Recorder::default());
        let mut client = open_client(&mut server, "/");

        server.shutdown();

        let close = read_frame(&mut client);
        assert_eq!(
            CloseFrame::from_payload(close.payload()).code,
            CloseCode::GoingAway
        );
        assert!(server.registry().is_empty());
        assert_eq!(server.handler().closed.len(), 1);
    }

    #[test]
    fn test_idle_timeout_closes_with_going_away() {
        let mut transport = SocketDriver::new();
        transport.listen("127.0.0.1", 0, 16).unwrap();
        let protocol = Config::server().with_timeouts(Timeouts::new(
            Duration::from_secs(30),
            Duration::from_millis(50),
        ));
        let config = ServerConfig::new("127.0.0.1", 0)
            .with_idle_sleep(Duration::ZERO)
            .with_protocol(protocol);
        let mut server = Server::new(transport, Recorder::default(), config);
        let mut client = open_client(&mut server, "/");

        thread::sleep(Duration::from_millis(80));
        pump(&mut server);

        let close = read_frame(&mut client);
        assert_eq!(
            CloseFrame::from_payload(close.payload()).code,
            CloseCode::GoingAway
        );
        assert!(server.registry().is_empty());
    }

    #[test]
    fn test_replace_handler_keeps_connections() {
        let mut server = server(Recorder::default());
        let _client = open_client(&mut server, "/");
        let old = server.replace_handler(Recorder::default());
        assert_eq!(old.opened, vec![1]);
        assert!(server.handler().opened.is_empty());
        assert_eq!(server.registry().open_ids(), vec![1]);
    }

    #[test]
    fn test_run_returns_once_stop_is_set() {
        let mut server = server(Recorder::default());
        let stop = AtomicBool::new(true);
        server.run(&stop).unwrap();
        assert!(server.registry().is_empty());
    }
}
