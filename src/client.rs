//! Minimal blocking client.
//!
//! Used by the integration tests and handy for poking at a running server.
//! Frames are always masked; incoming pings are answered automatically.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::{Buf, BytesMut};

use crate::config::Config;
use crate::connection::Role;
use crate::error::{Error, Result};
use crate::message::{CloseCode, CloseFrame, Message};
use crate::protocol::handshake::find_request_end;
use crate::protocol::{ClientHandshake, FrameDecoder, MessageAssembler, OpCode, encode};

/// A connected, upgraded client socket.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    decoder: FrameDecoder,
    assembler: MessageAssembler,
    buf: BytesMut,
    read_size: usize,
    protocol: Option<String>,
    close_sent: bool,
}

impl Client {
    /// Connect to `addr` (`host:port`) and upgrade at `path`.
    ///
    /// # Errors
    /// Connection failure, or any handshake error including
    /// `Error::AcceptKeyMismatch`.
    pub fn connect(addr: &str, path: &str) -> Result<Self> {
        Self::connect_with(addr, ClientHandshake::new(addr, path), Config::client())
    }

    /// Connect using a prepared handshake and client config.
    ///
    /// # Errors
    /// As [`connect`](Self::connect).
    pub fn connect_with(addr: &str, handshake: ClientHandshake, config: Config) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.write_all(&handshake.request()?)?;

        let max = config.limits.max_handshake_size;
        let mut buf = BytesMut::with_capacity(config.read_buffer_size);
        let mut chunk = vec![0u8; config.read_buffer_size.max(1)];
        let end = loop {
            if let Some(end) = find_request_end(&buf) {
                break end;
            }
            if buf.len() > max {
                return Err(Error::HandshakeTooLarge {
                    size: buf.len(),
                    max,
                });
            }
            let n = stream.read(&mut chunk)?;
            if n == 0 {
                return Err(Error::InvalidHandshake(
                    "connection closed during handshake".into(),
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        };

        let head = buf.split_to(end);
        let response = handshake.verify(&head)?;
        log::debug!("connected to {}", addr);

        Ok(Self {
            stream,
            decoder: FrameDecoder::new(
                Role::Client,
                config.limits.clone(),
                config.accept_unmasked_frames,
            ),
            assembler: MessageAssembler::new(config.limits),
            buf,
            read_size: config.read_buffer_size.max(1),
            protocol: response.protocol().map(str::to_string),
            close_sent: false,
        })
    }

    /// Sub-protocol the server selected.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// # Errors
    /// Socket failure.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    /// # Errors
    /// `Error::ConnectionClosed` after a close was sent, or socket failure.
    pub fn send(&mut self, message: &Message) -> Result<()> {
        self.send_frame(message.opcode(), message.payload())
    }

    /// # Errors
    /// As [`send`](Self::send).
    pub fn send_text(&mut self, text: &str) -> Result<()> {
        self.send(&Message::text(text))
    }

    /// # Errors
    /// As [`send`](Self::send).
    pub fn ping(&mut self, payload: &[u8]) -> Result<()> {
        self.send_frame(OpCode::Ping, payload)
    }

    /// Block until a complete data message arrives.
    ///
    /// # Errors
    /// - `Error::ConnectionClosed` with the peer's status once a Close arrives,
    ///   or with `None` if the Close was empty or the socket closed without one
    /// - any framing error, or a socket failure (including read timeouts)
    pub fn recv(&mut self) -> Result<Message> {
        loop {
            let frame = match self.decoder.decode(&self.buf) {
                Ok((frame, used)) => {
                    self.buf.advance(used);
                    frame
                }
                Err(err) if err.is_short_buffer() => {
                    self.fill()?;
                    continue;
                }
                Err(err) => return Err(err),
            };

            match frame.opcode {
                OpCode::Ping if !self.close_sent => {
                    self.send_frame(OpCode::Pong, frame.payload())?;
                }
                OpCode::Ping | OpCode::Pong => {}
                OpCode::Close => {
                    let close = CloseFrame::from_payload(frame.payload());
                    if !self.close_sent {
                        let _ = self.send_frame(OpCode::Close, &close.to_payload());
                    }
                    let code = (close.code != CloseCode::NoStatus).then(|| close.code.as_u16());
                    return Err(Error::ConnectionClosed(code));
                }
                _ => {
                    if let Some(message) = self.assembler.push(frame)? {
                        return Ok(message);
                    }
                }
            }
        }
    }

    /// Send a Close and wait for the server's reply.
    ///
    /// Returns the status the server echoed, if any.
    ///
    /// `NoStatus` sends an empty Close.
    ///
    /// # Errors
    /// [`Error::InvalidCloseCode`] for a code that may not be sent, or a
    /// socket failure while sending.
    pub fn close(&mut self, code: CloseCode, reason: &str) -> Result<Option<u16>> {
        if code != CloseCode::NoStatus && !code.is_valid_on_wire() {
            return Err(Error::InvalidCloseCode(code.as_u16()));
        }
        self.send_frame(OpCode::Close, &CloseFrame::new(code, reason).to_payload())?;
        loop {
            match self.recv() {
                Ok(_) => {}
                Err(Error::ConnectionClosed(code)) => return Ok(code),
                Err(_) => return Ok(None),
            }
        }
    }

    fn send_frame(&mut self, opcode: OpCode, payload: &[u8]) -> Result<()> {
        if self.close_sent {
            return Err(Error::ConnectionClosed(None));
        }
        if opcode == OpCode::Close {
            self.close_sent = true;
        }
        self.stream.write_all(&encode(payload, opcode, Role::Client.masks_outgoing(), true))?;
        Ok(())
    }

    fn fill(&mut self) -> Result<()> {
        let mut chunk = vec![0u8; self.read_size];
        let n = self.stream.read(&mut chunk)?;
        if n == 0 {
            return Err(Error::ConnectionClosed(None));
        }
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::connection::ConnectionId;
    use crate::protocol::{HandshakeRequest, HandshakeResponse};
    use crate::server::{Handler, Router, Server};
    use crate::transport::{SocketDriver, Transport};
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::thread;

    struct Echo;

    impl Handler for Echo {
        fn on_handshake(
            &mut self,
            _id: ConnectionId,
            request: &HandshakeRequest,
            response: &mut HandshakeResponse,
        ) -> bool {
            if request.protocols.iter().any(|p| p == "echo") {
                response.set_protocol(Some("echo"));
            }
            true
        }

        fn on_message(&mut self, id: ConnectionId, message: Message, router: &mut Router<'_>) {
            router.send_to(id, &message);
        }
    }

    fn spawn_server() -> (String, Arc<AtomicBool>, thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            let mut transport = SocketDriver::new();
            transport.listen("127.0.0.1", 0, 16).unwrap();
            let config = ServerConfig::new("127.0.0.1", 0)
                .with_poll_timeout(Some(Duration::from_millis(10)))
                .with_idle_sleep(Duration::ZERO);
            let mut server = Server::new(transport, Echo, config);
            tx.send(server.local_addr().unwrap()).unwrap();
            server.run(&flag).unwrap();
        });
        let addr = rx.recv().unwrap().to_string();
        (addr, stop, handle)
    }

    #[test]
    fn test_echo_round_trip() {
        let (addr, stop, handle) = spawn_server();
        let mut client = Client::connect(&addr, "/echo").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        client.send_text("hello").unwrap();
        assert_eq!(client.recv().unwrap(), Message::text("hello"));

        let big = vec![7u8; 70_000];
        client.send(&Message::binary(big.clone())).unwrap();
        assert_eq!(client.recv().unwrap(), Message::binary(big));

        assert_eq!(client.close(CloseCode::Normal, "done").unwrap(), Some(1000));
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_unsendable_close_code_is_refused() {
        let (addr, stop, handle) = spawn_server();
        let mut client = Client::connect(&addr, "/").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        assert_eq!(
            client.close(CloseCode::Other(1006), "").unwrap_err(),
            Error::InvalidCloseCode(1006)
        );
        client.send_text("still open").unwrap();
        assert_eq!(client.recv().unwrap(), Message::text("still open"));

        assert_eq!(client.close(CloseCode::NoStatus, "").unwrap(), None);
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_protocol_selection() {
        let (addr, stop, handle) = spawn_server();
        let handshake = ClientHandshake::new(addr.as_str(), "/")
            .with_protocols(vec!["chat".into(), "echo".into()]);
        let client = Client::connect_with(&addr, handshake, Config::client()).unwrap();
        assert_eq!(client.protocol(), Some("echo"));
        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_server_shutdown_reports_going_away() {
        let (addr, stop, handle) = spawn_server();
        let mut client = Client::connect(&addr, "/").unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

        stop.store(true, Ordering::SeqCst);
        handle.join().unwrap();
        assert_eq!(client.recv().unwrap_err(), Error::ConnectionClosed(Some(1001)));
        assert!(client.send_text("late").is_err());
    }

    #[test]
    fn test_wrong_accept_key_is_rejected() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            stream
                .write_all(
                    b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\n\
                      Connection: Upgrade\r\nSec-WebSocket-Accept: AAAAAAAAAAAAAAAAAAAAAAAAAAA=\r\n\r\n",
                )
                .unwrap();
        });

        let err = Client::connect(&addr, "/").unwrap_err();
        assert!(matches!(err, Error::AcceptKeyMismatch { .. }));
        server.join().unwrap();
    }

    #[test]
    fn test_refused_upgrade_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).unwrap();
            stream
                .write_all(b"HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n")
                .unwrap();
        });

        let err = Client::connect(&addr, "/").unwrap_err();
        assert!(matches!(err, Error::InvalidHandshake(_)));
        server.join().unwrap();
    }
}
