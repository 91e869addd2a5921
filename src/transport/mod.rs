//! Transport drivers: the I/O backends the dispatch loop runs on.
//!
//! Every driver owns the listening socket and the accepted connections and
//! hands out opaque [`Handle`]s. They differ in how sockets are driven but
//! present the same semantics upward:
//!
//! - `accept` returns `Ok(None)` when nothing is pending
//! - `read` returns [`ReadOutcome::Closed`] for a zero-byte read on a
//!   readable handle
//! - `write` may write fewer bytes than given (zero included); the caller
//!   queues the rest
//! - `EINTR`/`EAGAIN` never surface as errors

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

mod sockets;
mod streams;

#[cfg(feature = "event-loop")]
mod event_loop;

pub use sockets::SocketDriver;
pub use streams::StreamDriver;

#[cfg(feature = "event-loop")]
pub use event_loop::EventLoopDriver;

/// Opaque per-driver connection handle. Never zero, never reused by the
/// driver instance that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(u64);

impl Handle {
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Monotonic handle allocator shared by the drivers.
#[derive(Debug)]
pub(crate) struct HandleSeq(u64);

impl HandleSeq {
    pub(crate) const fn new() -> Self {
        Self(0)
    }

    pub(crate) fn next(&mut self) -> Handle {
        self.0 += 1;
        Handle(self.0)
    }
}

/// A freshly accepted connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    pub handle: Handle,
    pub remote: Option<SocketAddr>,
}

/// Result of one readiness poll.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Readiness {
    /// The listener has at least one pending connection.
    pub listener: bool,
    /// Connections with bytes (or EOF, or an error) to read.
    pub handles: Vec<Handle>,
}

impl Readiness {
    pub fn is_empty(&self) -> bool {
        !self.listener && self.handles.is_empty()
    }
}

/// Outcome of a read on a handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Data(Vec<u8>),
    /// The peer closed its end.
    Closed,
    /// Spurious wakeup, nothing to read right now.
    WouldBlock,
}

/// The available backends, in no particular order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    /// Non-blocking std sockets multiplexed with `poll(2)`.
    Sockets,
    /// Blocking streams; `poll(2)` only answers "is it readable".
    Streams,
    /// A tokio current-thread reactor.
    EventLoop,
}

impl DriverKind {
    /// Most capable first.
    pub const PREFERENCE: [DriverKind; 3] =
        [DriverKind::EventLoop, DriverKind::Sockets, DriverKind::Streams];

    /// Whether this backend can run here.
    pub fn is_supported(self) -> bool {
        match self {
            #[cfg(feature = "event-loop")]
            DriverKind::EventLoop => EventLoopDriver::is_supported(),
            #[cfg(not(feature = "event-loop"))]
            DriverKind::EventLoop => false,
            DriverKind::Sockets => SocketDriver::is_supported(),
            DriverKind::Streams => StreamDriver::is_supported(),
        }
    }

    /// Pick the most capable supported backend.
    ///
    /// # Errors
    /// `Error::DriverUnsupported` if no backend passes its probe.
    pub fn probe() -> Result<DriverKind> {
        Self::PREFERENCE
            .into_iter()
            .find(|kind| kind.is_supported())
            .ok_or_else(|| Error::DriverUnsupported("no transport driver available".into()))
    }

    /// Instantiate the backend.
    ///
    /// # Errors
    /// `Error::DriverUnsupported` if the backend is not available, or the
    /// driver's own construction error.
    pub fn create(self) -> Result<Box<dyn Transport>> {
        if !self.is_supported() {
            return Err(Error::DriverUnsupported(self.to_string()));
        }
        match self {
            DriverKind::Sockets => Ok(Box::new(SocketDriver::new())),
            DriverKind::Streams => Ok(Box::new(StreamDriver::new())),
            #[cfg(feature = "event-loop")]
            DriverKind::EventLoop => Ok(Box::new(EventLoopDriver::new()?)),
            #[cfg(not(feature = "event-loop"))]
            DriverKind::EventLoop => Err(Error::DriverUnsupported(self.to_string())),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            DriverKind::Sockets => "sockets",
            DriverKind::Streams => "streams",
            DriverKind::EventLoop => "event-loop",
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sockets" | "socket" => Ok(DriverKind::Sockets),
            "streams" | "stream" => Ok(DriverKind::Streams),
            "event-loop" | "eventloop" | "swoole" => Ok(DriverKind::EventLoop),
            other => Err(Error::DriverUnsupported(other.to_string())),
        }
    }
}

/// Capability interface shared by all drivers.
pub trait Transport {
    fn kind(&self) -> DriverKind;

    /// Whether the backend can run on this system.
    fn is_supported() -> bool
    where
        Self: Sized;

    /// Bind and listen on `host:port`.
    ///
    /// # Errors
    /// Bind or listen failure.
    fn listen(&mut self, host: &str, port: u16, backlog: i32) -> Result<()> {
        let listener = bind_listener(host, port, backlog)?;
        self.adopt(listener)
    }

    /// Take over an already listening socket, e.g. one inherited from the
    /// supervisor.
    ///
    /// # Errors
    /// The socket could not be switched to the driver's mode.
    fn adopt(&mut self, listener: TcpListener) -> Result<()>;

    /// Address of the listening socket.
    ///
    /// # Errors
    /// No listener, or the OS query failed.
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Accept one pending connection, `Ok(None)` if there is none.
    ///
    /// # Errors
    /// Fatal accept failure, or no listener.
    fn accept(&mut self) -> Result<Option<Accepted>>;

    /// Wait until the listener or any of `handles` is readable, or the
    /// timeout passes. `None` waits indefinitely.
    ///
    /// # Errors
    /// Fatal failure of the multiplexer.
    fn poll_readable(&mut self, handles: &[Handle], timeout: Option<Duration>)
    -> Result<Readiness>;

    /// Read at most `max` bytes.
    ///
    /// # Errors
    /// `Error::UnknownHandle`, or a fatal socket error.
    fn read(&mut self, handle: Handle, max: usize) -> Result<ReadOutcome>;

    /// Write as much of `bytes` as the socket takes without blocking the
    /// loop. Returns the count written.
    ///
    /// # Errors
    /// `Error::UnknownHandle`, or a fatal socket error.
    fn write(&mut self, handle: Handle, bytes: &[u8]) -> Result<usize>;

    /// Close and forget a handle. Unknown handles are ignored.
    fn close(&mut self, handle: Handle);

    /// Code and message of the most recent failure.
    fn last_error(&self) -> Option<(i32, String)>;
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn kind(&self) -> DriverKind {
        (**self).kind()
    }

    fn is_supported() -> bool {
        true
    }

    fn listen(&mut self, host: &str, port: u16, backlog: i32) -> Result<()> {
        (**self).listen(host, port, backlog)
    }

    fn adopt(&mut self, listener: TcpListener) -> Result<()> {
        (**self).adopt(listener)
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        (**self).local_addr()
    }

    fn accept(&mut self) -> Result<Option<Accepted>> {
        (**self).accept()
    }

    fn poll_readable(
        &mut self,
        handles: &[Handle],
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        (**self).poll_readable(handles, timeout)
    }

    fn read(&mut self, handle: Handle, max: usize) -> Result<ReadOutcome> {
        (**self).read(handle, max)
    }

    fn write(&mut self, handle: Handle, bytes: &[u8]) -> Result<usize> {
        (**self).write(handle, bytes)
    }

    fn close(&mut self, handle: Handle) {
        (**self).close(handle);
    }

    fn last_error(&self) -> Option<(i32, String)> {
        (**self).last_error()
    }
}

/// Bind a TCP listener and apply `backlog`.
///
/// # Errors
/// Address resolution, bind or listen failure.
pub fn bind_listener(host: &str, port: u16, backlog: i32) -> Result<TcpListener> {
    let addr = (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| Error::Io {
            code: libc::EADDRNOTAVAIL,
            message: format!("cannot resolve {}:{}", host, port),
        })?;
    let listener = TcpListener::bind(addr)?;
    // std binds with its own backlog; listen(2) again to apply ours.
    // SAFETY: the fd is owned by `listener` and open for this call.
    if unsafe { libc::listen(listener.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error().into());
    }
    Ok(listener)
}

/// Wait on `fds` with `poll(2)`. An interrupted wait counts as a timeout.
pub(crate) fn poll_fds(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms = timeout.map_or(-1, |d| {
        // Round up so sub-millisecond timeouts still sleep.
        let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
        i32::try_from(ms).unwrap_or(i32::MAX)
    });
    // SAFETY: the pointer and length describe a valid, exclusively borrowed slice.
    let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return Ok(0);
        }
        return Err(err);
    }
    Ok(rc as usize)
}

pub(crate) fn pollfd(fd: libc::c_int) -> libc::pollfd {
    libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    }
}

/// Readable, hung up or failed: all mean "a read will not block".
pub(crate) const fn is_ready(revents: libc::c_short) -> bool {
    revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
}

/// Whether `poll(2)` works at all here.
pub(crate) fn poll_available() -> bool {
    // SAFETY: zero fds with a null pointer is a valid, immediate call.
    unsafe { libc::poll(std::ptr::null_mut(), 0, 0) >= 0 }
}

pub(crate) fn record_error(slot: &mut Option<(i32, String)>, err: &io::Error) -> Error {
    let code = err.raw_os_error().unwrap_or(-1);
    *slot = Some((code, err.to_string()));
    Error::Io {
        code,
        message: err.to_string(),
    }
}
