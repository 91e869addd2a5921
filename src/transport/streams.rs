//! Stream driver: accepted connections stay in blocking mode.
//!
//! Readiness still comes from `poll(2)`, so a read only happens once bytes
//! (or EOF) are waiting. Writes block for at most the driver's write
//! timeout; whatever the kernel has not taken by then is reported as a
//! short write and stays in the connection's queue. The listener itself is
//! non-blocking, since with several workers sharing it another process may
//! win the race for a connection.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{
    Accepted, DriverKind, Handle, HandleSeq, ReadOutcome, Readiness, Transport, is_ready,
    poll_fds, pollfd, record_error,
};

/// Longest a single write may block on a peer that is not reading.
const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(50);

/// Blocking stream driver.
#[derive(Debug)]
pub struct StreamDriver {
    listener: Option<TcpListener>,
    streams: HashMap<Handle, TcpStream>,
    handles: HandleSeq,
    write_timeout: Duration,
    last_error: Option<(i32, String)>,
}

impl StreamDriver {
    pub fn new() -> Self {
        Self {
            listener: None,
            streams: HashMap::new(),
            handles: HandleSeq::new(),
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            last_error: None,
        }
    }

    /// Bound each write on streams accepted from now on. Zero is raised to
    /// one millisecond, since the socket layer reads zero as "no timeout".
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout.max(Duration::from_millis(1));
        self
    }
}

impl Default for StreamDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for StreamDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Streams
    }

    fn is_supported() -> bool {
        true
    }

    fn adopt(&mut self, listener: TcpListener) -> Result<()> {
        listener
            .set_nonblocking(true)
            .map_err(|e| record_error(&mut self.last_error, &e))?;
        self.listener = Some(listener);
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(Error::DriverUnsupported("streams: not listening".into())),
        }
    }

    fn accept(&mut self) -> Result<Option<Accepted>> {
        let Some(listener) = &self.listener else {
            return Err(Error::DriverUnsupported("streams: not listening".into()));
        };
        loop {
            match listener.accept() {
                Ok((stream, remote)) => {
                    // Accepted sockets may inherit O_NONBLOCK from the listener.
                    stream
                        .set_nonblocking(false)
                        .and_then(|()| stream.set_write_timeout(Some(self.write_timeout)))
                        .map_err(|e| record_error(&mut self.last_error, &e))?;
                    let handle = self.handles.next();
                    self.streams.insert(handle, stream);
                    return Ok(Some(Accepted {
                        handle,
                        remote: Some(remote),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(record_error(&mut self.last_error, &e)),
            }
        }
    }

    fn poll_readable(
        &mut self,
        handles: &[Handle],
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        let listener_fd = self.listener.as_ref().map(AsRawFd::as_raw_fd);
        let targets: Vec<(Handle, i32)> = handles
            .iter()
            .filter_map(|h| self.streams.get(h).map(|s| (*h, s.as_raw_fd())))
            .collect();

        let mut fds: Vec<libc::pollfd> = listener_fd
            .into_iter()
            .chain(targets.iter().map(|(_, fd)| *fd))
            .map(pollfd)
            .collect();

        poll_fds(&mut fds, timeout).map_err(|e| record_error(&mut self.last_error, &e))?;

        let offset = usize::from(listener_fd.is_some());
        Ok(Readiness {
            listener: listener_fd.is_some() && is_ready(fds[0].revents),
            handles: targets
                .iter()
                .zip(&fds[offset..])
                .filter(|(_, fd)| is_ready(fd.revents))
                .map(|((handle, _), _)| *handle)
                .collect(),
        })
    }

    fn read(&mut self, handle: Handle, max: usize) -> Result<ReadOutcome> {
        let stream = self
            .streams
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle.as_u64()))?;
        let mut buf = vec![0u8; max];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(ReadOutcome::Data(buf));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) => return Err(record_error(&mut self.last_error, &e)),
            }
        }
    }

    fn write(&mut self, handle: Handle, bytes: &[u8]) -> Result<usize> {
        let stream = self
            .streams
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle.as_u64()))?;
        let mut written = 0;
        while written < bytes.len() {
            match stream.write(&bytes[written..]) {
                Ok(0) => {
                    let e = io::Error::from(io::ErrorKind::WriteZero);
                    return Err(record_error(&mut self.last_error, &e));
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The write timeout expired: SO_SNDTIMEO surfaces as EAGAIN.
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    break;
                }
                Err(e) => return Err(record_error(&mut self.last_error, &e)),
            }
        }
        Ok(written)
    }

    fn close(&mut self, handle: Handle) {
        if let Some(stream) = self.streams.remove(&handle) {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn last_error(&self) -> Option<(i32, String)> {
        self.last_error.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::bind_listener;

    #[test]
    fn test_stream_driver_round_trip() {
        let mut driver = StreamDriver::new();
        driver.listen("127.0.0.1", 0, 8).unwrap();

        let mut client = TcpStream::connect(driver.local_addr().unwrap()).unwrap();
        let ready = driver.poll_readable(&[], Some(Duration::from_secs(5))).unwrap();
        assert!(ready.listener);
        let accepted = driver.accept().unwrap().unwrap();

        client.write_all(b"ping").unwrap();
        let ready = driver
            .poll_readable(&[accepted.handle], Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(ready.handles, vec![accepted.handle]);
        assert_eq!(
            driver.read(accepted.handle, 16).unwrap(),
            ReadOutcome::Data(b"ping".to_vec())
        );

        assert_eq!(driver.write(accepted.handle, b"pong").unwrap(), 4);
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn test_write_to_stalled_peer_is_bounded() {
        let mut driver = StreamDriver::new().with_write_timeout(Duration::from_millis(20));
        driver.listen("127.0.0.1", 0, 8).unwrap();

        // Never reads, so the socket buffers eventually fill.
        let _client = TcpStream::connect(driver.local_addr().unwrap()).unwrap();
        driver.poll_readable(&[], Some(Duration::from_secs(5))).unwrap();
        let accepted = driver.accept().unwrap().unwrap();

        let chunk = vec![0x5a; 1 << 20];
        let started = std::time::Instant::now();
        let mut short = None;
        for _ in 0..256 {
            let n = driver.write(accepted.handle, &chunk).unwrap();
            if n < chunk.len() {
                short = Some(n);
                break;
            }
        }
        assert!(short.is_some(), "socket buffers never filled");
        assert!(started.elapsed() < Duration::from_secs(10));

        let again = std::time::Instant::now();
        assert!(driver.write(accepted.handle, &chunk).unwrap() < chunk.len());
        assert!(again.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_stream_driver_write_to_unknown_handle() {
        let mut driver = StreamDriver::new();
        driver.adopt(bind_listener("127.0.0.1", 0, 8).unwrap()).unwrap();
        assert!(matches!(
            driver.write(Handle::new(7), b"x"),
            Err(Error::UnknownHandle(7))
        ));
    }
}
