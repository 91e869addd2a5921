//! Native socket driver: std sockets switched to non-blocking mode and
//! multiplexed with `poll(2)`.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::{
    Accepted, DriverKind, Handle, HandleSeq, ReadOutcome, Readiness, Transport, is_ready,
    poll_available, poll_fds, pollfd, record_error,
};

/// Non-blocking socket driver.
#[derive(Debug)]
pub struct SocketDriver {
    listener: Option<TcpListener>,
    streams: HashMap<Handle, TcpStream>,
    handles: HandleSeq,
    last_error: Option<(i32, String)>,
}

impl SocketDriver {
    pub fn new() -> Self {
        Self {
            listener: None,
            streams: HashMap::new(),
            handles: HandleSeq::new(),
            last_error: None,
        }
    }

    fn stream(&mut self, handle: Handle) -> Result<&mut TcpStream> {
        self.streams
            .get_mut(&handle)
            .ok_or(Error::UnknownHandle(handle.as_u64()))
    }
}

impl Default for SocketDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for SocketDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::Sockets
    }

    fn is_supported() -> bool {
        poll_available()
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
            None => Err(Error::DriverUnsupported("sockets: not listening".into())),
        }
    }

    fn accept(&mut self) -> Result<Option<Accepted>> {
        let Some(listener) = &self.listener else {
            return Err(Error::DriverUnsupported("sockets: not listening".into()));
        };
        loop {
            match listener.accept() {
                Ok((stream, remote)) => {
                    stream
                        .set_nonblocking(true)
                        .map_err(|e| record_error(&mut self.last_error, &e))?;
                    let _ = stream.set_nodelay(true);
                    let handle = self.handles.next();
                    self.streams.insert(handle, stream);
                    return Ok(Some(Accepted {
                        handle,
                        remote: Some(remote),
                    }));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // The peer gave up between SYN and accept.
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => return Ok(None),
                Err(e) => return Err(record_error(&mut self.last_error, &e)),
            }
        }
    }

    fn poll_readable(
        &mut self,
        handles: &[Handle],
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        let mut fds = Vec::with_capacity(handles.len() + 1);
        let mut polled = Vec::with_capacity(handles.len());
        if let Some(listener) = &self.listener {
            fds.push(pollfd(listener.as_raw_fd()));
        }
        for handle in handles {
            if let Some(stream) = self.streams.get(handle) {
                fds.push(pollfd(stream.as_raw_fd()));
                polled.push(*handle);
            }
        }

        poll_fds(&mut fds, timeout).map_err(|e| record_error(&mut self.last_error, &e))?;

        let mut readiness = Readiness::default();
        let mut revents = fds.iter().map(|fd| fd.revents);
        if self.listener.is_some() {
            readiness.listener = revents.next().is_some_and(is_ready);
        }
        readiness.handles = polled
            .into_iter()
            .zip(revents)
            .filter(|(_, ev)| is_ready(*ev))
            .map(|(handle, _)| handle)
            .collect();
        Ok(readiness)
    }

    fn read(&mut self, handle: Handle, max: usize) -> Result<ReadOutcome> {
        let mut buf = vec![0u8; max];
        loop {
            let result = self.stream(handle)?.read(&mut buf);
            match result {
                Ok(0) => return Ok(ReadOutcome::Closed),
                Ok(n) => {
                    buf.truncate(n);
                    return Ok(ReadOutcome::Data(buf));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    return Ok(ReadOutcome::WouldBlock);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(record_error(&mut self.last_error, &e)),
            }
        }
    }

    fn write(&mut self, handle: Handle, bytes: &[u8]) -> Result<usize> {
        loop {
            let result = self.stream(handle)?.write(bytes);
            match result {
                Ok(n) => return Ok(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(record_error(&mut self.last_error, &e)),
            }
        }
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
