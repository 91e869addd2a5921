//! Event-loop driver backed by a tokio current-thread reactor.
//!
//! The dispatch loop stays synchronous: each readiness poll runs the
//! reactor with `block_on` until a socket is ready or the timeout passes,
//! and reads and writes go through `try_read`/`try_write`.

use std::collections::{HashMap, VecDeque};
use std::future::poll_fn;
use std::io;
use std::net::{Shutdown, SocketAddr};
use std::task::Poll;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::{Builder, Runtime};

use crate::error::{Error, Result};
use crate::transport::{
    Accepted, DriverKind, Handle, HandleSeq, ReadOutcome, Readiness, Transport, record_error,
};

/// Reactor-driven driver.
#[derive(Debug)]
pub struct EventLoopDriver {
    listener: Option<TcpListener>,
    streams: HashMap<Handle, TcpStream>,
    /// Connections the reactor accepted while polling, not yet handed out.
    pending: VecDeque<(TcpStream, SocketAddr)>,
    handles: HandleSeq,
    last_error: Option<(i32, String)>,
    runtime: Runtime,
}

impl EventLoopDriver {
    /// # Errors
    /// The reactor could not be created.
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()?;
        Ok(Self {
            listener: None,
            streams: HashMap::new(),
            pending: VecDeque::new(),
            handles: HandleSeq::new(),
            last_error: None,
            runtime,
        })
    }

    fn register(&mut self, stream: TcpStream, remote: SocketAddr) -> Accepted {
        let _ = stream.set_nodelay(true);
        let handle = self.handles.next();
        self.streams.insert(handle, stream);
        Accepted {
            handle,
            remote: Some(remote),
        }
    }

    fn stream(&self, handle: Handle) -> Result<&TcpStream> {
        self.streams
            .get(&handle)
            .ok_or(Error::UnknownHandle(handle.as_u64()))
    }
}

impl Transport for EventLoopDriver {
    fn kind(&self) -> DriverKind {
        DriverKind::EventLoop
    }

    fn is_supported() -> bool {
        Builder::new_current_thread().enable_io().build().is_ok()
    }

    fn adopt(&mut self, listener: std::net::TcpListener) -> Result<()> {
        listener
            .set_nonblocking(true)
            .map_err(|e| record_error(&mut self.last_error, &e))?;
        let _guard = self.runtime.enter();
        let listener =
            TcpListener::from_std(listener).map_err(|e| record_error(&mut self.last_error, &e))?;
        self.listener = Some(listener);
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(Error::DriverUnsupported("event-loop: not listening".into())),
        }
    }

    fn accept(&mut self) -> Result<Option<Accepted>> {
        if let Some((stream, remote)) = self.pending.pop_front() {
            return Ok(Some(self.register(stream, remote)));
        }

        let Some(listener) = &self.listener else {
            return Err(Error::DriverUnsupported("event-loop: not listening".into()));
        };
        let polled = self.runtime.block_on(poll_fn(|cx| {
            Poll::Ready(match listener.poll_accept(cx) {
                Poll::Ready(result) => Some(result),
                Poll::Pending => None,
            })
        }));

        match polled {
            None => Ok(None),
            Some(Ok((stream, remote))) => Ok(Some(self.register(stream, remote))),
            Some(Err(e))
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionAborted
                ) =>
            {
                Ok(None)
            }
            Some(Err(e)) => Err(record_error(&mut self.last_error, &e)),
        }
    }

    fn poll_readable(
        &mut self,
        handles: &[Handle],
        timeout: Option<Duration>,
    ) -> Result<Readiness> {
        let queued = !self.pending.is_empty();
        let listener = self.listener.as_ref();
        let streams = &self.streams;
        let mut accepted = Vec::new();

        let wait = poll_fn(|cx| {
            let mut ready = Readiness::default();
            if let Some(listener) = listener {
                while let Poll::Ready(result) = listener.poll_accept(cx) {
                    match result {
                        Ok(conn) => accepted.push(conn),
                        Err(e) => {
                            log::debug!("event-loop accept failed: {}", e);
                            break;
                        }
                    }
                }
                ready.listener = queued || !accepted.is_empty();
            }
            for handle in handles {
                if let Some(stream) = streams.get(handle) {
                    if stream.poll_read_ready(cx).is_ready() {
                        ready.handles.push(*handle);
                    }
                }
            }
            if ready.is_empty() {
                Poll::Pending
            } else {
                Poll::Ready(ready)
            }
        });

        let readiness = match timeout {
            Some(limit) => self.runtime.block_on(async {
                tokio::time::timeout(limit, wait).await.unwrap_or_default()
            }),
            None => self.runtime.block_on(wait),
        };

        self.pending.extend(accepted);
        Ok(readiness)
    }

    fn read(&mut self, handle: Handle, max: usize) -> Result<ReadOutcome> {
        let mut buf = vec![0u8; max];
        loop {
            let result = self.stream(handle)?.try_read(&mut buf);
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
            let result = self.stream(handle)?.try_write(bytes);
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
            if let Ok(stream) = stream.into_std() {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }

    fn last_error(&self) -> Option<(i32, String)> {
        self.last_error.clone()
    }
}
