//! Configuration and limits for the server, its connections and its workers.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::transport::DriverKind;

/// Per-connection ceilings on buffered input.
///
/// Every check runs against declared lengths, so oversized input is refused
/// before any of it is buffered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Largest payload one frame may declare (16 MiB).
    pub max_frame_size: usize,
    /// Largest reassembled message (64 MiB).
    pub max_message_size: usize,
    /// Most frames one fragmented message may span (128).
    pub max_fragment_count: usize,
    /// Largest opening handshake request (8 KiB).
    pub max_handshake_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self::new(16 << 20, 64 << 20, 128, 8 << 10)
    }
}

fn within(ok: bool, err: impl FnOnce() -> Error) -> Result<()> {
    if ok { Ok(()) } else { Err(err()) }
}

impl Limits {
    #[must_use]
    pub const fn new(
        max_frame_size: usize,
        max_message_size: usize,
        max_fragment_count: usize,
        max_handshake_size: usize,
    ) -> Self {
        Self {
            max_frame_size,
            max_message_size,
            max_fragment_count,
            max_handshake_size,
        }
    }

    /// Tight ceilings for memory-constrained hosts: 64 KiB frames, 256 KiB
    /// messages, 16 fragments, 4 KiB handshakes.
    #[must_use]
    pub const fn embedded() -> Self {
        Self::new(64 << 10, 256 << 10, 16, 4 << 10)
    }

    /// Check a frame's declared length. Takes the raw 64-bit wire value so
    /// nothing is narrowed before the comparison.
    pub fn check_frame_size(&self, size: u64) -> Result<()> {
        within(size <= self.max_frame_size as u64, || Error::FrameTooLarge {
            size,
            max: self.max_frame_size,
        })
    }

    /// Check the size a message would reach after appending a fragment.
    pub fn check_message_size(&self, size: usize) -> Result<()> {
        within(size <= self.max_message_size, || Error::MessageTooLarge {
            size,
            max: self.max_message_size,
        })
    }

    pub fn check_fragment_count(&self, count: usize) -> Result<()> {
        within(count <= self.max_fragment_count, || Error::TooManyFragments {
            count,
            max: self.max_fragment_count,
        })
    }

    /// Check the bytes buffered so far for an incomplete handshake request.
    pub fn check_handshake_size(&self, size: usize) -> Result<()> {
        within(size <= self.max_handshake_size, || Error::HandshakeTooLarge {
            size,
            max: self.max_handshake_size,
        })
    }
}

/// Deadlines the dispatch loop's sweep enforces on each connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// From accept to a completed upgrade (30s).
    pub handshake: Duration,
    /// Longest an open connection may stay silent (5 min).
    pub idle: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(300))
    }
}

impl Timeouts {
    #[must_use]
    pub const fn new(handshake: Duration, idle: Duration) -> Self {
        Self { handshake, idle }
    }
}

/// Protocol settings every connection of a worker shares.
#[derive(Debug, Clone)]
pub struct Config {
    pub limits: Limits,
    /// Tolerate client frames without a masking key. Off by default, since
    /// RFC 6455 Section 5.1 makes masking mandatory for clients.
    pub accept_unmasked_frames: bool,
    /// Put a masking key on outgoing frames. Only clients do this.
    pub mask_frames: bool,
    /// Bytes pulled from a socket per readiness event.
    pub read_buffer_size: usize,
    /// `None` turns the timeout sweep off.
    pub timeouts: Option<Timeouts>,
    /// Accepted `Origin` values. `None` or an empty list lets every origin in.
    pub allowed_origins: Option<Vec<String>>,
}

impl Default for Config {
    fn default() -> Self {
        Self::client()
    }
}

impl Config {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Server side: unmasked output, masked input required, timeouts on.
    #[must_use]
    pub fn server() -> Self {
        Self {
            mask_frames: false,
            timeouts: Some(Timeouts::default()),
            ..Self::client()
        }
    }

    /// Client side: every outgoing frame masked, no sweep.
    #[must_use]
    pub fn client() -> Self {
        Self {
            limits: Limits::default(),
            accept_unmasked_frames: false,
            mask_frames: true,
            read_buffer_size: 8 << 10,
            timeouts: None,
            allowed_origins: None,
        }
    }

    #[must_use]
    pub const fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    #[must_use]
    pub const fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    #[must_use]
    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = Some(timeouts);
        self
    }

    #[must_use]
    pub fn with_allowed_origins(mut self, origins: Vec<String>) -> Self {
        self.allowed_origins = Some(origins);
        self
    }
}

/// Process-level configuration for a worker's listening socket and loop.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind.
    pub host: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub port: u16,
    /// Listen backlog.
    pub backlog: i32,
    /// Transport driver, or `None` to probe for the most capable one.
    pub driver: Option<DriverKind>,
    /// Number of worker processes.
    pub worker_num: usize,
    /// Upper bound on one readiness poll. `None` blocks until I/O arrives.
    pub poll_timeout: Option<Duration>,
    /// Sleep inserted after an iteration in which nothing was ready.
    pub idle_sleep: Duration,
    /// Protocol configuration for accepted connections.
    pub protocol: Config,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            backlog: 128,
            driver: None,
            worker_num: 1,
            poll_timeout: Some(Duration::from_secs(1)),
            idle_sleep: Duration::from_millis(200),
            protocol: Config::server(),
        }
    }
}

impl ServerConfig {
    /// Create a configuration bound to `host:port` with defaults elsewhere.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Default::default()
        }
    }

    /// Pin a transport driver instead of probing.
    #[must_use]
    pub const fn with_driver(mut self, driver: DriverKind) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Set the number of worker processes.
    #[must_use]
    pub const fn with_workers(mut self, worker_num: usize) -> Self {
        self.worker_num = worker_num;
        self
    }

    /// Set the readiness poll bound.
    #[must_use]
    pub const fn with_poll_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the idle sleep.
    #[must_use]
    pub const fn with_idle_sleep(mut self, sleep: Duration) -> Self {
        self.idle_sleep = sleep;
        self
    }

    /// Set the protocol configuration.
    #[must_use]
    pub fn with_protocol(mut self, protocol: Config) -> Self {
        self.protocol = protocol;
        self
    }
}

/// Configuration of the master process's supervision policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// Number of worker slots to keep filled.
    pub worker_num: usize,
    /// Time workers get to exit after SIGTERM before SIGKILL.
    ///
    /// Default: 30 seconds
    pub stop_grace: Duration,
    /// Upper bound of the random delay before a crashed worker is respawned.
    ///
    /// Default: 1 second
    pub max_splay: Duration,
    /// Interval at which the master checks signals and reaps children.
    ///
    /// Default: 100 ms
    pub tick: Duration,
    /// A worker that exits before running this long counts as failing to
    /// start; one that outlives it clears its slot's failure streak.
    ///
    /// Default: 5 seconds
    pub stable_after: Duration,
    /// Consecutive startup failures of one slot that stop the master.
    ///
    /// Default: 5
    pub max_startup_failures: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_num: 1,
            stop_grace: Duration::from_secs(30),
            max_splay: Duration::from_secs(1),
            tick: Duration::from_millis(100),
            stable_after: Duration::from_secs(5),
            max_startup_failures: 5,
        }
    }
}

impl SupervisorConfig {
    /// Create a supervision policy for `worker_num` workers.
    #[must_use]
    pub fn new(worker_num: usize) -> Self {
        Self {
            worker_num,
            ..Default::default()
        }
    }
}
