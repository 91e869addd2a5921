//! Per-worker table of live connections.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use crate::config::Config;
use crate::connection::ConnectionState;
use crate::error::{Error, Result};
use crate::protocol::MessageAssembler;
use crate::transport::Handle;

/// Connection id. Ids start at 1; 0 is reserved for "the system".
pub type ConnectionId = u64;

/// One accepted socket and everything known about it.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    handle: Handle,
    state: ConnectionState,
    /// Peer address, when the driver reports one.
    pub remote: Option<SocketAddr>,
    /// Request path from the handshake, `/` until then.
    pub path: String,
    /// Sub-protocol agreed in the handshake.
    pub protocol: Option<String>,
    pub connected_at: Instant,
    pub handshake_at: Option<Instant>,
    /// Last time bytes arrived.
    pub last_activity: Instant,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub messages_received: u64,
    /// Inbound bytes not yet consumed by the handshake or the decoder.
    pub(crate) read_buf: BytesMut,
    /// Outbound bytes the driver has not accepted yet.
    pub(crate) write_queue: BytesMut,
    pub(crate) assembler: MessageAssembler,
    /// A close frame has gone out; no more frames may follow it.
    pub(crate) close_sent: bool,
    /// The driver failed a write; the connection is dropped on the next sweep.
    pub(crate) write_failed: bool,
}

impl Connection {
    pub fn new(id: ConnectionId, handle: Handle, remote: Option<SocketAddr>, config: &Config) -> Self {
        let now = Instant::now();
        Self {
            id,
            handle,
            state: ConnectionState::Connecting,
            remote,
            path: "/".to_string(),
            protocol: None,
            connected_at: now,
            handshake_at: None,
            last_activity: now,
            bytes_received: 0,
            bytes_sent: 0,
            messages_received: 0,
            read_buf: BytesMut::with_capacity(config.read_buffer_size),
            write_queue: BytesMut::new(),
            assembler: MessageAssembler::new(config.limits.clone()),
            close_sent: false,
            write_failed: false,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    /// Move to `next`, stamping `handshake_at` on entering `Open`.
    ///
    /// # Errors
    /// `Error::InvalidTransition` for an edge the state machine forbids.
    pub fn transition(&mut self, next: ConnectionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        if next == ConnectionState::Open {
            self.handshake_at = Some(Instant::now());
        }
        log::trace!("connection {}: {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }

    /// Complete the handshake: record the path and protocol, then open.
    ///
    /// # Errors
    /// `Error::InvalidTransition` unless the connection is handshaking.
    pub fn open(&mut self, path: &str, protocol: Option<String>) -> Result<()> {
        self.transition(ConnectionState::Open)?;
        self.path = if path.is_empty() { "/".into() } else { path.to_string() };
        self.protocol = protocol;
        Ok(())
    }

    /// Time since the last inbound bytes.
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Bytes waiting to be written.
    pub fn pending_output(&self) -> usize {
        self.write_queue.len()
    }
}

/// Connections of one worker, iterated in ascending id order.
#[derive(Debug, Default)]
pub struct Registry {
    connections: BTreeMap<ConnectionId, Connection>,
    by_handle: HashMap<Handle, ConnectionId>,
    next_id: ConnectionId,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted handle and return its new id.
    pub fn insert(&mut self, handle: Handle, remote: Option<SocketAddr>, config: &Config) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections
            .insert(id, Connection::new(id, handle, remote, config));
        self.by_handle.insert(handle, id);
        id
    }

    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.connections.get_mut(&id)
    }

    pub fn id_for(&self, handle: Handle) -> Option<ConnectionId> {
        self.by_handle.get(&handle).copied()
    }

    /// Drop the entry. The caller closes the socket.
    pub fn remove(&mut self, id: ConnectionId) -> Option<Connection> {
        let conn = self.connections.remove(&id)?;
        self.by_handle.remove(&conn.handle);
        Some(conn)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    pub fn open_ids(&self) -> Vec<ConnectionId> {
        self.connections
            .values()
            .filter(|c| c.is_open())
            .map(|c| c.id)
            .collect()
    }

    /// Handles of every registered connection, in id order.
    pub fn handles(&self) -> Vec<Handle> {
        self.connections.values().map(|c| c.handle).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// No entry is `Closed`, every `Open` entry has a path and a handshake
    /// time, and the handle index matches the table.
    pub fn check_invariants(&self) -> bool {
        let entries_ok = self.connections.iter().all(|(id, c)| {
            *id == c.id
                && c.state != ConnectionState::Closed
                && (!c.is_open() || (!c.path.is_empty() && c.handshake_at.is_some()))
                && self.by_handle.get(&c.handle) == Some(id)
        });
        entries_ok && self.by_handle.len() == self.connections.len()
    }
}
