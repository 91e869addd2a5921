//! # wsd - multi-process RFC 6455 WebSocket server
//!
//! A master process keeps a fixed number of worker processes alive. Every
//! worker shares one listening socket and runs a single-threaded dispatch
//! loop over a pluggable transport driver.
//!
//! ## Layers
//!
//! - [`protocol`]: frame codec, reassembly, opening handshake
//! - [`transport`]: the driver trait and its socket, stream and event-loop
//!   implementations
//! - [`connection`]: per-connection state machine and the worker's registry
//! - [`server`]: dispatch loop, application callbacks, send/broadcast
//! - [`supervisor`]: worker processes and signal handling
//! - [`client`]: a small blocking client
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::atomic::AtomicBool;
//! use wsd::server::{Handler, Router, Server};
//! use wsd::{ConnectionId, Message, ServerConfig};
//!
//! struct Echo;
//!
//! impl Handler for Echo {
//!     fn on_message(&mut self, id: ConnectionId, message: Message, router: &mut Router<'_>) {
//!         router.send_to(id, &message);
//!     }
//! }
//!
//! let mut server = Server::bind(Echo, ServerConfig::new("0.0.0.0", 8080))?;
//! server.run(&AtomicBool::new(false))?;
//! # Ok::<(), wsd::Error>(())
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod message;
pub mod protocol;
pub mod server;
pub mod supervisor;
pub mod transport;

pub use client::Client;
pub use config::{Config, Limits, ServerConfig, SupervisorConfig, Timeouts};
pub use connection::{Connection, ConnectionId, ConnectionState, Registry, Role};
pub use error::{Error, Result};
pub use message::{CloseCode, CloseFrame, Message};
pub use protocol::{HandshakeRequest, HandshakeResponse, OpCode, WS_GUID, compute_accept_key};
pub use server::{Broadcast, Delivery, Handler, Router, Server};
pub use transport::{DriverKind, Handle, Transport};
