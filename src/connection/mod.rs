//! Connection bookkeeping: roles, the per-connection state machine and the
//! per-worker registry.
//!
//! ## Connection Lifecycle
//!
//! 1. **Connecting** - accepted, nothing read yet
//! 2. **Handshaking** - waiting for the full upgrade request
//! 3. **Open** - 101 sent, `on_open` fired
//! 4. **Closing** - a close frame was received or sent
//! 5. **Closed** - socket closed and removed from the registry

mod registry;
mod role;
mod state;

pub use registry::{Connection, ConnectionId, Registry};
pub use role::Role;
pub use state::ConnectionState;
