//! Utilities for integration tests.
//!
//! The `test-util` crate spins up real, in-process `meshgate` nodes — a
//! client listener, a peer listener, and the dispatch/RPC stack wired the
//! way `meshgated` wires them — bound to ephemeral ports, so integration
//! tests can exercise real TCP round-trips between two or more nodes
//! without shelling out to a subprocess.

pub type AnyError = Box<dyn std::error::Error + Send + Sync>;

mod node;
mod protocol;

pub use node::TestNode;
pub use protocol::{handshake, recv_message, send_message, send_request};
