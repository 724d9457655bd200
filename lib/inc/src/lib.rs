//! `inc` is the Inter-Node Communication framework of the iShell runtime:
//! a connection-oriented RPC + pub/sub + bulk-stream protocol over
//! pluggable transports (TCP, Unix stream, per-peer-multiplexed UDP), with
//! handshake negotiation, shared-memory zero-copy channels, auto-reconnect
//! and operation tracking.
//!
//! Everything here is driven by the `axon` kernel: endpoints, devices and
//! protocols are objects pinned to a thread and fed by that thread's event
//! dispatcher.

pub mod buffer;
pub mod config;
pub mod connection;
pub mod context;
pub mod device;
pub mod engine;
pub mod error;
pub mod handshake;
pub mod memory;
pub mod message;
pub mod operation;
pub mod protocol;
pub mod server;
pub mod tags;

pub mod prelude {
    pub use crate::config::{ContextConfig, ServerConfig};
    pub use crate::connection::{ConnectionRef, MODE_READ, MODE_WRITE};
    pub use crate::context::{Context, ContextState};
    pub use crate::error::{IncError, OK};
    pub use crate::message::{Message, MessageType};
    pub use crate::operation::{OpState, OperationRef};
    pub use crate::protocol::{BinaryChunk, BinaryPayload};
    pub use crate::server::Server;
}
