//! Device transport.
//!
//! `ConnectionClient` drives one persistent link through its lifecycle and
//! hands events to a `ConnectionHandler`; `ReconnectSupervisor` keeps it
//! alive. Links come from a `Connector`: WebSocket in production, channels in
//! tests.

pub mod client;
mod link;
pub mod memory;
pub mod protocol;
pub mod supervisor;
pub mod ws;

pub use client::{
    join_with_timeout, ClientCell, ConnectionClient, ConnectionHandler, ConnectionState,
    NoopHandler,
};
pub use link::{Connector, Incoming, Link};
pub use memory::{MemoryConnector, MemoryPeer};
pub use protocol::{Command, Notification, Resolution};
pub use supervisor::ReconnectSupervisor;
pub use ws::WsConnector;
