//! Fabric Transport Layer
//!
//! The raw primitives the endpoint layer is built on:
//! - [`Hub`]: accepts connections, tracks group ("room") membership, group
//!   send and disconnect notification
//! - [`Connection`]: one accepted client link (emit, listen, join/leave)
//! - [`TransportServer`]: the HTTP listener upgrading `/ws` requests into
//!   hub connections
//! - [`TopicSocket`]: publish/subscribe sockets over ZeroMQ or an in-process
//!   broker
//!
//! Nothing here knows about endpoints, plugins or servers.

pub mod connection;
pub mod error;
pub mod hub;
pub mod server;
pub mod topic;

pub use connection::{Connection, ConnectionId, EventCallback, Outbound};
pub use error::TransportError;
pub use hub::{ConnectHook, Hub, DEFAULT_NAMESPACE};
pub use server::{TransportConfig, TransportServer};
pub use topic::{SocketMode, SocketRole, TopicSocket, inproc_in_use, topic_matches};
