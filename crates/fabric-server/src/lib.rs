//! Fabric Server: endpoints, plugin chains, rooms.
//!
//! An application registers endpoints with a [`Server`] and activates them
//! together. Two transports sit behind one lifecycle:
//! - [`TopicEndpoint`]: one publish or subscribe topic socket
//! - [`ConnectionEndpoint`]: one websocket client, surfaced by a
//!   [`ListenerEndpoint`] as clients connect
//!
//! Connections are grouped into [`Room`]s for broadcast. Messages on topic
//! sockets pass through a [`PluginChain`] on the way in and out.

pub mod admin;
pub mod config;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod listener;
pub mod plugins;
pub mod room;
pub mod server;
pub mod topic;

pub use config::{ConfigStore, ServerConfig};
pub use connection::{ConnectionEndpoint, RouteCallback};
pub use endpoint::{ActivationState, Endpoint, EndpointCore, EndpointId, RoomMember, RouteTable};
pub use error::FabricError;
pub use listener::{ConnectCallback, ListenerEndpoint};
pub use plugins::{
    FnPlugin, FrameSelect, JsonDecode, MessageRoute, Plugin, PluginChain, PluginKind, RouteMatch,
    TopicEnvelope,
};
pub use room::Room;
pub use server::{Server, WeakServer};
pub use topic::{MessageCallback, TopicEndpoint, TopicEndpointBuilder};
