//! Fabric - Protocol Types
//!
//! Wire-level types shared by the transport and server crates. Topic sockets
//! exchange [`Frames`] (ordered string frames); connection endpoints exchange
//! [`EventPacket`]s encoded as JSON text frames. Payload semantics beyond that
//! belong to the plugins attached to an endpoint.

pub mod error;
pub mod event;
pub mod frames;

pub use error::ProtocolError;
pub use event::{EventPacket, Events};
pub use frames::{Frames, decode_frames, frames_to_value, value_to_frames};
