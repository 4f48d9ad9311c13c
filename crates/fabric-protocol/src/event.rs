//! Event packets exchanged with connection endpoints.
//!
//! Every websocket text frame carries one packet:
//! `{"event": "<name>", "args": [ ... ]}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// A named event with positional JSON arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPacket {
    pub event: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

impl EventPacket {
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
        }
    }

    /// Parse a text frame. Packets without an event name are rejected.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let packet: EventPacket = serde_json::from_str(text)?;
        if packet.event.is_empty() {
            return Err(ProtocolError::InvalidPacket("empty event name".into()));
        }
        Ok(packet)
    }

    /// Encode as a text frame.
    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    /// First argument, if any.
    pub fn first_arg(&self) -> Option<&Value> {
        self.args.first()
    }
}

/// Reserved event names.
pub struct Events;

impl Events {
    // ── Connection lifecycle ────────────────────────────────────────────
    pub const CONNECTED: &str = "connected";

    // ── Rooms ───────────────────────────────────────────────────────────
    pub const JOIN: &str = "join";
    pub const LEAVE: &str = "leave";
    pub const PUBLISH: &str = "publish";

    // ── Payloads ────────────────────────────────────────────────────────
    pub const MESSAGE: &str = "message";
}
