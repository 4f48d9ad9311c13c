//! Protocol error types.

use thiserror::Error;

/// Errors raised while decoding wire data.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The packet decoded as JSON but does not have the expected shape.
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}
