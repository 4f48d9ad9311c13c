//! Transport error types.

use fabric_protocol::ProtocolError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("address already bound: {0}")]
    AddressInUse(String),

    #[error("{op} is not supported on a {role} socket")]
    Unsupported {
        role: &'static str,
        op: &'static str,
    },

    #[error("cannot send a message with no frames")]
    EmptyMessage,

    #[error("socket closed")]
    Closed,

    #[error("zmq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
