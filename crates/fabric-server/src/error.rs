//! Error types for the endpoint layer.

use fabric_protocol::ProtocolError;
use fabric_transport::TransportError;
use thiserror::Error;

use crate::endpoint::EndpointId;

#[derive(Debug, Error)]
pub enum FabricError {
    #[error("endpoint {0} is already active")]
    AlreadyActive(EndpointId),

    #[error("endpoint {0} was closed and cannot be reactivated")]
    Closed(EndpointId),

    #[error("endpoint {0} is not active")]
    NotActive(EndpointId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    #[error("endpoint {0} has no connection attached")]
    NoHandle(EndpointId),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
