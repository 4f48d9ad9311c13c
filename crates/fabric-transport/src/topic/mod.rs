//! Publish/subscribe topic sockets.
//!
//! `tcp://` and `ipc://` addresses go over ZeroMQ. `inproc://` addresses use
//! an in-process broker with the same prefix-filter semantics, which keeps
//! tests and single-process deployments off the network.

mod memory;
mod zmq;

use fabric_protocol::Frames;
use tracing::debug;

use crate::error::TransportError;

pub use memory::MemoryTopicSocket;
pub use zmq::ZmqTopicSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    Publish,
    Subscribe,
}

impl SocketRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Subscribe => "subscribe",
        }
    }
}

/// Whether the socket owns the address or attaches to a peer that does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMode {
    Bind,
    Connect,
}

pub enum TopicSocket {
    Zmq(ZmqTopicSocket),
    Memory(MemoryTopicSocket),
}

impl TopicSocket {
    /// Open a socket and bind or connect it to `address`.
    pub async fn open(
        role: SocketRole,
        address: &str,
        mode: SocketMode,
    ) -> Result<Self, TransportError> {
        let (scheme, rest) = address
            .split_once("://")
            .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;
        if rest.is_empty() {
            return Err(TransportError::InvalidAddress(address.to_string()));
        }

        let socket = match scheme {
            "tcp" => {
                let resolved = resolve_tcp(rest).await?;
                Self::Zmq(ZmqTopicSocket::open(role, &resolved, mode).await?)
            }
            "ipc" => Self::Zmq(ZmqTopicSocket::open(role, address, mode).await?),
            "inproc" => Self::Memory(MemoryTopicSocket::open(role, rest, mode)?),
            _ => return Err(TransportError::InvalidAddress(address.to_string())),
        };
        debug!("Opened {} socket on {address} ({mode:?})", role.as_str());
        Ok(socket)
    }

    pub fn role(&self) -> SocketRole {
        match self {
            Self::Zmq(s) => s.role(),
            Self::Memory(s) => s.role(),
        }
    }

    pub async fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        if frames.is_empty() {
            return Err(TransportError::EmptyMessage);
        }
        match self {
            Self::Zmq(s) => s.send(frames).await,
            Self::Memory(s) => s.send(frames),
        }
    }

    /// Wait for the next message that passes the subscription filters.
    pub async fn recv(&mut self) -> Result<Frames, TransportError> {
        match self {
            Self::Zmq(s) => s.recv().await,
            Self::Memory(s) => s.recv().await,
        }
    }

    pub async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        match self {
            Self::Zmq(s) => s.subscribe(filter).await,
            Self::Memory(s) => s.subscribe(filter),
        }
    }

    pub async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        match self {
            Self::Zmq(s) => s.unsubscribe(filter).await,
            Self::Memory(s) => s.unsubscribe(filter),
        }
    }
}

impl std::fmt::Debug for TopicSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Self::Zmq(_) => "zmq",
            Self::Memory(_) => "inproc",
        };
        f.debug_struct("TopicSocket")
            .field("kind", &kind)
            .field("role", &self.role())
            .finish()
    }
}

/// Whether an `inproc://` address still has a socket open on it.
pub fn inproc_in_use(address: &str) -> bool {
    address
        .strip_prefix("inproc://")
        .is_some_and(memory::has_sockets)
}

/// Prefix match of `filter` against the first frame. An empty filter
/// matches everything, including a message with no frames.
pub fn topic_matches(frames: &[String], filter: &str) -> bool {
    if filter.is_empty() {
        return true;
    }
    frames
        .first()
        .is_some_and(|topic| topic.starts_with(filter))
}

/// Rewrite `host:port` into `tcp://ip:port`. ZeroMQ wants literal IPs.
async fn resolve_tcp(authority: &str) -> Result<String, TransportError> {
    let invalid = || TransportError::InvalidAddress(format!("tcp://{authority}"));

    let (host, port) = authority.rsplit_once(':').ok_or_else(invalid)?;
    let port: u16 = port.parse().map_err(|_| invalid())?;

    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host == "*" {
        return Ok(format!("tcp://0.0.0.0:{port}"));
    }
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(match ip {
            std::net::IpAddr::V4(v4) => format!("tcp://{v4}:{port}"),
            std::net::IpAddr::V6(v6) => format!("tcp://[{v6}]:{port}"),
        });
    }

    let mut addrs = tokio::net::lookup_host((host, port)).await?;
    let addr = addrs.next().ok_or_else(invalid)?;
    debug!("Resolved {host} to {}", addr.ip());
    Ok(format!("tcp://{addr}"))
}

