//! In-process broker for `inproc://` addresses.
//!
//! Each name maps to one broadcast channel. Either side may bind or connect,
//! in any order; only one socket may hold the bind on a name at a time.

use std::collections::HashSet;
use std::sync::LazyLock;

use dashmap::DashMap;
use fabric_protocol::Frames;
use tokio::sync::broadcast;
use tracing::warn;

use super::{SocketMode, SocketRole, topic_matches};
use crate::error::TransportError;

const CHANNEL_CAPACITY: usize = 1024;

struct Channel {
    tx: broadcast::Sender<Frames>,
    bound: bool,
    /// Open sockets on this name; the entry goes away at zero
    sockets: usize,
}

static BROKER: LazyLock<DashMap<String, Channel>> = LazyLock::new(DashMap::new);

pub struct MemoryTopicSocket {
    name: String,
    bound: bool,
    kind: Kind,
}

enum Kind {
    Pub(broadcast::Sender<Frames>),
    Sub {
        rx: broadcast::Receiver<Frames>,
        filters: HashSet<String>,
    },
}

impl MemoryTopicSocket {
    pub(crate) fn open(
        role: SocketRole,
        name: &str,
        mode: SocketMode,
    ) -> Result<Self, TransportError> {
        let tx = {
            let mut channel = BROKER.entry(name.to_string()).or_insert_with(|| Channel {
                tx: broadcast::channel(CHANNEL_CAPACITY).0,
                bound: false,
                sockets: 0,
            });
            if mode == SocketMode::Bind {
                if channel.bound {
                    return Err(TransportError::AddressInUse(format!("inproc://{name}")));
                }
                channel.bound = true;
            }
            channel.sockets += 1;
            channel.tx.clone()
        };

        let kind = match role {
            SocketRole::Publish => Kind::Pub(tx),
            SocketRole::Subscribe => Kind::Sub {
                rx: tx.subscribe(),
                filters: HashSet::new(),
            },
        };
        Ok(Self {
            name: name.to_string(),
            bound: mode == SocketMode::Bind,
            kind,
        })
    }

    pub fn role(&self) -> SocketRole {
        match self.kind {
            Kind::Pub(_) => SocketRole::Publish,
            Kind::Sub { .. } => SocketRole::Subscribe,
        }
    }

    pub(crate) fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        let Kind::Pub(tx) = &self.kind else {
            return Err(TransportError::Unsupported {
                role: "subscribe",
                op: "send",
            });
        };
        // No subscribers means the message is dropped, as with ZeroMQ PUB.
        let _ = tx.send(frames);
        Ok(())
    }

    pub(crate) async fn recv(&mut self) -> Result<Frames, TransportError> {
        let Kind::Sub { rx, filters } = &mut self.kind else {
            return Err(TransportError::Unsupported {
                role: "publish",
                op: "recv",
            });
        };
        loop {
            match rx.recv().await {
                Ok(frames) => {
                    if filters.iter().any(|f| topic_matches(&frames, f)) {
                        return Ok(frames);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("inproc://{} subscriber lagged, {skipped} messages lost", self.name);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }

    pub(crate) fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        match &mut self.kind {
            Kind::Sub { filters, .. } => {
                filters.insert(filter.to_string());
                Ok(())
            }
            Kind::Pub(_) => Err(TransportError::Unsupported {
                role: "publish",
                op: "subscribe",
            }),
        }
    }

    pub(crate) fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        match &mut self.kind {
            Kind::Sub { filters, .. } => {
                filters.remove(filter);
                Ok(())
            }
            Kind::Pub(_) => Err(TransportError::Unsupported {
                role: "publish",
                op: "unsubscribe",
            }),
        }
    }
}

impl Drop for MemoryTopicSocket {
    fn drop(&mut self) {
        if let Some(mut channel) = BROKER.get_mut(&self.name) {
            if self.bound {
                channel.bound = false;
            }
            channel.sockets = channel.sockets.saturating_sub(1);
        }
        BROKER.remove_if(&self.name, |_, channel| channel.sockets == 0);
    }
}

/// Whether any socket is open on `name`.
pub(crate) fn has_sockets(name: &str) -> bool {
    BROKER.contains_key(name)
}
