//! ZeroMQ PUB/SUB sockets (`tcp://`, `ipc://`).

use std::collections::HashSet;

use bytes::Bytes;
use fabric_protocol::{Frames, decode_frames};
use tracing::debug;
use zeromq::{PubSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use super::{SocketMode, SocketRole};
use crate::error::TransportError;

pub enum ZmqTopicSocket {
    Pub(PubSocket),
    Sub {
        socket: SubSocket,
        subscriptions: HashSet<String>,
    },
}

impl ZmqTopicSocket {
    pub(crate) async fn open(
        role: SocketRole,
        address: &str,
        mode: SocketMode,
    ) -> Result<Self, TransportError> {
        match role {
            SocketRole::Publish => {
                let mut socket = PubSocket::new();
                attach(&mut socket, address, mode).await?;
                Ok(Self::Pub(socket))
            }
            SocketRole::Subscribe => {
                let mut socket = SubSocket::new();
                attach(&mut socket, address, mode).await?;
                Ok(Self::Sub {
                    socket,
                    subscriptions: HashSet::new(),
                })
            }
        }
    }

    pub fn role(&self) -> SocketRole {
        match self {
            Self::Pub(_) => SocketRole::Publish,
            Self::Sub { .. } => SocketRole::Subscribe,
        }
    }

    pub(crate) async fn send(&mut self, frames: Frames) -> Result<(), TransportError> {
        let Self::Pub(socket) = self else {
            return Err(TransportError::Unsupported {
                role: "subscribe",
                op: "send",
            });
        };

        let mut frames = frames.into_iter();
        let first = frames.next().ok_or(TransportError::EmptyMessage)?;
        let mut message = ZmqMessage::from(first);
        for frame in frames {
            message.push_back(Bytes::from(frame));
        }
        socket.send(message).await?;
        Ok(())
    }

    pub(crate) async fn recv(&mut self) -> Result<Frames, TransportError> {
        let Self::Sub { socket, .. } = self else {
            return Err(TransportError::Unsupported {
                role: "publish",
                op: "recv",
            });
        };
        let message = socket.recv().await?;
        Ok(decode_frames(message.into_vec()))
    }

    pub(crate) async fn subscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        let Self::Sub {
            socket,
            subscriptions,
        } = self
        else {
            return Err(TransportError::Unsupported {
                role: "publish",
                op: "subscribe",
            });
        };
        if subscriptions.insert(filter.to_string()) {
            socket.subscribe(filter).await?;
            debug!("Subscribed to '{filter}'");
        }
        Ok(())
    }

    pub(crate) async fn unsubscribe(&mut self, filter: &str) -> Result<(), TransportError> {
        let Self::Sub {
            socket,
            subscriptions,
        } = self
        else {
            return Err(TransportError::Unsupported {
                role: "publish",
                op: "unsubscribe",
            });
        };
        if subscriptions.remove(filter) {
            socket.unsubscribe(filter).await?;
            debug!("Unsubscribed from '{filter}'");
        }
        Ok(())
    }
}

async fn attach<S: Socket>(
    socket: &mut S,
    address: &str,
    mode: SocketMode,
) -> Result<(), TransportError> {
    match mode {
        SocketMode::Bind => {
            socket.bind(address).await?;
        }
        SocketMode::Connect => {
            socket.connect(address).await?;
        }
    }
    Ok(())
}
