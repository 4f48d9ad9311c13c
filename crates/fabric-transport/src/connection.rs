//! Client connection handles.
//!
//! A [`Connection`] is the transport-side view of one accepted client. It is
//! cheap to clone; every clone refers to the same link. Outbound packets are
//! queued on an unbounded channel drained by the socket task that owns the
//! actual websocket, so emitting never blocks the caller.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::sync::atomic::{AtomicBool, Ordering};

use fabric_protocol::EventPacket;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::hub::HubInner;

/// Transport identity of a connection.
pub type ConnectionId = String;

/// Listener for one inbound event name. Receives the packet arguments.
pub type EventCallback = Arc<dyn Fn(&[Value]) + Send + Sync>;

type DisconnectHook = Box<dyn FnOnce() + Send>;

/// Frames queued for the socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// An encoded event packet.
    Text(String),
    /// Close the socket.
    Close,
}

#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

struct ConnectionShared {
    id: ConnectionId,
    namespace: String,
    outbound: mpsc::UnboundedSender<Outbound>,
    hub: Weak<HubInner>,
    listeners: RwLock<HashMap<String, EventCallback>>,
    disconnect_hooks: Mutex<Vec<DisconnectHook>>,
    disconnected: AtomicBool,
    store: RwLock<HashMap<String, Value>>,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        namespace: String,
        outbound: mpsc::UnboundedSender<Outbound>,
        hub: Weak<HubInner>,
    ) -> Self {
        Self {
            shared: Arc::new(ConnectionShared {
                id,
                namespace,
                outbound,
                hub,
                listeners: RwLock::new(HashMap::new()),
                disconnect_hooks: Mutex::new(Vec::new()),
                disconnected: AtomicBool::new(false),
                store: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Queue an event for this client. Returns false if the client is gone.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        if self.is_disconnected() {
            return false;
        }
        match EventPacket::new(event, args).to_text() {
            Ok(text) => self.send_text(text),
            Err(e) => {
                debug!("Failed to encode {event} for {}: {e}", self.shared.id);
                false
            }
        }
    }

    /// Queue an already encoded packet.
    pub fn send_text(&self, text: String) -> bool {
        if self.is_disconnected() {
            return false;
        }
        self.shared.outbound.send(Outbound::Text(text)).is_ok()
    }

    // ── Inbound listeners ───────────────────────────────────────────────

    /// Register (or replace) the listener for `event`.
    pub fn on(&self, event: &str, callback: EventCallback) {
        self.shared.listeners.write().insert(event.to_string(), callback);
    }

    /// Remove the listener for `event`.
    pub fn off(&self, event: &str) -> bool {
        self.shared.listeners.write().remove(event).is_some()
    }

    pub fn has_listener(&self, event: &str) -> bool {
        self.shared.listeners.read().contains_key(event)
    }

    /// Drop every event listener. Disconnect hooks are kept.
    pub fn remove_all_listeners(&self) {
        self.shared.listeners.write().clear();
    }

    /// Hand an inbound packet to its listener. Returns false when nobody listens.
    pub fn dispatch(&self, packet: &EventPacket) -> bool {
        let callback = self.shared.listeners.read().get(&packet.event).cloned();
        match callback {
            Some(callback) => {
                callback(&packet.args);
                true
            }
            None => {
                trace!("No listener for {} on {}", packet.event, self.shared.id);
                false
            }
        }
    }

    // ── Groups ──────────────────────────────────────────────────────────

    /// Join a group in this connection's namespace. No-op once disconnected.
    pub fn join(&self, group: &str) {
        if self.is_disconnected() {
            return;
        }
        if let Some(hub) = self.shared.hub.upgrade() {
            hub.join(&self.shared.id, group);
        }
    }

    /// Leave a group. No-op once disconnected.
    pub fn leave(&self, group: &str) {
        if self.is_disconnected() {
            return;
        }
        if let Some(hub) = self.shared.hub.upgrade() {
            hub.leave(&self.shared.id, group);
        }
    }

    /// Logical names of the groups this connection is in.
    pub fn groups(&self) -> Vec<String> {
        self.shared
            .hub
            .upgrade()
            .map(|hub| hub.groups_of(&self.shared.id))
            .unwrap_or_default()
    }

    // ── Disconnect ──────────────────────────────────────────────────────

    /// Run `hook` once when the connection goes away. If it is already gone
    /// the hook runs immediately.
    pub fn on_disconnect(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut hooks = self.shared.disconnect_hooks.lock();
            if !self.is_disconnected() {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Force the connection closed. Idempotent; hooks fire on the first call
    /// only, after the hub has forgotten the connection.
    pub fn disconnect(&self) {
        let hooks = {
            let mut hooks = self.shared.disconnect_hooks.lock();
            if self.shared.disconnected.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *hooks)
        };

        let _ = self.shared.outbound.send(Outbound::Close);
        if let Some(hub) = self.shared.hub.upgrade() {
            hub.release(&self.shared.id);
        }
        debug!("Connection {} disconnected", self.shared.id);

        for hook in hooks {
            hook();
        }
    }

    // ── Per-connection store ────────────────────────────────────────────

    pub fn set(&self, key: &str, value: Value) {
        self.shared.store.write().insert(key.to_string(), value);
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.shared.store.read().get(key).cloned()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.shared.id)
            .field("namespace", &self.shared.namespace)
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}
