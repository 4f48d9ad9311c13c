//! Connection hub: the accept context shared by the HTTP listener and the
//! endpoint layer.
//!
//! The hub owns the live connection table and the group table. Groups are the
//! transport's native notion of a room: membership lives here and group sends
//! fan out from here, so the hub is the source of truth for who actually
//! receives a broadcast.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use fabric_protocol::EventPacket;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionId, Outbound};

/// Namespace used when none is configured.
pub const DEFAULT_NAMESPACE: &str = "/";

/// Invoked for every accepted connection.
pub type ConnectHook = Arc<dyn Fn(Connection) + Send + Sync>;

#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

pub(crate) struct HubInner {
    namespace: String,
    connections: DashMap<ConnectionId, Connection>,
    /// Namespaced group name → member ids
    groups: DashMap<String, HashSet<ConnectionId>>,
    connect_hook: RwLock<Option<ConnectHook>>,
}

impl Hub {
    pub fn new() -> Self {
        Self::with_namespace(DEFAULT_NAMESPACE)
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        let mut namespace = namespace.into();
        if !namespace.starts_with('/') {
            namespace.insert(0, '/');
        }
        Self {
            inner: Arc::new(HubInner {
                namespace,
                connections: DashMap::new(),
                groups: DashMap::new(),
                connect_hook: RwLock::new(None),
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Transport-visible name of a logical group.
    pub fn group_name(&self, group: &str) -> String {
        self.inner.group_name(group)
    }

    // ── Accepting ───────────────────────────────────────────────────────

    /// Replace the hook run for each accepted connection. Connections already
    /// accepted are unaffected.
    pub fn on_connection(&self, hook: ConnectHook) {
        *self.inner.connect_hook.write() = Some(hook);
    }

    pub fn clear_connection_hook(&self) {
        *self.inner.connect_hook.write() = None;
    }

    /// Register a new connection and run the connect hook for it.
    ///
    /// The returned receiver yields everything queued for the client; whoever
    /// owns the physical socket drains it.
    pub fn accept(&self) -> (Connection, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4().to_string();
        let connection = Connection::new(
            id.clone(),
            self.inner.namespace.clone(),
            tx,
            Arc::downgrade(&self.inner),
        );
        self.inner.connections.insert(id, connection.clone());

        let hook = self.inner.connect_hook.read().clone();
        match hook {
            Some(hook) => hook(connection.clone()),
            None => warn!("Connection {} accepted with no connect hook", connection.id()),
        }

        (connection, rx)
    }

    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.inner.connections.get(id).map(|c| c.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    // ── Groups ──────────────────────────────────────────────────────────

    pub fn join(&self, id: &str, group: &str) {
        self.inner.join(id, group);
    }

    pub fn leave(&self, id: &str, group: &str) {
        self.inner.leave(id, group);
    }

    /// Current members of a group, in no particular order.
    pub fn members(&self, group: &str) -> Vec<ConnectionId> {
        self.inner
            .groups
            .get(&self.inner.group_name(group))
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn groups_of(&self, id: &str) -> Vec<String> {
        self.inner.groups_of(id)
    }

    /// Send one event to every member of a group. Returns how many
    /// connections it was queued for.
    pub fn emit_to(&self, group: &str, packet: &EventPacket) -> usize {
        let text = match packet.to_text() {
            Ok(text) => text,
            Err(e) => {
                warn!("Failed to encode {} for group {group}: {e}", packet.event);
                return 0;
            }
        };

        let members = self.members(group);
        let mut delivered = 0;
        for id in members {
            let connection = self.inner.connections.get(&id).map(|c| c.value().clone());
            if let Some(connection) = connection {
                if connection.send_text(text.clone()) {
                    delivered += 1;
                }
            }
        }
        debug!("Emitted {} to group {group} ({delivered} clients)", packet.event);
        delivered
    }
}

impl Default for Hub {
    fn default() -> Self {
        Self::new()
    }
}

impl HubInner {
    fn group_name(&self, group: &str) -> String {
        if self.namespace == DEFAULT_NAMESPACE {
            group.to_string()
        } else {
            format!("{}/{}", self.namespace, group)
        }
    }

    fn logical_name(&self, key: &str) -> String {
        if self.namespace == DEFAULT_NAMESPACE {
            return key.to_string();
        }
        key.strip_prefix(&self.namespace)
            .and_then(|rest| rest.strip_prefix('/'))
            .unwrap_or(key)
            .to_string()
    }

    pub(crate) fn join(&self, id: &str, group: &str) {
        if !self.connections.contains_key(id) {
            return;
        }
        self.groups
            .entry(self.group_name(group))
            .or_default()
            .insert(id.to_string());
    }

    pub(crate) fn leave(&self, id: &str, group: &str) {
        let key = self.group_name(group);
        let now_empty = match self.groups.get_mut(&key) {
            Some(mut members) => {
                members.remove(id);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.groups.remove_if(&key, |_, members| members.is_empty());
        }
    }

    pub(crate) fn groups_of(&self, id: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .groups
            .iter()
            .filter(|entry| entry.value().contains(id))
            .map(|entry| self.logical_name(entry.key()))
            .collect();
        groups.sort();
        groups
    }

    /// Forget a connection: leave every group, drop it from the table.
    pub(crate) fn release(&self, id: &str) {
        for group in self.groups_of(id) {
            self.leave(id, &group);
        }
        self.connections.remove(id);
    }
}
