//! Connection endpoints: one websocket client behind the endpoint lifecycle.
//!
//! Routes are kept on the endpoint and wired onto whatever connection handle
//! is attached, so routes registered early are replayed at attach time. Every
//! operation that needs the client quietly does nothing once it is gone.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use fabric_transport::{Connection, ConnectionId};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info};

use crate::endpoint::{Endpoint, EndpointCore, RoomMember, RouteTable};
use crate::error::FabricError;
use crate::server::Server;

/// Handles one inbound event. Receives the endpoint and the packet arguments.
pub type RouteCallback = Arc<dyn Fn(&ConnectionEndpoint, &[Value]) + Send + Sync>;

type DisconnectCallback = Box<dyn FnOnce(&ConnectionEndpoint) + Send>;

#[derive(Clone)]
pub struct ConnectionEndpoint {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    core: EndpointCore,
    handle: RwLock<Option<Connection>>,
    routes: RwLock<HashMap<String, RouteCallback>>,
    on_disconnect: Mutex<Option<DisconnectCallback>>,
}

impl ConnectionEndpoint {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ConnectionInner {
                core: EndpointCore::new(),
                handle: RwLock::new(None),
                routes: RwLock::new(HashMap::new()),
                on_disconnect: Mutex::new(None),
            }),
        }
    }

    /// A new endpoint with `handle` already attached.
    pub fn with_handle(handle: Connection) -> Self {
        let endpoint = Self::new();
        endpoint.attach(handle);
        endpoint
    }

    // ── Handle ──────────────────────────────────────────────────────────

    /// Attach a connection handle, replacing any previous one, and wire every
    /// registered route onto it.
    pub fn attach(&self, handle: Connection) {
        let previous = self.inner.handle.write().replace(handle.clone());
        if let Some(previous) = previous {
            if previous.id() != handle.id() {
                previous.remove_all_listeners();
            }
        }

        let routes: Vec<(String, RouteCallback)> = self
            .inner
            .routes
            .read()
            .iter()
            .map(|(name, cb)| (name.clone(), cb.clone()))
            .collect();
        for (route, callback) in routes {
            self.wire(&handle, &route, callback);
        }

        let weak = Arc::downgrade(&self.inner);
        let attached_id = handle.id().to_string();
        handle.on_disconnect(move || {
            if let Some(inner) = weak.upgrade() {
                ConnectionEndpoint { inner }.handle_disconnected(&attached_id);
            }
        });
    }

    pub fn handle(&self) -> Option<Connection> {
        self.inner.handle.read().clone()
    }

    /// Transport identity of the attached connection.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.handle.read().as_ref().map(|h| h.id().to_string())
    }

    pub fn namespace(&self) -> Option<String> {
        self.inner.handle.read().as_ref().map(|h| h.namespace().to_string())
    }

    /// Whether a live connection is attached.
    pub fn is_connected(&self) -> bool {
        self.inner
            .handle
            .read()
            .as_ref()
            .is_some_and(|h| !h.is_disconnected())
    }

    fn live_handle(&self) -> Option<Connection> {
        self.inner
            .handle
            .read()
            .as_ref()
            .filter(|h| !h.is_disconnected())
            .cloned()
    }

    /// Activate against `server`, attaching `handle` first when given.
    pub fn activate_with(
        &self,
        server: &Server,
        handle: Option<Connection>,
    ) -> Result<(), FabricError> {
        if let Some(handle) = handle {
            self.attach(handle);
        } else if self.inner.handle.read().is_none() {
            return Err(FabricError::NoHandle(self.inner.core.id()));
        }
        self.inner.core.activate(server)
    }

    // ── Routes ──────────────────────────────────────────────────────────

    /// Register or overwrite the route for inbound event `route`.
    pub fn on(
        &self,
        route: impl Into<String>,
        callback: impl Fn(&ConnectionEndpoint, &[Value]) + Send + Sync + 'static,
    ) {
        let route = route.into();
        let callback: RouteCallback = Arc::new(callback);
        self.inner
            .routes
            .write()
            .insert(route.clone(), callback.clone());
        if let Some(handle) = self.handle() {
            self.wire(&handle, &route, callback);
        }
    }

    fn wire(&self, handle: &Connection, route: &str, callback: RouteCallback) {
        let weak: Weak<ConnectionInner> = Arc::downgrade(&self.inner);
        handle.on(
            route,
            Arc::new(move |args: &[Value]| {
                if let Some(inner) = weak.upgrade() {
                    callback(&ConnectionEndpoint { inner }, args);
                }
            }),
        );
    }

    // ── Outbound ────────────────────────────────────────────────────────

    /// Send an event to the client. Returns false, without error, when there
    /// is no live connection.
    pub fn emit(&self, event: &str, args: Vec<Value>) -> bool {
        match self.live_handle() {
            Some(handle) => handle.emit(event, args),
            None => false,
        }
    }

    pub fn join(&self, room: &str) {
        if let Some(handle) = self.live_handle() {
            handle.join(room);
        }
    }

    pub fn leave(&self, room: &str) {
        if let Some(handle) = self.live_handle() {
            handle.leave(room);
        }
    }

    /// Logical names of the rooms the connection is in on the transport.
    pub fn rooms(&self) -> Vec<String> {
        self.handle().map(|h| h.groups()).unwrap_or_default()
    }

    // ── Disconnect ──────────────────────────────────────────────────────

    /// Run `callback` once, with this endpoint, when the client goes away.
    /// If the attached client is already gone it runs immediately.
    pub fn ondisconnect(&self, callback: impl FnOnce(&ConnectionEndpoint) + Send + 'static) {
        *self.inner.on_disconnect.lock() = Some(Box::new(callback));
        if self.handle().is_some_and(|h| h.is_disconnected()) {
            self.run_disconnect_callback();
        }
    }

    /// Run `hook` when the attached connection goes away. Used by the server
    /// for registry upkeep, independent of [`ConnectionEndpoint::ondisconnect`].
    pub(crate) fn on_handle_disconnect(&self, hook: impl FnOnce() + Send + 'static) {
        if let Some(handle) = self.handle() {
            handle.on_disconnect(hook);
        }
    }

    fn handle_disconnected(&self, connection_id: &str) {
        if self.connection_id().as_deref() != Some(connection_id) {
            return;
        }
        debug!("Connection endpoint {} lost client {connection_id}", self.inner.core.id());
        self.run_disconnect_callback();
    }

    fn run_disconnect_callback(&self) {
        let callback = self.inner.on_disconnect.lock().take();
        if let Some(callback) = callback {
            callback(self);
        }
    }

    // ── Per-connection store ────────────────────────────────────────────

    /// Keep a value with the connection. Ignored without a handle.
    pub fn store(&self, key: &str, value: Value) {
        if let Some(handle) = self.handle() {
            handle.set(key, value);
        }
    }

    pub fn retrieve(&self, key: &str) -> Option<Value> {
        self.handle().and_then(|h| h.get(key))
    }
}

impl Default for ConnectionEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint for ConnectionEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.inner.core
    }

    fn kind(&self) -> &'static str {
        "connection"
    }

    async fn activate(&self, server: &Server) -> Result<(), FabricError> {
        self.activate_with(server, None)
    }

    fn close(&self) {
        if !self.inner.core.close() {
            return;
        }
        if let Some(handle) = self.handle() {
            handle.remove_all_listeners();
            handle.disconnect();
            info!("Closed connection endpoint for {}", handle.id());
        }
    }
}

impl RouteTable for ConnectionEndpoint {
    fn drop_route(&self, route: &str) -> bool {
        let existed = self.inner.routes.write().remove(route).is_some();
        if let Some(handle) = self.handle() {
            handle.off(route);
        }
        existed
    }

    fn routes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.routes.read().keys().cloned().collect();
        names.sort();
        names
    }
}

impl RoomMember for ConnectionEndpoint {
    fn member_id(&self) -> Option<ConnectionId> {
        self.connection_id()
    }

    fn is_connected(&self) -> bool {
        ConnectionEndpoint::is_connected(self)
    }

    fn join(&self, group: &str) {
        ConnectionEndpoint::join(self, group);
    }

    fn leave(&self, group: &str) {
        ConnectionEndpoint::leave(self, group);
    }
}

impl std::fmt::Debug for ConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("id", &self.inner.core.id())
            .field("connection", &self.connection_id())
            .field("active", &self.inner.core.is_active())
            .finish()
    }
}
