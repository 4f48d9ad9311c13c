//! The endpoint server.
//!
//! Owns the endpoint registry and, for websocket clients, the client and room
//! registries. Connect and disconnect events from the listener keep the
//! registries current.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use fabric_transport::{ConnectionId, Hub, TransportServer};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::admin;
use crate::config::{ConfigStore, SERVER_SECTION, ServerConfig};
use crate::connection::ConnectionEndpoint;
use crate::endpoint::{ActivationState, Endpoint, EndpointDyn, EndpointId};
use crate::error::FabricError;
use crate::listener::ListenerEndpoint;
use crate::room::Room;

type ClientCallback = Arc<dyn Fn(&ConnectionEndpoint) + Send + Sync>;

/// Decides what happens to a disconnected client. `Some(false)` keeps it in
/// the client registry; anything else lets it be removed.
type DisconnectPolicy = Arc<dyn Fn(&ConnectionEndpoint) -> Option<bool> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

/// Non-owning server reference held by endpoints.
#[derive(Clone)]
pub struct WeakServer {
    inner: Weak<ServerInner>,
}

impl WeakServer {
    pub fn upgrade(&self) -> Option<Server> {
        self.inner.upgrade().map(|inner| Server { inner })
    }
}

struct ServerInner {
    settings: ServerConfig,
    config: ConfigStore,
    hub: Hub,
    /// Registered endpoints, in registration order
    endpoints: RwLock<Vec<Arc<dyn EndpointDyn>>>,
    clients: RwLock<HashMap<ConnectionId, ConnectionEndpoint>>,
    rooms: RwLock<HashMap<String, Room>>,
    client_hook: RwLock<Option<ClientCallback>>,
    disconnect_hook: RwLock<Option<DisconnectPolicy>>,
    transport: tokio::sync::Mutex<Option<TransportServer>>,
    local_addr: RwLock<Option<SocketAddr>>,
    state: Mutex<ServerState>,
}

impl Server {
    pub fn new(settings: ServerConfig) -> Self {
        let config = ConfigStore::new();
        if let Ok(section) = serde_json::to_value(&settings) {
            config.set_section(SERVER_SECTION, section);
        }
        Self::build(settings, config)
    }

    /// Build from a config store, reading settings from its `server` section.
    pub fn from_store(config: ConfigStore) -> Result<Self, FabricError> {
        let settings = ServerConfig::from_store(&config)?;
        Ok(Self::build(settings, config))
    }

    fn build(settings: ServerConfig, config: ConfigStore) -> Self {
        let hub = Hub::with_namespace(settings.namespace.clone());
        Self {
            inner: Arc::new(ServerInner {
                settings,
                config,
                hub,
                endpoints: RwLock::new(Vec::new()),
                clients: RwLock::new(HashMap::new()),
                rooms: RwLock::new(HashMap::new()),
                client_hook: RwLock::new(None),
                disconnect_hook: RwLock::new(None),
                transport: tokio::sync::Mutex::new(None),
                local_addr: RwLock::new(None),
                state: Mutex::new(ServerState::Idle),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakServer {
        WeakServer {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn settings(&self) -> &ServerConfig {
        &self.inner.settings
    }

    /// The config store served by the admin API.
    pub fn config(&self) -> ConfigStore {
        self.inner.config.clone()
    }

    /// Accept context shared with the HTTP listener.
    pub fn hub(&self) -> Hub {
        self.inner.hub.clone()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.read()
    }

    pub fn port(&self) -> Option<u16> {
        self.local_addr().map(|addr| addr.port())
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.lock() == ServerState::Running
    }

    // ── Endpoints ───────────────────────────────────────────────────────

    /// Register an endpoint. Registering the same endpoint twice is ignored.
    pub fn add_endpoint<E: Endpoint>(&self, endpoint: E) -> EndpointId {
        let id = endpoint.id();
        let mut endpoints = self.inner.endpoints.write();
        if endpoints.iter().any(|e| e.id_dyn() == id) {
            return id;
        }
        debug!("Registered {} endpoint {id}", endpoint.kind());
        endpoints.push(Arc::new(endpoint));
        id
    }

    pub fn endpoints(&self) -> Vec<EndpointId> {
        self.inner.endpoints.read().iter().map(|e| e.id_dyn()).collect()
    }

    fn endpoint(&self, id: EndpointId) -> Option<Arc<dyn EndpointDyn>> {
        self.inner
            .endpoints
            .read()
            .iter()
            .find(|e| e.id_dyn() == id)
            .cloned()
    }

    /// Activate every registered endpoint that has not been activated yet.
    pub async fn activate_endpoints(&self) -> Result<(), FabricError> {
        let endpoints: Vec<Arc<dyn EndpointDyn>> = self.inner.endpoints.read().clone();
        for endpoint in endpoints {
            if endpoint.state_dyn() != ActivationState::Inactive {
                continue;
            }
            endpoint.activate_dyn(self).await?;
            info!("Activated {} endpoint {}", endpoint.kind_dyn(), endpoint.id_dyn());
        }
        Ok(())
    }

    /// Make sure a listener is registered, activate everything, then start
    /// the HTTP listener if one is configured.
    pub async fn start_main_server(&self) -> Result<(), FabricError> {
        let has_listener = self
            .inner
            .endpoints
            .read()
            .iter()
            .any(|e| e.kind_dyn() == "listener");
        if !has_listener {
            self.add_endpoint(ListenerEndpoint::new());
        }

        self.activate_endpoints().await?;

        if let Some(transport_config) = self.inner.settings.transport.clone() {
            let mut transport = self.inner.transport.lock().await;
            if transport.is_none() {
                let admin = admin::router(self.config(), &self.inner.settings.admin_prefix);
                let server =
                    TransportServer::start(transport_config, self.hub(), admin).await?;
                *self.inner.local_addr.write() = Some(server.local_addr());
                *transport = Some(server);
            }
        }

        *self.inner.state.lock() = ServerState::Running;
        info!("Server '{}' running", self.inner.settings.name);
        Ok(())
    }

    /// Send through a registered topic endpoint.
    pub async fn send_from_endpoint(
        &self,
        id: EndpointId,
        message: Value,
    ) -> Result<(), FabricError> {
        let endpoint = self
            .endpoint(id)
            .ok_or_else(|| FabricError::NotFound(format!("endpoint {id}")))?;
        let topic = endpoint.as_topic_dyn().cloned().ok_or_else(|| {
            FabricError::InvalidOperation(format!(
                "{} endpoint {id} cannot send",
                endpoint.kind_dyn()
            ))
        })?;
        topic.send(message).await
    }

    /// Close every endpoint, room and client, then stop the HTTP listener.
    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == ServerState::Stopped {
                return;
            }
            *state = ServerState::Stopped;
        }

        let endpoints: Vec<Arc<dyn EndpointDyn>> = self.inner.endpoints.read().clone();
        for endpoint in endpoints {
            endpoint.close_dyn();
        }

        let rooms: Vec<Room> = self.inner.rooms.write().drain().map(|(_, room)| room).collect();
        for room in rooms {
            room.close();
        }

        let clients: Vec<ConnectionEndpoint> =
            self.inner.clients.write().drain().map(|(_, client)| client).collect();
        for client in clients {
            client.close();
        }

        if let Some(mut transport) = self.inner.transport.lock().await.take() {
            transport.stop().await;
        }
        *self.inner.local_addr.write() = None;
        info!("Server '{}' stopped", self.inner.settings.name);
    }

    // ── Clients ─────────────────────────────────────────────────────────

    /// Set the hook run after each new client is registered.
    pub fn onclient(&self, callback: impl Fn(&ConnectionEndpoint) + Send + Sync + 'static) {
        *self.inner.client_hook.write() = Some(Arc::new(callback));
    }

    /// Set the disconnect policy hook.
    pub fn ondisconnect(
        &self,
        callback: impl Fn(&ConnectionEndpoint) -> Option<bool> + Send + Sync + 'static,
    ) {
        *self.inner.disconnect_hook.write() = Some(Arc::new(callback));
    }

    pub fn clients(&self) -> Vec<ConnectionEndpoint> {
        self.inner.clients.read().values().cloned().collect()
    }

    pub fn client(&self, id: &str) -> Option<ConnectionEndpoint> {
        self.inner.clients.read().get(id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.inner.clients.read().len()
    }

    pub(crate) fn register_client(&self, endpoint: &ConnectionEndpoint) {
        let Some(id) = endpoint.connection_id() else {
            warn!("Refusing to register a client without a connection");
            return;
        };
        self.inner
            .clients
            .write()
            .insert(id.clone(), endpoint.clone());

        let weak = self.downgrade();
        let disconnected = id.clone();
        endpoint.on_handle_disconnect(move || {
            if let Some(server) = weak.upgrade() {
                server.client_disconnected(&disconnected);
            }
        });
        info!("Client registered: {id}");

        let hook = self.inner.client_hook.read().clone();
        if let Some(hook) = hook {
            hook(endpoint);
        }
    }

    fn client_disconnected(&self, id: &str) {
        self.forget_in_rooms(id);

        let endpoint = self.client(id);
        let policy = self.inner.disconnect_hook.read().clone();
        let keep = match (policy, endpoint) {
            (Some(policy), Some(endpoint)) => policy(&endpoint) == Some(false),
            _ => false,
        };

        if keep {
            debug!("Client {id} kept after disconnect");
        } else {
            self.expire(id);
        }
    }

    /// Close a client and drop it from the registry and every room.
    pub fn expire(&self, id: &str) -> bool {
        let endpoint = self.inner.clients.write().remove(id);
        self.forget_in_rooms(id);
        match endpoint {
            Some(endpoint) => {
                endpoint.close();
                info!("Client expired: {id}");
                true
            }
            None => false,
        }
    }

    fn forget_in_rooms(&self, id: &str) {
        let rooms: Vec<Room> = self.inner.rooms.read().values().cloned().collect();
        for room in rooms {
            room.forget(id);
        }
    }

    // ── Rooms ───────────────────────────────────────────────────────────

    /// The room called `name`, created on first use.
    pub fn room(&self, name: &str) -> Room {
        if let Some(room) = self.inner.rooms.read().get(name) {
            return room.clone();
        }
        let mut rooms = self.inner.rooms.write();
        if let Some(room) = rooms.get(name) {
            return room.clone();
        }
        let room = Room::new(name, self.hub());
        if let Err(e) = room.open(self) {
            warn!("Room {name} failed to open: {e}");
        }
        rooms.insert(name.to_string(), room.clone());
        debug!("Room created: {name}");
        room
    }

    pub fn has_room(&self, name: &str) -> bool {
        self.inner.rooms.read().contains_key(name)
    }

    /// Close a room and forget it. Every member leaves.
    pub fn close_room(&self, name: &str) -> bool {
        let room = self.inner.rooms.write().remove(name);
        match room {
            Some(room) => {
                room.close();
                true
            }
            None => false,
        }
    }

    /// Close `name` if the transport has nobody left in it.
    pub fn reclaim_room(&self, name: &str) -> bool {
        let room = self.inner.rooms.read().get(name).cloned();
        match room {
            Some(room) if room.clients().is_empty() => {
                debug!("Room {name} has no members left");
                self.close_room(name)
            }
            _ => false,
        }
    }

    /// Rooms holding `id`, sorted by name.
    pub fn rooms_of(&self, id: &str) -> Vec<Room> {
        let mut rooms: Vec<Room> = self
            .inner
            .rooms
            .read()
            .values()
            .filter(|room| room.has(id))
            .cloned()
            .collect();
        rooms.sort_by(|a, b| a.name().cmp(b.name()));
        rooms
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.inner.settings.name)
            .field("endpoints", &self.inner.endpoints.read().len())
            .field("clients", &self.client_count())
            .field("state", &*self.inner.state.lock())
            .finish()
    }
}
