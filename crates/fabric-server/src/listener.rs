//! Listener endpoint: turns accepted connections into connection endpoints.

use std::sync::Arc;

use fabric_transport::{Connection, Hub};
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::connection::ConnectionEndpoint;
use crate::endpoint::{Endpoint, EndpointCore};
use crate::error::FabricError;
use crate::server::Server;

/// Receives every newly connected, already registered client.
pub type ConnectCallback = Arc<dyn Fn(ConnectionEndpoint) + Send + Sync>;

#[derive(Clone)]
pub struct ListenerEndpoint {
    inner: Arc<ListenerInner>,
}

struct ListenerInner {
    core: EndpointCore,
    callback: RwLock<Option<ConnectCallback>>,
    hub: RwLock<Option<Hub>>,
}

impl ListenerEndpoint {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ListenerInner {
                core: EndpointCore::new(),
                callback: RwLock::new(None),
                hub: RwLock::new(None),
            }),
        }
    }

    /// Replace the connect callback. Takes effect from the next connection.
    pub fn onconnect(&self, callback: impl Fn(ConnectionEndpoint) + Send + Sync + 'static) {
        *self.inner.callback.write() = Some(Arc::new(callback));
    }
}

impl Default for ListenerEndpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerInner {
    fn accept(&self, server: &Server, connection: Connection) {
        let endpoint = ConnectionEndpoint::new();
        if let Err(e) = endpoint.activate_with(server, Some(connection.clone())) {
            warn!("Dropping connection {}: {e}", connection.id());
            connection.disconnect();
            return;
        }
        server.register_client(&endpoint);

        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => callback(endpoint),
            None => debug!("No connect callback for {}", connection.id()),
        }
    }
}

impl Endpoint for ListenerEndpoint {
    fn core(&self) -> &EndpointCore {
        &self.inner.core
    }

    fn kind(&self) -> &'static str {
        "listener"
    }

    async fn activate(&self, server: &Server) -> Result<(), FabricError> {
        self.inner.core.activate(server)?;

        let hub = server.hub();
        let weak = Arc::downgrade(&self.inner);
        let weak_server = server.downgrade();
        hub.on_connection(Arc::new(move |connection: Connection| {
            let (Some(inner), Some(server)) = (weak.upgrade(), weak_server.upgrade()) else {
                connection.disconnect();
                return;
            };
            inner.accept(&server, connection);
        }));
        *self.inner.hub.write() = Some(hub);
        debug!("Listener endpoint {} accepting", self.inner.core.id());
        Ok(())
    }

    fn close(&self) {
        if !self.inner.core.close() {
            return;
        }
        if let Some(hub) = self.inner.hub.write().take() {
            hub.clear_connection_hook();
        }
    }
}
