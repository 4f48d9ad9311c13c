//! The endpoint contract.
//!
//! Every endpoint embeds an [`EndpointCore`] holding its identity, activation
//! state and owning server. Concrete endpoints implement [`Endpoint`]; the
//! server stores them behind the object-safe `EndpointDyn` wrapper.

use std::fmt;

use fabric_transport::ConnectionId;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::FabricError;
use crate::server::{Server, WeakServer};
use crate::topic::TopicEndpoint;

/// Process-unique endpoint identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EndpointId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivationState {
    Inactive,
    Active,
    Closed,
}

// ─────────────────────────────────────────────────────────────────────────────
// EndpointCore
// ─────────────────────────────────────────────────────────────────────────────

/// Identity and lifecycle shared by every endpoint.
///
/// An endpoint activates exactly once. A second activation fails with
/// [`FabricError::AlreadyActive`], activation after close with
/// [`FabricError::Closed`].
pub struct EndpointCore {
    id: EndpointId,
    state: Mutex<ActivationState>,
    server: RwLock<Option<WeakServer>>,
}

impl EndpointCore {
    pub fn new() -> Self {
        Self {
            id: EndpointId::new(),
            state: Mutex::new(ActivationState::Inactive),
            server: RwLock::new(None),
        }
    }

    pub fn id(&self) -> EndpointId {
        self.id
    }

    pub fn state(&self) -> ActivationState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ActivationState::Active
    }

    /// Mark active and remember the owning server.
    pub fn activate(&self, server: &Server) -> Result<(), FabricError> {
        let mut state = self.state.lock();
        match *state {
            ActivationState::Active => return Err(FabricError::AlreadyActive(self.id)),
            ActivationState::Closed => return Err(FabricError::Closed(self.id)),
            ActivationState::Inactive => {}
        }
        *state = ActivationState::Active;
        *self.server.write() = Some(server.downgrade());
        Ok(())
    }

    /// Undo an activation whose resource setup failed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if *state == ActivationState::Active {
            *state = ActivationState::Inactive;
            *self.server.write() = None;
        }
    }

    /// Mark closed. Returns false when the endpoint was not active, in which
    /// case the caller has nothing to release.
    pub fn close(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ActivationState::Active {
            return false;
        }
        *state = ActivationState::Closed;
        debug!("Endpoint {} closed", self.id);
        true
    }

    /// The owning server, while it is alive.
    pub fn server(&self) -> Option<Server> {
        self.server.read().as_ref().and_then(WeakServer::upgrade)
    }
}

impl Default for EndpointCore {
    fn default() -> Self {
        Self::new()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// Uniform lifecycle over every transport binding.
pub trait Endpoint: Send + Sync + 'static {
    fn core(&self) -> &EndpointCore;

    /// Short label for logs.
    fn kind(&self) -> &'static str;

    /// Bind to `server` and acquire transport resources.
    fn activate(
        &self,
        server: &Server,
    ) -> impl std::future::Future<Output = Result<(), FabricError>> + Send;

    /// Release transport resources. No-op unless active.
    fn close(&self);

    fn id(&self) -> EndpointId {
        self.core().id()
    }

    fn state(&self) -> ActivationState {
        self.core().state()
    }

    fn is_active(&self) -> bool {
        self.core().is_active()
    }

    fn as_topic(&self) -> Option<&TopicEndpoint> {
        None
    }
}

/// Object-safe wrapper for the Endpoint trait.
pub(crate) trait EndpointDyn: Send + Sync {
    fn id_dyn(&self) -> EndpointId;
    fn kind_dyn(&self) -> &'static str;
    fn state_dyn(&self) -> ActivationState;
    fn activate_dyn<'a>(
        &'a self,
        server: &'a Server,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), FabricError>> + Send + 'a>>;
    fn close_dyn(&self);
    fn as_topic_dyn(&self) -> Option<&TopicEndpoint>;
}

impl<T: Endpoint> EndpointDyn for T {
    fn id_dyn(&self) -> EndpointId {
        self.id()
    }
    fn kind_dyn(&self) -> &'static str {
        self.kind()
    }
    fn state_dyn(&self) -> ActivationState {
        self.state()
    }
    fn activate_dyn<'a>(
        &'a self,
        server: &'a Server,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), FabricError>> + Send + 'a>>
    {
        Box::pin(self.activate(server))
    }
    fn close_dyn(&self) {
        self.close()
    }
    fn as_topic_dyn(&self) -> Option<&TopicEndpoint> {
        self.as_topic()
    }
}

/// Anything that keeps a table of named routes.
pub trait RouteTable {
    /// Remove a route. Returns whether it existed.
    fn drop_route(&self, route: &str) -> bool;

    /// Registered route names, sorted.
    fn routes(&self) -> Vec<String>;
}

/// Anything a [`crate::Room`] can hold.
pub trait RoomMember {
    /// Transport identity, once there is one.
    fn member_id(&self) -> Option<ConnectionId>;
    /// Whether the member can still take part in a group.
    fn is_connected(&self) -> bool;
    fn join(&self, group: &str);
    fn leave(&self, group: &str);
}
