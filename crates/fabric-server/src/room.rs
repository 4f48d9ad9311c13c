//! Rooms: named groups of connections.
//!
//! The transport's group table decides who receives a broadcast and who is
//! listed by [`Room::clients`]. The local member set answers [`Room::has`]
//! and is brought back in line with the transport whenever `clients` runs.

use std::collections::HashSet;
use std::sync::Arc;

use fabric_protocol::EventPacket;
use fabric_transport::{ConnectionId, Hub};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::endpoint::{Endpoint, EndpointCore, RoomMember};
use crate::error::FabricError;
use crate::server::Server;

#[derive(Clone)]
pub struct Room {
    inner: Arc<RoomInner>,
}

struct RoomInner {
    core: EndpointCore,
    name: String,
    hub: Hub,
    members: RwLock<HashSet<ConnectionId>>,
}

impl Room {
    pub(crate) fn new(name: impl Into<String>, hub: Hub) -> Self {
        Self {
            inner: Arc::new(RoomInner {
                core: EndpointCore::new(),
                name: name.into(),
                hub,
                members: RwLock::new(HashSet::new()),
            }),
        }
    }

    pub(crate) fn open(&self, server: &Server) -> Result<(), FabricError> {
        self.inner.core.activate(server)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Group name as the transport sees it.
    pub fn group_name(&self) -> String {
        self.inner.hub.group_name(&self.inner.name)
    }

    /// Add a member. Fails when it has no transport identity yet; a member
    /// that has already disconnected is ignored.
    pub fn include(&self, member: &impl RoomMember) -> Result<(), FabricError> {
        let id = member.member_id().ok_or_else(|| {
            FabricError::InvalidOperation(format!(
                "include into {} without a connection",
                self.inner.name
            ))
        })?;
        if !member.is_connected() {
            debug!("Room {} ignored disconnected client {id}", self.inner.name);
            return Ok(());
        }
        self.inner.members.write().insert(id.clone());
        member.join(&self.inner.name);
        // Lost the race with a disconnect whose cleanup already ran.
        if !member.is_connected() {
            self.inner.members.write().remove(&id);
        }
        Ok(())
    }

    pub fn exclude(&self, member: &impl RoomMember) {
        if let Some(id) = member.member_id() {
            self.inner.members.write().remove(&id);
        }
        member.leave(&self.inner.name);
    }

    /// Send an event to everyone the transport has in the group. Returns how
    /// many clients it was queued for.
    pub fn broadcast(&self, event: &str, args: Vec<Value>) -> usize {
        self.inner
            .hub
            .emit_to(&self.inner.name, &EventPacket::new(event, args))
    }

    pub fn has(&self, id: &str) -> bool {
        self.inner.members.read().contains(id)
    }

    /// Live members according to the transport, sorted. The local set is
    /// replaced with what the transport reports.
    pub fn clients(&self) -> Vec<ConnectionId> {
        let mut live = self.inner.hub.members(&self.inner.name);
        live.sort();
        let mut members = self.inner.members.write();
        let stale = members.iter().filter(|id| !live.contains(id)).count();
        if stale > 0 {
            debug!("Room {} pruned {stale} stale members", self.inner.name);
        }
        *members = live.iter().cloned().collect();
        live
    }

    pub fn member_count(&self) -> usize {
        self.inner.members.read().len()
    }

    /// Drop `id` from the local set only.
    pub(crate) fn forget(&self, id: &str) -> bool {
        self.inner.members.write().remove(id)
    }
}

impl Endpoint for Room {
    fn core(&self) -> &EndpointCore {
        &self.inner.core
    }

    fn kind(&self) -> &'static str {
        "room"
    }

    async fn activate(&self, server: &Server) -> Result<(), FabricError> {
        self.open(server)
    }

    /// Every member leaves the transport group, then the room is released.
    fn close(&self) {
        for id in self.inner.hub.members(&self.inner.name) {
            self.inner.hub.leave(&id, &self.inner.name);
        }
        self.inner.members.write().clear();
        if self.inner.core.close() {
            debug!("Room {} closed", self.inner.name);
        }
    }
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Room")
            .field("name", &self.inner.name)
            .field("members", &self.member_count())
            .finish()
    }
}
