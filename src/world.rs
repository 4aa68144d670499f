//! Capability interface the reconciliation core uses to talk to the world
//! engine. The core never sees concrete engine types; an adapter implements
//! [`WorldEngine`] and hands [`WorldContext`] views to scheduled tasks.

use crate::types::{BlockPos, EntityKind, NetworkId, OwnerId, Position, StableId, TransientRef};

/// Identity tag written onto a live entity so scans can recognise it.
#[derive(Clone, Debug, PartialEq)]
pub struct IdentityMarker {
    pub stable_id: StableId,
    pub owner: OwnerId,
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LiveEntity {
    pub transient: TransientRef,
    pub network_id: Option<NetworkId>,
    pub kind: Option<EntityKind>,
    pub position: Position,
    pub marker: Option<IdentityMarker>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemovalCause {
    /// The surrounding area was unloaded or the engine culled the entity.
    Unloaded,
    /// Removed by some other system; no further information.
    Discarded,
    Died,
    EnteredContainer(BlockPos),
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemovedEntity {
    pub transient: TransientRef,
    pub network_id: Option<NetworkId>,
    pub kind: Option<EntityKind>,
    pub position: Position,
    pub marker: Option<IdentityMarker>,
    pub cause: RemovalCause,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdditionSource {
    /// Freshly created by the simulation (natural spawn, breeding, commands).
    Spawned,
    /// Re-materialised from engine storage, e.g. when an area loads.
    Loaded,
    ContainerExit(BlockPos),
    /// Let out of a portable capture tool by a user.
    Released { by: OwnerId },
}

#[derive(Clone, Debug, PartialEq)]
pub struct AddedEntity {
    pub entity: LiveEntity,
    pub source: AdditionSource,
}

/// View of one world, only valid on that world's owning context.
pub trait WorldContext {
    fn world(&self) -> &str;

    /// Every loaded entity that currently carries an identity marker.
    fn marked_entities(&self) -> Vec<LiveEntity>;

    fn entity(&self, transient: TransientRef) -> Option<LiveEntity>;

    fn entity_exists(&self, transient: TransientRef) -> bool {
        self.entity(transient).is_some()
    }

    fn find_by_network_id(&self, network_id: NetworkId) -> Option<LiveEntity>;

    fn position_of(&self, transient: TransientRef) -> Option<Position> {
        self.entity(transient).map(|entity| entity.position)
    }

    /// Positions of connected users; respawns only happen near one of them.
    fn observers(&self) -> Vec<Position>;

    fn spawn(
        &mut self,
        kind: Option<&EntityKind>,
        at: &Position,
        marker: &IdentityMarker,
    ) -> Option<TransientRef>;

    fn remove(&mut self, transient: TransientRef) -> bool;

    /// Writes (or clears, with `None`) the identity marker and nameplate data.
    fn set_marker(&mut self, transient: TransientRef, marker: Option<&IdentityMarker>) -> bool;
}

pub type WorldTask = Box<dyn FnOnce(&mut dyn WorldContext) + Send + 'static>;

pub trait WorldEngine: Send + Sync {
    fn worlds(&self) -> Vec<String>;

    /// Schedules `task` on the world's owning context. May run later on
    /// another thread. Returns false if the world is unknown.
    fn execute(&self, world: &str, task: WorldTask) -> bool;
}
