//! Durable identities for simulated world entities whose engine handles are
//! destroyed and recreated whenever they leave the live simulation.

pub mod capture;
pub mod config;
pub mod events;
pub mod expiring;
pub mod persistence;
pub mod reconcile;
pub mod registry;
pub mod runtime;
pub mod sim;
pub mod storage;
pub mod tether;
pub mod types;
pub mod world;

pub use config::RuntimeConfig;
pub use events::{EventBus, TetherEvent};
pub use persistence::{PersistError, PersistenceEngine, SaveStatus};
pub use registry::{IdentityRecord, IdentityRegistry, RegistryError};
pub use runtime::TetherRuntime;
pub use tether::{GrowthHandle, IntentOutcome, RemovalOutcome, Tether};
pub use types::{
    BlockPos, EntityKind, GrowthState, LifecycleState, NetworkId, OwnerId, Position, StableId,
    TransientRef,
};
pub use world::{WorldContext, WorldEngine};
