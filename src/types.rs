use cgmath::{MetricSpace, Point3};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;
use web_time::{SystemTime, UNIX_EPOCH};

/// Edge length, in blocks, of the cells used to bucket container hints.
pub const SPATIAL_BUCKET_EDGE: i32 = 8;

/// Permanent identity of a claimed entity. Never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StableId(pub Uuid);

impl StableId {
    pub fn fresh() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(pub Uuid);

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Engine handle of a live entity. Invalidated whenever the entity leaves
/// the simulation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransientRef(pub u64);

impl fmt::Display for TransientRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection-scoped entity id carried by protocol-level signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetworkId(pub u32);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net:{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKind(pub String);

impl EntityKind {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for EntityKind {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Two optional kinds match when both are known and equal, or both unknown.
pub fn kinds_match(a: Option<&EntityKind>, b: Option<&EntityKind>) -> bool {
    a == b
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub world: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default)]
    pub facing: f32,
}

impl Position {
    pub fn new(world: impl Into<String>, x: f64, y: f64, z: f64, facing: f32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
            facing,
        }
    }

    pub fn point(&self) -> Point3<f64> {
        Point3::new(self.x, self.y, self.z)
    }

    /// Squared distance, or `None` when the positions are in different worlds.
    pub fn distance2(&self, other: &Position) -> Option<f64> {
        if self.world != other.world {
            return None;
        }
        Some(self.point().distance2(other.point()))
    }

    pub fn within(&self, other: &Position, radius: f64) -> bool {
        self.distance2(other)
            .map(|d2| d2 <= radius * radius)
            .unwrap_or(false)
    }

    pub fn block(&self) -> BlockPos {
        BlockPos {
            world: self.world.clone(),
            x: self.x.floor() as i32,
            y: self.y.floor() as i32,
            z: self.z.floor() as i32,
        }
    }

    pub fn bucket(&self) -> SpatialBucket {
        self.block().bucket()
    }
}

/// Exact block coordinates, used to key container slots.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockPos {
    pub world: String,
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub fn new(world: impl Into<String>, x: i32, y: i32, z: i32) -> Self {
        Self {
            world: world.into(),
            x,
            y,
            z,
        }
    }

    pub fn center(&self) -> Position {
        Position::new(
            self.world.clone(),
            self.x as f64 + 0.5,
            self.y as f64,
            self.z as f64 + 0.5,
            0.0,
        )
    }

    pub fn bucket(&self) -> SpatialBucket {
        let edge = SPATIAL_BUCKET_EDGE;
        SpatialBucket {
            world: self.world.clone(),
            cell: [
                self.x.div_euclid(edge),
                self.y.div_euclid(edge),
                self.z.div_euclid(edge),
            ],
        }
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{},{},{}", self.world, self.x, self.y, self.z)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SpatialBucket {
    pub world: String,
    pub cell: [i32; 3],
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LifecycleState {
    Active,
    Despawned,
    Captured,
    Stored,
    Dead,
}

impl LifecycleState {
    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Dead
    }

    /// Captured and stored entities are expected to come back on their own.
    pub fn is_parked(self) -> bool {
        matches!(self, LifecycleState::Captured | LifecycleState::Stored)
    }

    pub fn allows(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        if self == next {
            return true;
        }
        match (self, next) {
            (Dead, _) => false,
            (_, Dead) => true,
            (Active, Despawned | Captured | Stored) => true,
            // Scans can observe the absence before the lifecycle event lands.
            (Despawned, Active | Captured | Stored) => true,
            (Captured | Stored, Active) => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecycleState::Active => "active",
            LifecycleState::Despawned => "despawned",
            LifecycleState::Captured => "captured",
            LifecycleState::Stored => "stored",
            LifecycleState::Dead => "dead",
        };
        f.write_str(label)
    }
}

/// Opaque progression state owned by the growth collaborator.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GrowthState(pub serde_json::Value);

pub fn now_unix_ms() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_millis().min(u64::MAX as u128) as u64
}
