use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a cyclic event definition in the time-event table.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct MetadataId(pub i32);

/// Monotonically assigned id of one live occurrence of a cyclic event.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct InstanceId(pub u32);

impl MetadataId {
    pub fn new(id: i32) -> Self {
        Self(id)
    }
}

impl fmt::Display for MetadataId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The two families of cluster-wide cyclic events.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// At most one live instance per metadata id.
    WorldBoss,
    /// At most one live instance cluster-wide.
    GlobalPortal,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorldBoss => write!(f, "world_boss"),
            Self::GlobalPortal => write!(f, "global_portal"),
        }
    }
}
