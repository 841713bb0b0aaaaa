use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a channel shard process.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct ShardId(pub i32);

impl ShardId {
    /// Value persisted in the `channel` column for a player who is offline.
    pub const OFFLINE_SENTINEL: i32 = -1;

    pub fn new(id: i32) -> Self {
        Self(id)
    }

    /// Storage encoding for an optional shard binding (`None` -> `-1`).
    pub fn column_value(shard: Option<ShardId>) -> i32 {
        shard.map_or(Self::OFFLINE_SENTINEL, |s| s.0)
    }

    /// Inverse of [`column_value`](Self::column_value); any negative value
    /// reads as offline.
    pub fn from_column(value: i32) -> Option<ShardId> {
        (value >= 0).then_some(ShardId(value))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
