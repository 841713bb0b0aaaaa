//! Registries of live cluster events.
//!
//! World bosses allow one live instance per metadata id; global portals allow
//! one live instance cluster-wide. Both hand out instances wrapped in `Arc`
//! and tear them down through the same announce/warn/close fan-outs. Custom
//! string boards are kept alongside them.

pub mod global_portal;
pub mod instance;
pub mod monitor;
pub mod string_boards;
pub mod world_boss;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

pub use global_portal::{GlobalPortalRegistry, PortalTarget};
pub use instance::{EventInstance, InstanceState};
pub use monitor::LifetimeMonitors;
pub use string_boards::StringBoardRegistry;
pub use world_boss::WorldBossRegistry;

use crate::shard::FanOutReport;
use crate::types::{EventKind, InstanceId, MetadataId, ShardId};

/// Query view of one live instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveInstanceSummary {
    pub kind: EventKind,
    pub metadata_id: MetadataId,
    pub instance_id: InstanceId,
    pub alive_shards: Vec<ShardId>,
    pub next_occurrence: Option<DateTime<Utc>>,
    pub spawned_at: DateTime<Utc>,
    pub end_tick: DateTime<Utc>,
    pub state: InstanceState,
}

/// Registry operations the lifetime monitor drives.
#[async_trait]
pub trait ActiveEvents: Send + Sync {
    /// The live instance for `metadata_id`, if any.
    fn current(&self, metadata_id: MetadataId) -> Option<Arc<EventInstance>>;

    /// Warn the alive set of a live instance.
    async fn warn(&self, instance: &EventInstance) -> FanOutReport;

    /// Dispose the instance only if it is still the live one for its key.
    /// Returns `None` when it was already gone or superseded.
    async fn dispose_instance(
        &self,
        metadata_id: MetadataId,
        instance_id: InstanceId,
    ) -> Option<FanOutReport>;
}
