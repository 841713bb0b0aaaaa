//! Cluster-wide world orchestrator for a sharded game server.
//!
//! A single process sits above many channel shards and owns the state that
//! must be unique across the world: recurring world bosses and the global
//! portal, daily/weekly/monthly resets, player liveness and parties, game
//! event toggles and housing plot expiry. Shards are reached through the
//! [`ShardClient`](shard::ShardClient) trait and persistence through
//! [`WorldStorage`](world_storage::WorldStorage); the in-memory
//! implementations under [`storage`] and the doubles in [`testing`] make the
//! whole orchestrator runnable without a network or database.
//!
//! ```no_run
//! use std::sync::Arc;
//! use world_orchestrator::prelude::*;
//! use world_orchestrator::storage::memory_world::MemoryWorldStorage;
//! use world_orchestrator::storage::noop_directory::NoopDirectory;
//!
//! # async fn run() -> Result<(), OrchestratorError> {
//! let orchestrator = WorldOrchestrator::new(
//!     OrchestratorConfig::default(),
//!     Arc::new(SystemClock),
//!     Arc::new(MemoryWorldStorage::new()),
//!     Arc::new(NoopDirectory),
//!     Arc::new(WorldMetrics::unregistered()),
//! )?;
//! orchestrator.start().await?;
//! // ... register shards, feed player updates ...
//! orchestrator.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod cyclic;
pub mod directory;
pub mod error;
pub mod event;
pub mod game_events;
pub mod heartbeat;
pub mod metrics;
pub mod orchestrator;
pub mod party;
pub mod players;
pub mod plots;
pub mod recurrence;
pub mod registry;
pub mod reset;
pub mod scheduler;
pub mod shard;
pub mod storage;
pub mod testing;
pub mod types;
pub mod world_storage;

pub use orchestrator::WorldOrchestrator;

/// Commonly used items for embedding the orchestrator.
pub mod prelude {
    pub use crate::clock::{Clock, SystemClock};
    pub use crate::config::OrchestratorConfig;
    pub use crate::directory::DirectoryClient;
    pub use crate::error::OrchestratorError;
    pub use crate::event::{CyclicEventMetadata, EventPayload};
    pub use crate::metrics::WorldMetrics;
    pub use crate::orchestrator::WorldOrchestrator;
    pub use crate::players::PlayerUpdate;
    pub use crate::shard::{FanOutReport, ShardClient};
    pub use crate::types::{
        AccountId, CharacterId, EventKind, InstanceId, MetadataId, ResetKind, ShardId,
    };
    pub use crate::world_storage::WorldStorage;
}
