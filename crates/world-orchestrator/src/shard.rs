//! Channel shard RPC boundary and the registry used for fan-out.
//!
//! Shards are trusted workers reachable only over RPC. A fan-out calls every
//! target shard in id order; each call carries the configured deadline, and a
//! failure on one shard is logged and recorded without affecting the rest.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::error::OrchestratorError;
use crate::event::EventPayload;
use crate::metrics::WorldMetrics;
use crate::types::{AccountId, CharacterId, EventKind, InstanceId, MetadataId, ResetKind, ShardId};

/// Payload of an event announcement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventAnnouncement {
    pub event: EventRef,
    pub end_tick: DateTime<Utc>,
    pub next_occurrence: Option<DateTime<Utc>>,
    pub payload: EventPayload,
}

/// Identifies one live event instance on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub kind: EventKind,
    pub metadata_id: MetadataId,
    pub instance_id: InstanceId,
}

/// An event instance a shard reports as running locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEventSummary {
    pub event: EventRef,
    pub end_tick: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameEventChange {
    Add(i32),
    Remove(i32),
}

/// Notification that a housing plot changed hands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotUpdate {
    pub map_id: i32,
    pub plot_number: i32,
    /// Account the plot belonged to before the change.
    pub account_id: Option<AccountId>,
    /// `true` when the plot was taken from its owner, `false` when it was
    /// reopened for sale.
    pub forfeit: bool,
}

/// Change to the world's custom string boards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringBoardChange {
    Add { id: i32, message: String },
    Remove(i32),
}

/// RPC client for one channel shard.
///
/// Implementations report a down endpoint as
/// [`OrchestratorError::ShardUnreachable`]; every other failure is treated
/// as a hard RPC error.
#[async_trait]
pub trait ShardClient: Send + Sync {
    async fn announce_event(&self, announcement: &EventAnnouncement)
        -> Result<(), OrchestratorError>;

    async fn warn_event(&self, event: EventRef) -> Result<(), OrchestratorError>;

    async fn close_event(&self, event: EventRef) -> Result<(), OrchestratorError>;

    async fn notify_reset(&self, kind: ResetKind) -> Result<(), OrchestratorError>;

    /// Ask whether the character still has a live session on this shard.
    async fn heartbeat(&self, character_id: CharacterId) -> Result<bool, OrchestratorError>;

    async fn game_event(&self, change: GameEventChange) -> Result<(), OrchestratorError>;

    async fn update_plot(&self, update: &PlotUpdate) -> Result<(), OrchestratorError>;

    async fn string_board(&self, change: &StringBoardChange) -> Result<(), OrchestratorError>;

    async fn active_instances(&self) -> Result<Vec<ActiveEventSummary>, OrchestratorError>;
}

/// Outcome of a fan-out, split by failure class.
#[derive(Debug, Default)]
pub struct FanOutReport {
    /// Shards that acknowledged the call.
    pub acknowledged: Vec<ShardId>,
    /// Shards that were unreachable or no longer registered.
    pub unreachable: Vec<ShardId>,
    /// Per-shard hard failures, including deadline overruns.
    pub failed: Vec<(ShardId, OrchestratorError)>,
}

impl FanOutReport {
    pub fn is_complete(&self) -> bool {
        self.unreachable.is_empty() && self.failed.is_empty()
    }
}

/// Registered shard endpoints, keyed by shard id.
pub struct ShardRegistry {
    shards: DashMap<ShardId, Arc<dyn ShardClient>>,
    rpc_timeout: Duration,
    metrics: Arc<WorldMetrics>,
}

impl ShardRegistry {
    pub fn new(rpc_timeout: Duration, metrics: Arc<WorldMetrics>) -> Self {
        Self {
            shards: DashMap::new(),
            rpc_timeout,
            metrics,
        }
    }

    /// Register a shard endpoint, replacing any previous client for the id.
    pub fn register(&self, shard_id: ShardId, client: Arc<dyn ShardClient>) {
        if self.shards.insert(shard_id, client).is_some() {
            debug!(%shard_id, "replaced shard endpoint");
        } else {
            debug!(%shard_id, "registered shard endpoint");
        }
        self.metrics.shards.set(self.shards.len() as i64);
    }

    pub fn remove(&self, shard_id: ShardId) -> Option<Arc<dyn ShardClient>> {
        let removed = self.shards.remove(&shard_id).map(|(_, client)| client);
        self.metrics.shards.set(self.shards.len() as i64);
        removed
    }

    pub fn get(&self, shard_id: ShardId) -> Option<Arc<dyn ShardClient>> {
        self.shards.get(&shard_id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, shard_id: ShardId) -> bool {
        self.shards.contains_key(&shard_id)
    }

    /// Registered shard ids in ascending order.
    pub fn ids(&self) -> Vec<ShardId> {
        let mut ids: Vec<ShardId> = self.shards.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.shards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.is_empty()
    }

    pub fn rpc_timeout(&self) -> Duration {
        self.rpc_timeout
    }

    /// Run one RPC against a shard under the configured deadline.
    pub async fn call<T, F>(&self, shard_id: ShardId, call: F) -> Result<T, OrchestratorError>
    where
        F: Future<Output = Result<T, OrchestratorError>>,
    {
        match tokio::time::timeout(self.rpc_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::RpcTimeout {
                shard_id,
                timeout: self.rpc_timeout,
            }),
        }
    }

    /// Call `op` on every registered shard.
    pub async fn fan_out<F>(&self, operation: &str, op: F) -> FanOutReport
    where
        F: Fn(Arc<dyn ShardClient>) -> BoxFuture<'static, Result<(), OrchestratorError>>,
    {
        self.fan_out_to(operation, self.ids(), op).await
    }

    /// Call `op` on each of `targets`, sequentially and in the given order.
    ///
    /// A target that is no longer registered is reported as unreachable.
    pub async fn fan_out_to<F>(
        &self,
        operation: &str,
        targets: impl IntoIterator<Item = ShardId>,
        op: F,
    ) -> FanOutReport
    where
        F: Fn(Arc<dyn ShardClient>) -> BoxFuture<'static, Result<(), OrchestratorError>>,
    {
        let mut report = FanOutReport::default();
        for shard_id in targets {
            let Some(client) = self.get(shard_id) else {
                debug!(%shard_id, operation, "skipping unregistered shard");
                report.unreachable.push(shard_id);
                continue;
            };
            match self.call(shard_id, op(client)).await {
                Ok(()) => report.acknowledged.push(shard_id),
                Err(e) if e.is_unreachable() => {
                    warn!(%shard_id, operation, "shard unavailable");
                    report.unreachable.push(shard_id);
                }
                Err(e) => {
                    error!(%shard_id, operation, error = %e, "shard rpc failed");
                    report.failed.push((shard_id, e));
                }
            }
        }
        report
    }
}
