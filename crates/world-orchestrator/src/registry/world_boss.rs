use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ActiveEvents, ActiveInstanceSummary, EventInstance};
use crate::event::CyclicEventMetadata;
use crate::metrics::WorldMetrics;
use crate::shard::{FanOutReport, ShardRegistry};
use crate::types::{InstanceId, MetadataId, ShardId};

/// Live world bosses, at most one per metadata id.
///
/// Each instance carries a child of the registry's cancellation token; the
/// child is cancelled when the instance is removed.
pub struct WorldBossRegistry {
    active: DashMap<MetadataId, Arc<EventInstance>>,
    next_instance_id: AtomicU32,
    shards: Arc<ShardRegistry>,
    metrics: Arc<WorldMetrics>,
    cancel: CancellationToken,
}

impl WorldBossRegistry {
    pub fn new(
        shards: Arc<ShardRegistry>,
        metrics: Arc<WorldMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            active: DashMap::new(),
            next_instance_id: AtomicU32::new(1),
            shards,
            metrics,
            cancel,
        }
    }

    /// Insert a new instance for `metadata.id`.
    ///
    /// Returns `None` if an instance for the same metadata id is still live;
    /// the existing instance is left untouched.
    pub fn create(
        &self,
        metadata: Arc<CyclicEventMetadata>,
        spawned_at: DateTime<Utc>,
        end_tick: DateTime<Utc>,
        next_occurrence: Option<DateTime<Utc>>,
    ) -> Option<Arc<EventInstance>> {
        let instance = match self.active.entry(metadata.id) {
            Entry::Occupied(existing) => {
                debug!(
                    metadata_id = %metadata.id,
                    instance_id = %existing.get().instance_id(),
                    "world boss still active"
                );
                return None;
            }
            Entry::Vacant(slot) => {
                let id = InstanceId(self.next_instance_id.fetch_add(1, Ordering::Relaxed));
                let instance = Arc::new(EventInstance::new(
                    metadata,
                    id,
                    spawned_at,
                    end_tick,
                    next_occurrence,
                    self.cancel.child_token(),
                ));
                slot.insert(Arc::clone(&instance));
                instance
            }
        };
        self.metrics.active_world_bosses.set(self.active.len() as i64);
        Some(instance)
    }

    pub fn get(&self, metadata_id: MetadataId) -> Option<Arc<EventInstance>> {
        self.active.get(&metadata_id).map(|i| Arc::clone(i.value()))
    }

    /// Every live instance, ordered by metadata id.
    pub fn all(&self) -> Vec<Arc<EventInstance>> {
        let mut all: Vec<Arc<EventInstance>> =
            self.active.iter().map(|i| Arc::clone(i.value())).collect();
        all.sort_by_key(|i| i.metadata_id());
        all
    }

    pub fn summaries(&self) -> Vec<ActiveInstanceSummary> {
        self.all().iter().map(|i| i.summary()).collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// A shard reports the boss finished locally. Only the alive set
    /// changes; the instance stays registered until its monitor expires it.
    pub fn remove_channel(&self, metadata_id: MetadataId, shard_id: ShardId) -> bool {
        self.get(metadata_id)
            .is_some_and(|instance| instance.remove_channel(shard_id))
    }

    /// Remove the live instance for `metadata_id` and close it on every
    /// shard. Returns `None` if nothing was live.
    pub async fn dispose(&self, metadata_id: MetadataId) -> Option<FanOutReport> {
        let (_, instance) = self.active.remove(&metadata_id)?;
        Some(self.teardown(instance).await)
    }

    async fn teardown(&self, instance: Arc<EventInstance>) -> FanOutReport {
        instance.cancel_token().cancel();
        self.metrics.active_world_bosses.set(self.active.len() as i64);
        instance.close(&self.shards).await
    }
}

#[async_trait]
impl ActiveEvents for WorldBossRegistry {
    fn current(&self, metadata_id: MetadataId) -> Option<Arc<EventInstance>> {
        self.get(metadata_id)
    }

    async fn warn(&self, instance: &EventInstance) -> FanOutReport {
        instance.warn(&self.shards).await
    }

    async fn dispose_instance(
        &self,
        metadata_id: MetadataId,
        instance_id: InstanceId,
    ) -> Option<FanOutReport> {
        let (_, instance) = self
            .active
            .remove_if(&metadata_id, |_, live| live.instance_id() == instance_id)?;
        Some(self.teardown(instance).await)
    }
}
