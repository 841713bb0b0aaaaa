use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{ActiveEvents, ActiveInstanceSummary, EventInstance};
use crate::event::{CyclicEventMetadata, EventPayload};
use crate::metrics::WorldMetrics;
use crate::shard::{FanOutReport, ShardRegistry};
use crate::types::{InstanceId, MetadataId};

/// Where a player joining a global portal entry is sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortalTarget {
    pub instance_id: InstanceId,
    pub entry_index: usize,
    pub map_id: i32,
    pub portal_id: i32,
    /// Players sent through this entry so far, including this one.
    pub joined: u32,
}

struct ActivePortal {
    instance: Arc<EventInstance>,
    joins: Vec<u32>,
}

/// The single live global portal, cluster-wide.
pub struct GlobalPortalRegistry {
    slot: Mutex<Option<ActivePortal>>,
    next_instance_id: AtomicU32,
    shards: Arc<ShardRegistry>,
    metrics: Arc<WorldMetrics>,
    cancel: CancellationToken,
}

impl GlobalPortalRegistry {
    pub fn new(
        shards: Arc<ShardRegistry>,
        metrics: Arc<WorldMetrics>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            slot: Mutex::new(None),
            next_instance_id: AtomicU32::new(1),
            shards,
            metrics,
            cancel,
        }
    }

    /// Occupy the cluster-wide slot.
    ///
    /// Returns `None` if any portal is live, whatever its metadata id.
    pub fn create(
        &self,
        metadata: Arc<CyclicEventMetadata>,
        spawned_at: DateTime<Utc>,
        end_tick: DateTime<Utc>,
        next_occurrence: Option<DateTime<Utc>>,
    ) -> Option<Arc<EventInstance>> {
        let mut slot = self.slot.lock();
        if let Some(live) = slot.as_ref() {
            debug!(
                metadata_id = %live.instance.metadata_id(),
                instance_id = %live.instance.instance_id(),
                "global portal still active"
            );
            return None;
        }
        let entries = match &metadata.payload {
            EventPayload::GlobalPortal(portal) => portal.entries.len(),
            EventPayload::WorldBoss(_) => 0,
        };
        let id = InstanceId(self.next_instance_id.fetch_add(1, Ordering::Relaxed));
        let instance = Arc::new(EventInstance::new(
            metadata,
            id,
            spawned_at,
            end_tick,
            next_occurrence,
            self.cancel.child_token(),
        ));
        *slot = Some(ActivePortal {
            instance: Arc::clone(&instance),
            joins: vec![0; entries],
        });
        self.metrics.active_global_portals.set(1);
        Some(instance)
    }

    pub fn current(&self) -> Option<Arc<EventInstance>> {
        self.slot
            .lock()
            .as_ref()
            .map(|live| Arc::clone(&live.instance))
    }

    pub fn summary(&self) -> Option<ActiveInstanceSummary> {
        self.current().map(|instance| instance.summary())
    }

    /// Send a player through entry `entry_index` of the live portal.
    ///
    /// Returns `None` if no portal is live, the live portal has a different
    /// metadata id, the index is out of range, or the entry has no map.
    pub fn join(&self, metadata_id: MetadataId, entry_index: usize) -> Option<PortalTarget> {
        let mut slot = self.slot.lock();
        let live = slot.as_mut()?;
        if live.instance.metadata_id() != metadata_id {
            return None;
        }
        let EventPayload::GlobalPortal(portal) = &live.instance.metadata().payload else {
            return None;
        };
        let entry = portal.entries.get(entry_index)?;
        if entry.map_id == 0 {
            return None;
        }
        let joined = live.joins.get_mut(entry_index)?;
        *joined += 1;
        Some(PortalTarget {
            instance_id: live.instance.instance_id(),
            entry_index,
            map_id: entry.map_id,
            portal_id: entry.portal_id,
            joined: *joined,
        })
    }

    /// Empty the slot and close the portal on every shard.
    pub async fn dispose(&self) -> Option<FanOutReport> {
        let live = self.slot.lock().take()?;
        Some(self.teardown(live.instance).await)
    }

    async fn teardown(&self, instance: Arc<EventInstance>) -> FanOutReport {
        instance.cancel_token().cancel();
        self.metrics.active_global_portals.set(0);
        instance.close(&self.shards).await
    }

    fn take_if(&self, metadata_id: MetadataId, instance_id: InstanceId) -> Option<ActivePortal> {
        let mut slot = self.slot.lock();
        let matches = slot.as_ref().is_some_and(|live| {
            live.instance.metadata_id() == metadata_id && live.instance.instance_id() == instance_id
        });
        if matches {
            slot.take()
        } else {
            None
        }
    }
}

#[async_trait]
impl ActiveEvents for GlobalPortalRegistry {
    fn current(&self, metadata_id: MetadataId) -> Option<Arc<EventInstance>> {
        GlobalPortalRegistry::current(self).filter(|live| live.metadata_id() == metadata_id)
    }

    async fn warn(&self, instance: &EventInstance) -> FanOutReport {
        instance.warn(&self.shards).await
    }

    async fn dispose_instance(
        &self,
        metadata_id: MetadataId,
        instance_id: InstanceId,
    ) -> Option<FanOutReport> {
        let live = self.take_if(metadata_id, instance_id)?;
        Some(self.teardown(live.instance).await)
    }
}
