use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ActiveInstanceSummary;
use crate::event::CyclicEventMetadata;
use crate::shard::{EventAnnouncement, EventRef, FanOutReport, ShardRegistry};
use crate::types::{EventKind, InstanceId, MetadataId, ShardId};

/// Lifecycle of one live event instance.
///
/// `Closed` is only ever observed on an instance that has already left its
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Idle,
    Announced,
    Warned,
    Closed,
}

/// One live occurrence of a cyclic event.
pub struct EventInstance {
    metadata: Arc<CyclicEventMetadata>,
    instance_id: InstanceId,
    spawned_at: DateTime<Utc>,
    end_tick: DateTime<Utc>,
    next_occurrence: Option<DateTime<Utc>>,
    alive: DashSet<ShardId>,
    state: Mutex<InstanceState>,
    /// Cancelled when the instance leaves its registry or on shutdown.
    cancel: CancellationToken,
}

impl EventInstance {
    pub(crate) fn new(
        metadata: Arc<CyclicEventMetadata>,
        instance_id: InstanceId,
        spawned_at: DateTime<Utc>,
        end_tick: DateTime<Utc>,
        next_occurrence: Option<DateTime<Utc>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            metadata,
            instance_id,
            spawned_at,
            end_tick,
            next_occurrence,
            alive: DashSet::new(),
            state: Mutex::new(InstanceState::Idle),
            cancel,
        }
    }

    pub fn metadata(&self) -> &Arc<CyclicEventMetadata> {
        &self.metadata
    }

    pub fn metadata_id(&self) -> MetadataId {
        self.metadata.id
    }

    pub fn kind(&self) -> EventKind {
        self.metadata.kind()
    }

    pub fn instance_id(&self) -> InstanceId {
        self.instance_id
    }

    pub fn spawned_at(&self) -> DateTime<Utc> {
        self.spawned_at
    }

    pub fn end_tick(&self) -> DateTime<Utc> {
        self.end_tick
    }

    pub fn next_occurrence(&self) -> Option<DateTime<Utc>> {
        self.next_occurrence
    }

    pub fn state(&self) -> InstanceState {
        *self.state.lock()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn event_ref(&self) -> EventRef {
        EventRef {
            kind: self.kind(),
            metadata_id: self.metadata_id(),
            instance_id: self.instance_id,
        }
    }

    /// Shards that acknowledged the announcement and have not reported the
    /// event finished, in ascending order.
    pub fn alive_shards(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.alive.iter().map(|s| *s).collect();
        shards.sort();
        shards
    }

    /// Drop a shard from the alive set. The instance itself stays live.
    pub fn remove_channel(&self, shard_id: ShardId) -> bool {
        self.alive.remove(&shard_id).is_some()
    }

    pub fn summary(&self) -> ActiveInstanceSummary {
        ActiveInstanceSummary {
            kind: self.kind(),
            metadata_id: self.metadata_id(),
            instance_id: self.instance_id,
            alive_shards: self.alive_shards(),
            next_occurrence: self.next_occurrence,
            spawned_at: self.spawned_at,
            end_tick: self.end_tick,
            state: self.state(),
        }
    }

    /// Announce the instance to every registered shard. Shards that
    /// acknowledge join the alive set.
    pub async fn announce(&self, shards: &ShardRegistry) -> FanOutReport {
        let announcement = Arc::new(EventAnnouncement {
            event: self.event_ref(),
            end_tick: self.end_tick,
            next_occurrence: self.next_occurrence,
            payload: self.metadata.payload.clone(),
        });
        let report = shards
            .fan_out("announce_event", move |client| {
                let announcement = Arc::clone(&announcement);
                Box::pin(async move { client.announce_event(&announcement).await })
            })
            .await;
        for shard_id in &report.acknowledged {
            self.alive.insert(*shard_id);
        }
        self.transition(InstanceState::Idle, InstanceState::Announced);
        info!(
            kind = %self.kind(),
            metadata_id = %self.metadata_id(),
            instance_id = %self.instance_id,
            alive = report.acknowledged.len(),
            "event announced"
        );
        report
    }

    /// Warn the shards still in the alive set that the instance is about to
    /// expire.
    pub async fn warn(&self, shards: &ShardRegistry) -> FanOutReport {
        let event = self.event_ref();
        let report = shards
            .fan_out_to("warn_event", self.alive_shards(), move |client| {
                Box::pin(async move { client.warn_event(event).await })
            })
            .await;
        self.transition(InstanceState::Announced, InstanceState::Warned);
        report
    }

    /// Tell every registered shard to tear the instance down.
    pub(crate) async fn close(&self, shards: &ShardRegistry) -> FanOutReport {
        let event = self.event_ref();
        let report = shards
            .fan_out("close_event", move |client| {
                Box::pin(async move { client.close_event(event).await })
            })
            .await;
        *self.state.lock() = InstanceState::Closed;
        info!(
            kind = %self.kind(),
            metadata_id = %self.metadata_id(),
            instance_id = %self.instance_id,
            "event closed"
        );
        report
    }

    fn transition(&self, from: InstanceState, to: InstanceState) {
        let mut state = self.state.lock();
        if *state == from {
            *state = to;
        }
    }
}
