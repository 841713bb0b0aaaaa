//! Scheduling of cyclic world-boss and global-portal events.
//!
//! Every definition is armed as a one-shot scheduler task at its next
//! occurrence. When a task fires it arms the following occurrence first, then
//! rolls the probability gate and, if the roll hits and no instance is live
//! for the event's slot, spawns, announces and monitors a new instance.

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::event::CyclicEventMetadata;
use crate::recurrence::{next_after_firing, next_occurrence, Occurrence};
use crate::registry::{
    ActiveEvents, EventInstance, GlobalPortalRegistry, LifetimeMonitors, WorldBossRegistry,
};
use crate::scheduler::Scheduler;
use crate::shard::ShardRegistry;
use crate::types::EventKind;

pub struct CyclicEventDriver {
    scheduler: Arc<Scheduler>,
    shards: Arc<ShardRegistry>,
    world_bosses: Arc<WorldBossRegistry>,
    global_portals: Arc<GlobalPortalRegistry>,
    monitors: Arc<LifetimeMonitors>,
    world_boss_warn_window: Duration,
    global_portal_warn_window: Duration,
    rng: Mutex<StdRng>,
}

impl CyclicEventDriver {
    pub fn new(
        scheduler: Arc<Scheduler>,
        shards: Arc<ShardRegistry>,
        world_bosses: Arc<WorldBossRegistry>,
        global_portals: Arc<GlobalPortalRegistry>,
        monitors: Arc<LifetimeMonitors>,
        config: &OrchestratorConfig,
        rng: StdRng,
    ) -> Self {
        Self {
            scheduler,
            shards,
            world_bosses,
            global_portals,
            monitors,
            world_boss_warn_window: config.world_boss_warn_window,
            global_portal_warn_window: config.global_portal_warn_window,
            rng: Mutex::new(rng),
        }
    }

    /// Arm every definition at its next occurrence after now.
    ///
    /// Invalid definitions and definitions whose window has closed are
    /// skipped. Returns how many were armed.
    pub fn schedule_all(self: &Arc<Self>, events: Vec<CyclicEventMetadata>) -> usize {
        let now = self.scheduler.now();
        let mut armed = 0;
        for metadata in events {
            if let Err(e) = metadata.validate() {
                error!(metadata_id = %metadata.id, error = %e, "skipping invalid cyclic event");
                continue;
            }
            let next = next_occurrence(&metadata, now, &mut *self.rng.lock());
            match next {
                Some(occurrence) => {
                    info!(
                        kind = %metadata.kind(),
                        metadata_id = %metadata.id,
                        at = %occurrence.at,
                        "cyclic event scheduled"
                    );
                    self.arm(Arc::new(metadata), occurrence);
                    armed += 1;
                }
                None => debug!(metadata_id = %metadata.id, "cyclic event has no further occurrence"),
            }
        }
        armed
    }

    fn arm(self: &Arc<Self>, metadata: Arc<CyclicEventMetadata>, occurrence: Occurrence) {
        let driver = Arc::clone(self);
        let name = format!("{}:{}", metadata.kind(), metadata.id);
        self.scheduler.schedule_at(name, occurrence.at, move |_| {
            let driver = Arc::clone(&driver);
            let metadata = Arc::clone(&metadata);
            Box::pin(async move { driver.fire(metadata, occurrence).await })
        });
    }

    /// Handle a due occurrence: arm the next one, roll, and spawn.
    pub async fn fire(
        self: &Arc<Self>,
        metadata: Arc<CyclicEventMetadata>,
        occurrence: Occurrence,
    ) -> Result<(), OrchestratorError> {
        let now = self.scheduler.now();
        let (next, hit) = {
            let mut rng = self.rng.lock();
            let next = next_after_firing(&metadata, &occurrence, now, &mut *rng);
            (next, metadata.roll(&mut *rng))
        };
        if let Some(next) = next {
            self.arm(Arc::clone(&metadata), next);
        }
        if !hit {
            debug!(
                metadata_id = %metadata.id,
                probability = metadata.probability,
                "cyclic event roll missed"
            );
            return Ok(());
        }
        self.spawn(metadata, now, next.map(|n| n.at)).await;
        Ok(())
    }

    /// Create, announce and start monitoring an instance of `metadata`.
    ///
    /// Returns `None` when the event's slot is still occupied.
    pub async fn spawn(
        &self,
        metadata: Arc<CyclicEventMetadata>,
        now: DateTime<Utc>,
        next_occurrence: Option<DateTime<Utc>>,
    ) -> Option<Arc<EventInstance>> {
        let end_tick = TimeDelta::from_std(metadata.lifetime)
            .ok()
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let lifetime = metadata.lifetime;

        let (events, created, warn_window) = match metadata.kind() {
            EventKind::WorldBoss => (
                Arc::clone(&self.world_bosses) as Arc<dyn ActiveEvents>,
                self.world_bosses
                    .create(Arc::clone(&metadata), now, end_tick, next_occurrence),
                self.world_boss_warn_window,
            ),
            EventKind::GlobalPortal => (
                Arc::clone(&self.global_portals) as Arc<dyn ActiveEvents>,
                self.global_portals
                    .create(Arc::clone(&metadata), now, end_tick, next_occurrence),
                self.global_portal_warn_window,
            ),
        };
        let Some(instance) = created else {
            debug!(metadata_id = %metadata.id, "event still active, skipping spawn");
            return None;
        };

        instance.announce(&self.shards).await;
        self.monitors
            .spawn(events, Arc::clone(&instance), lifetime, warn_window);
        Some(instance)
    }
}
