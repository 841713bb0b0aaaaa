//! The world orchestrator: owns every registry and loop and wires them up.
//!
//! `start` runs the startup sweep (everyone offline, orphaned items
//! deleted), catches up on overdue resets, arms cyclic events, game events
//! and the plot sweep, then spawns the scheduler loop and the heartbeat loop. `shutdown` cancels the root token, which reaches the
//! loops and every lifetime monitor, and waits a bounded grace period for
//! them to exit.

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::config::OrchestratorConfig;
use crate::cyclic::CyclicEventDriver;
use crate::directory::DirectoryClient;
use crate::error::OrchestratorError;
use crate::game_events::schedule_game_events;
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::WorldMetrics;
use crate::party::{PartyChange, PartyRegistry};
use crate::players::{PlayerLivenessRecord, PlayerRegistry, PlayerUpdate};
use crate::plots::PlotSweeper;
use crate::registry::{
    ActiveInstanceSummary, GlobalPortalRegistry, LifetimeMonitors, PortalTarget,
    StringBoardRegistry, WorldBossRegistry,
};
use crate::reset::{ResetCalendar, ResetCoordinator};
use crate::scheduler::Scheduler;
use crate::shard::{FanOutReport, ShardClient, ShardRegistry};
use crate::types::{EventKind, InstanceId, MetadataId, ShardId};
use crate::world_storage::WorldStorage;

pub struct WorldOrchestrator {
    config: OrchestratorConfig,
    clock: Arc<dyn Clock>,
    storage: Arc<dyn WorldStorage>,
    metrics: Arc<WorldMetrics>,
    scheduler: Arc<Scheduler>,
    shards: Arc<ShardRegistry>,
    players: Arc<PlayerRegistry>,
    parties: Arc<PartyRegistry>,
    world_bosses: Arc<WorldBossRegistry>,
    global_portals: Arc<GlobalPortalRegistry>,
    monitors: Arc<LifetimeMonitors>,
    string_boards: StringBoardRegistry,
    cyclic: Arc<CyclicEventDriver>,
    resets: Arc<ResetCoordinator>,
    plots: Arc<PlotSweeper>,
    heartbeat: Arc<HeartbeatMonitor>,
    cancel: CancellationToken,
    loops: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl WorldOrchestrator {
    /// Build an orchestrator. Nothing runs until [`start`](Self::start).
    pub fn new(
        config: OrchestratorConfig,
        clock: Arc<dyn Clock>,
        storage: Arc<dyn WorldStorage>,
        directory: Arc<dyn DirectoryClient>,
        metrics: Arc<WorldMetrics>,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;

        let cancel = CancellationToken::new();
        let scheduler = Arc::new(Scheduler::new(Arc::clone(&clock), Arc::clone(&metrics)));
        let shards = Arc::new(ShardRegistry::new(config.rpc_timeout, Arc::clone(&metrics)));
        let players = Arc::new(PlayerRegistry::new(
            config.heartbeat_retry_ceiling,
            Arc::clone(&metrics),
        ));
        let parties = Arc::new(PartyRegistry::new());
        let world_bosses = Arc::new(WorldBossRegistry::new(
            Arc::clone(&shards),
            Arc::clone(&metrics),
            cancel.clone(),
        ));
        let global_portals = Arc::new(GlobalPortalRegistry::new(
            Arc::clone(&shards),
            Arc::clone(&metrics),
            cancel.clone(),
        ));
        let monitors = Arc::new(LifetimeMonitors::new());
        let string_boards = StringBoardRegistry::new(Arc::clone(&shards));
        let cyclic = Arc::new(CyclicEventDriver::new(
            Arc::clone(&scheduler),
            Arc::clone(&shards),
            Arc::clone(&world_bosses),
            Arc::clone(&global_portals),
            Arc::clone(&monitors),
            &config,
            StdRng::from_entropy(),
        ));
        let resets = Arc::new(ResetCoordinator::new(
            Arc::clone(&scheduler),
            Arc::clone(&storage),
            Arc::clone(&shards),
            Arc::clone(&metrics),
            ResetCalendar::from_config(&config),
        ));
        let plots = Arc::new(PlotSweeper::new(
            Arc::clone(&scheduler),
            Arc::clone(&storage),
            Arc::clone(&shards),
            &config,
        ));
        let heartbeat = Arc::new(HeartbeatMonitor::new(
            directory,
            Arc::clone(&shards),
            Arc::clone(&players),
            Arc::clone(&parties),
            Arc::clone(&storage),
            Arc::clone(&clock),
            Arc::clone(&metrics),
        ));

        Ok(Self {
            config,
            clock,
            storage,
            metrics,
            scheduler,
            shards,
            players,
            parties,
            world_bosses,
            global_portals,
            monitors,
            string_boards,
            cyclic,
            resets,
            plots,
            heartbeat,
            cancel,
            loops: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        })
    }

    /// Run startup and spawn the scheduler and heartbeat loops.
    ///
    /// Storage failures during startup are logged and startup carries on;
    /// the affected work is picked up at its next natural opportunity.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), OrchestratorError> {
        if self.cancel.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("world orchestrator already started");
            return Ok(());
        }

        self.sweep_offline().await;
        self.resets.start().await;

        match self.storage.pending_cyclic_events().await {
            Ok(events) => {
                let total = events.len();
                let armed = self.cyclic.schedule_all(events);
                info!(total, armed, "cyclic events loaded");
            }
            Err(e) => error!(error = %e, "failed to load cyclic events"),
        }
        if let Err(e) = schedule_game_events(&self.scheduler, self.storage.as_ref(), &self.shards).await
        {
            error!(error = %e, "failed to load game events");
        }
        self.plots.start();

        let scheduler = Arc::clone(&self.scheduler);
        let tick = self.config.scheduler_tick;
        let cancel = self.cancel.clone();
        let scheduler_loop = tokio::spawn(async move { scheduler.run(tick, cancel).await });

        let heartbeat = Arc::clone(&self.heartbeat);
        let interval = self.config.heartbeat_interval;
        let cancel = self.cancel.clone();
        let heartbeat_loop = tokio::spawn(async move { heartbeat.run(interval, cancel).await });

        self.loops.lock().extend([scheduler_loop, heartbeat_loop]);
        info!(queued = self.scheduler.len(), "world orchestrator started");
        Ok(())
    }

    /// Everyone starts offline after a world restart, and items left
    /// without an owner are purged.
    async fn sweep_offline(&self) {
        match self.storage.set_all_characters_offline().await {
            Ok(count) => info!(count, "marked all characters offline"),
            Err(e) => error!(error = %e, "failed to mark characters offline"),
        }
        match self.storage.delete_unowned_items().await {
            Ok(count) => info!(count, "deleted unowned items"),
            Err(e) => error!(error = %e, "failed to delete unowned items"),
        }
        let count = self.players.mark_all_offline(self.clock.now());
        debug!(count, "dropped in-memory liveness records to offline");
    }

    /// Stop the loops and monitors and drop every queued task.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let grace = self.config.monitor_shutdown_grace;

        let loops: Vec<JoinHandle<()>> = std::mem::take(&mut *self.loops.lock());
        let aborts: Vec<_> = loops.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(grace, futures::future::join_all(loops))
            .await
            .is_err()
        {
            warn!(?grace, "loops did not stop within the grace period, aborting");
            for handle in aborts {
                handle.abort();
            }
        }
        self.monitors.shutdown(grace).await;
        self.scheduler.clear();
        info!("world orchestrator stopped");
    }

    pub fn register_shard(&self, shard_id: ShardId, client: Arc<dyn ShardClient>) {
        self.shards.register(shard_id, client);
        info!(%shard_id, "shard registered");
    }

    pub fn remove_shard(&self, shard_id: ShardId) -> bool {
        let removed = self.shards.remove(shard_id).is_some();
        if removed {
            info!(%shard_id, "shard removed");
        }
        removed
    }

    /// Apply a shard-reported session change. A logout runs the same party
    /// cleanup as a heartbeat demotion.
    pub fn on_player_update(&self, update: PlayerUpdate) -> PlayerLivenessRecord {
        let was_online = self.players.is_online(update.account_id);
        let record = self.players.update(update);
        if was_online && !record.is_online() {
            if let Some(character_id) = record.character_id {
                if let PartyChange::Disbanded { party } =
                    self.parties.on_member_offline(character_id, &self.players)
                {
                    debug!(%party, "party disbanded after logout");
                }
            }
        }
        record
    }

    /// Live instances of `kind` for "next spawn" listings.
    pub fn active_instances(&self, kind: EventKind) -> Vec<ActiveInstanceSummary> {
        match kind {
            EventKind::WorldBoss => self.world_bosses.summaries(),
            EventKind::GlobalPortal => self.global_portals.summary().into_iter().collect(),
        }
    }

    /// A shard reports the world boss finished locally.
    pub fn on_world_boss_killed(&self, metadata_id: MetadataId, shard_id: ShardId) -> bool {
        let removed = self.world_bosses.remove_channel(metadata_id, shard_id);
        debug!(%metadata_id, %shard_id, removed, "world boss channel removed");
        removed
    }

    /// Close a live world boss ahead of its lifetime.
    pub async fn dispose_world_boss(&self, metadata_id: MetadataId) -> Option<FanOutReport> {
        self.world_bosses.dispose(metadata_id).await
    }

    pub fn join_global_portal(
        &self,
        metadata_id: MetadataId,
        entry_index: usize,
    ) -> Option<PortalTarget> {
        self.global_portals.join(metadata_id, entry_index)
    }

    /// Metadata and instance id of the live global portal.
    pub fn global_portal(&self) -> Option<(MetadataId, InstanceId)> {
        self.global_portals
            .current()
            .map(|portal| (portal.metadata_id(), portal.instance_id()))
    }

    /// Publish a custom string board to every shard. `None` for an empty
    /// message.
    pub async fn add_string_board(&self, message: impl Into<String>) -> Option<i32> {
        self.string_boards.add(message).await
    }

    pub async fn remove_string_board(&self, id: i32) -> bool {
        self.string_boards.remove(id).await
    }

    pub fn string_boards(&self) -> Vec<(i32, String)> {
        self.string_boards.all()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<WorldMetrics> {
        &self.metrics
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn shards(&self) -> &Arc<ShardRegistry> {
        &self.shards
    }

    pub fn players(&self) -> &Arc<PlayerRegistry> {
        &self.players
    }

    pub fn parties(&self) -> &Arc<PartyRegistry> {
        &self.parties
    }

    pub fn world_bosses(&self) -> &Arc<WorldBossRegistry> {
        &self.world_bosses
    }

    pub fn global_portals(&self) -> &Arc<GlobalPortalRegistry> {
        &self.global_portals
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatMonitor> {
        &self.heartbeat
    }

    pub fn cyclic_events(&self) -> &Arc<CyclicEventDriver> {
        &self.cyclic
    }
}
