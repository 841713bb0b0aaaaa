use prometheus::{IntCounter, IntGauge, Opts, Registry};

/// World-level prometheus metrics.
pub struct WorldMetrics {
    /// Number of registered channel shards.
    pub shards: IntGauge,
    /// Number of players currently bound to a shard.
    pub online_players: IntGauge,
    /// Number of live world-boss instances.
    pub active_world_bosses: IntGauge,
    /// Number of live global-portal instances (0 or 1).
    pub active_global_portals: IntGauge,
    /// Players demoted to offline by the heartbeat monitor.
    pub heartbeat_demotions: IntCounter,
    /// Scheduled actions that returned an error or panicked.
    pub scheduler_task_failures: IntCounter,
    /// Daily/weekly/monthly resets performed.
    pub resets_performed: IntCounter,
}

impl WorldMetrics {
    /// Create metrics and register them with the given prometheus registry.
    pub fn new(registry: &Registry) -> Result<Self, prometheus::Error> {
        let shards = IntGauge::with_opts(Opts::new(
            "world_shards",
            "Number of registered channel shards",
        ))?;
        let online_players = IntGauge::with_opts(Opts::new(
            "world_online_players",
            "Number of players bound to a shard",
        ))?;
        let active_world_bosses = IntGauge::with_opts(Opts::new(
            "world_active_world_bosses",
            "Number of live world-boss instances",
        ))?;
        let active_global_portals = IntGauge::with_opts(Opts::new(
            "world_active_global_portals",
            "Number of live global-portal instances",
        ))?;
        let heartbeat_demotions = IntCounter::with_opts(Opts::new(
            "world_heartbeat_demotions_total",
            "Players demoted to offline by the heartbeat monitor",
        ))?;
        let scheduler_task_failures = IntCounter::with_opts(Opts::new(
            "world_scheduler_task_failures_total",
            "Scheduled actions that failed or panicked",
        ))?;
        let resets_performed = IntCounter::with_opts(Opts::new(
            "world_resets_performed_total",
            "Daily, weekly and monthly resets performed",
        ))?;

        registry.register(Box::new(shards.clone()))?;
        registry.register(Box::new(online_players.clone()))?;
        registry.register(Box::new(active_world_bosses.clone()))?;
        registry.register(Box::new(active_global_portals.clone()))?;
        registry.register(Box::new(heartbeat_demotions.clone()))?;
        registry.register(Box::new(scheduler_task_failures.clone()))?;
        registry.register(Box::new(resets_performed.clone()))?;

        Ok(Self {
            shards,
            online_players,
            active_world_bosses,
            active_global_portals,
            heartbeat_demotions,
            scheduler_task_failures,
            resets_performed,
        })
    }

    /// Create metrics without registering (for testing).
    pub fn unregistered() -> Self {
        Self {
            shards: IntGauge::new("world_shards", "shards").expect("valid metric name"),
            online_players: IntGauge::new("world_online_players", "online")
                .expect("valid metric name"),
            active_world_bosses: IntGauge::new("world_active_world_bosses", "bosses")
                .expect("valid metric name"),
            active_global_portals: IntGauge::new("world_active_global_portals", "portals")
                .expect("valid metric name"),
            heartbeat_demotions: IntCounter::new("world_heartbeat_demotions_total", "demotions")
                .expect("valid metric name"),
            scheduler_task_failures: IntCounter::new(
                "world_scheduler_task_failures_total",
                "failures",
            )
            .expect("valid metric name"),
            resets_performed: IntCounter::new("world_resets_performed_total", "resets")
                .expect("valid metric name"),
        }
    }
}
