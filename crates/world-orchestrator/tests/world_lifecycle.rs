use chrono::{TimeDelta, TimeZone, Utc};
use std::sync::Arc;
use std::time::Duration;
use world_orchestrator::event::{
    CyclicEventMetadata, EventPayload, GlobalPortalPayload, PortalEntry, WorldBossPayload,
};
use world_orchestrator::prelude::*;
use world_orchestrator::registry::InstanceState;
use world_orchestrator::storage::memory_world::MemoryWorldStorage;
use world_orchestrator::storage::noop_directory::NoopDirectory;
use world_orchestrator::testing::{ManualClock, ScriptedOutcome, ScriptedShard};

struct World {
    clock: Arc<ManualClock>,
    storage: Arc<MemoryWorldStorage>,
    orchestrator: WorldOrchestrator,
    shards: Vec<Arc<ScriptedShard>>,
}

fn world(shard_count: i32, config: OrchestratorConfig) -> World {
    let clock = Arc::new(ManualClock::default());
    let storage = Arc::new(MemoryWorldStorage::new());
    let orchestrator = WorldOrchestrator::new(
        config,
        clock.clone(),
        storage.clone(),
        Arc::new(NoopDirectory),
        Arc::new(WorldMetrics::unregistered()),
    )
    .unwrap();
    let shards = (1..=shard_count)
        .map(|id| {
            let shard = Arc::new(ScriptedShard::new(ShardId::new(id)));
            orchestrator.register_shard(ShardId::new(id), shard.clone());
            shard
        })
        .collect();
    World {
        clock,
        storage,
        orchestrator,
        shards,
    }
}

fn world_boss(id: i32, lifetime: Duration) -> Arc<CyclicEventMetadata> {
    let start = Utc.with_ymd_and_hms(2023, 12, 1, 0, 0, 0).unwrap();
    Arc::new(CyclicEventMetadata {
        id: MetadataId::new(id),
        probability: 100,
        start_time: start,
        end_time: start + TimeDelta::days(365),
        cycle: Duration::from_secs(3600),
        random_jitter: Duration::ZERO,
        lifetime,
        payload: EventPayload::WorldBoss(WorldBossPayload {
            target_map_ids: vec![100_000_000],
            npc_ids: vec![8_800_000],
            ..Default::default()
        }),
    })
}

fn global_portal(id: i32) -> Arc<CyclicEventMetadata> {
    let mut meta = (*world_boss(id, Duration::from_secs(600))).clone();
    meta.payload = EventPayload::GlobalPortal(GlobalPortalPayload {
        popup_message: "A portal has opened".to_string(),
        entries: vec![
            PortalEntry {
                name: "Temple".to_string(),
                map_id: 270_000_000,
                portal_id: 1,
            },
            PortalEntry {
                name: "Sealed".to_string(),
                map_id: 0,
                portal_id: 2,
            },
        ],
        ..Default::default()
    });
    Arc::new(meta)
}

#[tokio::test(start_paused = true)]
async fn unreachable_shard_is_left_out_of_the_alive_set() {
    let w = world(3, OrchestratorConfig::default());
    w.shards[1].set_default(ScriptedOutcome::Unreachable);

    let instance = w
        .orchestrator
        .cyclic_events()
        .spawn(world_boss(1, Duration::from_secs(600)), w.clock.now(), None)
        .await
        .unwrap();

    assert_eq!(instance.alive_shards(), vec![ShardId::new(1), ShardId::new(3)]);
    assert_eq!(w.shards[0].announced().len(), 1);
    assert!(w.shards[1].announced().is_empty());
    assert_eq!(w.shards[2].announced().len(), 1);
    w.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn world_boss_warns_its_alive_set_then_closes_everywhere() {
    let w = world(
        2,
        OrchestratorConfig {
            world_boss_warn_window: Duration::from_secs(60),
            ..Default::default()
        },
    );
    w.shards[1].push_outcomes([ScriptedOutcome::Unreachable]);
    let meta = world_boss(7, Duration::from_secs(300));

    let instance = w
        .orchestrator
        .cyclic_events()
        .spawn(Arc::clone(&meta), w.clock.now(), None)
        .await
        .unwrap();
    let event = instance.event_ref();
    assert_eq!(w.orchestrator.active_instances(EventKind::WorldBoss).len(), 1);

    tokio::time::sleep(Duration::from_secs(250)).await;
    assert_eq!(instance.state(), InstanceState::Warned);
    assert_eq!(w.shards[0].warned(), vec![event]);
    assert!(w.shards[1].warned().is_empty());

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(instance.state(), InstanceState::Closed);
    assert_eq!(w.shards[0].closed(), vec![event]);
    assert_eq!(w.shards[1].closed(), vec![event]);
    assert!(w.orchestrator.active_instances(EventKind::WorldBoss).is_empty());

    // The slot is free again.
    assert!(w
        .orchestrator
        .cyclic_events()
        .spawn(meta, w.clock.now(), None)
        .await
        .is_some());
    w.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_live_events_untouched_on_shards() {
    let w = world(1, OrchestratorConfig::default());
    let instance = w
        .orchestrator
        .cyclic_events()
        .spawn(world_boss(3, Duration::from_secs(600)), w.clock.now(), None)
        .await
        .unwrap();

    w.orchestrator.shutdown().await;
    tokio::time::sleep(Duration::from_secs(900)).await;
    assert!(w.shards[0].closed().is_empty());
    assert_ne!(instance.state(), InstanceState::Closed);
}

#[tokio::test(start_paused = true)]
async fn silent_player_is_demoted_after_the_retry_ceiling() {
    let w = world(1, OrchestratorConfig::default());
    w.shards[0].set_default(ScriptedOutcome::Unreachable);
    let account = AccountId::new(42);
    w.orchestrator.on_player_update(PlayerUpdate {
        account_id: account,
        character_id: Some(CharacterId::new(4200)),
        shard: Some(ShardId::new(1)),
        last_seen: w.clock.now(),
    });

    for _ in 0..2 {
        let report = w.orchestrator.heartbeat().tick().await;
        assert!(report.demoted.is_empty());
    }
    let report = w.orchestrator.heartbeat().tick().await;
    assert_eq!(report.demoted, vec![account]);
    assert!(!w.orchestrator.players().is_online(account));
    assert_eq!(w.orchestrator.metrics().heartbeat_demotions.get(), 1);

    // Persistence runs in the background.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(w.storage.player(account).unwrap().shard, None);
}

#[tokio::test(start_paused = true)]
async fn startup_catches_up_a_missed_daily_reset() {
    let w = world(2, OrchestratorConfig::default());
    let now = Utc.with_ymd_and_hms(2024, 1, 2, 12, 0, 0).unwrap();
    w.clock.set(now);
    w.storage.set_last_reset(
        ResetKind::Daily,
        Utc.with_ymd_and_hms(2023, 12, 31, 0, 0, 0).unwrap(),
    );

    w.orchestrator.start().await.unwrap();

    assert_eq!(w.storage.resets(), vec![(ResetKind::Daily, now)]);
    for shard in &w.shards {
        assert_eq!(shard.resets(), vec![ResetKind::Daily]);
    }
    assert_eq!(w.orchestrator.metrics().resets_performed.get(), 1);
    w.orchestrator.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn players_join_the_live_global_portal() {
    let w = world(1, OrchestratorConfig::default());
    let meta = global_portal(9);
    let instance = w
        .orchestrator
        .cyclic_events()
        .spawn(Arc::clone(&meta), w.clock.now(), None)
        .await
        .unwrap();
    assert_eq!(
        w.orchestrator.global_portal(),
        Some((meta.id, instance.instance_id()))
    );

    let first = w.orchestrator.join_global_portal(meta.id, 0).unwrap();
    let second = w.orchestrator.join_global_portal(meta.id, 0).unwrap();
    assert_eq!((first.map_id, first.joined), (270_000_000, 1));
    assert_eq!(second.joined, 2);
    assert!(w.orchestrator.join_global_portal(meta.id, 1).is_none());
    assert!(w.orchestrator.join_global_portal(meta.id, 5).is_none());
    assert!(w
        .orchestrator
        .join_global_portal(MetadataId::new(10), 0)
        .is_none());

    // A second definition cannot open a portal while one is live.
    assert!(w
        .orchestrator
        .cyclic_events()
        .spawn(global_portal(10), w.clock.now(), None)
        .await
        .is_none());
    w.orchestrator.shutdown().await;
}
