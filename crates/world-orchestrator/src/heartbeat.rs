//! Heartbeat failure detector.
//!
//! Runs on its own timer, independent of the scheduler. Each tick announces
//! this orchestrator to the upstream directory, then probes the shard of
//! every online player and folds the result into the player's retry budget.
//! Demoted players are persisted offline in the background and their party
//! is cleaned up.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::clock::Clock;
use crate::directory::DirectoryClient;
use crate::metrics::WorldMetrics;
use crate::party::{PartyChange, PartyRegistry};
use crate::players::{PlayerLivenessRecord, PlayerRegistry, PlayerUpdate, ProbeOutcome, ProbeVerdict};
use crate::shard::ShardRegistry;
use crate::types::AccountId;
use crate::world_storage::WorldStorage;

/// What one heartbeat tick observed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub directory_ok: bool,
    /// Players whose shard was actually probed.
    pub probed: usize,
    pub healthy: usize,
    pub retrying: usize,
    /// Accounts moved offline during this tick, in account order.
    pub demoted: Vec<AccountId>,
}

pub struct HeartbeatMonitor {
    directory: Arc<dyn DirectoryClient>,
    shards: Arc<ShardRegistry>,
    players: Arc<PlayerRegistry>,
    parties: Arc<PartyRegistry>,
    storage: Arc<dyn WorldStorage>,
    clock: Arc<dyn Clock>,
    metrics: Arc<WorldMetrics>,
}

impl HeartbeatMonitor {
    pub fn new(
        directory: Arc<dyn DirectoryClient>,
        shards: Arc<ShardRegistry>,
        players: Arc<PlayerRegistry>,
        parties: Arc<PartyRegistry>,
        storage: Arc<dyn WorldStorage>,
        clock: Arc<dyn Clock>,
        metrics: Arc<WorldMetrics>,
    ) -> Self {
        Self {
            directory,
            shards,
            players,
            parties,
            storage,
            clock,
            metrics,
        }
    }

    /// Tick every `interval` until cancelled.
    #[instrument(skip(self, cancel))]
    pub async fn run(&self, interval: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    let report = self.tick().await;
                    if !report.demoted.is_empty() {
                        info!(demoted = report.demoted.len(), "heartbeat demoted players");
                    }
                }
            }
        }
        debug!("heartbeat loop stopped");
    }

    /// Run one heartbeat pass.
    pub async fn tick(&self) -> HeartbeatReport {
        let mut report = HeartbeatReport {
            directory_ok: self.probe_directory().await,
            ..Default::default()
        };

        for record in self.players.online() {
            let account_id = record.account_id;
            let (Some(character_id), Some(shard_id)) = (record.character_id, record.shard) else {
                warn!(%account_id, "online player without a bound character");
                self.demote_now(account_id, &mut report);
                continue;
            };
            let Some(client) = self.shards.get(shard_id) else {
                debug!(%account_id, %shard_id, "player bound to unregistered shard");
                self.demote_now(account_id, &mut report);
                continue;
            };

            report.probed += 1;
            let outcome = match self
                .shards
                .call(shard_id, client.heartbeat(character_id))
                .await
            {
                Ok(true) => ProbeOutcome::Alive,
                Ok(false) => ProbeOutcome::SessionGone,
                Err(e) if e.is_unreachable() => {
                    warn!(%account_id, %shard_id, "heartbeat probe: shard unavailable");
                    ProbeOutcome::Failed
                }
                Err(e) => {
                    error!(%account_id, %shard_id, error = %e, "heartbeat probe failed");
                    ProbeOutcome::Failed
                }
            };

            match self.players.apply_probe(account_id, outcome, self.clock.now()) {
                ProbeVerdict::Healthy => report.healthy += 1,
                ProbeVerdict::Retrying { remaining } => {
                    debug!(%account_id, remaining, "heartbeat retry budget decremented");
                    report.retrying += 1;
                }
                ProbeVerdict::Demoted(record) => self.on_demoted(record, &mut report),
                ProbeVerdict::AlreadyOffline => {}
            }
        }
        report
    }

    async fn probe_directory(&self) -> bool {
        let deadline = self.shards.rpc_timeout();
        match tokio::time::timeout(deadline, self.directory.heartbeat()).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "directory heartbeat failed");
                false
            }
            Err(_) => {
                warn!(timeout = ?deadline, "directory heartbeat timed out");
                false
            }
        }
    }

    fn demote_now(&self, account_id: AccountId, report: &mut HeartbeatReport) {
        if let Some(record) = self.players.set_offline(account_id, self.clock.now()) {
            self.on_demoted(record, report);
        }
    }

    /// Persist the demotion in the background, then clean up the party.
    fn on_demoted(&self, record: PlayerLivenessRecord, report: &mut HeartbeatReport) {
        self.metrics.heartbeat_demotions.inc();
        info!(
            account_id = %record.account_id,
            character_id = ?record.character_id,
            "player demoted to offline"
        );

        self.persist_offline(&record);

        if let Some(character_id) = record.character_id {
            match self.parties.on_member_offline(character_id, &self.players) {
                PartyChange::Unchanged => {}
                PartyChange::LeaderChanged { party, leader } => {
                    debug!(%party, %leader, "party leadership passed on after demotion");
                }
                PartyChange::Disbanded { party } => {
                    debug!(%party, "party disbanded after demotion");
                }
            }
        }
        report.demoted.push(record.account_id);
    }

    fn persist_offline(&self, record: &PlayerLivenessRecord) {
        let storage = Arc::clone(&self.storage);
        let update = PlayerUpdate {
            account_id: record.account_id,
            character_id: record.character_id,
            shard: None,
            last_seen: record.last_seen,
        };
        tokio::spawn(async move {
            if let Err(e) = storage.update_player(&update).await {
                error!(account_id = %update.account_id, error = %e, "failed to persist offline player");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::party::{PartyId, PartyMember};
    use crate::storage::memory_world::{MemoryWorldStorage, StorageOp};
    use crate::testing::{ManualClock, ScriptedDirectory, ScriptedOutcome, ScriptedShard};
    use crate::types::{CharacterId, ShardId};

    struct Harness {
        monitor: HeartbeatMonitor,
        players: Arc<PlayerRegistry>,
        parties: Arc<PartyRegistry>,
        storage: Arc<MemoryWorldStorage>,
        directory: Arc<ScriptedDirectory>,
        shard: Arc<ScriptedShard>,
        metrics: Arc<WorldMetrics>,
        clock: Arc<ManualClock>,
    }

    fn harness(retry_ceiling: u32) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(WorldMetrics::unregistered());
        let shards = Arc::new(ShardRegistry::new(Duration::from_millis(50), metrics.clone()));
        let shard = Arc::new(ScriptedShard::new(ShardId::new(1)));
        shards.register(ShardId::new(1), shard.clone());
        let players = Arc::new(PlayerRegistry::new(retry_ceiling, metrics.clone()));
        let parties = Arc::new(PartyRegistry::new());
        let storage = Arc::new(MemoryWorldStorage::new());
        let directory = Arc::new(ScriptedDirectory::new());
        let monitor = HeartbeatMonitor::new(
            directory.clone(),
            shards,
            players.clone(),
            parties.clone(),
            storage.clone(),
            clock.clone(),
            metrics.clone(),
        );
        Harness {
            monitor,
            players,
            parties,
            storage,
            directory,
            shard,
            metrics,
            clock,
        }
    }

    fn login(h: &Harness, account: i64, shard: i32) {
        h.players.update(PlayerUpdate {
            account_id: AccountId::new(account),
            character_id: Some(CharacterId::new(account * 10)),
            shard: Some(ShardId::new(shard)),
            last_seen: h.clock.now(),
        });
    }

    #[tokio::test]
    async fn healthy_player_stays_online() {
        let h = harness(3);
        login(&h, 1, 1);

        let report = h.monitor.tick().await;
        assert!(report.directory_ok);
        assert_eq!((report.probed, report.healthy), (1, 1));
        assert!(h.players.is_online(AccountId::new(1)));
        assert_eq!(h.shard.heartbeats(), vec![CharacterId::new(10)]);
    }

    #[tokio::test]
    async fn demoted_exactly_on_ceiling_failure() {
        let h = harness(3);
        login(&h, 1, 1);
        h.shard.set_default(ScriptedOutcome::Unreachable);

        for _ in 0..2 {
            let report = h.monitor.tick().await;
            assert_eq!(report.retrying, 1);
            assert!(h.players.is_online(AccountId::new(1)));
        }
        let report = h.monitor.tick().await;
        assert_eq!(report.demoted, vec![AccountId::new(1)]);
        assert!(!h.players.is_online(AccountId::new(1)));
        assert_eq!(h.metrics.heartbeat_demotions.get(), 1);

        // Already offline: no longer probed.
        let report = h.monitor.tick().await;
        assert_eq!(report.probed, 0);
    }

    #[tokio::test]
    async fn success_restores_retry_budget() {
        let h = harness(2);
        login(&h, 1, 1);
        h.shard.push_outcomes([ScriptedOutcome::Fail, ScriptedOutcome::Ok, ScriptedOutcome::Fail]);

        h.monitor.tick().await;
        assert_eq!(h.players.get(AccountId::new(1)).unwrap().retry, 1);
        h.monitor.tick().await;
        assert_eq!(h.players.get(AccountId::new(1)).unwrap().retry, 2);
        h.monitor.tick().await;
        assert!(h.players.is_online(AccountId::new(1)));
    }

    #[tokio::test]
    async fn session_gone_demotes_immediately() {
        let h = harness(3);
        login(&h, 1, 1);
        h.shard.set_session_alive(false);

        let report = h.monitor.tick().await;
        assert_eq!(report.demoted, vec![AccountId::new(1)]);
        assert_eq!(h.players.get(AccountId::new(1)).unwrap().retry, 3);
    }

    #[tokio::test]
    async fn unregistered_shard_demotes_without_probe() {
        let h = harness(3);
        login(&h, 1, 9);

        let report = h.monitor.tick().await;
        assert_eq!(report.probed, 0);
        assert_eq!(report.demoted, vec![AccountId::new(1)]);
        assert_eq!(h.shard.attempts(), 0);
    }

    #[tokio::test]
    async fn missing_character_demotes_without_probe() {
        let h = harness(3);
        h.players.update(PlayerUpdate {
            account_id: AccountId::new(4),
            character_id: None,
            shard: Some(ShardId::new(1)),
            last_seen: h.clock.now(),
        });

        let report = h.monitor.tick().await;
        assert_eq!(report.demoted, vec![AccountId::new(4)]);
        assert_eq!(h.shard.attempts(), 0);
    }

    #[tokio::test]
    async fn directory_outage_demotes_nobody() {
        let h = harness(1);
        login(&h, 1, 1);
        h.directory.set_failing(true);

        let report = h.monitor.tick().await;
        assert!(!report.directory_ok);
        assert!(report.demoted.is_empty());
        assert_eq!(h.directory.calls(), 1);
    }

    #[tokio::test]
    async fn demotion_persists_in_background() {
        let h = harness(1);
        login(&h, 1, 1);
        h.shard.set_default(ScriptedOutcome::Fail);

        h.monitor.tick().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stored = h.storage.player(AccountId::new(1)).unwrap();
        assert_eq!(stored.shard, None);
        assert_eq!(stored.last_seen, h.clock.now());
    }

    #[tokio::test]
    async fn storage_failure_does_not_block_demotion() {
        let h = harness(1);
        login(&h, 1, 1);
        h.storage.fail(StorageOp::UpdatePlayer);
        h.shard.set_default(ScriptedOutcome::Unreachable);

        let report = h.monitor.tick().await;
        assert_eq!(report.demoted, vec![AccountId::new(1)]);
        assert!(!h.players.is_online(AccountId::new(1)));
    }

    #[tokio::test]
    async fn demoted_leader_hands_over_party() {
        let h = harness(1);
        login(&h, 1, 1);
        login(&h, 2, 1);
        h.parties.create(
            PartyId(1),
            vec![
                PartyMember {
                    account_id: AccountId::new(1),
                    character_id: CharacterId::new(10),
                },
                PartyMember {
                    account_id: AccountId::new(2),
                    character_id: CharacterId::new(20),
                },
            ],
        );
        // Account 1 is probed first and fails; account 2 stays healthy.
        h.shard.push_outcomes([ScriptedOutcome::Unreachable]);

        let report = h.monitor.tick().await;
        assert_eq!(report.demoted, vec![AccountId::new(1)]);
        let party = h.parties.get(PartyId(1)).unwrap();
        assert_eq!(party.leader, CharacterId::new(20));
    }

    #[tokio::test]
    async fn slow_shard_counts_as_failed_probe() {
        let h = harness(1);
        login(&h, 1, 1);
        h.shard.set_default(ScriptedOutcome::Hang);

        let report = h.monitor.tick().await;
        assert_eq!(report.demoted, vec![AccountId::new(1)]);
    }

    #[tokio::test]
    async fn run_stops_on_cancel() {
        let h = Arc::new(harness(3));
        let cancel = CancellationToken::new();
        let task = {
            let h = Arc::clone(&h);
            let cancel = cancel.clone();
            tokio::spawn(async move { h.monitor.run(Duration::from_millis(10), cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(35)).await;
        cancel.cancel();
        task.await.unwrap();
        assert!(h.directory.calls() >= 2);
    }
}
