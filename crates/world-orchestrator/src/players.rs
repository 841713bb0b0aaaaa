//! Player liveness records.
//!
//! A record is online while it is bound to a shard. Every mutation of a
//! record (session updates from shards, heartbeat outcomes, demotion) happens
//! under that record's map entry lock, so the retry counter and the shard
//! binding never tear against each other.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metrics::WorldMetrics;
use crate::types::{AccountId, CharacterId, ShardId};

/// Session change reported by a shard (login, logout, channel change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerUpdate {
    pub account_id: AccountId,
    pub character_id: Option<CharacterId>,
    /// `None` means the player went offline.
    pub shard: Option<ShardId>,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerLivenessRecord {
    pub account_id: AccountId,
    pub character_id: Option<CharacterId>,
    pub shard: Option<ShardId>,
    /// Failed probes left before demotion; between 0 and the ceiling.
    pub retry: u32,
    pub last_seen: DateTime<Utc>,
}

impl PlayerLivenessRecord {
    pub fn is_online(&self) -> bool {
        self.shard.is_some()
    }
}

/// Result of one heartbeat probe against a player's shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// The shard confirmed the session.
    Alive,
    /// The shard answered but no longer holds the session.
    SessionGone,
    /// The probe itself failed (unreachable, timeout, other RPC error).
    Failed,
}

/// What applying a probe outcome did to the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeVerdict {
    Healthy,
    Retrying { remaining: u32 },
    /// The record was moved offline; carries the record as it is now.
    Demoted(PlayerLivenessRecord),
    /// The record was already offline or unknown; nothing changed.
    AlreadyOffline,
}

/// Liveness records keyed by account.
pub struct PlayerRegistry {
    records: DashMap<AccountId, PlayerLivenessRecord>,
    retry_ceiling: u32,
    metrics: Arc<WorldMetrics>,
}

impl PlayerRegistry {
    pub fn new(retry_ceiling: u32, metrics: Arc<WorldMetrics>) -> Self {
        Self {
            records: DashMap::new(),
            retry_ceiling,
            metrics,
        }
    }

    pub fn retry_ceiling(&self) -> u32 {
        self.retry_ceiling
    }

    /// Apply a session change. A record seen for the first time, or coming
    /// back online, starts with a full retry budget.
    pub fn update(&self, update: PlayerUpdate) -> PlayerLivenessRecord {
        let record = {
            let mut entry = self
                .records
                .entry(update.account_id)
                .or_insert_with(|| PlayerLivenessRecord {
                    account_id: update.account_id,
                    character_id: None,
                    shard: None,
                    retry: self.retry_ceiling,
                    last_seen: update.last_seen,
                });
            let record = entry.value_mut();
            if update.shard.is_some() && !record.is_online() {
                record.retry = self.retry_ceiling;
            }
            if update.character_id.is_some() {
                record.character_id = update.character_id;
            }
            record.shard = update.shard;
            record.last_seen = update.last_seen;
            record.clone()
        };
        self.refresh_online_gauge();
        record
    }

    pub fn get(&self, account_id: AccountId) -> Option<PlayerLivenessRecord> {
        self.records.get(&account_id).map(|r| r.value().clone())
    }

    /// Snapshot of every online record, ordered by account.
    pub fn online(&self) -> Vec<PlayerLivenessRecord> {
        let mut online: Vec<PlayerLivenessRecord> = self
            .records
            .iter()
            .filter(|r| r.is_online())
            .map(|r| r.value().clone())
            .collect();
        online.sort_by_key(|r| r.account_id);
        online
    }

    pub fn online_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_online()).count()
    }

    pub fn is_online(&self, account_id: AccountId) -> bool {
        self.records
            .get(&account_id)
            .is_some_and(|r| r.is_online())
    }

    /// Move a record offline. Returns the demoted record, or `None` if it
    /// was already offline or unknown.
    pub fn set_offline(
        &self,
        account_id: AccountId,
        now: DateTime<Utc>,
    ) -> Option<PlayerLivenessRecord> {
        let demoted = {
            let mut record = self.records.get_mut(&account_id)?;
            if !record.is_online() {
                return None;
            }
            Self::demote(&mut record, self.retry_ceiling, now);
            record.clone()
        };
        self.refresh_online_gauge();
        Some(demoted)
    }

    /// Fold one probe outcome into a record's retry budget.
    ///
    /// A failed probe decrements the counter first and demotes once it
    /// reaches zero, so a ceiling of N demotes on the Nth consecutive
    /// failure.
    pub fn apply_probe(
        &self,
        account_id: AccountId,
        outcome: ProbeOutcome,
        now: DateTime<Utc>,
    ) -> ProbeVerdict {
        let verdict = {
            let Some(mut record) = self.records.get_mut(&account_id) else {
                return ProbeVerdict::AlreadyOffline;
            };
            if !record.is_online() {
                return ProbeVerdict::AlreadyOffline;
            }
            match outcome {
                ProbeOutcome::Alive => {
                    record.retry = self.retry_ceiling;
                    ProbeVerdict::Healthy
                }
                ProbeOutcome::SessionGone => {
                    Self::demote(&mut record, self.retry_ceiling, now);
                    ProbeVerdict::Demoted(record.clone())
                }
                ProbeOutcome::Failed => {
                    record.retry = record.retry.saturating_sub(1);
                    if record.retry == 0 {
                        Self::demote(&mut record, self.retry_ceiling, now);
                        ProbeVerdict::Demoted(record.clone())
                    } else {
                        ProbeVerdict::Retrying {
                            remaining: record.retry,
                        }
                    }
                }
            }
        };
        if matches!(verdict, ProbeVerdict::Demoted(_)) {
            self.refresh_online_gauge();
        }
        verdict
    }

    /// Drop every record to offline without touching storage.
    pub fn mark_all_offline(&self, now: DateTime<Utc>) -> usize {
        let mut count = 0;
        for mut record in self.records.iter_mut() {
            if record.is_online() {
                Self::demote(&mut record, self.retry_ceiling, now);
                count += 1;
            }
        }
        self.refresh_online_gauge();
        count
    }

    fn demote(record: &mut PlayerLivenessRecord, ceiling: u32, now: DateTime<Utc>) {
        record.shard = None;
        record.retry = ceiling;
        record.last_seen = now;
    }

    fn refresh_online_gauge(&self) {
        self.metrics.online_players.set(self.online_count() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 2, 2, 2, 2).unwrap()
    }

    fn registry(ceiling: u32) -> PlayerRegistry {
        PlayerRegistry::new(ceiling, Arc::new(WorldMetrics::unregistered()))
    }

    fn login(registry: &PlayerRegistry, account: i64, shard: i32) {
        registry.update(PlayerUpdate {
            account_id: AccountId::new(account),
            character_id: Some(CharacterId::new(account * 100)),
            shard: Some(ShardId::new(shard)),
            last_seen: now(),
        });
    }

    #[test]
    fn new_record_starts_at_ceiling() {
        let registry = registry(3);
        login(&registry, 1, 1);
        let record = registry.get(AccountId::new(1)).unwrap();
        assert_eq!(record.retry, 3);
        assert!(record.is_online());
        assert_eq!(registry.metrics.online_players.get(), 1);
    }

    #[test]
    fn failed_probes_demote_on_the_ceiling_th_failure() {
        let registry = registry(3);
        login(&registry, 1, 1);
        let account = AccountId::new(1);

        assert_eq!(
            registry.apply_probe(account, ProbeOutcome::Failed, now()),
            ProbeVerdict::Retrying { remaining: 2 }
        );
        assert_eq!(
            registry.apply_probe(account, ProbeOutcome::Failed, now()),
            ProbeVerdict::Retrying { remaining: 1 }
        );
        assert!(registry.is_online(account));
        let verdict = registry.apply_probe(account, ProbeOutcome::Failed, now());
        assert!(matches!(verdict, ProbeVerdict::Demoted(ref r) if r.shard.is_none()));
        assert!(!registry.is_online(account));
        assert_eq!(registry.metrics.online_players.get(), 0);
    }

    #[test]
    fn success_restores_the_retry_budget() {
        let registry = registry(3);
        login(&registry, 1, 1);
        let account = AccountId::new(1);

        registry.apply_probe(account, ProbeOutcome::Failed, now());
        registry.apply_probe(account, ProbeOutcome::Failed, now());
        assert_eq!(
            registry.apply_probe(account, ProbeOutcome::Alive, now()),
            ProbeVerdict::Healthy
        );
        assert_eq!(registry.get(account).unwrap().retry, 3);
    }

    #[test]
    fn session_gone_demotes_immediately() {
        let registry = registry(3);
        login(&registry, 1, 1);
        let verdict = registry.apply_probe(AccountId::new(1), ProbeOutcome::SessionGone, now());
        match verdict {
            ProbeVerdict::Demoted(record) => {
                assert_eq!(record.retry, 3);
                assert_eq!(record.character_id, Some(CharacterId::new(100)));
            }
            other => panic!("expected demotion, got {other:?}"),
        }
    }

    #[test]
    fn set_offline_is_idempotent() {
        let registry = registry(3);
        login(&registry, 1, 1);
        let account = AccountId::new(1);

        assert!(registry.set_offline(account, now()).is_some());
        assert!(registry.set_offline(account, now()).is_none());
        assert_eq!(
            registry.apply_probe(account, ProbeOutcome::Failed, now()),
            ProbeVerdict::AlreadyOffline
        );
        assert!(registry.set_offline(AccountId::new(99), now()).is_none());
    }

    #[test]
    fn coming_back_online_resets_retry() {
        let registry = registry(2);
        login(&registry, 1, 1);
        let account = AccountId::new(1);
        registry.apply_probe(account, ProbeOutcome::Failed, now());
        assert_eq!(registry.get(account).unwrap().retry, 1);

        // Channel change keeps the budget; logging back in after going
        // offline restores it.
        login(&registry, 1, 2);
        assert_eq!(registry.get(account).unwrap().retry, 1);
        registry.set_offline(account, now());
        login(&registry, 1, 2);
        assert_eq!(registry.get(account).unwrap().retry, 2);
    }

    #[test]
    fn online_snapshot_and_mass_offline() {
        let registry = registry(3);
        login(&registry, 2, 1);
        login(&registry, 1, 1);
        login(&registry, 3, 2);
        registry.set_offline(AccountId::new(3), now());

        let online: Vec<_> = registry.online().iter().map(|r| r.account_id).collect();
        assert_eq!(online, vec![AccountId::new(1), AccountId::new(2)]);
        assert_eq!(registry.mark_all_offline(now()), 2);
        assert!(registry.online().is_empty());
    }
}
