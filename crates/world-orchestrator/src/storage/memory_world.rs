use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::error::OrchestratorError;
use crate::event::{parse_table, CyclicEventMetadata};
use crate::players::PlayerUpdate;
use crate::types::{AccountId, CharacterId, ResetKind, ShardId};
use crate::world_storage::{GameEventWindow, PlotInfo, WorldStorage};

/// Storage operations that can be made to fail in tests.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum StorageOp {
    LastReset,
    PerformReset,
    PendingCyclicEvents,
    SetAllCharactersOffline,
    DeleteUnownedItems,
    UpdatePlayer,
    GameEvents,
    PlotsToExpire,
    ForfeitPlot,
    ReopenPlot,
    SoonestPlotExpiry,
}

/// Lifecycle of a housing plot's ownership.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PlotStatus {
    Owned,
    /// Forfeited and waiting out the resale delay.
    Pending,
    Open,
}

/// In-memory world storage for testing and single-process deployments.
///
/// Rows are kept in the shape of the game database: last reset times live
/// in a server-info table keyed by name, and a character's shard binding is
/// a `channel` column where offline is a sentinel value.
pub struct MemoryWorldStorage {
    inner: Mutex<Inner>,
}

struct CharacterRow {
    character_id: Option<CharacterId>,
    channel: i32,
    last_seen: DateTime<Utc>,
}

impl CharacterRow {
    fn from_update(update: &PlayerUpdate) -> Self {
        Self {
            character_id: update.character_id,
            channel: ShardId::column_value(update.shard),
            last_seen: update.last_seen,
        }
    }

    fn to_update(&self, account_id: AccountId) -> PlayerUpdate {
        PlayerUpdate {
            account_id,
            character_id: self.character_id,
            shard: ShardId::from_column(self.channel),
            last_seen: self.last_seen,
        }
    }
}

struct Inner {
    server_info: HashMap<&'static str, DateTime<Utc>>,
    reset_log: Vec<(ResetKind, DateTime<Utc>)>,
    events: Vec<CyclicEventMetadata>,
    characters: HashMap<AccountId, CharacterRow>,
    /// Item id to owning account; `None` for orphaned items.
    items: HashMap<i64, Option<AccountId>>,
    game_events: Vec<GameEventWindow>,
    plots: HashMap<i64, (PlotInfo, PlotStatus)>,
    failing: HashSet<StorageOp>,
}

impl MemoryWorldStorage {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                server_info: HashMap::new(),
                reset_log: Vec::new(),
                events: Vec::new(),
                characters: HashMap::new(),
                items: HashMap::new(),
                game_events: Vec::new(),
                plots: HashMap::new(),
                failing: HashSet::new(),
            }),
        }
    }

    pub fn with_events(events: Vec<CyclicEventMetadata>) -> Self {
        let storage = Self::new();
        storage.inner.lock().events = events;
        storage
    }

    /// Load cyclic event definitions from a JSON time-event table.
    pub fn from_event_table(json: &str) -> Result<Self, OrchestratorError> {
        Ok(Self::with_events(parse_table(json)?))
    }

    pub fn set_last_reset(&self, kind: ResetKind, at: DateTime<Utc>) {
        self.inner.lock().server_info.insert(kind.storage_key(), at);
    }

    pub fn add_item(&self, id: i64, owner: Option<AccountId>) {
        self.inner.lock().items.insert(id, owner);
    }

    /// Ids of every stored item, sorted.
    pub fn items(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.inner.lock().items.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn add_game_event(&self, event: GameEventWindow) {
        self.inner.lock().game_events.push(event);
    }

    pub fn add_plot(&self, plot: PlotInfo) {
        let status = if plot.owner.is_some() {
            PlotStatus::Owned
        } else {
            PlotStatus::Pending
        };
        self.inner.lock().plots.insert(plot.id, (plot, status));
    }

    /// Make every call of `op` fail until [`recover`](Self::recover).
    pub fn fail(&self, op: StorageOp) {
        self.inner.lock().failing.insert(op);
    }

    pub fn recover(&self, op: StorageOp) {
        self.inner.lock().failing.remove(&op);
    }

    /// Every reset performed, in order.
    pub fn resets(&self) -> Vec<(ResetKind, DateTime<Utc>)> {
        self.inner.lock().reset_log.clone()
    }

    pub fn last_reset_record(&self, kind: ResetKind) -> Option<DateTime<Utc>> {
        self.inner.lock().server_info.get(kind.storage_key()).copied()
    }

    pub fn player(&self, account_id: AccountId) -> Option<PlayerUpdate> {
        self.inner
            .lock()
            .characters
            .get(&account_id)
            .map(|row| row.to_update(account_id))
    }

    pub fn plot(&self, id: i64) -> Option<(PlotInfo, PlotStatus)> {
        self.inner.lock().plots.get(&id).cloned()
    }

    fn check(inner: &Inner, op: StorageOp) -> Result<(), OrchestratorError> {
        if inner.failing.contains(&op) {
            return Err(OrchestratorError::storage(format!("{op:?} unavailable")));
        }
        Ok(())
    }
}

impl Default for MemoryWorldStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorldStorage for MemoryWorldStorage {
    async fn last_reset(
        &self,
        kind: ResetKind,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, OrchestratorError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, StorageOp::LastReset)?;
        Ok(*inner.server_info.entry(kind.storage_key()).or_insert(now))
    }

    async fn perform_reset(
        &self,
        kind: ResetKind,
        at: DateTime<Utc>,
    ) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, StorageOp::PerformReset)?;
        inner.server_info.insert(kind.storage_key(), at);
        inner.reset_log.push((kind, at));
        Ok(())
    }

    async fn pending_cyclic_events(&self) -> Result<Vec<CyclicEventMetadata>, OrchestratorError> {
        let inner = self.inner.lock();
        Self::check(&inner, StorageOp::PendingCyclicEvents)?;
        Ok(inner.events.clone())
    }

    async fn set_all_characters_offline(&self) -> Result<usize, OrchestratorError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, StorageOp::SetAllCharactersOffline)?;
        let mut count = 0;
        for row in inner.characters.values_mut() {
            if row.channel != ShardId::OFFLINE_SENTINEL {
                row.channel = ShardId::OFFLINE_SENTINEL;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn delete_unowned_items(&self) -> Result<usize, OrchestratorError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, StorageOp::DeleteUnownedItems)?;
        let before = inner.items.len();
        inner.items.retain(|_, owner| owner.is_some());
        Ok(before - inner.items.len())
    }

    async fn update_player(&self, update: &PlayerUpdate) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, StorageOp::UpdatePlayer)?;
        inner
            .characters
            .insert(update.account_id, CharacterRow::from_update(update));
        Ok(())
    }

    async fn game_events(&self) -> Result<Vec<GameEventWindow>, OrchestratorError> {
        let inner = self.inner.lock();
        Self::check(&inner, StorageOp::GameEvents)?;
        Ok(inner.game_events.clone())
    }

    async fn plots_to_expire(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlotInfo>, OrchestratorError> {
        let inner = self.inner.lock();
        Self::check(&inner, StorageOp::PlotsToExpire)?;
        let mut plots: Vec<PlotInfo> = inner
            .plots
            .values()
            .filter(|(plot, status)| match status {
                PlotStatus::Owned => plot.expiry < now,
                PlotStatus::Pending => true,
                PlotStatus::Open => false,
            })
            .map(|(plot, _)| plot.clone())
            .collect();
        plots.sort_by_key(|plot| plot.id);
        Ok(plots)
    }

    async fn forfeit_plot(&self, plot: &PlotInfo) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, StorageOp::ForfeitPlot)?;
        let Some((stored, status)) = inner.plots.get_mut(&plot.id) else {
            return Err(OrchestratorError::storage(format!("plot {} not found", plot.id)));
        };
        stored.owner = None;
        *status = PlotStatus::Pending;
        Ok(())
    }

    async fn reopen_plot(&self, plot: &PlotInfo) -> Result<(), OrchestratorError> {
        let mut inner = self.inner.lock();
        Self::check(&inner, StorageOp::ReopenPlot)?;
        let Some((_, status)) = inner.plots.get_mut(&plot.id) else {
            return Err(OrchestratorError::storage(format!("plot {} not found", plot.id)));
        };
        *status = PlotStatus::Open;
        Ok(())
    }

    async fn soonest_plot_expiry(&self) -> Result<Option<DateTime<Utc>>, OrchestratorError> {
        let inner = self.inner.lock();
        Self::check(&inner, StorageOp::SoonestPlotExpiry)?;
        Ok(inner
            .plots
            .values()
            .filter(|(_, status)| *status == PlotStatus::Owned)
            .map(|(plot, _)| plot.expiry)
            .min())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 1, 8, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn missing_last_reset_is_stamped_now() {
        let storage = MemoryWorldStorage::new();
        let first = storage.last_reset(ResetKind::Daily, now()).await.unwrap();
        assert_eq!(first, now());

        let later = now() + TimeDelta::hours(5);
        let second = storage.last_reset(ResetKind::Daily, later).await.unwrap();
        assert_eq!(second, now());
    }

    #[tokio::test]
    async fn perform_reset_records_time() {
        let storage = MemoryWorldStorage::new();
        storage.perform_reset(ResetKind::Weekly, now()).await.unwrap();
        assert_eq!(storage.last_reset_record(ResetKind::Weekly), Some(now()));
        assert_eq!(storage.resets(), vec![(ResetKind::Weekly, now())]);
    }

    #[tokio::test]
    async fn failure_injection_is_per_operation() {
        let storage = MemoryWorldStorage::new();
        storage.fail(StorageOp::PerformReset);
        let err = storage.perform_reset(ResetKind::Daily, now()).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Storage { .. }));
        storage.last_reset(ResetKind::Daily, now()).await.unwrap();

        storage.recover(StorageOp::PerformReset);
        storage.perform_reset(ResetKind::Daily, now()).await.unwrap();
    }

    #[tokio::test]
    async fn offline_sweep_counts_online_players() {
        let storage = MemoryWorldStorage::new();
        for (account, shard) in [(1, Some(ShardId::new(1))), (2, None), (3, Some(ShardId::new(2)))] {
            storage
                .update_player(&PlayerUpdate {
                    account_id: AccountId::new(account),
                    character_id: Some(CharacterId::new(account * 10)),
                    shard,
                    last_seen: now(),
                })
                .await
                .unwrap();
        }
        assert_eq!(storage.set_all_characters_offline().await.unwrap(), 2);
        assert_eq!(storage.player(AccountId::new(3)).unwrap().shard, None);
        assert_eq!(storage.set_all_characters_offline().await.unwrap(), 0);
        assert_eq!(
            storage.inner.lock().characters[&AccountId::new(1)].channel,
            ShardId::OFFLINE_SENTINEL
        );
    }

    #[tokio::test]
    async fn reset_times_are_keyed_by_server_info_name() {
        let storage = MemoryWorldStorage::new();
        storage.set_last_reset(ResetKind::Monthly, now());
        assert_eq!(storage.inner.lock().server_info.get("MonthlyReset"), Some(&now()));
        assert_eq!(storage.last_reset_record(ResetKind::Daily), None);
    }

    #[tokio::test]
    async fn unowned_items_are_deleted() {
        let storage = MemoryWorldStorage::new();
        storage.add_item(1, Some(AccountId::new(42)));
        storage.add_item(2, None);
        storage.add_item(3, None);

        assert_eq!(storage.delete_unowned_items().await.unwrap(), 2);
        assert_eq!(storage.items(), vec![1]);
        assert_eq!(storage.delete_unowned_items().await.unwrap(), 0);

        storage.fail(StorageOp::DeleteUnownedItems);
        assert!(storage.delete_unowned_items().await.is_err());
    }

    #[tokio::test]
    async fn plot_lifecycle() {
        let storage = MemoryWorldStorage::new();
        let plot = PlotInfo {
            id: 7,
            map_id: 2000062,
            number: 3,
            owner: Some(AccountId::new(42)),
            expiry: now() - TimeDelta::hours(1),
        };
        storage.add_plot(plot.clone());
        storage.add_plot(PlotInfo {
            id: 8,
            expiry: now() + TimeDelta::hours(6),
            ..plot.clone()
        });

        let due = storage.plots_to_expire(now()).await.unwrap();
        assert_eq!(due.iter().map(|p| p.id).collect::<Vec<_>>(), vec![7]);
        assert_eq!(
            storage.soonest_plot_expiry().await.unwrap(),
            Some(now() - TimeDelta::hours(1))
        );

        storage.forfeit_plot(&plot).await.unwrap();
        assert_eq!(storage.plot(7).unwrap().1, PlotStatus::Pending);
        assert_eq!(storage.plot(7).unwrap().0.owner, None);
        assert_eq!(
            storage.soonest_plot_expiry().await.unwrap(),
            Some(now() + TimeDelta::hours(6))
        );

        storage.reopen_plot(&plot).await.unwrap();
        assert_eq!(storage.plot(7).unwrap().1, PlotStatus::Open);
        assert!(storage.plots_to_expire(now()).await.unwrap().is_empty());
    }

    #[test]
    fn loads_event_table() {
        let storage = MemoryWorldStorage::from_event_table(
            r#"[{
                "id": 5,
                "probability": 100,
                "start_time": "2026-01-01T00:00:00Z",
                "end_time": "2027-01-01T00:00:00Z",
                "cycle": 3600,
                "lifetime": 600,
                "payload": {"kind": "world_boss", "target_map_ids": [1], "npc_ids": [2]}
            }]"#,
        )
        .unwrap();
        assert_eq!(storage.inner.lock().events.len(), 1);
    }
}
