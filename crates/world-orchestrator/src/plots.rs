//! Housing plot expiry sweep.
//!
//! Owned plots past their expiry are forfeited. Owner-less plots are put
//! back up for sale once the sale waiting time has passed since their
//! expiry. Each sweep re-arms itself at the soonest owned expiry, or after
//! the fallback delay when no owned plot is left. A plot still owned past
//! its expiry after a sweep failed to forfeit; the sweep then backs off for
//! the retry delay instead of firing again on the next tick.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::scheduler::Scheduler;
use crate::shard::{PlotUpdate, ShardRegistry};
use crate::world_storage::{PlotInfo, WorldStorage};

/// Plot ids touched by one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PlotSweepReport {
    pub forfeited: Vec<i64>,
    pub reopened: Vec<i64>,
    /// Plots whose storage update failed; retried on a later sweep.
    pub skipped: Vec<i64>,
}

pub struct PlotSweeper {
    scheduler: Arc<Scheduler>,
    storage: Arc<dyn WorldStorage>,
    shards: Arc<ShardRegistry>,
    sale_waiting_time: TimeDelta,
    fallback: Duration,
    retry_delay: Duration,
}

impl PlotSweeper {
    pub fn new(
        scheduler: Arc<Scheduler>,
        storage: Arc<dyn WorldStorage>,
        shards: Arc<ShardRegistry>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            scheduler,
            storage,
            shards,
            sale_waiting_time: TimeDelta::from_std(config.plot_sale_waiting_time)
                .unwrap_or(TimeDelta::MAX),
            fallback: config.plot_check_fallback,
            retry_delay: config.plot_retry_delay,
        }
    }

    /// Arm the first sweep for the next scheduler drain.
    pub fn start(self: &Arc<Self>) {
        self.arm(TimeDelta::zero());
    }

    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<PlotSweepReport, OrchestratorError> {
        let mut report = PlotSweepReport::default();
        for plot in self.storage.plots_to_expire(now).await? {
            match plot.owner {
                Some(owner) => match self.storage.forfeit_plot(&plot).await {
                    Ok(()) => {
                        info!(plot = plot.id, %owner, "plot forfeited");
                        self.notify(&plot, PlotUpdate {
                            map_id: plot.map_id,
                            plot_number: plot.number,
                            account_id: Some(owner),
                            forfeit: true,
                        })
                        .await;
                        report.forfeited.push(plot.id);
                    }
                    Err(e) => {
                        error!(plot = plot.id, error = %e, "failed to forfeit plot");
                        report.skipped.push(plot.id);
                    }
                },
                None => {
                    let reopens_at = plot
                        .expiry
                        .checked_add_signed(self.sale_waiting_time)
                        .unwrap_or(DateTime::<Utc>::MAX_UTC);
                    if reopens_at > now {
                        continue;
                    }
                    match self.storage.reopen_plot(&plot).await {
                        Ok(()) => {
                            info!(plot = plot.id, "plot reopened for sale");
                            self.notify(&plot, PlotUpdate {
                                map_id: plot.map_id,
                                plot_number: plot.number,
                                account_id: None,
                                forfeit: false,
                            })
                            .await;
                            report.reopened.push(plot.id);
                        }
                        Err(e) => {
                            error!(plot = plot.id, error = %e, "failed to reopen plot");
                            report.skipped.push(plot.id);
                        }
                    }
                }
            }
        }
        Ok(report)
    }

    async fn notify(&self, plot: &PlotInfo, update: PlotUpdate) {
        let update = Arc::new(update);
        let report = self
            .shards
            .fan_out("update_plot", move |client| {
                let update = Arc::clone(&update);
                Box::pin(async move { client.update_plot(&update).await })
            })
            .await;
        debug!(plot = plot.id, notified = report.acknowledged.len(), "plot update sent");
    }

    /// Delay until the next sweep: the soonest owned expiry, the retry delay
    /// if that expiry is already overdue, else the fallback.
    async fn next_delay(&self, now: DateTime<Utc>) -> TimeDelta {
        let fallback = TimeDelta::from_std(self.fallback).unwrap_or(TimeDelta::MAX);
        match self.storage.soonest_plot_expiry().await {
            Ok(Some(expiry)) if expiry >= now => expiry - now,
            Ok(Some(expiry)) => {
                warn!(
                    %expiry,
                    retry_in = ?self.retry_delay,
                    "expired plot still owned, backing off"
                );
                TimeDelta::from_std(self.retry_delay).unwrap_or(fallback)
            }
            Ok(None) => fallback,
            Err(e) => {
                error!(error = %e, "failed to read soonest plot expiry");
                fallback
            }
        }
    }

    fn arm(self: &Arc<Self>, delay: TimeDelta) {
        let sweeper = Arc::clone(self);
        self.scheduler.schedule("plot_sweep", delay, move |_| {
            let sweeper = Arc::clone(&sweeper);
            Box::pin(async move { sweeper.run_once().await })
        });
    }

    async fn run_once(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        let now = self.scheduler.now();
        let result = self.sweep(now).await;
        let delay = self.next_delay(now).await;
        self.arm(delay);
        result.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::metrics::WorldMetrics;
    use crate::storage::memory_world::{MemoryWorldStorage, PlotStatus, StorageOp};
    use crate::testing::{ManualClock, ScriptedShard};
    use crate::types::{AccountId, ShardId};

    struct Harness {
        clock: Arc<ManualClock>,
        scheduler: Arc<Scheduler>,
        storage: Arc<MemoryWorldStorage>,
        shard: Arc<ScriptedShard>,
        sweeper: Arc<PlotSweeper>,
    }

    fn harness() -> Harness {
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(WorldMetrics::unregistered());
        let scheduler = Arc::new(Scheduler::new(clock.clone(), metrics.clone()));
        let shards = Arc::new(ShardRegistry::new(Duration::from_millis(50), metrics));
        let shard = Arc::new(ScriptedShard::new(ShardId::new(1)));
        shards.register(ShardId::new(1), shard.clone());
        let storage = Arc::new(MemoryWorldStorage::new());
        let sweeper = Arc::new(PlotSweeper::new(
            scheduler.clone(),
            storage.clone(),
            shards,
            &OrchestratorConfig::default(),
        ));
        Harness {
            clock,
            scheduler,
            storage,
            shard,
            sweeper,
        }
    }

    fn plot(id: i64, owner: Option<i64>, expiry: DateTime<Utc>) -> PlotInfo {
        PlotInfo {
            id,
            map_id: 2_000_000 + id as i32,
            number: id as i32,
            owner: owner.map(AccountId::new),
            expiry,
        }
    }

    #[tokio::test]
    async fn expired_owned_plot_is_forfeited() {
        let h = harness();
        let now = h.clock.now();
        h.storage.add_plot(plot(1, Some(77), now - TimeDelta::hours(1)));
        h.storage.add_plot(plot(2, Some(78), now + TimeDelta::hours(1)));

        let report = h.sweeper.sweep(now).await.unwrap();
        assert_eq!(report.forfeited, vec![1]);
        let (stored, status) = h.storage.plot(1).unwrap();
        assert_eq!((stored.owner, status), (None, PlotStatus::Pending));
        assert_eq!(h.storage.plot(2).unwrap().1, PlotStatus::Owned);
        assert_eq!(
            h.shard.plot_updates(),
            vec![PlotUpdate {
                map_id: 2_000_001,
                plot_number: 1,
                account_id: Some(AccountId::new(77)),
                forfeit: true,
            }]
        );
    }

    #[tokio::test]
    async fn pending_plot_reopens_after_waiting_time() {
        let h = harness();
        let now = h.clock.now();
        h.storage.add_plot(plot(1, None, now - TimeDelta::days(4)));
        h.storage.add_plot(plot(2, None, now - TimeDelta::days(1)));

        let report = h.sweeper.sweep(now).await.unwrap();
        assert_eq!(report.reopened, vec![1]);
        assert_eq!(h.storage.plot(1).unwrap().1, PlotStatus::Open);
        assert_eq!(h.storage.plot(2).unwrap().1, PlotStatus::Pending);
        let updates = h.shard.plot_updates();
        assert_eq!(updates.len(), 1);
        assert!(!updates[0].forfeit);
    }

    #[tokio::test]
    async fn failed_plot_is_skipped() {
        let h = harness();
        let now = h.clock.now();
        h.storage.add_plot(plot(1, Some(77), now - TimeDelta::hours(1)));
        h.storage.add_plot(plot(2, None, now - TimeDelta::days(5)));
        h.storage.fail(StorageOp::ForfeitPlot);

        let report = h.sweeper.sweep(now).await.unwrap();
        assert_eq!(report.skipped, vec![1]);
        assert_eq!(report.reopened, vec![2]);
    }

    #[tokio::test]
    async fn sweep_rearms_at_soonest_expiry() {
        let h = harness();
        let now = h.clock.now();
        h.storage.add_plot(plot(1, Some(77), now + TimeDelta::hours(6)));
        h.storage.add_plot(plot(2, Some(78), now + TimeDelta::hours(2)));

        h.sweeper.start();
        h.scheduler.drain().await;
        assert_eq!(h.scheduler.next_fire_at(), Some(now + TimeDelta::hours(2)));

        h.clock.advance(TimeDelta::hours(2) + TimeDelta::seconds(1));
        h.scheduler.drain().await;
        assert_eq!(h.storage.plot(2).unwrap().1, PlotStatus::Pending);
        assert_eq!(h.scheduler.next_fire_at(), Some(now + TimeDelta::hours(6)));
    }

    #[tokio::test]
    async fn no_owned_plots_falls_back() {
        let h = harness();
        let now = h.clock.now();
        h.sweeper.start();
        h.scheduler.drain().await;
        assert_eq!(h.scheduler.next_fire_at(), Some(now + TimeDelta::days(1)));
    }

    #[tokio::test]
    async fn failed_forfeit_backs_off_instead_of_spinning() {
        let h = harness();
        let now = h.clock.now();
        h.storage.add_plot(plot(1, Some(77), now - TimeDelta::hours(1)));
        h.storage.fail(StorageOp::ForfeitPlot);

        h.sweeper.start();
        h.scheduler.drain().await;
        assert_eq!(h.scheduler.next_fire_at(), Some(now + TimeDelta::minutes(10)));

        // Ticks inside the back-off run nothing.
        for _ in 0..5 {
            h.clock.advance(TimeDelta::seconds(1));
            assert_eq!(h.scheduler.drain().await, 0);
        }

        h.storage.recover(StorageOp::ForfeitPlot);
        h.clock.set(now + TimeDelta::minutes(10));
        assert_eq!(h.scheduler.drain().await, 1);
        assert_eq!(h.storage.plot(1).unwrap().1, PlotStatus::Pending);
        assert_eq!(
            h.scheduler.next_fire_at(),
            Some(now + TimeDelta::minutes(10) + TimeDelta::days(1))
        );
    }

    #[tokio::test]
    async fn listing_failure_still_rearms() {
        let h = harness();
        let now = h.clock.now();
        h.storage.fail(StorageOp::PlotsToExpire);
        h.sweeper.start();
        h.scheduler.drain().await;
        assert_eq!(h.scheduler.len(), 1);
        assert_eq!(h.scheduler.next_fire_at(), Some(now + TimeDelta::days(1)));
    }
}
