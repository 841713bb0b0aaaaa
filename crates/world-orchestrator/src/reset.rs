//! Daily, weekly and monthly resets.
//!
//! Boundaries are local midnights in a fixed UTC offset: every midnight for
//! daily, the configured weekday for weekly and the first of the month for
//! monthly. On startup each reset whose last record predates the most recent
//! boundary runs immediately. Daily and weekly resets then repeat on a strict
//! grid anchored at the next boundary. Monthly resets recompute the next
//! first-of-month at every firing.

use chrono::{
    DateTime, Datelike, FixedOffset, Months, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::metrics::WorldMetrics;
use crate::scheduler::Scheduler;
use crate::shard::{FanOutReport, ShardRegistry};
use crate::types::ResetKind;
use crate::world_storage::WorldStorage;

/// Reset boundary arithmetic in a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetCalendar {
    offset: FixedOffset,
    weekly_day: Weekday,
}

impl ResetCalendar {
    pub fn new(offset: FixedOffset, weekly_day: Weekday) -> Self {
        Self { offset, weekly_day }
    }

    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.reset_utc_offset, config.weekly_reset_day)
    }

    /// The most recent boundary at or before `now`.
    pub fn last_boundary(&self, kind: ResetKind, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let today = now.with_timezone(&self.offset).date_naive();
        let date = match kind {
            ResetKind::Daily => today,
            ResetKind::Weekly => {
                let since = (today.weekday().num_days_from_monday() + 7
                    - self.weekly_day.num_days_from_monday())
                    % 7;
                today.checked_sub_signed(TimeDelta::days(i64::from(since)))?
            }
            ResetKind::Monthly => today.with_day(1)?,
        };
        Some(self.midnight(date))
    }

    /// The first boundary strictly after `now`.
    pub fn next_boundary(&self, kind: ResetKind, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last = self.last_boundary(kind, now)?;
        match kind {
            ResetKind::Daily => last.checked_add_signed(TimeDelta::days(1)),
            ResetKind::Weekly => last.checked_add_signed(TimeDelta::weeks(1)),
            ResetKind::Monthly => {
                let first = last.with_timezone(&self.offset).date_naive();
                Some(self.midnight(first.checked_add_months(Months::new(1))?))
            }
        }
    }

    fn midnight(&self, date: NaiveDate) -> DateTime<Utc> {
        let local = date.and_time(NaiveTime::MIN);
        let utc = local - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(utc, Utc)
    }
}

/// Keeps the periodic resets on schedule.
pub struct ResetCoordinator {
    scheduler: Arc<Scheduler>,
    storage: Arc<dyn WorldStorage>,
    shards: Arc<ShardRegistry>,
    metrics: Arc<WorldMetrics>,
    calendar: ResetCalendar,
}

impl ResetCoordinator {
    pub fn new(
        scheduler: Arc<Scheduler>,
        storage: Arc<dyn WorldStorage>,
        shards: Arc<ShardRegistry>,
        metrics: Arc<WorldMetrics>,
        calendar: ResetCalendar,
    ) -> Self {
        Self {
            scheduler,
            storage,
            shards,
            metrics,
            calendar,
        }
    }

    pub fn calendar(&self) -> ResetCalendar {
        self.calendar
    }

    /// Catch up on overdue resets, then arm every reset at its next
    /// boundary.
    ///
    /// A storage failure is logged; the affected reset is retried at its
    /// next boundary.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) {
        let now = self.scheduler.now();
        for kind in ResetKind::ALL {
            if let Err(e) = self.reset_if_stale(kind, now).await {
                error!(%kind, error = %e, "reset catch-up failed");
            }
            self.arm(kind, now);
        }
    }

    /// Perform `kind` if its last record predates the boundary at or before
    /// `now`. Returns whether a reset ran.
    pub async fn reset_if_stale(
        &self,
        kind: ResetKind,
        now: DateTime<Utc>,
    ) -> Result<bool, OrchestratorError> {
        let boundary = self.calendar.last_boundary(kind, now).ok_or_else(|| {
            OrchestratorError::InvalidConfig {
                reason: format!("{kind} reset boundary out of range at {now}"),
            }
        })?;
        let last = self.storage.last_reset(kind, now).await?;
        if last >= boundary {
            return Ok(false);
        }
        info!(%kind, last_reset = %last, %boundary, "reset due");
        self.perform(kind, now).await?;
        Ok(true)
    }

    /// Mutate storage for `kind`, then tell every shard.
    pub async fn perform(
        &self,
        kind: ResetKind,
        at: DateTime<Utc>,
    ) -> Result<FanOutReport, OrchestratorError> {
        self.storage.perform_reset(kind, at).await?;
        self.metrics.resets_performed.inc();
        let report = self
            .shards
            .fan_out("notify_reset", move |client| {
                Box::pin(async move { client.notify_reset(kind).await })
            })
            .await;
        info!(
            %kind,
            %at,
            notified = report.acknowledged.len(),
            "reset performed"
        );
        Ok(report)
    }

    fn arm(self: &Arc<Self>, kind: ResetKind, now: DateTime<Utc>) {
        let Some(next) = self.calendar.next_boundary(kind, now) else {
            error!(%kind, "no next reset boundary");
            return;
        };
        let name = format!("reset:{kind}");
        let coordinator = Arc::clone(self);
        match kind {
            ResetKind::Daily | ResetKind::Weekly => {
                let interval = match kind {
                    ResetKind::Weekly => Duration::from_secs(7 * 86_400),
                    _ => Duration::from_secs(86_400),
                };
                self.scheduler
                    .schedule_repeated_from(name, next, interval, true, move |at| {
                        let coordinator = Arc::clone(&coordinator);
                        Box::pin(async move {
                            coordinator.reset_if_stale(kind, at).await.map(|_| ())
                        })
                    });
            }
            ResetKind::Monthly => {
                self.scheduler.schedule_at(name, next, move |at| {
                    let coordinator = Arc::clone(&coordinator);
                    Box::pin(async move {
                        coordinator.arm(kind, at);
                        coordinator.reset_if_stale(kind, at).await.map(|_| ())
                    })
                });
            }
        }
    }
}
