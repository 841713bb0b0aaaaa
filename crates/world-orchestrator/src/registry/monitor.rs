//! Lifetime monitors for live event instances.
//!
//! Each live instance gets one task that sleeps until the warn point, warns
//! the alive set, sleeps out the rest of the lifetime and then disposes the
//! instance. Cancellation (shutdown, or the instance leaving its registry
//! early) ends the task without any teardown side effects.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ActiveEvents, EventInstance};
use crate::types::{EventKind, InstanceId};

/// How a monitor task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    /// The lifetime elapsed and the monitor disposed the instance.
    Expired,
    /// The lifetime elapsed but the instance had already left its registry.
    AlreadyGone,
    /// Cancelled before the lifetime elapsed.
    Cancelled,
}

type MonitorKey = (EventKind, InstanceId);

/// Tracks one monitor task per live instance so shutdown can join them.
pub struct LifetimeMonitors {
    tasks: Arc<DashMap<MonitorKey, JoinHandle<MonitorExit>>>,
}

impl LifetimeMonitors {
    pub fn new() -> Self {
        Self {
            tasks: Arc::new(DashMap::new()),
        }
    }

    /// Start monitoring `instance`, which lives in `events`.
    ///
    /// With a zero warn window, or one at least as long as the lifetime, no
    /// warning is sent and the instance simply expires after `lifetime`.
    pub fn spawn(
        &self,
        events: Arc<dyn ActiveEvents>,
        instance: Arc<EventInstance>,
        lifetime: Duration,
        warn_window: Duration,
    ) {
        let key = (instance.kind(), instance.instance_id());
        let handle = tokio::spawn(watch(events, instance, lifetime, warn_window));
        self.tasks.retain(|_, task| !task.is_finished());
        self.tasks.insert(key, handle);
    }

    /// Number of monitors that have not finished yet.
    pub fn active(&self) -> usize {
        self.tasks.iter().filter(|t| !t.is_finished()).count()
    }

    /// Wait up to `grace` for every monitor to finish, then abort the rest.
    ///
    /// Monitors exit promptly once their instance tokens are cancelled, so
    /// the grace period only matters for a monitor caught mid-teardown.
    pub async fn shutdown(&self, grace: Duration) {
        let keys: Vec<MonitorKey> = self.tasks.iter().map(|t| *t.key()).collect();
        let handles: Vec<(MonitorKey, JoinHandle<MonitorExit>)> = keys
            .into_iter()
            .filter_map(|key| self.tasks.remove(&key))
            .collect();
        let abort_handles: Vec<_> = handles.iter().map(|(_, h)| h.abort_handle()).collect();

        let join_all = async {
            for ((kind, instance_id), handle) in handles {
                match handle.await {
                    Ok(exit) => debug!(%kind, %instance_id, ?exit, "monitor finished"),
                    Err(e) => warn!(%kind, %instance_id, error = %e, "monitor task failed"),
                }
            }
        };
        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!(
                remaining = abort_handles.iter().filter(|h| !h.is_finished()).count(),
                "monitor shutdown grace elapsed, aborting"
            );
            for handle in abort_handles {
                handle.abort();
            }
        }
    }
}

impl Default for LifetimeMonitors {
    fn default() -> Self {
        Self::new()
    }
}

async fn watch(
    events: Arc<dyn ActiveEvents>,
    instance: Arc<EventInstance>,
    lifetime: Duration,
    warn_window: Duration,
) -> MonitorExit {
    let cancel = instance.cancel_token().clone();
    let metadata_id = instance.metadata_id();
    let instance_id = instance.instance_id();

    if !warn_window.is_zero() && warn_window < lifetime {
        if !sleep_unless_cancelled(lifetime - warn_window, &cancel).await {
            return MonitorExit::Cancelled;
        }
        let still_live = events
            .current(metadata_id)
            .is_some_and(|live| live.instance_id() == instance_id);
        if !still_live {
            return MonitorExit::AlreadyGone;
        }
        events.warn(&instance).await;
        if !sleep_unless_cancelled(warn_window, &cancel).await {
            return MonitorExit::Cancelled;
        }
    } else if !sleep_unless_cancelled(lifetime, &cancel).await {
        return MonitorExit::Cancelled;
    }

    match events.dispose_instance(metadata_id, instance_id).await {
        Some(_) => {
            info!(
                kind = %instance.kind(),
                %metadata_id,
                %instance_id,
                "event lifetime expired"
            );
            MonitorExit::Expired
        }
        None => MonitorExit::AlreadyGone,
    }
}

/// Sleep for `duration`; returns `false` if `cancel` fired first.
async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
