//! Cooperative task scheduler.
//!
//! A single loop drains a time-ordered queue of one-shot and repeating tasks.
//! Any component may enqueue from any task; only the drain executes actions.
//! A failing or panicking action is logged and never affects the other tasks
//! due in the same pass.

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument};

use crate::clock::Clock;
use crate::error::OrchestratorError;
use crate::metrics::WorldMetrics;

/// A scheduled action. Receives the time it was scheduled to fire at, which
/// may be earlier than the wall clock if the drain ran late.
pub type TaskAction =
    Arc<dyn Fn(DateTime<Utc>) -> BoxFuture<'static, Result<(), OrchestratorError>> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
struct Repeat {
    interval: TimeDelta,
    strict: bool,
}

struct QueuedTask {
    fire_at: DateTime<Utc>,
    seq: u64,
    name: String,
    action: TaskAction,
    repeat: Option<Repeat>,
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.fire_at == other.fire_at && self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.fire_at
            .cmp(&other.fire_at)
            .then(self.seq.cmp(&other.seq))
    }
}

/// Time-ordered queue of one-shot and repeating tasks.
pub struct Scheduler {
    clock: Arc<dyn Clock>,
    metrics: Arc<WorldMetrics>,
    queue: Mutex<BinaryHeap<Reverse<QueuedTask>>>,
    seq: AtomicU64,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn Clock>, metrics: Arc<WorldMetrics>) -> Self {
        Self {
            clock,
            metrics,
            queue: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Enqueue a one-shot task firing at `now + delay`.
    ///
    /// A zero or negative delay fires on the next drain.
    pub fn schedule(
        &self,
        name: impl Into<String>,
        delay: TimeDelta,
        action: impl Fn(DateTime<Utc>) -> BoxFuture<'static, Result<(), OrchestratorError>>
            + Send
            + Sync
            + 'static,
    ) {
        let fire_at = self.fire_time(delay);
        self.push(name.into(), fire_at, Arc::new(action), None);
    }

    /// Enqueue a one-shot task firing at an absolute time.
    pub fn schedule_at(
        &self,
        name: impl Into<String>,
        at: DateTime<Utc>,
        action: impl Fn(DateTime<Utc>) -> BoxFuture<'static, Result<(), OrchestratorError>>
            + Send
            + Sync
            + 'static,
    ) {
        self.push(name.into(), at, Arc::new(action), None);
    }

    /// Enqueue a task that re-arms itself after every firing.
    ///
    /// With `strict` the next fire time is the previous fire time plus
    /// `interval`; otherwise it is the drain time plus `interval`. With
    /// `skip_first` the first firing waits one interval instead of running on
    /// the next drain.
    pub fn schedule_repeated(
        &self,
        name: impl Into<String>,
        interval: Duration,
        strict: bool,
        skip_first: bool,
        action: impl Fn(DateTime<Utc>) -> BoxFuture<'static, Result<(), OrchestratorError>>
            + Send
            + Sync
            + 'static,
    ) {
        let first = if skip_first {
            self.fire_time(TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX))
        } else {
            self.clock.now()
        };
        self.schedule_repeated_from(name, first, interval, strict, action);
    }

    /// Enqueue a repeating task whose first firing is at `first`.
    ///
    /// With `strict` every later firing stays on the `first + k * interval`
    /// grid however late the drains run.
    pub fn schedule_repeated_from(
        &self,
        name: impl Into<String>,
        first: DateTime<Utc>,
        interval: Duration,
        strict: bool,
        action: impl Fn(DateTime<Utc>) -> BoxFuture<'static, Result<(), OrchestratorError>>
            + Send
            + Sync
            + 'static,
    ) {
        let interval = TimeDelta::from_std(interval).unwrap_or(TimeDelta::MAX);
        self.push(
            name.into(),
            first,
            Arc::new(action),
            Some(Repeat { interval, strict }),
        );
    }

    /// Execute every task whose fire time has elapsed, in fire-time order.
    ///
    /// Repeating tasks are re-armed after they run and become eligible on the
    /// next drain at the earliest. Returns the number of actions executed.
    pub async fn drain(&self) -> usize {
        let now = self.clock.now();
        let due = {
            let mut queue = self.queue.lock();
            let mut due = Vec::new();
            while queue.peek().is_some_and(|Reverse(task)| task.fire_at <= now) {
                if let Some(Reverse(task)) = queue.pop() {
                    due.push(task);
                }
            }
            due
        };

        let executed = due.len();
        for task in due {
            self.execute(&task).await;
            if let Some(repeat) = task.repeat {
                let base = if repeat.strict { task.fire_at } else { now };
                let next = base
                    .checked_add_signed(repeat.interval)
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.push(task.name, next, task.action, Some(repeat));
            }
        }
        executed
    }

    /// Drain the queue every `tick` until cancelled.
    #[instrument(skip_all)]
    pub async fn run(&self, tick: Duration, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(tick) => {
                    self.drain().await;
                }
            }
        }
        debug!("scheduler loop stopped");
    }

    /// Number of queued tasks.
    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Fire time of the earliest queued task.
    pub fn next_fire_at(&self) -> Option<DateTime<Utc>> {
        self.queue.lock().peek().map(|Reverse(task)| task.fire_at)
    }

    /// Drop every queued task.
    ///
    /// Actions commonly capture handles to the components that scheduled
    /// them; clearing on shutdown releases those references.
    pub fn clear(&self) {
        self.queue.lock().clear();
    }

    async fn execute(&self, task: &QueuedTask) {
        let outcome = AssertUnwindSafe((task.action)(task.fire_at))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.metrics.scheduler_task_failures.inc();
                error!(task = %task.name, fire_at = %task.fire_at, error = %e, "scheduled task failed");
            }
            Err(panic) => {
                self.metrics.scheduler_task_failures.inc();
                error!(
                    task = %task.name,
                    fire_at = %task.fire_at,
                    panic = %panic_message(panic.as_ref()),
                    "scheduled task panicked"
                );
            }
        }
    }

    fn fire_time(&self, delay: TimeDelta) -> DateTime<Utc> {
        self.clock
            .now()
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn push(
        &self,
        name: String,
        fire_at: DateTime<Utc>,
        action: TaskAction,
        repeat: Option<Repeat>,
    ) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        self.queue.lock().push(Reverse(QueuedTask {
            fire_at,
            seq,
            name,
            action,
            repeat,
        }));
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}
