//! Test doubles for unit and integration testing.
//!
//! Provides a manually driven clock, a shard client whose outcomes are
//! scripted per call, and a directory client that can be switched into a
//! failing state. None of them touch the network.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::clock::Clock;
use crate::directory::DirectoryClient;
use crate::error::OrchestratorError;
use crate::shard::{
    ActiveEventSummary, EventAnnouncement, EventRef, GameEventChange, PlotUpdate, ShardClient,
    StringBoardChange,
};
use crate::types::{CharacterId, ResetKind, ShardId};

/// A clock that only moves when told to.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    /// Starts at 2024-01-01T00:00:00Z.
    fn default() -> Self {
        Self::at(DateTime::from_timestamp(1_704_067_200, 0).unwrap_or_default())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// How a [`ScriptedShard`] answers one call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Ok,
    /// Fail with [`OrchestratorError::ShardUnreachable`].
    Unreachable,
    /// Fail with a hard [`OrchestratorError::ShardRpc`] error.
    Fail,
    /// Never answer; only the caller's deadline ends the call.
    Hang,
}

/// A call a [`ScriptedShard`] acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub enum ShardCall {
    Announce(EventAnnouncement),
    Warn(EventRef),
    Close(EventRef),
    Reset(ResetKind),
    Heartbeat(CharacterId),
    GameEvent(GameEventChange),
    Plot(PlotUpdate),
    StringBoard(StringBoardChange),
}

struct ScriptState {
    default: ScriptedOutcome,
    queued: VecDeque<ScriptedOutcome>,
    session_alive: bool,
    calls: Vec<ShardCall>,
}

/// In-process [`ShardClient`] with scripted outcomes and a call log.
///
/// Each call consumes the next queued outcome, falling back to the default
/// outcome once the queue is empty. Only calls that succeed are logged.
pub struct ScriptedShard {
    id: ShardId,
    state: Mutex<ScriptState>,
    attempts: AtomicUsize,
}

impl ScriptedShard {
    pub fn new(id: ShardId) -> Self {
        Self {
            id,
            state: Mutex::new(ScriptState {
                default: ScriptedOutcome::Ok,
                queued: VecDeque::new(),
                session_alive: true,
                calls: Vec::new(),
            }),
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    pub fn set_default(&self, outcome: ScriptedOutcome) {
        self.state.lock().default = outcome;
    }

    /// Queue outcomes for the next calls, in order.
    pub fn push_outcomes(&self, outcomes: impl IntoIterator<Item = ScriptedOutcome>) {
        self.state.lock().queued.extend(outcomes);
    }

    /// What a successful heartbeat probe reports about the session.
    pub fn set_session_alive(&self, alive: bool) {
        self.state.lock().session_alive = alive;
    }

    /// Calls attempted, successful or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<ShardCall> {
        self.state.lock().calls.clone()
    }

    pub fn announced(&self) -> Vec<EventAnnouncement> {
        self.filter_calls(|call| match call {
            ShardCall::Announce(a) => Some(a.clone()),
            _ => None,
        })
    }

    pub fn warned(&self) -> Vec<EventRef> {
        self.filter_calls(|call| match call {
            ShardCall::Warn(e) => Some(*e),
            _ => None,
        })
    }

    pub fn closed(&self) -> Vec<EventRef> {
        self.filter_calls(|call| match call {
            ShardCall::Close(e) => Some(*e),
            _ => None,
        })
    }

    pub fn resets(&self) -> Vec<ResetKind> {
        self.filter_calls(|call| match call {
            ShardCall::Reset(kind) => Some(*kind),
            _ => None,
        })
    }

    pub fn heartbeats(&self) -> Vec<CharacterId> {
        self.filter_calls(|call| match call {
            ShardCall::Heartbeat(c) => Some(*c),
            _ => None,
        })
    }

    pub fn game_events(&self) -> Vec<GameEventChange> {
        self.filter_calls(|call| match call {
            ShardCall::GameEvent(change) => Some(*change),
            _ => None,
        })
    }

    pub fn plot_updates(&self) -> Vec<PlotUpdate> {
        self.filter_calls(|call| match call {
            ShardCall::Plot(update) => Some(update.clone()),
            _ => None,
        })
    }

    pub fn string_boards(&self) -> Vec<StringBoardChange> {
        self.filter_calls(|call| match call {
            ShardCall::StringBoard(change) => Some(change.clone()),
            _ => None,
        })
    }

    fn filter_calls<T>(&self, f: impl Fn(&ShardCall) -> Option<T>) -> Vec<T> {
        self.state.lock().calls.iter().filter_map(f).collect()
    }

    /// Resolve the next outcome and log `call` if it succeeds.
    async fn respond(&self, call: ShardCall) -> Result<(), OrchestratorError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = {
            let mut state = self.state.lock();
            let outcome = state.queued.pop_front().unwrap_or(state.default);
            if outcome == ScriptedOutcome::Ok {
                state.calls.push(call);
            }
            outcome
        };
        match outcome {
            ScriptedOutcome::Ok => Ok(()),
            ScriptedOutcome::Unreachable => Err(OrchestratorError::ShardUnreachable {
                shard_id: self.id,
                source: None,
            }),
            ScriptedOutcome::Fail => Err(OrchestratorError::ShardRpc {
                shard_id: self.id,
                reason: "scripted failure".to_string(),
                source: None,
            }),
            ScriptedOutcome::Hang => futures::future::pending().await,
        }
    }
}

#[async_trait]
impl ShardClient for ScriptedShard {
    async fn announce_event(
        &self,
        announcement: &EventAnnouncement,
    ) -> Result<(), OrchestratorError> {
        self.respond(ShardCall::Announce(announcement.clone())).await
    }

    async fn warn_event(&self, event: EventRef) -> Result<(), OrchestratorError> {
        self.respond(ShardCall::Warn(event)).await
    }

    async fn close_event(&self, event: EventRef) -> Result<(), OrchestratorError> {
        self.respond(ShardCall::Close(event)).await
    }

    async fn notify_reset(&self, kind: ResetKind) -> Result<(), OrchestratorError> {
        self.respond(ShardCall::Reset(kind)).await
    }

    async fn heartbeat(&self, character_id: CharacterId) -> Result<bool, OrchestratorError> {
        self.respond(ShardCall::Heartbeat(character_id)).await?;
        Ok(self.state.lock().session_alive)
    }

    async fn game_event(&self, change: GameEventChange) -> Result<(), OrchestratorError> {
        self.respond(ShardCall::GameEvent(change)).await
    }

    async fn update_plot(&self, update: &PlotUpdate) -> Result<(), OrchestratorError> {
        self.respond(ShardCall::Plot(update.clone())).await
    }

    async fn string_board(&self, change: &StringBoardChange) -> Result<(), OrchestratorError> {
        self.respond(ShardCall::StringBoard(change.clone())).await
    }

    /// Events announced to this shard and not yet closed.
    async fn active_instances(&self) -> Result<Vec<ActiveEventSummary>, OrchestratorError> {
        let closed = self.closed();
        Ok(self
            .announced()
            .into_iter()
            .filter(|a| !closed.contains(&a.event))
            .map(|a| ActiveEventSummary {
                event: a.event,
                end_tick: a.end_tick,
            })
            .collect())
    }
}

/// Directory client that can be told to fail.
#[derive(Default)]
pub struct ScriptedDirectory {
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl ScriptedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectoryClient for ScriptedDirectory {
    async fn heartbeat(&self) -> Result<(), OrchestratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Directory {
                reason: "scripted directory outage".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventKind, InstanceId, MetadataId};

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::default();
        let start = clock.now();
        assert_eq!(clock.now(), start);
        clock.advance(TimeDelta::minutes(5));
        assert_eq!(clock.now() - start, TimeDelta::minutes(5));
    }

    #[tokio::test]
    async fn queued_outcomes_run_before_default() {
        let shard = ScriptedShard::new(ShardId::new(1));
        shard.push_outcomes([ScriptedOutcome::Unreachable, ScriptedOutcome::Fail]);

        let first = shard.notify_reset(ResetKind::Daily).await.unwrap_err();
        assert!(first.is_unreachable());
        let second = shard.notify_reset(ResetKind::Daily).await.unwrap_err();
        assert!(!second.is_unreachable());
        shard.notify_reset(ResetKind::Weekly).await.unwrap();

        assert_eq!(shard.attempts(), 3);
        assert_eq!(shard.resets(), vec![ResetKind::Weekly]);
    }

    #[tokio::test]
    async fn heartbeat_reports_session_state() {
        let shard = ScriptedShard::new(ShardId::new(1));
        assert!(shard.heartbeat(CharacterId::new(5)).await.unwrap());
        shard.set_session_alive(false);
        assert!(!shard.heartbeat(CharacterId::new(5)).await.unwrap());
        assert_eq!(shard.heartbeats().len(), 2);
    }

    #[tokio::test]
    async fn active_instances_excludes_closed() {
        let shard = ScriptedShard::new(ShardId::new(1));
        let event = EventRef {
            kind: EventKind::WorldBoss,
            metadata_id: MetadataId::new(1),
            instance_id: InstanceId(1),
        };
        shard
            .announce_event(&EventAnnouncement {
                event,
                end_tick: Utc::now(),
                next_occurrence: None,
                payload: crate::event::EventPayload::WorldBoss(Default::default()),
            })
            .await
            .unwrap();
        assert_eq!(shard.active_instances().await.unwrap().len(), 1);
        shard.close_event(event).await.unwrap();
        assert!(shard.active_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn directory_failure_toggle() {
        let directory = ScriptedDirectory::new();
        directory.heartbeat().await.unwrap();
        directory.set_failing(true);
        assert!(directory.heartbeat().await.is_err());
        assert_eq!(directory.calls(), 2);
    }
}
