use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrchestratorError;
use crate::event::CyclicEventMetadata;
use crate::players::PlayerUpdate;
use crate::types::{AccountId, ResetKind};

/// A scheduled game event (seasonal content toggled on every shard).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEventWindow {
    pub id: i32,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// An outdoor housing plot with a rental expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotInfo {
    pub id: i64,
    pub map_id: i32,
    pub number: i32,
    /// `None` once the plot has been forfeited.
    pub owner: Option<AccountId>,
    pub expiry: DateTime<Utc>,
}

/// Persistent state the orchestrator reads and mutates.
///
/// Every call may fail transiently. Callers log the failure and retry at
/// the next natural opportunity rather than immediately.
#[async_trait]
pub trait WorldStorage: Send + Sync {
    /// Last time the given reset was performed. A missing record is created
    /// stamped `now`, so a fresh database never triggers a catch-up reset.
    async fn last_reset(
        &self,
        kind: ResetKind,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, OrchestratorError>;

    /// Apply the reset's game-state mutation and record `at` as the last
    /// reset time, atomically.
    async fn perform_reset(&self, kind: ResetKind, at: DateTime<Utc>)
        -> Result<(), OrchestratorError>;

    /// Cyclic event definitions to schedule on startup.
    async fn pending_cyclic_events(&self) -> Result<Vec<CyclicEventMetadata>, OrchestratorError>;

    /// Mark every character offline. Returns how many were online.
    async fn set_all_characters_offline(&self) -> Result<usize, OrchestratorError>;

    /// Remove items that no longer belong to any character or account.
    /// Returns how many were deleted.
    async fn delete_unowned_items(&self) -> Result<usize, OrchestratorError>;

    /// Persist a player's shard binding and last-seen time.
    async fn update_player(&self, update: &PlayerUpdate) -> Result<(), OrchestratorError>;

    async fn game_events(&self) -> Result<Vec<GameEventWindow>, OrchestratorError>;

    /// Plots whose expiry has passed and that are not yet pending.
    async fn plots_to_expire(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<PlotInfo>, OrchestratorError>;

    /// Take an expired plot away from its owner, returning its furnishings
    /// to the owner's inventory.
    async fn forfeit_plot(&self, plot: &PlotInfo) -> Result<(), OrchestratorError>;

    /// Put an owner-less plot back up for sale.
    async fn reopen_plot(&self, plot: &PlotInfo) -> Result<(), OrchestratorError>;

    /// Earliest expiry among plots that still have an owner.
    async fn soonest_plot_expiry(&self) -> Result<Option<DateTime<Utc>>, OrchestratorError>;
}
