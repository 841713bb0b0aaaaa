//! Scheduled game events (seasonal content toggled on every shard).
//!
//! Shards load events that are already running on their own, so only future
//! starts and ends are scheduled here.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::error::OrchestratorError;
use crate::scheduler::Scheduler;
use crate::shard::{GameEventChange, ShardRegistry};
use crate::world_storage::WorldStorage;

/// Load game events and arm their future start/end fan-outs. Returns the
/// number of tasks scheduled.
pub async fn schedule_game_events(
    scheduler: &Scheduler,
    storage: &dyn WorldStorage,
    shards: &Arc<ShardRegistry>,
) -> Result<usize, OrchestratorError> {
    let now = scheduler.now();
    let mut scheduled = 0;
    for event in storage.game_events().await? {
        if event.start > now {
            arm(scheduler, shards, event.start, GameEventChange::Add(event.id));
            scheduled += 1;
        }
        if event.end > now {
            arm(scheduler, shards, event.end, GameEventChange::Remove(event.id));
            scheduled += 1;
        }
    }
    info!(scheduled, "game events scheduled");
    Ok(scheduled)
}

fn arm(
    scheduler: &Scheduler,
    shards: &Arc<ShardRegistry>,
    at: DateTime<Utc>,
    change: GameEventChange,
) {
    let shards = Arc::clone(shards);
    let name = match change {
        GameEventChange::Add(id) => format!("game_event:add:{id}"),
        GameEventChange::Remove(id) => format!("game_event:remove:{id}"),
    };
    scheduler.schedule_at(name, at, move |_| {
        let shards = Arc::clone(&shards);
        Box::pin(async move {
            shards
                .fan_out("game_event", move |client| {
                    Box::pin(async move { client.game_event(change).await })
                })
                .await;
            Ok(())
        })
    });
}
