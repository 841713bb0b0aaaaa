use dashmap::DashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

use crate::shard::{FanOutReport, ShardRegistry, StringBoardChange};

/// Custom string boards shown on every shard. They live in memory only and
/// are lost on restart.
pub struct StringBoardRegistry {
    boards: DashMap<i32, String>,
    next_id: AtomicI32,
    shards: Arc<ShardRegistry>,
}

impl StringBoardRegistry {
    pub fn new(shards: Arc<ShardRegistry>) -> Self {
        Self {
            boards: DashMap::new(),
            next_id: AtomicI32::new(1),
            shards,
        }
    }

    /// Store `message` under a fresh id and push it to every shard.
    ///
    /// Returns `None` for an empty message.
    pub async fn add(&self, message: impl Into<String>) -> Option<i32> {
        let message = message.into();
        if message.is_empty() {
            return None;
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.boards.insert(id, message.clone());
        info!(id, "string board added");
        self.notify(StringBoardChange::Add { id, message }).await;
        Some(id)
    }

    /// Drop board `id`. Shards are only told when it existed.
    pub async fn remove(&self, id: i32) -> bool {
        if self.boards.remove(&id).is_none() {
            return false;
        }
        info!(id, "string board removed");
        self.notify(StringBoardChange::Remove(id)).await;
        true
    }

    pub fn get(&self, id: i32) -> Option<String> {
        self.boards.get(&id).map(|b| b.value().clone())
    }

    /// Every board, ordered by id.
    pub fn all(&self) -> Vec<(i32, String)> {
        let mut boards: Vec<(i32, String)> = self
            .boards
            .iter()
            .map(|b| (*b.key(), b.value().clone()))
            .collect();
        boards.sort_by_key(|(id, _)| *id);
        boards
    }

    pub fn len(&self) -> usize {
        self.boards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.boards.is_empty()
    }

    async fn notify(&self, change: StringBoardChange) -> FanOutReport {
        let change = Arc::new(change);
        let report = self
            .shards
            .fan_out("string_board", move |client| {
                let change = Arc::clone(&change);
                Box::pin(async move { client.string_board(&change).await })
            })
            .await;
        debug!(notified = report.acknowledged.len(), "string board change sent");
        report
    }
}
