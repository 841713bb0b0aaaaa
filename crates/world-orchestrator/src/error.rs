use std::time::Duration;

use crate::types::ShardId;

/// Errors that can occur in the world orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The shard endpoint could not be reached. Expected while shards restart;
    /// fan-outs skip the shard and carry on.
    #[error("shard {shard_id} unreachable")]
    ShardUnreachable {
        shard_id: ShardId,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("rpc to shard {shard_id} failed: {reason}")]
    ShardRpc {
        shard_id: ShardId,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("rpc to shard {shard_id} exceeded its {timeout:?} deadline")]
    RpcTimeout { shard_id: ShardId, timeout: Duration },

    /// Returned by [`DirectoryClient`](crate::directory::DirectoryClient)
    /// implementations when the upstream heartbeat fails. Logged only.
    #[error("directory heartbeat failed: {reason}")]
    Directory { reason: String },

    #[error("storage error: {reason}")]
    Storage {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("invalid event metadata: {reason}")]
    InvalidEvent {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

impl OrchestratorError {
    /// Whether this is the soft "endpoint unreachable" class that fan-outs
    /// log at warning level.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::ShardUnreachable { .. })
    }

    pub(crate) fn storage(reason: impl Into<String>) -> Self {
        Self::Storage {
            reason: reason.into(),
            source: None,
        }
    }
}
