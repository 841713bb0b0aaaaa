use async_trait::async_trait;

use crate::error::OrchestratorError;

/// Upstream directory service the orchestrator reports its own liveness to.
#[async_trait]
pub trait DirectoryClient: Send + Sync {
    async fn heartbeat(&self) -> Result<(), OrchestratorError>;
}
