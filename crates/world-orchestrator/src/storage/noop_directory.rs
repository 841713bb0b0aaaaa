use async_trait::async_trait;

use crate::directory::DirectoryClient;
use crate::error::OrchestratorError;

/// Directory client for deployments without an upstream directory.
pub struct NoopDirectory;

#[async_trait]
impl DirectoryClient for NoopDirectory {
    async fn heartbeat(&self) -> Result<(), OrchestratorError> {
        Ok(())
    }
}
