//! Container launch strategies

use crate::error::{PreviewError, PreviewResult};
use crate::orchestration::{ContainerConfig, ContainerRuntime};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// How a container gets created and started
#[async_trait]
pub trait ContainerLauncher: Send + Sync {
    /// Launch a container, returning its ID when the runtime reported one
    async fn launch(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        config: &ContainerConfig,
    ) -> PreviewResult<Option<String>>;

    fn name(&self) -> &'static str;
}

/// Fire a `run` and treat silence within the grace period as success
///
/// The run keeps going in the background past the deadline; callers
/// confirm the container through a cache refresh.
pub struct OptimisticLauncher {
    grace: Duration,
}

impl OptimisticLauncher {
    pub fn new(grace: Duration) -> Self {
        Self { grace }
    }
}

#[async_trait]
impl ContainerLauncher for OptimisticLauncher {
    async fn launch(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        config: &ContainerConfig,
    ) -> PreviewResult<Option<String>> {
        let runtime = Arc::clone(runtime);
        let config = config.clone();
        let mut run = tokio::spawn(async move { runtime.run(&config).await });

        match tokio::time::timeout(self.grace, &mut run).await {
            Ok(Ok(result)) => result.map(Some),
            Ok(Err(e)) => Err(PreviewError::Internal(format!("container run task failed: {}", e))),
            Err(_) => {
                debug!(grace = ?self.grace, "No error reported within grace period, assuming started");
                Ok(None)
            }
        }
    }

    fn name(&self) -> &'static str {
        "optimistic"
    }
}

/// Create, then start, trusting the runtime's answer
pub struct ConfirmedLauncher;

#[async_trait]
impl ContainerLauncher for ConfirmedLauncher {
    async fn launch(
        &self,
        runtime: &Arc<dyn ContainerRuntime>,
        config: &ContainerConfig,
    ) -> PreviewResult<Option<String>> {
        let id = runtime.create(config).await?;
        runtime.start(&id).await?;
        Ok(Some(id))
    }

    fn name(&self) -> &'static str {
        "confirmed"
    }
}
