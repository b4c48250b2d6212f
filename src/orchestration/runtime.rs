//! Container runtime abstraction
//!
//! Provides a trait for container operations so the orchestration engine
//! can run against the Docker CLI, a compatible Podman, or a test double.

use crate::error::PreviewResult;
use crate::orchestration::types::{BuildOptions, ContainerConfig, ContainerInfo, ImageInfo};
use async_trait::async_trait;

/// Progress callback receiving one runtime output line at a time
pub type ProgressFn<'a> = &'a (dyn Fn(String) + Send + Sync);

/// Tar build context delivered in chunks while it is being packed
pub type BuildContext = tokio::sync::mpsc::Receiver<Vec<u8>>;

/// Abstract container runtime interface
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check if the runtime is available on this system
    async fn is_available(&self) -> PreviewResult<bool>;

    /// List local images
    async fn list_images(&self) -> PreviewResult<Vec<ImageInfo>>;

    /// List containers, including stopped ones
    async fn list_containers(&self) -> PreviewResult<Vec<ContainerInfo>>;

    /// Inspect one container, `None` if it does not exist
    async fn inspect_container(&self, id: &str) -> PreviewResult<Option<ContainerInfo>>;

    /// Build an image from a tar build context, reading it to the end
    async fn build_image(
        &self,
        context: BuildContext,
        options: &BuildOptions,
        on_output: ProgressFn<'_>,
    ) -> PreviewResult<()>;

    /// Pull an image from its registry
    async fn pull_image(&self, image: &str, on_output: ProgressFn<'_>) -> PreviewResult<()>;

    /// Create and start a container in one call, returning its ID
    async fn run(&self, config: &ContainerConfig) -> PreviewResult<String>;

    /// Create a container without starting it, returning its ID
    async fn create(&self, config: &ContainerConfig) -> PreviewResult<String>;

    /// Start an existing container
    async fn start(&self, id: &str) -> PreviewResult<()>;

    /// Stop a container, killing it after `grace_secs`
    async fn stop(&self, id: &str, grace_secs: u64) -> PreviewResult<()>;

    /// Force-remove a container, succeeding if it is already gone
    async fn remove(&self, id: &str) -> PreviewResult<()>;

    /// Force-remove an image, succeeding if it is already gone
    async fn remove_image(&self, image: &str) -> PreviewResult<()>;

    /// Get the human-readable runtime name for display
    fn runtime_name(&self) -> &'static str;
}
