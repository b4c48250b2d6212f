//! Orchestration module for the container runtime
//!
//! Provides the runtime abstraction and a Docker CLI backend
//! (which also drives a CLI-compatible Podman).

mod docker;
mod output;
mod runtime;
pub mod types;

pub use docker::DockerCli;
pub use runtime::{BuildContext, ContainerRuntime, ProgressFn};
pub use types::{
    BuildOptions, ContainerConfig, ContainerInfo, ContainerState, ImageInfo, PortMapping,
};

use crate::config::Config;
use std::sync::Arc;

/// Create the container runtime named in the configuration
pub fn create_runtime(config: &Config) -> Arc<dyn ContainerRuntime> {
    Arc::new(DockerCli::new(config.runtime.binary.clone()))
}
