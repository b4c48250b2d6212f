//! Expiry reaper
//!
//! Reclaims containers nobody has used for a while. Containers that have
//! exited are removed outright; young containers are always left alone.

use crate::build::extract_commit_from_image;
use crate::config::Config;
use crate::error::PreviewResult;
use crate::lifecycle::ContainerLifecycleManager;
use crate::orchestration::{ContainerInfo, ContainerState};
use crate::state::{AccessTracker, RuntimeStateCache};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// When a container counts as expired
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    /// Idle time after which a running container is reclaimed
    pub expiry: Duration,
    /// Containers younger than this are never reclaimed
    pub min_age: Duration,
}

impl ExpiryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            expiry: Duration::seconds(config.timing.container_expiry_secs as i64),
            min_age: Duration::seconds(config.timing.container_min_age_secs as i64),
        }
    }

    /// Decide whether `container` should be reclaimed at `now`
    ///
    /// `last_access` is the most recent access under either the commit hash
    /// or the container name.
    pub fn is_expired(
        &self,
        container: &ContainerInfo,
        last_access: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> bool {
        if now - container.created_at < self.min_age {
            return false;
        }

        if matches!(container.state, ContainerState::Exited | ContainerState::Dead) {
            return true;
        }

        let last_used = last_access.unwrap_or(container.created_at);
        now - last_used > self.expiry
    }
}

/// Periodic sweep over preview containers
pub struct ExpiryReaper {
    policy: ExpiryPolicy,
    tag_prefix: String,
    environment_label: String,
    cache: Arc<RuntimeStateCache>,
    access: Arc<AccessTracker>,
    lifecycle: Arc<ContainerLifecycleManager>,
}

impl ExpiryReaper {
    pub fn new(
        config: &Config,
        cache: Arc<RuntimeStateCache>,
        access: Arc<AccessTracker>,
        lifecycle: Arc<ContainerLifecycleManager>,
    ) -> Self {
        Self {
            policy: ExpiryPolicy::from_config(config),
            tag_prefix: config.build.tag_prefix.clone(),
            environment_label: config.lifecycle.environment_label.clone(),
            cache,
            access,
            lifecycle,
        }
    }

    /// Most recent access by commit hash or by container name
    fn last_access(&self, container: &ContainerInfo) -> Option<DateTime<Utc>> {
        let by_commit = extract_commit_from_image(&self.tag_prefix, &container.image)
            .and_then(|hash| self.access.last_access(hash));
        let by_name = self.access.last_access(&container.name);
        by_commit.max(by_name)
    }

    /// Cached containers that should be reclaimed at `now`
    ///
    /// Only containers started by this service (carrying the environment
    /// label) are considered.
    pub fn expired_containers(&self, now: DateTime<Utc>) -> Vec<ContainerInfo> {
        self.cache
            .containers()
            .iter()
            .filter(|c| c.label(&self.environment_label).is_some())
            .filter(|c| self.policy.is_expired(c, self.last_access(c), now))
            .cloned()
            .collect()
    }

    /// Refresh containers and remove every expired one
    ///
    /// Returns the number of containers removed.
    pub async fn sweep(&self) -> PreviewResult<usize> {
        self.cache.refresh_containers().await?;

        let expired = self.expired_containers(Utc::now());
        let mut removed = 0;
        for container in &expired {
            info!(
                container = %container.name,
                image_name = %container.image,
                state = %container.state,
                "Removing expired container"
            );
            match self.lifecycle.delete_container(container).await {
                Ok(()) => removed += 1,
                Err(e) => warn!(container = %container.name, error = %e, "Failed to remove expired container"),
            }
        }
        Ok(removed)
    }
}
