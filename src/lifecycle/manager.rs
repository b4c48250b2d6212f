//! Container lifecycle manager
//!
//! Starts are deduplicated per (environment, image): concurrent callers
//! share one launch and see the same container or the same error.

use crate::build::image_name;
use crate::config::schema::LaunchMode;
use crate::config::Config;
use crate::error::{PreviewError, PreviewResult};
use crate::lifecycle::launcher::{ConfirmedLauncher, ContainerLauncher, OptimisticLauncher};
use crate::lifecycle::ports::free_port;
use crate::orchestration::{
    ContainerConfig, ContainerInfo, ContainerRuntime, ContainerState, ProgressFn,
};
use crate::state::{lock, RuntimeStateCache, SingleFlight};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// How often a restarting container is re-inspected
const REVIVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Buffered pull progress lines per image
const PULL_PROGRESS_BUFFER: usize = 256;

/// Creates, starts, revives and deletes containers
pub struct ContainerLifecycleManager {
    runtime: Arc<dyn ContainerRuntime>,
    cache: Arc<RuntimeStateCache>,
    launcher: Arc<dyn ContainerLauncher>,
    tag_prefix: String,
    exposed_port: u16,
    environment_label: String,
    environments: BTreeMap<String, BTreeMap<String, String>>,
    stop_grace_secs: u64,
    revive_timeout: Duration,
    starting: SingleFlight<(String, String), ContainerInfo>,
    pulling: SingleFlight<String, ()>,
    pull_watchers: Mutex<HashMap<String, PullWatch>>,
}

/// Progress channel of one image pull and how many callers follow it
struct PullWatch {
    sender: broadcast::Sender<String>,
    watchers: usize,
}

/// A caller following a pull; leaving drops the channel once nobody is left
struct PullWatcher<'a> {
    watchers: &'a Mutex<HashMap<String, PullWatch>>,
    image: String,
    progress: broadcast::Receiver<String>,
}

impl<'a> PullWatcher<'a> {
    fn join(watchers: &'a Mutex<HashMap<String, PullWatch>>, image: &str) -> Self {
        let mut map = lock(watchers);
        let watch = map.entry(image.to_string()).or_insert_with(|| PullWatch {
            sender: broadcast::channel(PULL_PROGRESS_BUFFER).0,
            watchers: 0,
        });
        watch.watchers += 1;
        let progress = watch.sender.subscribe();
        Self {
            watchers,
            image: image.to_string(),
            progress,
        }
    }
}

impl Drop for PullWatcher<'_> {
    fn drop(&mut self) {
        let mut map = lock(self.watchers);
        if let Some(watch) = map.get_mut(&self.image) {
            watch.watchers = watch.watchers.saturating_sub(1);
            if watch.watchers == 0 {
                map.remove(&self.image);
            }
        }
    }
}

impl ContainerLifecycleManager {
    pub fn new(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        cache: Arc<RuntimeStateCache>,
    ) -> Self {
        let launcher: Arc<dyn ContainerLauncher> = match config.lifecycle.launch {
            LaunchMode::Optimistic => Arc::new(OptimisticLauncher::new(Duration::from_secs(
                config.lifecycle.start_grace_secs,
            ))),
            LaunchMode::Confirmed => Arc::new(ConfirmedLauncher),
        };

        Self {
            runtime,
            cache,
            launcher,
            tag_prefix: config.build.tag_prefix.clone(),
            exposed_port: config.build.exposed_port,
            environment_label: config.lifecycle.environment_label.clone(),
            environments: config
                .environments
                .iter()
                .map(|e| (e.name.clone(), e.env.clone()))
                .collect(),
            stop_grace_secs: config.lifecycle.stop_grace_secs,
            revive_timeout: Duration::from_secs(config.lifecycle.revive_timeout_secs),
            starting: SingleFlight::new(),
            pulling: SingleFlight::new(),
            pull_watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Environment a container was started for
    pub fn environment_of<'a>(&self, container: &'a ContainerInfo) -> Option<&'a str> {
        container.label(&self.environment_label)
    }

    /// Running container for an image in an environment, from the cache
    pub fn running_container(&self, image: &str, environment: &str) -> Option<ContainerInfo> {
        self.cache.find_container(|c| {
            c.image == image && c.is_running() && self.environment_of(c) == Some(environment)
        })
    }

    /// Any container for an image in an environment, running or not
    pub fn find_container(&self, image: &str, environment: &str) -> Option<ContainerInfo> {
        self.running_container(image, environment).or_else(|| {
            self.cache
                .find_container(|c| c.image == image && self.environment_of(c) == Some(environment))
        })
    }

    /// Container by name, from the cache
    pub fn find_container_by_name(&self, name: &str) -> Option<ContainerInfo> {
        self.cache.find_container(|c| c.name == name)
    }

    /// Make sure a container runs the image for `hash` in `environment`
    pub async fn start_container(
        self: &Arc<Self>,
        hash: &str,
        environment: &str,
    ) -> PreviewResult<ContainerInfo> {
        let image = image_name(&self.tag_prefix, hash);
        self.ensure_running(image, environment, Arc::clone(&self.launcher))
            .await
    }

    /// Create a container for a registry image, confirming the start
    pub async fn create_container(
        self: &Arc<Self>,
        image: &str,
        environment: &str,
    ) -> PreviewResult<ContainerInfo> {
        self.ensure_running(image.to_string(), environment, Arc::new(ConfirmedLauncher))
            .await
    }

    async fn ensure_running(
        self: &Arc<Self>,
        image: String,
        environment: &str,
        launcher: Arc<dyn ContainerLauncher>,
    ) -> PreviewResult<ContainerInfo> {
        if let Some(container) = self.running_container(&image, environment) {
            return Ok(container);
        }

        let key = (environment.to_string(), image.clone());
        let this = Arc::clone(self);
        let environment = environment.to_string();
        self.starting
            .run(key, move || async move {
                this.launch(&image, &environment, launcher.as_ref()).await
            })
            .await
    }

    async fn launch(
        &self,
        image: &str,
        environment: &str,
        launcher: &dyn ContainerLauncher,
    ) -> PreviewResult<ContainerInfo> {
        let host_port = free_port().await?;

        let mut labels = BTreeMap::new();
        labels.insert(self.environment_label.clone(), environment.to_string());
        let config = ContainerConfig {
            image: image.to_string(),
            name: None,
            env: self.environments.get(environment).cloned().unwrap_or_default(),
            labels,
            exposed_port: self.exposed_port,
            host_port,
        };

        info!(
            image_name = %image,
            environment = %environment,
            host_port,
            launcher = launcher.name(),
            "Starting container"
        );
        let id = launcher.launch(&self.runtime, &config).await?;

        self.cache.refresh_containers().await?;

        let started = match &id {
            Some(id) => self.cache.find_container(|c| &c.id == id),
            None => self.running_container(image, environment),
        };
        started.ok_or_else(|| {
            PreviewError::ContainerStart(format!(
                "no running container for {} after launch",
                image
            ))
        })
    }

    /// Start a stopped container, waiting out a restart in progress
    pub async fn revive_container(&self, container: &ContainerInfo) -> PreviewResult<ContainerInfo> {
        let deadline = Instant::now() + self.revive_timeout;
        let mut current = container.clone();

        loop {
            match current.state {
                ContainerState::Running => return Ok(current),
                ContainerState::Restarting => {
                    if Instant::now() >= deadline {
                        return Err(PreviewError::RestartTimeout {
                            container: current.name.clone(),
                            seconds: self.revive_timeout.as_secs(),
                        });
                    }
                    debug!(container = %current.name, "Waiting for container to finish restarting");
                    tokio::time::sleep(REVIVE_POLL_INTERVAL).await;
                    current = self.inspect(&current).await?;
                }
                _ => {
                    info!(container = %current.name, state = %current.state, "Reviving container");
                    self.runtime.start(&current.id).await?;
                    break;
                }
            }
        }

        if let Err(e) = self.cache.refresh_containers().await {
            warn!(error = %e, "Error refreshing containers after revive");
        }
        self.inspect(&current).await
    }

    async fn inspect(&self, container: &ContainerInfo) -> PreviewResult<ContainerInfo> {
        self.runtime
            .inspect_container(&container.id)
            .await?
            .ok_or_else(|| PreviewError::ContainerNotFound(container.name.clone()))
    }

    /// Stop with a grace period, then force-remove
    pub async fn delete_container(&self, container: &ContainerInfo) -> PreviewResult<()> {
        info!(container = %container.name, id = %container.short_id(), "Deleting container");

        if container.is_running() {
            if let Err(e) = self.runtime.stop(&container.id, self.stop_grace_secs).await {
                warn!(container = %container.name, error = %e, "Failed to stop container, removing anyway");
            }
        }
        self.runtime.remove(&container.id).await?;

        if let Err(e) = self.cache.refresh_containers().await {
            warn!(error = %e, "Error refreshing containers after delete");
        }
        Ok(())
    }

    /// Remove the image for `hash` and every container using it
    pub async fn delete_image(&self, hash: &str) -> PreviewResult<()> {
        let image = image_name(&self.tag_prefix, hash);
        info!(commit_hash = %hash, image_name = %image, "Deleting image");

        let containers = self.runtime.list_containers().await?;
        for container in containers.iter().filter(|c| c.image == image) {
            self.delete_container(container).await?;
        }

        match self.runtime.remove_image(&image).await {
            Ok(()) => {}
            Err(e) if matches!(e.root(), PreviewError::ImageNotFound { .. }) => {}
            Err(e) => return Err(e),
        }

        if let Err(e) = self.cache.refresh_images().await {
            warn!(error = %e, "Error refreshing images after delete");
        }
        Ok(())
    }

    /// Pull a registry image, joining a pull already in flight
    ///
    /// Progress lines are forwarded to `on_output` until the pull settles.
    pub async fn pull_image(
        self: &Arc<Self>,
        image: &str,
        on_output: ProgressFn<'_>,
    ) -> PreviewResult<()> {
        let mut watcher = PullWatcher::join(&self.pull_watchers, image);

        let this = Arc::clone(self);
        let image_owned = image.to_string();
        let pull = self.pulling.run(image.to_string(), move || async move {
            let forward = |line: String| {
                if let Some(watch) = lock(&this.pull_watchers).get(&image_owned) {
                    let _ = watch.sender.send(line);
                }
            };
            let result = this.runtime.pull_image(&image_owned, &forward).await;
            if result.is_ok() {
                if let Err(e) = this.cache.refresh_images().await {
                    warn!(error = %e, "Error refreshing images after pull");
                }
            }
            result
        });
        tokio::pin!(pull);

        let mut listening = true;
        loop {
            tokio::select! {
                result = &mut pull => {
                    while let Ok(line) = watcher.progress.try_recv() {
                        on_output(line);
                    }
                    return result;
                }
                line = watcher.progress.recv(), if listening => match line {
                    Ok(line) => on_output(line),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(image = %image, skipped, "Pull progress receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => listening = false,
                },
            }
        }
    }

    /// Images with callers following their pull progress
    #[cfg(test)]
    fn watched_pulls(&self) -> usize {
        lock(&self.pull_watchers).len()
    }

    /// (environment, image) pairs with a start in flight
    pub fn starting(&self) -> Vec<(String, String)> {
        self.starting.keys()
    }

    /// Images with a pull in flight
    pub fn pulling(&self) -> Vec<String> {
        self.pulling.keys()
    }
}
