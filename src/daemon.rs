//! Orchestrator
//!
//! Owns every component and hands them to each other explicitly. Also runs
//! the background loops that keep the cache fresh, drain the build queue
//! and reap idle containers.

use crate::build::{image_name, BuildPipeline, BuildStage};
use crate::config::{Config, ConfigManager};
use crate::error::PreviewResult;
use crate::lifecycle::ContainerLifecycleManager;
use crate::logging::RecentLogs;
use crate::orchestration::{create_runtime, ContainerInfo, ContainerRuntime, ImageInfo};
use crate::reaper::ExpiryReaper;
use crate::source::{GitCli, SourceControl};
use crate::state::{lock, AccessTracker, RuntimeStateCache};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Background failures kept for the debug view
const MAX_TASK_FAILURES: usize = 100;

/// What a commit looks like from the outside
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BuildStatus {
    /// A container is running
    Ready,
    /// The last build failed
    #[serde(rename = "FAIL")]
    Fail,
    /// The image exists but no container runs it
    NeedsPriming,
    /// A build is queued, running or left on disk
    Building,
    /// Nothing is known about this commit
    NotBuilt,
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Ready => "Ready",
            Self::Fail => "FAIL",
            Self::NeedsPriming => "NeedsPriming",
            Self::Building => "Building",
            Self::NotBuilt => "NotBuilt",
        };
        write!(f, "{}", s)
    }
}

/// A background task error or panic
#[derive(Debug, Clone, Serialize)]
pub struct TaskFailure {
    pub task: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Bounded list of recent background failures
#[derive(Debug, Default)]
pub struct TaskFailures {
    entries: Mutex<VecDeque<TaskFailure>>,
}

impl TaskFailures {
    pub fn record(&self, task: &str, error: impl fmt::Display) {
        let mut entries = lock(&self.entries);
        if entries.len() == MAX_TASK_FAILURES {
            entries.pop_front();
        }
        entries.push_back(TaskFailure {
            task: task.to_string(),
            error: error.to_string(),
            at: Utc::now(),
        });
    }

    pub fn list(&self) -> Vec<TaskFailure> {
        lock(&self.entries).iter().cloned().collect()
    }
}

/// Read-only view of everything the orchestrator tracks
#[derive(Debug, Serialize)]
pub struct DebugSnapshot {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub images: Vec<ImageInfo>,
    pub containers: Vec<ContainerInfo>,
    pub build_queue: Vec<String>,
    pub pending_hashes: Vec<String>,
    pub build_stages: BTreeMap<String, BuildStage>,
    pub failed_hashes: Vec<String>,
    pub waiting_on_commits: Vec<String>,
    pub starting_containers: Vec<String>,
    pub pulling_images: Vec<String>,
    pub access_times: BTreeMap<String, DateTime<Utc>>,
    pub task_failures: Vec<TaskFailure>,
    pub recent_logs: Vec<String>,
}

/// Owner of all preview components
pub struct Orchestrator {
    pub config: Arc<Config>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub cache: Arc<RuntimeStateCache>,
    pub access: Arc<AccessTracker>,
    pub builds: Arc<BuildPipeline>,
    pub lifecycle: Arc<ContainerLifecycleManager>,
    pub reaper: Arc<ExpiryReaper>,
    pub failures: Arc<TaskFailures>,
    recent_logs: Option<RecentLogs>,
    started_at: DateTime<Utc>,
}

impl Orchestrator {
    /// Wire components around the given runtime and source control
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        source: Arc<dyn SourceControl>,
    ) -> Self {
        let cache = Arc::new(RuntimeStateCache::new(
            Arc::clone(&runtime),
            Arc::clone(&source),
        ));
        let access = Arc::new(AccessTracker::new());
        let builds = Arc::new(BuildPipeline::new(
            &config,
            Arc::clone(&runtime),
            source,
            Arc::clone(&cache),
        ));
        let lifecycle = Arc::new(ContainerLifecycleManager::new(
            &config,
            Arc::clone(&runtime),
            Arc::clone(&cache),
        ));
        let reaper = Arc::new(ExpiryReaper::new(
            &config,
            Arc::clone(&cache),
            Arc::clone(&access),
            Arc::clone(&lifecycle),
        ));

        Self {
            config: Arc::new(config),
            runtime,
            cache,
            access,
            builds,
            lifecycle,
            reaper,
            failures: Arc::new(TaskFailures::default()),
            recent_logs: None,
            started_at: Utc::now(),
        }
    }

    /// Wire components around the Docker and git CLIs
    pub fn from_config(config: Config) -> Self {
        let runtime = create_runtime(&config);
        let mirror = config.repo.mirror_dir.clone().unwrap_or_else(|| {
            ConfigManager::repos_dir().join(format!("{}.git", config.repo.slug()))
        });
        let source: Arc<dyn SourceControl> = Arc::new(GitCli::new(config.repo.remote(), mirror));
        Self::new(config, runtime, source)
    }

    /// Expose recent process log lines through the debug snapshot
    pub fn with_recent_logs(mut self, logs: RecentLogs) -> Self {
        self.recent_logs = Some(logs);
        self
    }

    /// Image name for a commit
    pub fn image_for(&self, hash: &str) -> String {
        image_name(&self.config.build.tag_prefix, hash)
    }

    /// Running container for a commit in an environment
    pub fn running_container_for(&self, hash: &str, environment: &str) -> Option<ContainerInfo> {
        self.lifecycle
            .running_container(&self.image_for(hash), environment)
    }

    /// Resolve the status of a commit
    pub async fn status_for(&self, hash: &str, environment: &str) -> BuildStatus {
        if self.running_container_for(hash, environment).is_some() {
            BuildStatus::Ready
        } else if self.cache.has_image(&self.image_for(hash)) {
            BuildStatus::NeedsPriming
        } else if self.builds.did_build_fail(hash) {
            BuildStatus::Fail
        } else if self.builds.is_build_in_progress(hash).await {
            BuildStatus::Building
        } else {
            BuildStatus::NotBuilt
        }
    }

    /// Queue a build without making the caller wait for commit validation
    pub fn enqueue_in_background(&self, hash: &str) {
        let builds = Arc::clone(&self.builds);
        let failures = Arc::clone(&self.failures);
        let hash = hash.to_string();
        tokio::spawn(async move {
            if let Err(e) = builds.enqueue(&hash).await {
                failures.record("enqueue", format!("{}: {}", hash, e));
            }
        });
    }

    /// Delete the image and build directory of a commit
    pub async fn hard_reset(&self, hash: &str) -> PreviewResult<()> {
        info!(commit_hash = %hash, "Hard reset");
        self.lifecycle.delete_image(hash).await?;
        self.builds.cleanup_build_dir(hash).await;
        Ok(())
    }

    /// Local images, one entry per image ID, newest first
    pub fn local_images(&self) -> Vec<ImageInfo> {
        let mut images: Vec<ImageInfo> = Vec::new();
        for image in self.cache.images().values() {
            if !images.iter().any(|i| i.id == image.id) {
                images.push(image.clone());
            }
        }
        images.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        images
    }

    pub fn snapshot(&self) -> DebugSnapshot {
        let now = Utc::now();
        DebugSnapshot {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            images: self.local_images(),
            containers: self.cache.containers().as_ref().clone(),
            build_queue: self.builds.queued(),
            pending_hashes: self.builds.pending(),
            build_stages: self.builds.stages(),
            failed_hashes: self.builds.failed(),
            waiting_on_commits: self.builds.waiting_on_commits(),
            starting_containers: self
                .lifecycle
                .starting()
                .into_iter()
                .map(|(env, image)| format!("{}/{}", env, image))
                .collect(),
            pulling_images: self.lifecycle.pulling(),
            access_times: self.access.snapshot(),
            task_failures: self.failures.list(),
            recent_logs: self
                .recent_logs
                .as_ref()
                .map(RecentLogs::lines)
                .unwrap_or_default(),
        }
    }

    /// Start every background loop
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let timing = &self.config.timing;
        let mut handles = Vec::new();

        let cache = Arc::clone(&self.cache);
        handles.push(self.every("refresh images", timing.image_refresh(), Duration::ZERO, move || {
            let cache = Arc::clone(&cache);
            async move { cache.refresh_images().await }
        }));

        let cache = Arc::clone(&self.cache);
        handles.push(self.every(
            "refresh containers",
            timing.container_refresh(),
            Duration::ZERO,
            move || {
                let cache = Arc::clone(&cache);
                async move { cache.refresh_containers().await }
            },
        ));

        let cache = Arc::clone(&self.cache);
        handles.push(self.every(
            "refresh branches",
            timing.branch_refresh(),
            Duration::ZERO,
            move || {
                let cache = Arc::clone(&cache);
                async move { cache.refresh_branches().await }
            },
        ));

        let builds = Arc::clone(&self.builds);
        handles.push(self.every("drain build queue", timing.queue_drain(), Duration::ZERO, move || {
            let builds = Arc::clone(&builds);
            async move {
                builds.drain();
                Ok(())
            }
        }));

        let builds = Arc::clone(&self.builds);
        handles.push(self.every("queue warning", timing.queue_warn(), Duration::ZERO, move || {
            let builds = Arc::clone(&builds);
            async move {
                builds.warn_on_queue_buildup();
                Ok(())
            }
        }));

        let reaper = Arc::clone(&self.reaper);
        handles.push(self.every(
            "expire containers",
            timing.expiry_sweep(),
            timing.expiry_initial_delay(),
            move || {
                let reaper = Arc::clone(&reaper);
                async move {
                    let removed = reaper.sweep().await?;
                    if removed > 0 {
                        info!(removed, "Expired containers removed");
                    }
                    Ok(())
                }
            },
        ));

        handles
    }

    /// Run `tick` every `period` after `delay`, recording failures and panics
    fn every<F, Fut>(&self, name: &'static str, period: Duration, delay: Duration, tick: F) -> JoinHandle<()>
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = PreviewResult<()>> + Send + 'static,
    {
        let failures = Arc::clone(&self.failures);
        tokio::spawn(async move {
            if !delay.is_zero() {
                debug!(task = name, delay = ?delay, "Delaying background task");
                tokio::time::sleep(delay).await;
            }

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                match AssertUnwindSafe(tick()).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        error!(task = name, error = %e, "Background task failed");
                        failures.record(name, &e);
                    }
                    Err(_) => {
                        error!(task = name, "Background task panicked");
                        failures.record(name, "panicked");
                    }
                }
            }
        })
    }
}
