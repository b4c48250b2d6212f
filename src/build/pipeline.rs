//! Build queue and per-commit build task
//!
//! Hashes wait in a FIFO queue; a periodic drain starts up to the
//! concurrency limit. A hash is either queued or pending, never both.

use crate::build::{
    finish_packing, image_name, pack_context, BuildLayout, BuildLogger, LogSink,
};
use crate::config::schema::WorkerPolicy;
use crate::config::Config;
use crate::error::{PreviewError, PreviewResult};
use crate::orchestration::{BuildOptions, ContainerRuntime};
use crate::source::SourceControl;
use crate::state::{lock, RuntimeStateCache, SingleFlight};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

/// Where a build currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    Queued,
    Cloning,
    CheckingOut,
    Packaging,
    ImageBuilding,
}

#[derive(Debug, Default)]
struct QueueState {
    queue: VecDeque<String>,
    pending: HashSet<String>,
    failed: HashSet<String>,
    stages: BTreeMap<String, BuildStage>,
}

/// Concurrency-limited image builder
pub struct BuildPipeline {
    runtime: Arc<dyn ContainerRuntime>,
    source: Arc<dyn SourceControl>,
    cache: Arc<RuntimeStateCache>,
    layout: BuildLayout,
    tag_prefix: String,
    max_concurrent: usize,
    workers: WorkerPolicy,
    state: Mutex<QueueState>,
    waiting_on_commits: SingleFlight<String, bool>,
}

impl BuildPipeline {
    pub fn new(
        config: &Config,
        runtime: Arc<dyn ContainerRuntime>,
        source: Arc<dyn SourceControl>,
        cache: Arc<RuntimeStateCache>,
    ) -> Self {
        Self {
            runtime,
            source,
            cache,
            layout: BuildLayout::from_config(config),
            tag_prefix: config.build.tag_prefix.clone(),
            max_concurrent: config.build.max_concurrent_builds.max(1),
            workers: config.build.workers.clone(),
            state: Mutex::new(QueueState::default()),
            waiting_on_commits: SingleFlight::new(),
        }
    }

    pub fn layout(&self) -> &BuildLayout {
        &self.layout
    }

    /// Admit a commit to the build queue
    ///
    /// Returns `Ok(false)` if the hash is already queued or building and
    /// `CommitNotFound` if the remote does not know it.
    pub async fn enqueue(self: &Arc<Self>, hash: &str) -> PreviewResult<bool> {
        if !self.commit_exists(hash).await? {
            error!(commit_hash = %hash, "Cannot find commit");
            return Err(PreviewError::CommitNotFound(hash.to_string()));
        }

        let mut state = lock(&self.state);
        if state.pending.contains(hash) || state.queue.iter().any(|h| h == hash) {
            return Ok(false);
        }

        info!(
            commit_hash = %hash,
            build_queue_size = state.queue.len(),
            "Adding a commit hash to the build queue"
        );
        state.failed.remove(hash);
        state.queue.push_back(hash.to_string());
        state.stages.insert(hash.to_string(), BuildStage::Queued);
        Ok(true)
    }

    /// Check the mirror for a commit, fetching once if it is not there yet
    async fn commit_exists(self: &Arc<Self>, hash: &str) -> PreviewResult<bool> {
        let this = Arc::clone(self);
        let hash_owned = hash.to_string();
        self.waiting_on_commits
            .run(hash.to_string(), move || async move {
                if this.source.has_commit(&hash_owned).await? {
                    return Ok(true);
                }
                debug!(commit_hash = %hash_owned, "Commit not in mirror, refreshing branches");
                this.cache.refresh_branches().await?;
                this.source.has_commit(&hash_owned).await
            })
            .await
    }

    /// Start builds for the next batch of queued hashes
    ///
    /// Returns the hashes that were started.
    pub fn drain(self: &Arc<Self>) -> Vec<String> {
        let batch: Vec<String> = {
            let mut state = lock(&self.state);
            let slots = self.max_concurrent.saturating_sub(state.pending.len());
            let take = slots.min(state.queue.len());
            let batch: Vec<String> = state.queue.drain(..take).collect();
            for hash in &batch {
                state.pending.insert(hash.clone());
            }
            batch
        };

        for hash in &batch {
            info!(commit_hash = %hash, "Popping a commit hash off of the build queue");
            let this = Arc::clone(self);
            let hash = hash.clone();
            tokio::spawn(async move {
                if let Err(e) = this.build(&hash).await {
                    debug!(commit_hash = %hash, error = %e, "Build task ended with an error");
                }
            });
        }

        batch
    }

    /// Log when the queue holds more hashes than can build at once
    pub fn warn_on_queue_buildup(&self) -> bool {
        let state = lock(&self.state);
        if state.queue.len() > self.max_concurrent {
            warn!(
                build_queue = ?state.queue,
                "There are images waiting to be built that are stuck because of too many concurrent builds"
            );
            return true;
        }
        false
    }

    /// Build the image for one pending hash
    async fn build(&self, hash: &str) -> PreviewResult<()> {
        let _pending = PendingGuard {
            pipeline: self,
            hash,
        };

        let build_dir = self.layout.build_dir(hash);
        if tokio::fs::try_exists(&build_dir).await.unwrap_or(false) {
            info!(
                commit_hash = %hash,
                build_dir = %build_dir.display(),
                "Skipping build because a build is already in progress"
            );
            return Ok(());
        }

        if let Err(e) = tokio::fs::create_dir(&build_dir).await {
            error!(
                commit_hash = %hash,
                build_dir = %build_dir.display(),
                error = %e,
                "Could not create directory for the build"
            );
            self.mark_failed(hash);
            return Err(PreviewError::io(
                format!("creating build directory {}", build_dir.display()),
                e,
            ));
        }

        let image = image_name(&self.tag_prefix, hash);
        let logger = match BuildLogger::open(
            hash,
            &image,
            &[LogSink::File(self.layout.log_path(hash)), LogSink::Console],
        ) {
            Ok(logger) => logger,
            Err(e) => {
                self.mark_failed(hash);
                return Err(e);
            }
        };

        let branch = self.cache.branch_for_hash(hash);
        info!(
            commit_hash = %hash,
            image_name = %image,
            branch = ?branch,
            "Attempting to build image"
        );
        if let Some(branch) = &branch {
            logger.info(&format!("Building branch {}", branch));
        }

        match self.run_build(hash, &image, &logger).await {
            Ok(()) => {
                if let Err(e) = self.cache.refresh_images().await {
                    warn!(commit_hash = %hash, error = %e, "Error refreshing local images");
                }
                info!(
                    commit_hash = %hash,
                    image_name = %image,
                    "Successfully built image. Now cleaning up build directory"
                );
                self.remove_build_dir(hash).await;
                Ok(())
            }
            Err(e) => {
                logger.error("Encountered error when building image", &e);
                error!(
                    commit_hash = %hash,
                    error = %e,
                    "Failed to build image. Leaving build files in place"
                );
                self.mark_failed(hash);
                Err(e)
            }
        }
    }

    async fn run_build(&self, hash: &str, image: &str, logger: &BuildLogger) -> PreviewResult<()> {
        let repo_dir = self.layout.repo_dir(hash);

        self.set_stage(hash, BuildStage::Cloning);
        logger.info("Cloning git repo");
        {
            let _lease = self.cache.lease_mirror();
            self.source.clone_to(&repo_dir).await?;
        }
        logger.info("Finished cloning repo");

        self.set_stage(hash, BuildStage::CheckingOut);
        self.source.checkout(&repo_dir, hash).await?;
        logger.info("Checked out the correct branch");

        self.set_stage(hash, BuildStage::Packaging);
        logger.info("Placing all the contents into a tarball for the image build");
        let (context, packer) = pack_context(repo_dir);

        self.set_stage(hash, BuildStage::ImageBuilding);
        logger.info("Handing off tarball to the container runtime for the rest of the legwork");

        let mut build_args = BTreeMap::new();
        build_args.insert("commit_sha".to_string(), hash.to_string());
        build_args.insert(
            "workers".to_string(),
            self.workers.workers(self.max_concurrent).to_string(),
        );
        let options = BuildOptions {
            tag: image.to_string(),
            build_args,
        };

        let on_output = |line: String| logger.runtime_output(&line);
        let built = self.runtime.build_image(context, &options, &on_output).await;
        let packed = finish_packing(packer).await;
        built?;
        packed
    }

    fn set_stage(&self, hash: &str, stage: BuildStage) {
        lock(&self.state).stages.insert(hash.to_string(), stage);
    }

    fn mark_failed(&self, hash: &str) {
        lock(&self.state).failed.insert(hash.to_string());
    }

    async fn remove_build_dir(&self, hash: &str) {
        let build_dir = self.layout.build_dir(hash);
        info!(build_dir = %build_dir.display(), "Removing build directory");
        match tokio::fs::remove_dir_all(&build_dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(build_dir = %build_dir.display(), error = %e, "Failed to remove build directory"),
        }
    }

    /// Pending in memory, or a build directory left on disk
    pub async fn is_build_in_progress(&self, hash: &str) -> bool {
        let pending = lock(&self.state).pending.contains(hash);
        if pending {
            return true;
        }
        tokio::fs::try_exists(self.layout.build_dir(hash))
            .await
            .unwrap_or(false)
    }

    pub fn did_build_fail(&self, hash: &str) -> bool {
        lock(&self.state).failed.contains(hash)
    }

    /// Raw NDJSON build log, `None` if there is none
    pub async fn read_build_log(&self, hash: &str) -> PreviewResult<Option<String>> {
        let path = self.layout.log_path(hash);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PreviewError::io(
                format!("reading build log {}", path.display()),
                e,
            )),
        }
    }

    /// Forget a hash, including a recorded failure, and delete its build
    /// directory
    pub async fn cleanup_build_dir(&self, hash: &str) {
        {
            let mut state = lock(&self.state);
            state.pending.remove(hash);
            state.stages.remove(hash);
            state.failed.remove(hash);
        }
        self.remove_build_dir(hash).await;
    }

    pub fn queued(&self) -> Vec<String> {
        lock(&self.state).queue.iter().cloned().collect()
    }

    pub fn pending(&self) -> Vec<String> {
        let mut pending: Vec<String> = lock(&self.state).pending.iter().cloned().collect();
        pending.sort();
        pending
    }

    pub fn failed(&self) -> Vec<String> {
        let mut failed: Vec<String> = lock(&self.state).failed.iter().cloned().collect();
        failed.sort();
        failed
    }

    pub fn stages(&self) -> BTreeMap<String, BuildStage> {
        lock(&self.state).stages.clone()
    }

    /// Hashes whose existence is being checked against the remote
    pub fn waiting_on_commits(&self) -> Vec<String> {
        self.waiting_on_commits.keys()
    }
}

/// Clears the pending marker however the build ends
struct PendingGuard<'a> {
    pipeline: &'a BuildPipeline,
    hash: &'a str,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(&self.pipeline.state);
        state.pending.remove(self.hash);
        state.stages.remove(self.hash);
    }
}
