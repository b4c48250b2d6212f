//! In-memory doubles for the container runtime and source control

use crate::config::Config;
use crate::daemon::Orchestrator;
use crate::error::{PreviewError, PreviewResult};
use crate::orchestration::{
    BuildContext, BuildOptions, ContainerConfig, ContainerInfo, ContainerRuntime, ContainerState,
    ImageInfo, PortMapping, ProgressFn,
};
use crate::source::{BranchRef, SourceControl};
use crate::state::lock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

#[derive(Default)]
struct RuntimeState {
    images: Vec<ImageInfo>,
    containers: Vec<ContainerInfo>,
    pullable: HashMap<String, BTreeMap<String, String>>,
    next_id: u64,
    published_port: Option<u16>,
    fail_listing: bool,
    fail_run: bool,
    fail_build: bool,
    run_delay: Option<Duration>,
    build_delay: Option<Duration>,
    pull_delay: Option<Duration>,
    run_count: usize,
    create_count: usize,
    start_count: usize,
    stop_count: usize,
    build_count: usize,
    pull_count: usize,
    last_build: Option<BuildOptions>,
    last_context: Vec<u8>,
    last_run_config: Option<ContainerConfig>,
}

impl RuntimeState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn push_image(&mut self, tags: Vec<String>, labels: HashMap<String, String>) {
        let n = self.next_id();
        self.images.push(ImageInfo {
            id: format!("sha256:{:064x}", n),
            tags,
            size: 1024 * n,
            created_at: Utc::now(),
            labels,
        });
    }

    fn push_container(&mut self, config: &ContainerConfig, state: ContainerState) -> String {
        let n = self.next_id();
        let id = format!("{:064x}", n);
        self.containers.push(ContainerInfo {
            id: id.clone(),
            name: config.name.clone().unwrap_or_else(|| format!("preview_{}", n)),
            image: config.image.clone(),
            state,
            ports: vec![PortMapping {
                private_port: config.exposed_port,
                public_port: Some(self.published_port.unwrap_or(config.host_port)),
            }],
            labels: config.labels.clone().into_iter().collect(),
            created_at: Utc::now(),
        });
        id
    }

    fn find_container(&mut self, id: &str) -> Option<&mut ContainerInfo> {
        self.containers.iter_mut().find(|c| c.id == id || c.name == id)
    }
}

/// Container runtime that keeps images and containers in memory
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_image(&self, tag: &str) {
        self.add_image_with_tags(vec![tag]);
    }

    pub fn add_image_with_tags(&self, tags: Vec<&str>) {
        let tags = tags.into_iter().map(String::from).collect();
        lock(&self.state).push_image(tags, HashMap::new());
    }

    /// Register an image that `pull_image` can fetch
    pub fn add_pullable(&self, image: &str, labels: BTreeMap<String, String>) {
        lock(&self.state).pullable.insert(image.to_string(), labels);
    }

    /// Add a container that was not started by the service
    pub fn add_container(&self, name: &str, image: &str, state: ContainerState) -> ContainerInfo {
        self.insert_container(name, image, state, BTreeMap::new())
    }

    /// Add a container carrying the production environment label
    pub fn add_labeled_container(
        &self,
        name: &str,
        image: &str,
        state: ContainerState,
    ) -> ContainerInfo {
        let mut labels = BTreeMap::new();
        labels.insert("previewEnvironment".to_string(), "production".to_string());
        self.insert_container(name, image, state, labels)
    }

    fn insert_container(
        &self,
        name: &str,
        image: &str,
        state: ContainerState,
        labels: BTreeMap<String, String>,
    ) -> ContainerInfo {
        let mut inner = lock(&self.state);
        let host_port = 49000 + inner.next_id as u16;
        let config = ContainerConfig {
            image: image.to_string(),
            name: Some(name.to_string()),
            env: BTreeMap::new(),
            labels,
            exposed_port: 3000,
            host_port,
        };
        let id = inner.push_container(&config, state);
        inner
            .find_container(&id)
            .map(|c| c.clone())
            .unwrap_or_else(|| unreachable!("container just inserted"))
    }

    pub fn set_created_at(&self, id: &str, created_at: DateTime<Utc>) {
        if let Some(c) = lock(&self.state).find_container(id) {
            c.created_at = created_at;
        }
    }

    pub fn set_container_state(&self, id: &str, state: ContainerState) {
        if let Some(c) = lock(&self.state).find_container(id) {
            c.state = state;
        }
    }

    /// Publish every new container on `port` instead of the requested one
    pub fn set_published_port(&self, port: u16) {
        lock(&self.state).published_port = Some(port);
    }

    pub fn set_fail_listing(&self, fail: bool) {
        lock(&self.state).fail_listing = fail;
    }

    pub fn set_fail_run(&self, fail: bool) {
        lock(&self.state).fail_run = fail;
    }

    pub fn set_fail_build(&self, fail: bool) {
        lock(&self.state).fail_build = fail;
    }

    pub fn set_run_delay(&self, delay: Duration) {
        lock(&self.state).run_delay = Some(delay);
    }

    pub fn set_build_delay(&self, delay: Duration) {
        lock(&self.state).build_delay = Some(delay);
    }

    pub fn set_pull_delay(&self, delay: Duration) {
        lock(&self.state).pull_delay = Some(delay);
    }

    pub fn run_count(&self) -> usize {
        lock(&self.state).run_count
    }

    pub fn create_count(&self) -> usize {
        lock(&self.state).create_count
    }

    pub fn start_count(&self) -> usize {
        lock(&self.state).start_count
    }

    pub fn stop_count(&self) -> usize {
        lock(&self.state).stop_count
    }

    pub fn build_count(&self) -> usize {
        lock(&self.state).build_count
    }

    pub fn pull_count(&self) -> usize {
        lock(&self.state).pull_count
    }

    pub fn container_count(&self) -> usize {
        lock(&self.state).containers.len()
    }

    pub fn containers(&self) -> Vec<ContainerInfo> {
        lock(&self.state).containers.clone()
    }

    pub fn container(&self, id: &str) -> Option<ContainerInfo> {
        lock(&self.state).find_container(id).map(|c| c.clone())
    }

    pub fn has_image(&self, tag: &str) -> bool {
        lock(&self.state)
            .images
            .iter()
            .any(|i| i.tags.iter().any(|t| t == tag))
    }

    pub fn last_build(&self) -> Option<BuildOptions> {
        lock(&self.state).last_build.clone()
    }

    /// Build context bytes the last build read
    pub fn last_context(&self) -> Vec<u8> {
        lock(&self.state).last_context.clone()
    }

    pub fn last_run_config(&self) -> Option<ContainerConfig> {
        lock(&self.state).last_run_config.clone()
    }

    async fn pause(delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn is_available(&self) -> PreviewResult<bool> {
        Ok(true)
    }

    async fn list_images(&self) -> PreviewResult<Vec<ImageInfo>> {
        let inner = lock(&self.state);
        if inner.fail_listing {
            return Err(PreviewError::command_exec("docker image ls", "daemon unavailable"));
        }
        Ok(inner.images.clone())
    }

    async fn list_containers(&self) -> PreviewResult<Vec<ContainerInfo>> {
        let inner = lock(&self.state);
        if inner.fail_listing {
            return Err(PreviewError::command_exec("docker ps", "daemon unavailable"));
        }
        Ok(inner.containers.clone())
    }

    async fn inspect_container(&self, id: &str) -> PreviewResult<Option<ContainerInfo>> {
        Ok(self.container(id))
    }

    async fn build_image(
        &self,
        mut context: BuildContext,
        options: &BuildOptions,
        on_output: ProgressFn<'_>,
    ) -> PreviewResult<()> {
        let mut bytes = Vec::new();
        while let Some(chunk) = context.recv().await {
            bytes.extend(chunk);
        }

        let delay = {
            let mut inner = lock(&self.state);
            inner.build_count += 1;
            inner.last_build = Some(options.clone());
            inner.last_context = bytes;
            inner.build_delay
        };
        Self::pause(delay).await;

        on_output("Step 1/1 : FROM scratch".to_string());

        let mut inner = lock(&self.state);
        if inner.fail_build {
            return Err(PreviewError::ImageBuild {
                tag: options.tag.clone(),
                reason: "The command '/bin/sh -c make' returned a non-zero code: 2".to_string(),
            });
        }
        inner.push_image(vec![options.tag.clone()], HashMap::new());
        Ok(())
    }

    async fn pull_image(&self, image: &str, on_output: ProgressFn<'_>) -> PreviewResult<()> {
        let delay = {
            let mut inner = lock(&self.state);
            inner.pull_count += 1;
            inner.pull_delay
        };
        Self::pause(delay).await;

        let labels = lock(&self.state).pullable.get(image).cloned();
        let labels = labels.ok_or_else(|| PreviewError::ImageNotFound {
            image: image.to_string(),
        })?;

        on_output(format!("Pulling from {}", image));
        on_output("Digest: sha256:0f0e0d0c".to_string());
        on_output(format!("Status: Downloaded newer image for {}", image));

        lock(&self.state).push_image(vec![image.to_string()], labels.into_iter().collect());
        Ok(())
    }

    async fn run(&self, config: &ContainerConfig) -> PreviewResult<String> {
        let delay = {
            let mut inner = lock(&self.state);
            inner.run_count += 1;
            inner.last_run_config = Some(config.clone());
            inner.run_delay
        };
        Self::pause(delay).await;

        let mut inner = lock(&self.state);
        if inner.fail_run {
            return Err(PreviewError::ContainerStart(format!(
                "port {} is already allocated",
                config.host_port
            )));
        }
        Ok(inner.push_container(config, ContainerState::Running))
    }

    async fn create(&self, config: &ContainerConfig) -> PreviewResult<String> {
        let mut inner = lock(&self.state);
        inner.create_count += 1;
        inner.last_run_config = Some(config.clone());
        Ok(inner.push_container(config, ContainerState::Created))
    }

    async fn start(&self, id: &str) -> PreviewResult<()> {
        let mut inner = lock(&self.state);
        inner.start_count += 1;
        match inner.find_container(id) {
            Some(c) => {
                c.state = ContainerState::Running;
                Ok(())
            }
            None => Err(PreviewError::ContainerNotFound(id.to_string())),
        }
    }

    async fn stop(&self, id: &str, _grace_secs: u64) -> PreviewResult<()> {
        let mut inner = lock(&self.state);
        inner.stop_count += 1;
        match inner.find_container(id) {
            Some(c) => {
                c.state = ContainerState::Exited;
                Ok(())
            }
            None => Err(PreviewError::ContainerNotFound(id.to_string())),
        }
    }

    async fn remove(&self, id: &str) -> PreviewResult<()> {
        lock(&self.state)
            .containers
            .retain(|c| c.id != id && c.name != id);
        Ok(())
    }

    async fn remove_image(&self, image: &str) -> PreviewResult<()> {
        lock(&self.state)
            .images
            .retain(|i| i.id != image && !i.tags.iter().any(|t| t == image));
        Ok(())
    }

    fn runtime_name(&self) -> &'static str {
        "Fake"
    }
}

#[derive(Default)]
struct SourceState {
    remote: Vec<BranchRef>,
    mirror: Vec<BranchRef>,
    sync_delay: Option<Duration>,
    fail_sync: bool,
    sync_count: usize,
    gc_count: usize,
    checkouts: Vec<String>,
}

/// Source control whose remote and mirror are plain branch lists
#[derive(Default)]
pub struct FakeSource {
    state: Mutex<SourceState>,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a branch that is already in the mirror
    pub fn add_branch(&self, name: &str, hash: &str) {
        let branch = BranchRef {
            name: name.to_string(),
            hash: hash.to_string(),
        };
        let mut inner = lock(&self.state);
        inner.remote.push(branch.clone());
        inner.mirror.push(branch);
    }

    /// Add a branch that only shows up after the next sync
    pub fn push_remote_branch(&self, name: &str, hash: &str) {
        lock(&self.state).remote.push(BranchRef {
            name: name.to_string(),
            hash: hash.to_string(),
        });
    }

    pub fn set_sync_delay(&self, delay: Duration) {
        lock(&self.state).sync_delay = Some(delay);
    }

    pub fn set_fail_sync(&self, fail: bool) {
        lock(&self.state).fail_sync = fail;
    }

    pub fn sync_count(&self) -> usize {
        lock(&self.state).sync_count
    }

    pub fn gc_count(&self) -> usize {
        lock(&self.state).gc_count
    }

    pub fn checkouts(&self) -> Vec<String> {
        lock(&self.state).checkouts.clone()
    }
}

#[async_trait]
impl SourceControl for FakeSource {
    async fn sync_mirror(&self) -> PreviewResult<()> {
        let delay = {
            let mut inner = lock(&self.state);
            inner.sync_count += 1;
            inner.sync_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut inner = lock(&self.state);
        if inner.fail_sync {
            return Err(PreviewError::git("fetch", "could not read from remote repository"));
        }
        inner.mirror = inner.remote.clone();
        Ok(())
    }

    async fn branches(&self) -> PreviewResult<Vec<BranchRef>> {
        Ok(lock(&self.state).mirror.clone())
    }

    async fn has_commit(&self, hash: &str) -> PreviewResult<bool> {
        Ok(lock(&self.state)
            .mirror
            .iter()
            .any(|b| b.hash.starts_with(hash)))
    }

    async fn clone_to(&self, dest: &Path) -> PreviewResult<()> {
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| PreviewError::io("creating clone", e))?;
        tokio::fs::create_dir_all(dest.join(".git"))
            .await
            .map_err(|e| PreviewError::io("creating clone", e))?;
        tokio::fs::write(dest.join(".git/HEAD"), "ref: refs/heads/trunk\n")
            .await
            .map_err(|e| PreviewError::io("writing HEAD", e))?;
        tokio::fs::write(dest.join("Dockerfile"), "FROM scratch\n")
            .await
            .map_err(|e| PreviewError::io("writing Dockerfile", e))
    }

    async fn checkout(&self, _repo_dir: &Path, hash: &str) -> PreviewResult<()> {
        if !self.has_commit(hash).await? {
            return Err(PreviewError::git(
                "checkout",
                format!("reference is not a tree: {}", hash),
            ));
        }
        lock(&self.state).checkouts.push(hash.to_string());
        Ok(())
    }

    async fn gc(&self) -> PreviewResult<()> {
        lock(&self.state).gc_count += 1;
        Ok(())
    }
}

/// Orchestrator over fakes, building under `dir`, with branch `trunk` at `abc123`
pub fn orchestrator(dir: &TempDir) -> (Arc<FakeRuntime>, Arc<FakeSource>, Arc<Orchestrator>) {
    let mut config = Config::default();
    config.build.build_root = Some(dir.path().to_path_buf());

    let runtime = Arc::new(FakeRuntime::new());
    let source = Arc::new(FakeSource::new());
    source.add_branch("trunk", "abc123");

    let orch = Orchestrator::new(config, runtime.clone(), source.clone());
    (runtime, source, Arc::new(orch))
}
