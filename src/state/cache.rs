//! Runtime state cache
//!
//! Point-in-time snapshots of local images, containers and remote branches.
//! Each refresh swaps in a whole new snapshot; readers clone an `Arc` and
//! never see a half-updated collection.

use crate::error::PreviewResult;
use crate::orchestration::{ContainerInfo, ContainerRuntime, ImageInfo};
use crate::source::SourceControl;
use crate::state::SingleFlight;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Branch to commit mapping, with the reverse direction
#[derive(Debug, Default, Clone)]
pub struct BranchMap {
    by_branch: HashMap<String, String>,
    by_hash: HashMap<String, String>,
}

impl BranchMap {
    pub fn from_pairs<I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut map = Self::default();
        for (branch, hash) in pairs {
            // Only the latest branch per hash is kept
            map.by_hash.insert(hash.clone(), branch.clone());
            map.by_branch.insert(branch, hash);
        }
        map
    }

    pub fn hash(&self, branch: &str) -> Option<&str> {
        self.by_branch.get(branch).map(String::as_str)
    }

    pub fn branch(&self, hash: &str) -> Option<&str> {
        self.by_hash.get(hash).map(String::as_str)
    }

    pub fn branch_count(&self) -> usize {
        self.by_branch.len()
    }
}

/// Cached view of the container runtime and the source remote
pub struct RuntimeStateCache {
    runtime: Arc<dyn ContainerRuntime>,
    source: Arc<dyn SourceControl>,
    images: RwLock<Arc<HashMap<String, ImageInfo>>>,
    containers: RwLock<Arc<Vec<ContainerInfo>>>,
    branches: RwLock<Arc<BranchMap>>,
    branch_refresh: SingleFlight<(), ()>,
    mirror_users: Arc<AtomicUsize>,
}

impl RuntimeStateCache {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, source: Arc<dyn SourceControl>) -> Self {
        Self {
            runtime,
            source,
            images: RwLock::new(Arc::new(HashMap::new())),
            containers: RwLock::new(Arc::new(Vec::new())),
            branches: RwLock::new(Arc::new(BranchMap::default())),
            branch_refresh: SingleFlight::new(),
            mirror_users: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Re-list local images, indexed by every tag they carry
    pub async fn refresh_images(&self) -> PreviewResult<()> {
        let listed = self.runtime.list_images().await?;

        let mut images = HashMap::new();
        for image in listed {
            for tag in &image.tags {
                images.insert(tag.clone(), image.clone());
            }
        }

        debug!(count = images.len(), "Refreshed local images");
        *self.images.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(images);
        Ok(())
    }

    /// Re-list all containers, stopped ones included
    pub async fn refresh_containers(&self) -> PreviewResult<()> {
        let containers = self.runtime.list_containers().await?;

        debug!(count = containers.len(), "Refreshed containers");
        *self.containers.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(containers);
        Ok(())
    }

    /// Fetch the mirror and rebuild the branch map
    ///
    /// Concurrent callers share one fetch.
    pub async fn refresh_branches(self: &Arc<Self>) -> PreviewResult<()> {
        let this = Arc::clone(self);
        self.branch_refresh
            .run((), move || async move { this.sync_branches().await })
            .await
    }

    async fn sync_branches(&self) -> PreviewResult<()> {
        self.source.sync_mirror().await?;
        let refs = self.source.branches().await?;

        let map = BranchMap::from_pairs(refs.into_iter().map(|r| (r.name, r.hash)));
        debug!(count = map.branch_count(), "Refreshed remote branches");
        *self.branches.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(map);

        if self.mirror_users.load(Ordering::SeqCst) == 0 {
            if let Err(e) = self.source.gc().await {
                warn!(error = %e, "Mirror garbage collection failed");
            }
        } else {
            debug!("Skipping mirror garbage collection while builds read it");
        }

        Ok(())
    }

    /// Mark the mirror as in use until the lease is dropped
    pub fn lease_mirror(&self) -> MirrorLease {
        self.mirror_users.fetch_add(1, Ordering::SeqCst);
        MirrorLease {
            users: Arc::clone(&self.mirror_users),
        }
    }

    pub fn images(&self) -> Arc<HashMap<String, ImageInfo>> {
        Arc::clone(&self.images.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn containers(&self) -> Arc<Vec<ContainerInfo>> {
        Arc::clone(&self.containers.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn branches(&self) -> Arc<BranchMap> {
        Arc::clone(&self.branches.read().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn get_image(&self, tag: &str) -> Option<ImageInfo> {
        self.images().get(tag).cloned()
    }

    pub fn has_image(&self, tag: &str) -> bool {
        self.images().contains_key(tag)
    }

    /// First container matching `predicate`
    pub fn find_container<P>(&self, predicate: P) -> Option<ContainerInfo>
    where
        P: Fn(&ContainerInfo) -> bool,
    {
        self.containers().iter().find(|c| predicate(c)).cloned()
    }

    pub fn branch_hash(&self, branch: &str) -> Option<String> {
        self.branches().hash(branch).map(String::from)
    }

    pub fn branch_for_hash(&self, hash: &str) -> Option<String> {
        self.branches().branch(hash).map(String::from)
    }
}

/// Holds off mirror garbage collection while alive
pub struct MirrorLease {
    users: Arc<AtomicUsize>,
}

impl Drop for MirrorLease {
    fn drop(&mut self) {
        self.users.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestration::ContainerState;
    use crate::testing::{FakeRuntime, FakeSource};

    fn cache(runtime: &Arc<FakeRuntime>, source: &Arc<FakeSource>) -> Arc<RuntimeStateCache> {
        Arc::new(RuntimeStateCache::new(runtime.clone(), source.clone()))
    }

    #[tokio::test]
    async fn images_indexed_by_tag_and_untagged_skipped() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image_with_tags(vec!["previewd:abc123", "previewd:latest"]);
        runtime.add_image_with_tags(vec![]);
        let cache = cache(&runtime, &Arc::new(FakeSource::new()));

        cache.refresh_images().await.unwrap();

        assert_eq!(cache.images().len(), 2);
        assert!(cache.has_image("previewd:abc123"));
        assert!(cache.has_image("previewd:latest"));
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_snapshot() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image("previewd:abc123");
        runtime.add_container("eager_hopper", "previewd:abc123", ContainerState::Running);
        let cache = cache(&runtime, &Arc::new(FakeSource::new()));
        cache.refresh_images().await.unwrap();
        cache.refresh_containers().await.unwrap();

        runtime.set_fail_listing(true);
        assert!(cache.refresh_images().await.is_err());
        assert!(cache.refresh_containers().await.is_err());

        assert!(cache.has_image("previewd:abc123"));
        assert!(cache
            .find_container(|c| c.name == "eager_hopper")
            .is_some());
    }

    #[tokio::test]
    async fn snapshot_held_by_reader_is_not_mutated() {
        let runtime = Arc::new(FakeRuntime::new());
        runtime.add_image("previewd:one");
        let cache = cache(&runtime, &Arc::new(FakeSource::new()));
        cache.refresh_images().await.unwrap();

        let before = cache.images();
        runtime.add_image("previewd:two");
        cache.refresh_images().await.unwrap();

        assert_eq!(before.len(), 1);
        assert_eq!(cache.images().len(), 2);
    }

    #[tokio::test]
    async fn branch_refresh_maps_both_directions() {
        let source = Arc::new(FakeSource::new());
        source.add_branch("trunk", "aaaa1111");
        source.add_branch("feature/x", "bbbb2222");
        let cache = cache(&Arc::new(FakeRuntime::new()), &source);

        cache.refresh_branches().await.unwrap();

        assert_eq!(cache.branch_hash("trunk").as_deref(), Some("aaaa1111"));
        assert_eq!(cache.branch_for_hash("bbbb2222").as_deref(), Some("feature/x"));
        assert!(cache.branch_hash("missing").is_none());
    }

    #[tokio::test]
    async fn concurrent_branch_refreshes_share_one_fetch() {
        let source = Arc::new(FakeSource::new());
        source.set_sync_delay(std::time::Duration::from_millis(50));
        let cache = cache(&Arc::new(FakeRuntime::new()), &source);

        let (a, b, c) = tokio::join!(
            cache.refresh_branches(),
            cache.refresh_branches(),
            cache.refresh_branches()
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert_eq!(source.sync_count(), 1);
    }

    #[tokio::test]
    async fn failed_branch_refresh_keeps_last_mapping() {
        let source = Arc::new(FakeSource::new());
        source.add_branch("trunk", "aaaa1111");
        let cache = cache(&Arc::new(FakeRuntime::new()), &source);
        cache.refresh_branches().await.unwrap();

        source.set_fail_sync(true);
        assert!(cache.refresh_branches().await.is_err());
        assert_eq!(cache.branch_hash("trunk").as_deref(), Some("aaaa1111"));
    }

    #[tokio::test]
    async fn gc_deferred_while_mirror_leased() {
        let source = Arc::new(FakeSource::new());
        let cache = cache(&Arc::new(FakeRuntime::new()), &source);

        let lease = cache.lease_mirror();
        cache.refresh_branches().await.unwrap();
        assert_eq!(source.gc_count(), 0);

        drop(lease);
        cache.refresh_branches().await.unwrap();
        assert_eq!(source.gc_count(), 1);
    }
}
