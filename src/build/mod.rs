//! Image builds for commit hashes
//!
//! Naming and on-disk layout live here; the queue and the build task are
//! in `pipeline`.

mod context;
mod log;
mod pipeline;
mod workers;

pub use context::{finish_packing, pack_context};
pub use log::{format_log, BuildLogger, LogSink};
pub use pipeline::{BuildPipeline, BuildStage};

use crate::config::Config;
use std::path::PathBuf;

/// Subdirectory of a build directory holding the checked-out tree
const REPO_SUBDIR: &str = "repo";

/// Deterministic image name for a commit
pub fn image_name(tag_prefix: &str, hash: &str) -> String {
    format!("{}:{}", tag_prefix, hash)
}

/// Commit hash encoded in an image name, `None` for other repositories
pub fn extract_commit_from_image<'a>(tag_prefix: &str, image: &'a str) -> Option<&'a str> {
    let hash = image.strip_prefix(tag_prefix)?.strip_prefix(':')?;
    (!hash.is_empty()).then_some(hash)
}

/// Where each build keeps its working tree and log
#[derive(Debug, Clone)]
pub struct BuildLayout {
    root: PathBuf,
    slug: String,
    log_filename: String,
}

impl BuildLayout {
    pub fn new(root: PathBuf, slug: impl Into<String>, log_filename: impl Into<String>) -> Self {
        Self {
            root,
            slug: slug.into(),
            log_filename: log_filename.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.build.build_root(),
            config.repo.slug(),
            config.build.log_filename.clone(),
        )
    }

    /// `<root>/previewd-build-<slug>-<hash>`
    pub fn build_dir(&self, hash: &str) -> PathBuf {
        self.root
            .join(format!("{}-build-{}-{}", env!("CARGO_PKG_NAME"), self.slug, hash))
    }

    pub fn repo_dir(&self, hash: &str) -> PathBuf {
        self.build_dir(hash).join(REPO_SUBDIR)
    }

    pub fn log_path(&self, hash: &str) -> PathBuf {
        self.build_dir(hash).join(&self.log_filename)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_name_round_trip() {
        for hash in ["abc123", "6b6215eed45a5668010911744ec660f5f12edb74"] {
            let name = image_name("previewd", hash);
            assert_eq!(extract_commit_from_image("previewd", &name), Some(hash));
        }
    }

    #[test]
    fn extract_rejects_other_prefixes() {
        assert_eq!(extract_commit_from_image("previewd", "other:abc123"), None);
        assert_eq!(extract_commit_from_image("previewd", "previewd-x:abc123"), None);
        assert_eq!(extract_commit_from_image("previewd", "previewd:"), None);
        assert_eq!(extract_commit_from_image("previewd", "previewd"), None);
    }

    #[test]
    fn layout_paths() {
        let layout = BuildLayout::new(PathBuf::from("/tmp"), "acme-shop", "build.log");
        assert_eq!(
            layout.build_dir("abc123"),
            PathBuf::from("/tmp/previewd-build-acme-shop-abc123")
        );
        assert_eq!(
            layout.repo_dir("abc123"),
            PathBuf::from("/tmp/previewd-build-acme-shop-abc123/repo")
        );
        assert_eq!(
            layout.log_path("abc123"),
            PathBuf::from("/tmp/previewd-build-acme-shop-abc123/build.log")
        );
    }
}
