//! Source control access for the tracked repository
//!
//! A bare mirror of the remote is kept under the state directory; builds
//! clone from it into their own working directory.

mod git;

pub use git::GitCli;

use crate::error::PreviewResult;
use async_trait::async_trait;
use std::path::Path;

/// A branch and the commit it points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRef {
    pub name: String,
    pub hash: String,
}

/// Source control operations used by the cache and the build pipeline
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Clone the mirror if it is missing, otherwise fetch and prune
    async fn sync_mirror(&self) -> PreviewResult<()>;

    /// List branches in the mirror
    async fn branches(&self) -> PreviewResult<Vec<BranchRef>>;

    /// Check whether the mirror knows a commit
    async fn has_commit(&self, hash: &str) -> PreviewResult<bool>;

    /// Clone the mirror into `dest`
    async fn clone_to(&self, dest: &Path) -> PreviewResult<()>;

    /// Check out `hash` on a throwaway branch inside a clone
    async fn checkout(&self, repo_dir: &Path, hash: &str) -> PreviewResult<()>;

    /// Garbage-collect the mirror
    async fn gc(&self) -> PreviewResult<()>;
}

/// Whether `s` looks like a (possibly abbreviated) commit hash
pub fn is_commit_hash(s: &str) -> bool {
    (4..=64).contains(&s.len()) && s.bytes().all(|b| b.is_ascii_hexdigit())
}
