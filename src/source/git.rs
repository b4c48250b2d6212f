//! Git CLI implementation of SourceControl

use crate::error::{PreviewError, PreviewResult};
use crate::source::{is_commit_hash, BranchRef, SourceControl};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info};

/// Name of the throwaway branch builds check out
const BUILD_BRANCH: &str = "previewd";

/// Source control backed by the `git` binary and a local bare mirror
pub struct GitCli {
    remote: String,
    mirror: PathBuf,
}

impl GitCli {
    pub fn new(remote: impl Into<String>, mirror: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            mirror: mirror.into(),
        }
    }

    /// Check if git is installed
    pub async fn is_available() -> bool {
        Command::new("git")
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    async fn git(&self, operation: &str, args: &[&str]) -> PreviewResult<String> {
        debug!("Executing: git {:?}", args);

        let output = Command::new("git")
            .args(args)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| PreviewError::command_failed(format!("git {}", operation), e))?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(PreviewError::git(operation, stderr.trim()))
        }
    }

    fn git_dir(&self) -> String {
        self.mirror.display().to_string()
    }
}

#[async_trait]
impl SourceControl for GitCli {
    async fn sync_mirror(&self) -> PreviewResult<()> {
        if self.mirror.join("HEAD").exists() {
            let git_dir = self.git_dir();
            self.git("fetch", &["--git-dir", &git_dir, "fetch", "--prune", "origin"])
                .await?;
            return Ok(());
        }

        if let Some(parent) = self.mirror.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                PreviewError::io(format!("creating directory {}", parent.display()), e)
            })?;
        }

        info!(remote = %self.remote, mirror = %self.mirror.display(), "Cloning mirror");
        let dest = self.git_dir();
        self.git("clone", &["clone", "--mirror", "--", &self.remote, &dest])
            .await?;
        Ok(())
    }

    async fn branches(&self) -> PreviewResult<Vec<BranchRef>> {
        let git_dir = self.git_dir();
        let stdout = self
            .git(
                "for-each-ref",
                &[
                    "--git-dir",
                    &git_dir,
                    "for-each-ref",
                    "--format=%(refname:short) %(objectname)",
                    "refs/heads",
                ],
            )
            .await?;
        Ok(parse_branch_refs(&stdout))
    }

    async fn has_commit(&self, hash: &str) -> PreviewResult<bool> {
        if !is_commit_hash(hash) {
            return Ok(false);
        }

        let git_dir = self.git_dir();
        let object = format!("{}^{{commit}}", hash);
        let status = Command::new("git")
            .args(["--git-dir", &git_dir, "cat-file", "-e", &object])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(|e| PreviewError::command_failed("git cat-file", e))?;
        Ok(status.success())
    }

    async fn clone_to(&self, dest: &Path) -> PreviewResult<()> {
        let source = self.git_dir();
        let dest = dest.display().to_string();
        self.git("clone", &["clone", "--no-checkout", "--", &source, &dest])
            .await?;
        Ok(())
    }

    async fn checkout(&self, repo_dir: &Path, hash: &str) -> PreviewResult<()> {
        if !is_commit_hash(hash) {
            return Err(PreviewError::CommitNotFound(hash.to_string()));
        }

        let dir = repo_dir.display().to_string();
        self.git("checkout", &["-C", &dir, "checkout", "-q", "-B", BUILD_BRANCH, hash])
            .await?;
        Ok(())
    }

    async fn gc(&self) -> PreviewResult<()> {
        let git_dir = self.git_dir();
        self.git("gc", &["--git-dir", &git_dir, "gc", "--auto", "--quiet"])
            .await?;
        Ok(())
    }
}

/// Parse `for-each-ref --format='%(refname:short) %(objectname)'` output
fn parse_branch_refs(output: &str) -> Vec<BranchRef> {
    output
        .lines()
        .filter_map(|line| {
            let (name, hash) = line.trim().rsplit_once(' ')?;
            if name.is_empty() || !is_commit_hash(hash) {
                return None;
            }
            Some(BranchRef {
                name: name.to_string(),
                hash: hash.to_string(),
            })
        })
        .collect()
}
