//! Version-control workspaces: one git checkout per branch.

use std::{
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tern_core::sanitize_for_path;
use tokio::process::Command;
use tracing::{debug, info};

#[async_trait]
pub trait Workspace: Send + Sync {
    fn path_for(&self, branch: &str) -> PathBuf;
    /// Clones if missing, then resets to the remote branch, creating it from
    /// `base_branch` when it does not exist upstream yet.
    async fn prepare(&self, branch: &str, base_branch: &str) -> Result<PathBuf>;
    /// Commits pending changes and pushes to `push_branch`. Returns the pushed
    /// commit, or `None` when there was nothing new to push.
    async fn commit_and_push(
        &self,
        branch: &str,
        push_branch: &str,
        base_branch: &str,
        message: &str,
    ) -> Result<Option<String>>;
    async fn remove(&self, branch: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
pub struct GitWorkspace {
    root: PathBuf,
    remote_url: String,
}

impl GitWorkspace {
    pub fn new(root: impl Into<PathBuf>, remote_url: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            remote_url: remote_url.into(),
        }
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<String> {
        let output = self.git_raw(dir, args).await?;
        if !output.status.success() {
            bail!(
                "git {} failed in {}: {}",
                args.join(" "),
                dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn git_raw(&self, dir: &Path, args: &[&str]) -> Result<std::process::Output> {
        debug!(dir = %dir.display(), ?args, "git");
        Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .stdin(Stdio::null())
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .await
            .with_context(|| format!("failed to run git {}", args.join(" ")))
    }

    async fn remote_branch_exists(&self, dir: &Path, branch: &str) -> Result<bool> {
        let output = self
            .git_raw(dir, &["ls-remote", "--exit-code", "--heads", "origin", branch])
            .await?;
        Ok(output.status.success())
    }

    async fn exclude_controller_files(&self, dir: &Path) -> Result<()> {
        let exclude = dir.join(".git").join("info").join("exclude");
        let existing = tokio::fs::read_to_string(&exclude).await.unwrap_or_default();
        if existing.lines().any(|line| line.trim() == ".tern/") {
            return Ok(());
        }
        if let Some(parent) = exclude.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut updated = existing;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(".tern/\n");
        tokio::fs::write(&exclude, updated)
            .await
            .with_context(|| format!("failed to write {}", exclude.display()))
    }
}

#[async_trait]
impl Workspace for GitWorkspace {
    fn path_for(&self, branch: &str) -> PathBuf {
        self.root.join(sanitize_for_path(branch))
    }

    async fn prepare(&self, branch: &str, base_branch: &str) -> Result<PathBuf> {
        let dir = self.path_for(branch);
        if !dir.join(".git").exists() {
            tokio::fs::create_dir_all(&self.root)
                .await
                .with_context(|| format!("failed to create {}", self.root.display()))?;
            let target = dir.display().to_string();
            self.git(&self.root, &["clone", "--quiet", self.remote_url.as_str(), target.as_str()])
                .await?;
            info!(%branch, dir = %dir.display(), "workspace cloned");
        }
        self.git(&dir, &["fetch", "--quiet", "--prune", "origin"])
            .await?;
        let upstream = if self.remote_branch_exists(&dir, branch).await? {
            format!("origin/{branch}")
        } else {
            format!("origin/{base_branch}")
        };
        self.git(&dir, &["checkout", "--quiet", "-B", branch, upstream.as_str()])
            .await?;
        self.git(&dir, &["reset", "--quiet", "--hard", upstream.as_str()])
            .await?;
        self.git(&dir, &["clean", "-fdq"]).await?;
        self.exclude_controller_files(&dir).await?;
        debug!(%branch, %upstream, "workspace reset");
        Ok(dir)
    }

    async fn commit_and_push(
        &self,
        branch: &str,
        push_branch: &str,
        base_branch: &str,
        message: &str,
    ) -> Result<Option<String>> {
        let dir = self.path_for(branch);
        self.git(&dir, &["add", "--all"]).await?;
        let staged = self.git(&dir, &["status", "--porcelain"]).await?;
        if !staged.is_empty() {
            self.git(&dir, &["commit", "--quiet", "-m", message]).await?;
        }

        let upstream = if self.remote_branch_exists(&dir, push_branch).await? {
            format!("origin/{push_branch}")
        } else {
            format!("origin/{base_branch}")
        };
        let range = format!("{upstream}..HEAD");
        let ahead = self.git(&dir, &["rev-list", "--count", range.as_str()]).await?;
        if ahead.trim() == "0" {
            return Ok(None);
        }

        let refspec = format!("HEAD:refs/heads/{push_branch}");
        self.git(&dir, &["push", "--quiet", "origin", refspec.as_str()])
            .await?;
        let sha = self.git(&dir, &["rev-parse", "HEAD"]).await?;
        info!(%branch, %push_branch, %sha, "workspace pushed");
        Ok(Some(sha))
    }

    async fn remove(&self, branch: &str) -> Result<bool> {
        let dir = self.path_for(branch);
        if !dir.exists() {
            return Ok(false);
        }
        tokio::fs::remove_dir_all(&dir)
            .await
            .with_context(|| format!("failed to remove {}", dir.display()))?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_workspace_path_is_sanitized_per_branch() {
        let workspace = GitWorkspace::new("/work/acme__widgets", "https://example.invalid/x.git");
        assert_eq!(
            workspace.path_for("tern/issue-3"),
            PathBuf::from("/work/acme__widgets/tern_issue-3")
        );
    }

    #[tokio::test]
    async fn functional_remove_reports_missing_and_existing_dirs() {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let workspace = GitWorkspace::new(tempdir.path(), "unused");
        assert!(!workspace.remove("feature").await.expect("remove"));
        std::fs::create_dir_all(workspace.path_for("feature").join("src")).expect("mkdir");
        assert!(workspace.remove("feature").await.expect("remove"));
        assert!(!workspace.path_for("feature").exists());
    }
}
