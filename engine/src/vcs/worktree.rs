//! Worktree management for the `pre-sync` and `post-cleanup` pipeline
//! steps. Grounded almost verbatim on `src/worktree/manager.rs`, retargeted
//! from a random `exec_id`-keyed worktree per loop execution to a
//! deterministic `task_id -> branch` mapping sourced from the manifest.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::process::{Invocation, ProcessRunner};

#[derive(Debug, Error)]
pub enum WorktreeError {
    #[error("failed to create worktree: {0}")]
    CreateFailed(String),
    #[error("failed to remove worktree: {0}")]
    RemoveFailed(String),
    #[error("rebase conflict in worktree for {0}")]
    RebaseConflict(String),
    #[error("worktree not found: {0}")]
    NotFound(String),
    #[error("worktree corrupted: {0}")]
    Corrupted(String),
    #[error("process error: {0}")]
    Process(#[from] crate::process::ProcessError),
}

#[derive(Debug, Clone)]
pub struct WorktreeConfig {
    /// Base directory under which each task's worktree lives.
    pub base_dir: PathBuf,
    /// Path to the main repository the worktrees are linked against.
    pub repo_root: PathBuf,
}

/// State of a task's worktree after `pre-sync`.
#[derive(Debug, Clone)]
pub struct WorktreeInfo {
    pub task_id: String,
    pub worktree_path: PathBuf,
    pub branch: String,
    pub parent_branch: String,
    pub created_worktree: bool,
    pub synced_from_parent: bool,
}

pub struct WorktreeManager {
    config: WorktreeConfig,
    runner: ProcessRunner,
}

impl WorktreeManager {
    pub fn new(config: WorktreeConfig) -> Self {
        Self {
            config,
            runner: ProcessRunner::new(),
        }
    }

    fn worktree_path(&self, task_id: &str) -> PathBuf {
        self.config.base_dir.join(task_id)
    }

    async fn git(&self, args: &[&str], cwd: &Path) -> Result<(bool, String, String), WorktreeError> {
        let inv = Invocation::new(args.iter().copied(), cwd);
        let out = self.runner.run(inv).await?;
        Ok((out.success(), out.stdout_string(), out.stderr_string()))
    }

    pub fn exists(&self, task_id: &str) -> bool {
        self.worktree_path(task_id).exists()
    }

    /// Idempotent `pre-sync`: create the worktree for `task_id` at `branch`
    /// if it doesn't exist yet (checked out from `parent_branch`), then
    /// rebase it onto the parent's current HEAD.
    pub async fn ensure_synced(
        &self,
        task_id: &str,
        branch: &str,
        parent_branch: &str,
    ) -> Result<WorktreeInfo, WorktreeError> {
        debug!(task_id, branch, parent_branch, "WorktreeManager::ensure_synced: called");
        tokio::fs::create_dir_all(&self.config.base_dir)
            .await
            .map_err(|e| WorktreeError::CreateFailed(e.to_string()))?;

        let worktree_path = self.worktree_path(task_id);
        let created_worktree = !worktree_path.exists();

        if created_worktree {
            let (ok, _, stderr) = self
                .git(
                    &[
                        "worktree",
                        "add",
                        worktree_path.to_str().unwrap(),
                        "-b",
                        branch,
                        parent_branch,
                    ],
                    &self.config.repo_root,
                )
                .await?;
            if !ok {
                return Err(WorktreeError::CreateFailed(stderr));
            }
            info!(task_id, branch, "WorktreeManager::ensure_synced: created worktree");
        }

        let synced_from_parent = self.rebase_onto(task_id, parent_branch).await?;

        Ok(WorktreeInfo {
            task_id: task_id.to_string(),
            worktree_path,
            branch: branch.to_string(),
            parent_branch: parent_branch.to_string(),
            created_worktree,
            synced_from_parent,
        })
    }

    /// Rebase the task's worktree onto `parent_branch`'s current HEAD,
    /// committing any uncommitted work first so the rebase is clean.
    async fn rebase_onto(&self, task_id: &str, parent_branch: &str) -> Result<bool, WorktreeError> {
        let worktree_path = self.worktree_path(task_id);
        if !worktree_path.exists() {
            return Err(WorktreeError::NotFound(task_id.to_string()));
        }

        self.auto_commit(&worktree_path, "WIP: before rebase").await?;

        let (ok, _, _) = self.git(&["rebase", parent_branch], &worktree_path).await?;
        if !ok {
            let _ = self.git(&["rebase", "--abort"], &worktree_path).await;
            return Err(WorktreeError::RebaseConflict(task_id.to_string()));
        }
        Ok(true)
    }

    async fn auto_commit(&self, worktree_path: &Path, message: &str) -> Result<(), WorktreeError> {
        let (_, status_out, _) = self.git(&["status", "--porcelain"], worktree_path).await?;
        if status_out.trim().is_empty() {
            return Ok(());
        }
        self.git(&["add", "-A"], worktree_path).await?;
        self.git(&["commit", "-m", message, "--allow-empty"], worktree_path).await?;
        Ok(())
    }

    /// `post-cleanup`: remove the worktree and, if requested, delete its
    /// branch. Non-fatal by design — callers log failures, they don't fail
    /// the task (spec.md §4.6).
    pub async fn remove(&self, task_id: &str, branch: &str, delete_branch: bool) -> Result<(), WorktreeError> {
        let worktree_path = self.worktree_path(task_id);
        if !worktree_path.exists() {
            warn!(task_id, "WorktreeManager::remove: worktree already absent, skipping");
            return Ok(());
        }

        let (ok, _, stderr) = self
            .git(
                &["worktree", "remove", worktree_path.to_str().unwrap(), "--force"],
                &self.config.repo_root,
            )
            .await?;
        if !ok && !stderr.contains("is not a working tree") {
            return Err(WorktreeError::RemoveFailed(stderr));
        }

        if delete_branch {
            let _ = self.git(&["branch", "-D", branch], &self.config.repo_root).await;
        }

        info!(task_id, "WorktreeManager::remove: removed worktree");
        Ok(())
    }

    pub async fn validate(&self, task_id: &str) -> Result<(), WorktreeError> {
        let worktree_path = self.worktree_path(task_id);
        if !worktree_path.exists() {
            return Err(WorktreeError::NotFound(task_id.to_string()));
        }
        let (ok, _, _) = self.git(&["status"], &worktree_path).await?;
        if !ok {
            return Err(WorktreeError::Corrupted(task_id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn git(args: &[&str], cwd: &Path) {
        tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output()
            .await
            .unwrap();
    }

    async fn setup_repo(dir: &Path) -> String {
        git(&["init"], dir).await;
        git(&["config", "user.email", "t@t.com"], dir).await;
        git(&["config", "user.name", "Test"], dir).await;
        git(&["commit", "--allow-empty", "-m", "initial"], dir).await;
        let out = tokio::process::Command::new("git")
            .args(["rev-parse", "--abbrev-ref", "HEAD"])
            .current_dir(dir)
            .output()
            .await
            .unwrap();
        String::from_utf8_lossy(&out.stdout).trim().to_string()
    }

    #[tokio::test]
    async fn ensure_synced_creates_then_is_idempotent() {
        let repo_dir = tempdir().unwrap();
        let worktree_dir = tempdir().unwrap();
        let base = setup_repo(repo_dir.path()).await;

        let manager = WorktreeManager::new(WorktreeConfig {
            base_dir: worktree_dir.path().to_path_buf(),
            repo_root: repo_dir.path().to_path_buf(),
        });

        let info = manager.ensure_synced("T001", "base_a_T001", &base).await.unwrap();
        assert!(info.created_worktree);
        assert!(info.worktree_path.exists());

        // Re-running pre-sync must not fail and must not re-create.
        let info2 = manager.ensure_synced("T001", "base_a_T001", &base).await.unwrap();
        assert!(!info2.created_worktree);
        assert!(info2.synced_from_parent);
    }

    #[tokio::test]
    async fn remove_is_idempotent_when_already_gone() {
        let repo_dir = tempdir().unwrap();
        let worktree_dir = tempdir().unwrap();
        setup_repo(repo_dir.path()).await;

        let manager = WorktreeManager::new(WorktreeConfig {
            base_dir: worktree_dir.path().to_path_buf(),
            repo_root: repo_dir.path().to_path_buf(),
        });

        manager.remove("nonexistent", "nonexistent-branch", true).await.unwrap();
    }

    #[tokio::test]
    async fn validate_reports_not_found() {
        let repo_dir = tempdir().unwrap();
        let worktree_dir = tempdir().unwrap();
        setup_repo(repo_dir.path()).await;

        let manager = WorktreeManager::new(WorktreeConfig {
            base_dir: worktree_dir.path().to_path_buf(),
            repo_root: repo_dir.path().to_path_buf(),
        });

        assert!(matches!(manager.validate("missing").await, Err(WorktreeError::NotFound(_))));
    }
}
