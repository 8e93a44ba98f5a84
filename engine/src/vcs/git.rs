//! Commit-oriented VCS backend: plain `git` invocations via the Process
//! Runner. Grounded on `src/worktree/manager.rs`'s
//! `tokio::process::Command::new("git")` pattern, generalized from
//! worktree-only calls into the full adapter surface spec.md §4.2 lists.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{LogOptions, MergeOutcome, Result, VcsAdapter, VcsError};
use crate::constants::COMMIT_SEP;
use crate::process::{Invocation, ProcessRunner};

#[derive(Debug, Clone, Default)]
pub struct GitAdapter {
    runner: ProcessRunner,
}

impl GitAdapter {
    pub fn new() -> Self {
        Self {
            runner: ProcessRunner::new(),
        }
    }

    async fn git(&self, args: &[&str], cwd: &Path) -> Result<String> {
        debug!(?args, cwd = %cwd.display(), "GitAdapter::git: invoking");
        let inv = Invocation::new(args.iter().copied(), cwd);
        let out = self.runner.run(inv).await?;
        if !out.success() {
            return Err(VcsError::CommandFailed(out.stderr_string()));
        }
        Ok(out.stdout_string())
    }

    async fn git_allow_failure(&self, args: &[&str], cwd: &Path) -> Result<(bool, String, String)> {
        let inv = Invocation::new(args.iter().copied(), cwd);
        let out = self.runner.run(inv).await?;
        Ok((out.success(), out.stdout_string(), out.stderr_string()))
    }
}

#[async_trait]
impl VcsAdapter for GitAdapter {
    async fn toplevel(&self, cwd: &Path) -> Result<PathBuf> {
        let out = self.git(&["rev-parse", "--show-toplevel"], cwd).await?;
        Ok(PathBuf::from(out.trim()))
    }

    async fn current_branch(&self, cwd: &Path) -> Result<String> {
        let out = self.git(&["rev-parse", "--abbrev-ref", "HEAD"], cwd).await?;
        Ok(out.trim().to_string())
    }

    async fn branch_exists(&self, branch: &str, cwd: &Path) -> Result<bool> {
        let (ok, _, _) = self
            .git_allow_failure(&["show-ref", "--verify", "--quiet", &format!("refs/heads/{branch}")], cwd)
            .await?;
        Ok(ok)
    }

    async fn checkout(&self, branch: &str, create: bool, start_point: Option<&str>, cwd: &Path) -> Result<()> {
        let mut args = vec!["checkout"];
        if create {
            args.push("-b");
        }
        args.push(branch);
        if let Some(start) = start_point {
            args.push(start);
        }
        self.git(&args, cwd).await?;
        Ok(())
    }

    async fn add_all(&self, cwd: &Path) -> Result<()> {
        self.git(&["add", "-A"], cwd).await?;
        Ok(())
    }

    async fn commit(&self, message: &str, cwd: &Path, allow_empty: bool) -> Result<String> {
        let mut args = vec!["commit", "-m", message];
        if allow_empty {
            args.push("--allow-empty");
        }
        self.git(&args, cwd).await?;
        let sha = self.git(&["rev-parse", "HEAD"], cwd).await?;
        Ok(sha.trim().to_string())
    }

    async fn merge(&self, branch: &str, cwd: &Path, message: &str) -> Result<MergeOutcome> {
        let (ok, _stdout, stderr) = self
            .git_allow_failure(&["merge", "--no-ff", branch, "-m", message], cwd)
            .await?;
        if ok {
            let sha = self.git(&["rev-parse", "HEAD"], cwd).await?;
            return Ok(MergeOutcome::Ok { sha: sha.trim().to_string() });
        }

        // Conflicted merge: git leaves unmerged paths listed by `diff
        // --name-only --diff-filter=U`. If there are none, this wasn't a
        // conflict (some other failure) and we propagate the original error.
        let (_, paths_out, _) = self
            .git_allow_failure(&["diff", "--name-only", "--diff-filter=U"], cwd)
            .await?;
        let paths: Vec<String> = paths_out.lines().map(str::to_string).collect();
        if paths.is_empty() {
            return Err(VcsError::CommandFailed(stderr));
        }
        Ok(MergeOutcome::Conflicts { paths })
    }

    async fn log(&self, rev: &str, format: &str, cwd: &Path, opts: &LogOptions) -> Result<String> {
        let mut args = vec!["log".to_string(), format!("--format={format}"), rev.to_string()];
        apply_log_options(&mut args, opts);
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(&args_ref, cwd).await
    }

    async fn diff(&self, a: &str, b: &str, cwd: &Path) -> Result<String> {
        self.git(&["diff", a, b], cwd).await
    }

    async fn diff_stat(&self, a: &str, b: &str, cwd: &Path) -> Result<String> {
        self.git(&["diff", "--stat", a, b], cwd).await
    }

    async fn merge_base(&self, a: &str, b: &str, cwd: &Path) -> Result<Option<String>> {
        let (ok, out, _) = self.git_allow_failure(&["merge-base", a, b], cwd).await?;
        Ok(if ok { Some(out.trim().to_string()) } else { None })
    }

    async fn log_since(&self, rev: &str, since: &str, format: &str, cwd: &Path, opts: &LogOptions) -> Result<String> {
        let range = if since == rev { rev.to_string() } else { format!("{since}..{rev}") };
        let sentinel_format = format!("{format}%n{COMMIT_SEP}");
        let mut args = vec!["log".to_string(), format!("--format={sentinel_format}"), range];
        apply_log_options(&mut args, opts);
        let args_ref: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(&args_ref, cwd).await
    }
}

fn apply_log_options(args: &mut Vec<String>, opts: &LogOptions) {
    if let Some(n) = opts.n {
        args.push(format!("-n{n}"));
    }
    if let Some(grep) = &opts.grep {
        if opts.fixed_strings {
            args.push("--fixed-strings".to_string());
        }
        args.push(format!("--grep={grep}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn init_repo(dir: &Path) -> GitAdapter {
        let adapter = GitAdapter::new();
        adapter.git(&["init"], dir).await.unwrap();
        adapter.git(&["config", "user.email", "t@t.com"], dir).await.unwrap();
        adapter.git(&["config", "user.name", "Test"], dir).await.unwrap();
        adapter
            .git(&["commit", "--allow-empty", "-m", "initial"], dir)
            .await
            .unwrap();
        adapter
    }

    #[tokio::test]
    async fn commit_and_log_round_trip() {
        let dir = tempdir().unwrap();
        let adapter = init_repo(dir.path()).await;

        std::fs::write(dir.path().join("a.txt"), "hi").unwrap();
        adapter.add_all(dir.path()).await.unwrap();
        let sha = adapter.commit("task(hello@T001@complete): done", dir.path(), false).await.unwrap();
        assert_eq!(sha.len(), 40);

        let log = adapter
            .log_since(
                "HEAD",
                "HEAD~1",
                "%s",
                dir.path(),
                &LogOptions {
                    grep: Some("task(hello@".to_string()),
                    fixed_strings: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(log.contains("task(hello@T001@complete): done"));
    }

    #[tokio::test]
    async fn merge_base_is_none_for_unrelated_histories() {
        let dir = tempdir().unwrap();
        let adapter = init_repo(dir.path()).await;
        let base = adapter.merge_base("HEAD", "HEAD", dir.path()).await.unwrap();
        assert!(base.is_some());
    }

    #[tokio::test]
    async fn branch_exists_false_for_unknown_branch() {
        let dir = tempdir().unwrap();
        let adapter = init_repo(dir.path()).await;
        assert!(!adapter.branch_exists("does-not-exist", dir.path()).await.unwrap());
    }

    #[tokio::test]
    async fn merge_no_conflicts() {
        let dir = tempdir().unwrap();
        let adapter = init_repo(dir.path()).await;
        let default_branch = adapter.current_branch(dir.path()).await.unwrap();

        adapter.checkout("feature", true, None, dir.path()).await.unwrap();
        std::fs::write(dir.path().join("feature.txt"), "hi").unwrap();
        adapter.add_all(dir.path()).await.unwrap();
        adapter.commit("feature work", dir.path(), false).await.unwrap();

        adapter.checkout(&default_branch, false, None, dir.path()).await.unwrap();

        let result = adapter.merge("feature", dir.path(), "merge feature").await.unwrap();
        assert!(matches!(result, MergeOutcome::Ok { .. }));
    }
}
