//! VCS Adapter: the minimum set of operations the engine needs, presented
//! as ordinary async function calls. Only the commit-oriented (git) backend
//! is required per spec.md §4.2/§9; a change-oriented backend is left as an
//! unimplemented trait target.

mod git;
pub mod worktree;

pub use git::GitAdapter;
pub use worktree::{WorktreeConfig, WorktreeError, WorktreeInfo, WorktreeManager};

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::constants::COMMIT_SEP;

#[derive(Debug, Error)]
pub enum VcsError {
    #[error("vcs command failed: {0}")]
    CommandFailed(String),
    #[error("process error: {0}")]
    Process(#[from] crate::process::ProcessError),
}

pub type Result<T> = std::result::Result<T, VcsError>;

/// Outcome of a `merge --no-ff`.
#[derive(Debug, Clone)]
pub enum MergeOutcome {
    Ok { sha: String },
    Conflicts { paths: Vec<String> },
}

/// Options threaded into `log`/`log_since`.
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub n: Option<usize>,
    pub grep: Option<String>,
    pub fixed_strings: bool,
}

/// One parsed block from `log_since`, separated by `COMMIT_SEP` on the wire.
#[derive(Debug, Clone)]
pub struct LogBlock {
    pub raw: String,
}

/// Split a `log_since`-formatted string on the commit separator, dropping
/// empty trailing blocks.
pub fn split_log_blocks(raw: &str) -> Vec<LogBlock> {
    raw.split(COMMIT_SEP)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| LogBlock { raw: s.to_string() })
        .collect()
}

/// Abstract VCS operations the engine depends on. Every operation returns a
/// typed result; only malformed invocations raise `VcsError` — "not found"
/// is represented in the return type (`Option`, empty `Vec`, etc).
#[async_trait]
pub trait VcsAdapter: Send + Sync {
    async fn toplevel(&self, cwd: &Path) -> Result<PathBuf>;
    async fn current_branch(&self, cwd: &Path) -> Result<String>;
    async fn branch_exists(&self, branch: &str, cwd: &Path) -> Result<bool>;
    async fn checkout(&self, branch: &str, create: bool, start_point: Option<&str>, cwd: &Path) -> Result<()>;
    async fn add_all(&self, cwd: &Path) -> Result<()>;
    async fn commit(&self, message: &str, cwd: &Path, allow_empty: bool) -> Result<String>;
    async fn merge(&self, branch: &str, cwd: &Path, message: &str) -> Result<MergeOutcome>;
    async fn log(&self, rev: &str, format: &str, cwd: &Path, opts: &LogOptions) -> Result<String>;
    async fn diff(&self, a: &str, b: &str, cwd: &Path) -> Result<String>;
    async fn diff_stat(&self, a: &str, b: &str, cwd: &Path) -> Result<String>;
    async fn merge_base(&self, a: &str, b: &str, cwd: &Path) -> Result<Option<String>>;
    async fn log_since(&self, rev: &str, since: &str, format: &str, cwd: &Path, opts: &LogOptions) -> Result<String>;
}
