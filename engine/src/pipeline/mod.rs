//! Per-Task Pipeline: the fixed ordered sequence of steps a leaf task runs,
//! each emitting exactly one JSON `StepResult`. Grounded on
//! `tools/builtin/run_command.rs`'s one-shot "run an external thing, capture
//! structured output" shape, generalized across the eight leaf steps
//! spec.md §4.6 names, using the VCS Adapter (§4.2), Worktree Manager, and
//! Process Runner (§4.1) built earlier.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Environment;
use crate::constants;
use crate::process::{ContainerError, ContainerRunner, Invocation, ProcessError, ProcessRunner};
use crate::tree::TestCommand;
use crate::vcs::{MergeOutcome, VcsAdapter, VcsError};
use crate::vcs::worktree::{WorktreeError, WorktreeManager};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),
    #[error("worktree error: {0}")]
    Worktree(#[from] WorktreeError),
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("no test commands resolved for task")]
    NoTestCommands,
    #[error("container error: {0}")]
    Container(#[from] ContainerError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;

/// Fields common to every `StepResult` variant, flattened into its JSON
/// representation (spec.md §3's "Preamble").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPreamble {
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StepPreamble {
    pub fn ok(timestamp: DateTime<Utc>) -> Self {
        Self {
            success: true,
            timestamp,
            error: None,
            skipped: false,
            skip_reason: None,
        }
    }

    pub fn failed(timestamp: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            timestamp,
            error: Some(error.into()),
            skipped: false,
            skip_reason: None,
        }
    }

    pub fn skip(prior: &StepPreamble, reason: impl Into<String>) -> Self {
        Self {
            success: prior.success,
            timestamp: prior.timestamp,
            error: prior.error.clone(),
            skipped: true,
            skip_reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub worktree_path: String,
    pub branch: String,
    pub parent_branch: String,
    pub created_worktree: bool,
    pub synced_from_parent: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerUpResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub running: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub runner: String,
    pub model: String,
    pub duration_ms: u64,
    pub files_changed: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub commit_sha: String,
    pub was_fallback: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub command: String,
    pub passed: u32,
    pub failed: u32,
    pub skipped_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub result: String,
    pub log: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub target: String,
    pub source: String,
    pub conflicts: Vec<String>,
    pub resolved: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub worktree_removed: bool,
    pub branch_deleted: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HookResult {
    #[serde(flatten)]
    pub preamble: StepPreamble,
    pub hook_kind: String,
    pub output: serde_json::Value,
}

/// Tagged union of every step's JSON result, discriminated on `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum StepResult {
    #[serde(rename = "sync")]
    Sync(SyncResult),
    #[serde(rename = "container-up")]
    ContainerUp(ContainerUpResult),
    #[serde(rename = "run")]
    Run(RunResult),
    #[serde(rename = "commit")]
    Commit(CommitResult),
    #[serde(rename = "test")]
    Test(TestResult),
    #[serde(rename = "review")]
    Review(ReviewResult),
    #[serde(rename = "merge")]
    Merge(MergeResult),
    #[serde(rename = "cleanup")]
    Cleanup(CleanupResult),
    #[serde(rename = "hook")]
    Hook(HookResult),
}

impl StepResult {
    pub fn preamble(&self) -> &StepPreamble {
        match self {
            StepResult::Sync(r) => &r.preamble,
            StepResult::ContainerUp(r) => &r.preamble,
            StepResult::Run(r) => &r.preamble,
            StepResult::Commit(r) => &r.preamble,
            StepResult::Test(r) => &r.preamble,
            StepResult::Review(r) => &r.preamble,
            StepResult::Merge(r) => &r.preamble,
            StepResult::Cleanup(r) => &r.preamble,
            StepResult::Hook(r) => &r.preamble,
        }
    }

    pub fn success(&self) -> bool {
        self.preamble().success
    }
}

/// `pre-sync`: ensure the task's worktree exists at its pre-computed branch,
/// rebased onto the parent branch's HEAD. Idempotent; safe to re-run.
pub async fn pre_sync(
    worktrees: &WorktreeManager,
    task_id: &str,
    branch: &str,
    parent_branch: &str,
) -> Result<StepResult> {
    let info = worktrees.ensure_synced(task_id, branch, parent_branch).await?;
    Ok(StepResult::Sync(SyncResult {
        preamble: StepPreamble::ok(Utc::now()),
        worktree_path: info.worktree_path.display().to_string(),
        branch: info.branch,
        parent_branch: info.parent_branch,
        created_worktree: info.created_worktree,
        synced_from_parent: info.synced_from_parent,
    }))
}

/// `container-up`: lazily start the devcontainer for the worktree, if any.
pub async fn container_up(containers: &ContainerRunner, worktree_path: &std::path::Path) -> Result<StepResult> {
    let state = containers.ensure_up(worktree_path).await?;
    Ok(StepResult::ContainerUp(ContainerUpResult {
        preamble: StepPreamble::ok(Utc::now()),
        running: matches!(state, crate::process::ContainerState::Running),
    }))
}

/// `run`: invoke the implement LLM runner with the task description. The
/// runner argv and env come from `Environment`'s `ARBORIST_RUNNER`/
/// `ARBORIST_MODEL` defaults; the runner itself is responsible for editing
/// files in `worktree_path`.
pub async fn run_implement(
    runner: &ProcessRunner,
    env: &Environment,
    worktree_path: &std::path::Path,
    task_description: &str,
) -> Result<StepResult> {
    let started = std::time::Instant::now();
    let runner_bin = std::env::var("ARBORIST_RUNNER").unwrap_or_else(|_| "claude".to_string());
    let model = std::env::var("ARBORIST_MODEL").unwrap_or_else(|_| "default".to_string());

    let inv = Invocation::new([runner_bin.as_str(), "-p", task_description], worktree_path)
        .with_timeout(std::time::Duration::from_secs(3600));
    let inv = env
        .container_env_overlay()
        .into_iter()
        .fold(inv, |inv, (k, v)| inv.with_env(k, v));

    let output = runner.run(inv).await?;
    let duration_ms = started.elapsed().as_millis() as u64;

    if !output.success() {
        return Ok(StepResult::Run(RunResult {
            preamble: StepPreamble::failed(Utc::now(), "runner-failure"),
            runner: runner_bin,
            model,
            duration_ms,
            files_changed: Vec::new(),
        }));
    }

    Ok(StepResult::Run(RunResult {
        preamble: StepPreamble::ok(Utc::now()),
        runner: runner_bin,
        model,
        duration_ms,
        files_changed: Vec::new(),
    }))
}

/// `commit`: stage everything and commit with the canonical subject. If the
/// runner produced no changes, falls back to an empty commit carrying
/// `was_fallback=true` rather than treating it as an error.
pub async fn commit_step(
    vcs: &dyn VcsAdapter,
    worktree_path: &std::path::Path,
    spec_id: &str,
    task_id: &str,
    step: &str,
    subject: &str,
) -> Result<StepResult> {
    vcs.add_all(worktree_path).await?;

    let status = crate::process::Invocation::new(["git", "status", "--porcelain"], worktree_path);
    let process = ProcessRunner::new();
    let status_out = process.run(status).await?;
    let was_fallback = status_out.stdout_string().trim().is_empty();

    let message = constants::step_commit_message(
        spec_id,
        task_id,
        step,
        subject,
        &[("Step", "implement".to_string()), ("Result", "pass".to_string()), ("Retry", "0".to_string())],
    );

    let sha = vcs.commit(&message, worktree_path, was_fallback).await?;
    Ok(StepResult::Commit(CommitResult {
        preamble: StepPreamble::ok(Utc::now()),
        commit_sha: sha,
        was_fallback,
    }))
}

/// `run-test`: resolve and run the task's test commands, aggregating pass
/// counts. A single `StepResult` summarizes the whole set; per-command
/// commands are run in order and the first failure stops the sweep. Records
/// a trailer-carrying commit (`Step=test`) alongside the result, since a
/// failed test is itself a state transition the State Oracle must observe.
pub async fn run_test(
    vcs: &dyn VcsAdapter,
    runner: &ProcessRunner,
    worktree_path: &std::path::Path,
    spec_id: &str,
    task_id: &str,
    test_commands: &[TestCommand],
    retry: u32,
) -> Result<StepResult> {
    if test_commands.is_empty() {
        return Ok(StepResult::Test(TestResult {
            preamble: StepPreamble::failed(Utc::now(), PipelineError::NoTestCommands.to_string()),
            command: String::new(),
            passed: 0,
            failed: 0,
            skipped_count: 0,
        }));
    }

    let mut passed = 0u32;
    let mut failed = 0u32;
    let mut last_command = String::new();

    for test in test_commands {
        last_command = test.command.clone();
        let timeout = Duration::from_secs(test.timeout_seconds.unwrap_or(1800));
        let inv = Invocation::new(["sh", "-c", test.command.as_str()], worktree_path).with_timeout(timeout);
        let output = runner.run(inv).await?;
        if output.success() {
            passed += 1;
        } else {
            failed += 1;
            break;
        }
    }

    let all_passed = failed == 0;
    let message = constants::step_commit_message(
        spec_id,
        task_id,
        "test",
        &format!("ran {} test command(s)", passed + failed),
        &[
            ("Step", "test".to_string()),
            ("Result", if all_passed { "pass".to_string() } else { "fail".to_string() }),
            ("Retry", retry.to_string()),
            ("Test-Passed", passed.to_string()),
            ("Test-Failed", failed.to_string()),
            ("Test-Skipped", "0".to_string()),
        ],
    );
    vcs.commit(&message, worktree_path, true).await?;

    if !all_passed {
        return Ok(StepResult::Test(TestResult {
            preamble: StepPreamble::failed(Utc::now(), "test-failure"),
            command: last_command,
            passed,
            failed,
            skipped_count: 0,
        }));
    }

    Ok(StepResult::Test(TestResult {
        preamble: StepPreamble::ok(Utc::now()),
        command: last_command,
        passed,
        failed,
        skipped_count: 0,
    }))
}

/// `review`: invoke the review LLM runner against the produced diff; record
/// a pass/fail trailer value and a pointer to the captured review log. A
/// failed review is treated like a test failure for retry purposes.
pub async fn review_step(
    vcs: &dyn VcsAdapter,
    runner: &ProcessRunner,
    worktree_path: &std::path::Path,
    against: &str,
    spec_id: &str,
    task_id: &str,
    retry: u32,
) -> Result<StepResult> {
    let diff = vcs.diff(against, "HEAD", worktree_path).await?;
    let reviewer_bin = std::env::var("ARBORIST_RUNNER").unwrap_or_else(|_| "claude".to_string());

    let inv = Invocation::new([reviewer_bin.as_str(), "-p", "review this diff"], worktree_path)
        .with_stdin(crate::process::Stdin::Pipe(diff.into_bytes()))
        .with_timeout(std::time::Duration::from_secs(900));
    let output = runner.run(inv).await?;

    let result = if output.success() { "pass" } else { "fail" };
    let log = output.stdout_string();

    let message = constants::step_commit_message(
        spec_id,
        task_id,
        "review",
        "reviewed diff",
        &[
            ("Step", "review".to_string()),
            ("Result", result.to_string()),
            ("Retry", retry.to_string()),
            ("Review", result.to_string()),
            ("Review-Log", review_log_pointer(&log)),
        ],
    );
    vcs.commit(&message, worktree_path, true).await?;

    let preamble = if output.success() {
        StepPreamble::ok(Utc::now())
    } else {
        StepPreamble::failed(Utc::now(), "review-failure")
    };

    Ok(StepResult::Review(ReviewResult {
        preamble,
        result: result.to_string(),
        log,
    }))
}

/// First line of the review log, truncated: a pointer rather than the full
/// log, since trailer values are plain single-line scalars (spec.md §6).
fn review_log_pointer(log: &str) -> String {
    log.lines().next().unwrap_or("").chars().take(80).collect()
}

/// `post-merge`: merge the task's branch into its parent with `--no-ff`.
pub async fn post_merge(
    vcs: &dyn VcsAdapter,
    parent_worktree: &std::path::Path,
    branch: &str,
    spec_id: &str,
    task_id: &str,
) -> Result<StepResult> {
    let message = constants::step_commit_message(
        spec_id,
        task_id,
        "complete",
        "merged",
        &[("Step", "complete".to_string()), ("Result", "pass".to_string())],
    );
    match vcs.merge(branch, parent_worktree, &message).await? {
        MergeOutcome::Ok { .. } => Ok(StepResult::Merge(MergeResult {
            preamble: StepPreamble::ok(Utc::now()),
            target: vcs.current_branch(parent_worktree).await?,
            source: branch.to_string(),
            conflicts: Vec::new(),
            resolved: None,
        })),
        MergeOutcome::Conflicts { paths } => Ok(StepResult::Merge(MergeResult {
            preamble: StepPreamble::failed(Utc::now(), "merge-conflict"),
            target: vcs.current_branch(parent_worktree).await?,
            source: branch.to_string(),
            conflicts: paths,
            resolved: Some(false),
        })),
    }
}

/// `post-cleanup`: best-effort worktree/branch removal. Failures are logged
/// by the caller and never fail the task (spec.md §4.6).
pub async fn post_cleanup(worktrees: &WorktreeManager, task_id: &str, branch: &str, delete_branch: bool) -> StepResult {
    match worktrees.remove(task_id, branch, delete_branch).await {
        Ok(()) => StepResult::Cleanup(CleanupResult {
            preamble: StepPreamble::ok(Utc::now()),
            worktree_removed: true,
            branch_deleted: delete_branch,
        }),
        Err(e) => StepResult::Cleanup(CleanupResult {
            preamble: StepPreamble::failed(Utc::now(), e.to_string()),
            worktree_removed: false,
            branch_deleted: false,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_result_round_trips_through_json_with_kind_tag() {
        let result = StepResult::Commit(CommitResult {
            preamble: StepPreamble::ok(Utc::now()),
            commit_sha: "abc123".to_string(),
            was_fallback: false,
        });
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"kind\":\"commit\""));
        let reparsed: StepResult = serde_json::from_str(&json).unwrap();
        assert!(reparsed.success());
    }

    #[test]
    fn skip_preserves_prior_outcome_and_marks_skipped() {
        let prior = StepPreamble::ok(Utc::now());
        let skip = StepPreamble::skip(&prior, "prior run");
        assert!(skip.skipped);
        assert_eq!(skip.skip_reason.as_deref(), Some("prior run"));
        assert!(skip.success);
    }
}
