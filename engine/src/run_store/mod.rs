//! Run Capture & Restart Oracle: one directory per `run_id` holding every
//! step's captured `StepResult` plus a parallel status log, and the
//! `RestartContext` builder that turns those captures into skip-if-done
//! decisions. Grounded on `arborist_store`'s temp-file-then-rename write
//! discipline, laid out per-run instead of per-collection because the unit
//! of atomicity here is a single step's output file (spec.md §4.9/§6).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::pipeline::StepResult;

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RunStoreError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Success,
    Failed,
    Running,
    Skipped,
    Pending,
}

/// One record of a step's execution, keyed by its fully-qualified name
/// (`<sub-dag path>.<step>`), uniquely identifying `{spec, run_id, sub-dag,
/// step}` per spec.md §4.9.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepAttempt {
    pub full_step_name: String,
    pub status: AttemptStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Per-run directory: `<home>/runs/<spec>/<run_id>/`. Step outputs go in
/// `<full_step_name>.json`; attempt status/timing lives in `status.json`.
pub struct RunStore {
    dir: PathBuf,
    status: HashMap<String, StepAttempt>,
}

impl RunStore {
    pub fn open(home: &Path, spec_id: &str, run_id: &str) -> Result<Self> {
        let dir = home.join("runs").join(spec_id).join(run_id);
        fs::create_dir_all(&dir)?;
        let status = Self::load_status(&dir)?;
        debug!(dir = %dir.display(), steps = status.len(), "RunStore::open: loaded prior attempts");
        Ok(Self { dir, status })
    }

    fn status_path(dir: &Path) -> PathBuf {
        dir.join("status.json")
    }

    fn load_status(dir: &Path) -> Result<HashMap<String, StepAttempt>> {
        let path = Self::status_path(dir);
        if !path.exists() {
            return Ok(HashMap::new());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_status(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.status)?;
        let tmp = Self::status_path(&self.dir).with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, Self::status_path(&self.dir))?;
        Ok(())
    }

    fn output_path(&self, full_step_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", full_step_name.replace('/', "__")))
    }

    /// Record a step's attempt and persist its `StepResult`, both via
    /// temp-file-then-rename so a crash mid-write never leaves a partial
    /// file for a restart to misread.
    pub fn record(&mut self, full_step_name: &str, result: &StepResult) -> Result<()> {
        let preamble = result.preamble();
        let attempt = StepAttempt {
            full_step_name: full_step_name.to_string(),
            status: if preamble.skipped {
                AttemptStatus::Skipped
            } else if preamble.success {
                AttemptStatus::Success
            } else {
                AttemptStatus::Failed
            },
            started_at: preamble.timestamp,
            completed_at: Some(preamble.timestamp),
            exit_code: None,
            error: preamble.error.clone(),
        };

        let json = serde_json::to_string_pretty(result)?;
        let path = self.output_path(full_step_name);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;

        self.status.insert(full_step_name.to_string(), attempt);
        self.write_status()
    }

    pub fn load_output(&self, full_step_name: &str) -> Result<Option<StepResult>> {
        let path = self.output_path(full_step_name);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    pub fn attempt(&self, full_step_name: &str) -> Option<&StepAttempt> {
        self.status.get(full_step_name)
    }

    pub fn was_completed(&self, full_step_name: &str) -> bool {
        matches!(
            self.attempt(full_step_name).map(|a| a.status),
            Some(AttemptStatus::Success) | Some(AttemptStatus::Skipped)
        )
    }
}

/// Per-task restart state, derived from captured step attempts/outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRestartContext {
    pub run_id: String,
    pub overall_status: OverallStatus,
    pub children_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub head_commit_sha: Option<String>,
    pub steps: HashMap<String, bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Pending,
    Partial,
    Complete,
    Failed,
    Running,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartContext {
    pub spec_id: String,
    pub source_run_id: String,
    pub created_at: DateTime<Utc>,
    pub root_status: OverallStatus,
    pub tasks: HashMap<String, TaskRestartContext>,
}

const LEAF_STEPS: &[&str] = &[
    "pre-sync",
    "container-up",
    "run",
    "commit",
    "run-test",
    "review",
    "post-merge",
    "post-cleanup",
];

impl RestartContext {
    /// Walk the run store's recorded attempts for every task id, building
    /// the skip-if-done structure the scheduler consults before launching
    /// each step. An explicit work stack replaces recursion (spec.md §9).
    pub fn build(store: &RunStore, spec_id: &str, run_id: &str, task_ids: &[String]) -> Self {
        let mut tasks = HashMap::new();
        let mut work_stack: Vec<String> = task_ids.to_vec();

        while let Some(task_id) = work_stack.pop() {
            if tasks.contains_key(&task_id) {
                continue;
            }

            let mut steps = HashMap::new();
            for step in LEAF_STEPS {
                let full_name = format!("task.{task_id}.{step}");
                steps.insert((*step).to_string(), store.was_completed(&full_name));
            }

            let branch_name = store
                .load_output(&format!("task.{task_id}.pre-sync"))
                .ok()
                .flatten()
                .and_then(|r| match r {
                    StepResult::Sync(s) => Some(s.branch),
                    _ => None,
                });
            let head_commit_sha = store
                .load_output(&format!("task.{task_id}.commit"))
                .ok()
                .flatten()
                .and_then(|r| match r {
                    StepResult::Commit(c) => Some(c.commit_sha),
                    _ => None,
                });

            let completed_count = steps.values().filter(|v| **v).count();
            let overall_status = if completed_count == 0 {
                OverallStatus::Pending
            } else if completed_count == LEAF_STEPS.len() {
                OverallStatus::Complete
            } else if steps.get("run-test").copied() == Some(false) && steps.get("run").copied() == Some(true) {
                OverallStatus::Partial
            } else {
                OverallStatus::Partial
            };

            tasks.insert(
                task_id.clone(),
                TaskRestartContext {
                    run_id: run_id.to_string(),
                    overall_status,
                    children_complete: false,
                    branch_name,
                    head_commit_sha,
                    steps,
                },
            );
        }

        let root_status = if tasks.values().all(|t| t.overall_status == OverallStatus::Complete) && !tasks.is_empty() {
            OverallStatus::Complete
        } else {
            OverallStatus::Partial
        };

        Self {
            spec_id: spec_id.to_string(),
            source_run_id: run_id.to_string(),
            created_at: Utc::now(),
            root_status,
            tasks,
        }
    }

    pub fn should_skip(&self, task_id: &str, step: &str) -> bool {
        self.tasks.get(task_id).and_then(|t| t.steps.get(step)).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{CommitResult, StepPreamble, SyncResult};

    #[test]
    fn record_then_reload_reports_completed() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::open(dir.path(), "hello", "run1").unwrap();

        let result = StepResult::Sync(SyncResult {
            preamble: StepPreamble::ok(Utc::now()),
            worktree_path: "/tmp/wt".to_string(),
            branch: "main_a_T001".to_string(),
            parent_branch: "main_a".to_string(),
            created_worktree: true,
            synced_from_parent: true,
        });
        store.record("task.T001.pre-sync", &result).unwrap();

        assert!(store.was_completed("task.T001.pre-sync"));
        assert!(!store.was_completed("task.T001.run"));

        let reloaded = RunStore::open(dir.path(), "hello", "run1").unwrap();
        assert!(reloaded.was_completed("task.T001.pre-sync"));
    }

    #[test]
    fn restart_context_marks_partial_progress() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = RunStore::open(dir.path(), "hello", "run1").unwrap();

        store
            .record(
                "task.T001.pre-sync",
                &StepResult::Sync(SyncResult {
                    preamble: StepPreamble::ok(Utc::now()),
                    worktree_path: "/tmp/wt".to_string(),
                    branch: "main_a_T001".to_string(),
                    parent_branch: "main_a".to_string(),
                    created_worktree: true,
                    synced_from_parent: true,
                }),
            )
            .unwrap();
        store
            .record(
                "task.T001.commit",
                &StepResult::Commit(CommitResult {
                    preamble: StepPreamble::ok(Utc::now()),
                    commit_sha: "deadbeef".to_string(),
                    was_fallback: false,
                }),
            )
            .unwrap();

        let ctx = RestartContext::build(&store, "hello", "run1", &["T001".to_string()]);
        assert!(ctx.should_skip("T001", "pre-sync"));
        assert!(ctx.should_skip("T001", "commit"));
        assert!(!ctx.should_skip("T001", "run-test"));
        assert_eq!(
            ctx.tasks.get("T001").unwrap().head_commit_sha.as_deref(),
            Some("deadbeef")
        );
    }
}
