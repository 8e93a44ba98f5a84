//! State Oracle: reconstructs task state purely by grepping commit
//! trailers, scoped to a spec id, within a branch's divergence from a base
//! ref. Grounded on `src/vcs` log-scanning callers (`git log --grep`
//! patterns) generalized here into the trailer parser and state-mapping
//! rules spec.md §3/§4.5 define. Never touches the manifest or the
//! filesystem — any clone with the same history reports the same state.

use std::collections::HashMap;
use std::path::Path;

use thiserror::Error;

use crate::constants::{self, TRAILER_PREFIX};
use crate::vcs::{LogOptions, VcsAdapter, VcsError, split_log_blocks};

#[derive(Debug, Error)]
pub enum StateError {
    #[error("vcs error: {0}")]
    Vcs(#[from] VcsError),
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Format string passed to `log`/`log_since`: subject on its own line, a
/// blank line, then the raw trailer block. Parsed back by `parse_commit`.
const LOG_FORMAT: &str = "%s%n%n%b";

#[derive(Debug, Clone, Default)]
pub struct CommitTrailers {
    pub values: HashMap<String, Vec<String>>,
}

impl CommitTrailers {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).and_then(|v| v.first()).map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        self.values.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    fn prefixed(name: &str) -> String {
        format!("{TRAILER_PREFIX}-{name}")
    }

    pub fn step(&self) -> Option<&str> {
        self.get(&Self::prefixed("Step"))
    }

    pub fn result(&self) -> Option<&str> {
        self.get(&Self::prefixed("Result"))
    }

    pub fn retry(&self) -> Option<u32> {
        self.get(&Self::prefixed("Retry")).and_then(|v| v.parse().ok())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Implementing,
    Testing,
    Reviewing,
    Complete,
    Failed,
}

/// One parsed commit: subject and the trailers found in its body.
#[derive(Debug, Clone)]
pub struct ParsedCommit {
    pub subject: String,
    pub trailers: CommitTrailers,
}

/// Parse a raw formatted commit block (`%s%n%n%b`) into subject + trailers.
/// Trailer lines are `Key: value` lines in the final contiguous block of
/// the message; repeated keys accumulate (multi-value trailers use
/// repetition, not commas, per spec.md §6).
pub fn parse_commit(raw: &str) -> ParsedCommit {
    let mut lines = raw.lines();
    let subject = lines.next().unwrap_or_default().to_string();

    let mut values: HashMap<String, Vec<String>> = HashMap::new();
    for line in lines {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some((key, value)) = line.split_once(": ") {
            if key.starts_with(TRAILER_PREFIX) {
                values.entry(key.to_string()).or_default().push(value.to_string());
            }
        }
    }

    ParsedCommit {
        subject,
        trailers: CommitTrailers { values },
    }
}

/// Pure mapping from a task's most recent trailers to its derived state,
/// per the table in spec.md §3.
pub fn task_state_from_trailers(trailers: &CommitTrailers) -> TaskState {
    match (trailers.step(), trailers.result()) {
        (Some("complete"), Some("pass")) => TaskState::Complete,
        (Some("complete"), Some("fail")) => TaskState::Failed,
        (Some("review"), _) => TaskState::Reviewing,
        (Some("test"), _) => TaskState::Testing,
        (Some("implement"), _) => TaskState::Implementing,
        _ => TaskState::Pending,
    }
}

/// Find the most recent commit on `rev` whose subject matches
/// `task(<spec_id>@<task_id>` (fixed-string grep) and return its trailers.
pub async fn get_task_trailers(
    vcs: &dyn VcsAdapter,
    rev: &str,
    task_id: &str,
    cwd: &Path,
    spec_id: &str,
) -> Result<Option<CommitTrailers>> {
    let grep = format!("task({spec_id}@{task_id}@");
    let raw = vcs
        .log(
            rev,
            LOG_FORMAT,
            cwd,
            &LogOptions {
                n: Some(1),
                grep: Some(grep),
                fixed_strings: true,
            },
        )
        .await?;
    if raw.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(parse_commit(&raw).trailers))
}

/// One `log_since` call over `base_branch..HEAD` (or just `HEAD` if already
/// on `base_branch`), scoped by a fixed-string grep on the spec prefix.
/// Records state from the first (most recent) block seen per task id.
pub async fn scan_task_states(
    vcs: &dyn VcsAdapter,
    cwd: &Path,
    spec_id: &str,
    base_branch: &str,
) -> Result<(HashMap<String, TaskState>, HashMap<String, CommitTrailers>)> {
    let current = vcs.current_branch(cwd).await?;
    let rev = "HEAD";
    let since = if current == base_branch { rev } else { base_branch };

    let raw = vcs
        .log_since(
            rev,
            since,
            LOG_FORMAT,
            cwd,
            &LogOptions {
                n: None,
                grep: Some(constants::spec_scope_prefix(spec_id)),
                fixed_strings: true,
            },
        )
        .await?;

    let mut states = HashMap::new();
    let mut trailers_by_task = HashMap::new();

    for block in split_log_blocks(&raw) {
        let parsed = parse_commit(&block.raw);
        let Some(task_id) = extract_task_id(&parsed.subject, spec_id) else {
            continue;
        };
        // First block seen per task id is the most recent (git log is
        // reverse-chronological), so later blocks for the same id are
        // ignored.
        states.entry(task_id.clone()).or_insert_with(|| task_state_from_trailers(&parsed.trailers));
        trailers_by_task.entry(task_id).or_insert(parsed.trailers);
    }

    Ok((states, trailers_by_task))
}

/// Parse `task_id` out of a subject matching `task(<spec_id>@<task_id>@<step>): ...`.
/// Returns `None` for the run-start sentinel (empty task segment) or a
/// non-matching subject.
fn extract_task_id(subject: &str, spec_id: &str) -> Option<String> {
    let prefix = constants::spec_scope_prefix(spec_id);
    let rest = subject.strip_prefix(&prefix)?;
    let task_id = rest.split('@').next()?;
    if task_id.is_empty() { None } else { Some(task_id.to_string()) }
}

pub async fn scan_completed_tasks(
    vcs: &dyn VcsAdapter,
    cwd: &Path,
    spec_id: &str,
    base_branch: &str,
) -> Result<std::collections::HashSet<String>> {
    let (states, _) = scan_task_states(vcs, cwd, spec_id, base_branch).await?;
    Ok(states
        .into_iter()
        .filter(|(_, state)| *state == TaskState::Complete)
        .map(|(id, _)| id)
        .collect())
}

/// Find the run-start sentinel commit for `spec_id`, creating it (an empty
/// commit) if `create` is true and none is found.
pub async fn get_run_start_sha(vcs: &dyn VcsAdapter, cwd: &Path, spec_id: &str, create: bool) -> Result<Option<String>> {
    let grep = format!("task({spec_id}@@run-start)");
    let raw = vcs
        .log(
            "HEAD",
            "%H",
            cwd,
            &LogOptions {
                n: Some(1),
                grep: Some(grep),
                fixed_strings: true,
            },
        )
        .await?;
    if !raw.trim().is_empty() {
        return Ok(Some(raw.trim().to_string()));
    }

    if !create {
        return Ok(None);
    }

    let sha = vcs.commit(&constants::run_start_subject(spec_id), cwd, true).await?;
    Ok(Some(sha))
}
