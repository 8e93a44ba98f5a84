//! Workflow Engine / Scheduler: executes a `DAGBundle`, respecting step
//! dependencies, AI-queue admission, restart skip-if-done, and cooperative
//! cancellation. Grounded on `src/scheduler/core.rs`'s mutex-protected
//! inner-state pattern (reused directly for the AI queue in `queue.rs`);
//! dispatch itself generalizes that file's flat `running: HashMap` into a
//! recursive sub-DAG walk, since spec.md §4.7 requires `call` steps to
//! suspend the caller until the sub-DAG's terminal step returns.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::dag::{DAGBundle, QueueKind, StepAction, SubDAG};
use super::queue::AiQueue;
use crate::pipeline::{StepPreamble, StepResult};
use crate::process::{Invocation, ProcessError, ProcessRunner};
use crate::run_store::RunStore;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown sub-dag: {0}")]
    UnknownSubDag(String),
    #[error("process error: {0}")]
    Process(#[from] ProcessError),
    #[error("run store error: {0}")]
    RunStore(#[from] crate::run_store::RunStoreError),
    #[error("step produced no parseable output: {0}")]
    UnparseableOutput(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_ai_tasks: usize,
    pub step_timeout: Duration,
    pub max_retries: u32,
}

/// Outcome of running one sub-DAG to completion: every step's result,
/// keyed by step name.
#[derive(Debug, Default)]
pub struct SubDagOutcome {
    pub results: HashMap<String, StepResult>,
}

impl SubDagOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(|r| r.success())
    }
}

pub struct Scheduler {
    runner: ProcessRunner,
    ai_queue: AiQueue,
    run_store: Mutex<RunStore>,
    cancelled: AtomicBool,
    step_timeout: Duration,
    max_retries: u32,
    restart: Option<crate::run_store::RestartContext>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, run_store: RunStore, restart: Option<crate::run_store::RestartContext>) -> Self {
        Self {
            runner: ProcessRunner::new(),
            ai_queue: AiQueue::new(config.max_ai_tasks),
            run_store: Mutex::new(run_store),
            cancelled: AtomicBool::new(false),
            step_timeout: config.step_timeout,
            max_retries: config.max_retries,
            restart,
        }
    }

    /// Request cancellation: no new steps are admitted after this returns;
    /// in-flight subprocesses are left to the `ProcessRunner`'s own timeout
    /// or an explicit `cancel()` call from the caller (spec.md §4.7(iii)).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Execute the whole bundle starting from its root sub-DAG.
    pub async fn run(&self, bundle: &DAGBundle) -> Result<SubDagOutcome> {
        self.run_subdag(&bundle.root, bundle).await
    }

    /// Run one sub-DAG to completion: dispatch steps in dependency order,
    /// `call` steps recursing into the named sub-DAG and suspending until
    /// it returns.
    fn run_subdag<'a>(&'a self, subdag: &'a SubDAG, bundle: &'a DAGBundle) -> Pin<Box<dyn Future<Output = Result<SubDagOutcome>> + 'a>> {
        Box::pin(async move {
            debug!(subdag = %subdag.name, steps = subdag.steps.len(), "Scheduler::run_subdag: starting");
            let mut outcome = SubDagOutcome::default();
            let mut remaining: Vec<&super::dag::Step> = subdag.steps.iter().collect();

            while !remaining.is_empty() {
                if self.is_cancelled() {
                    warn!(subdag = %subdag.name, "Scheduler::run_subdag: cancelled, stopping admission");
                    break;
                }

                let (ready, blocked): (Vec<_>, Vec<_>) = remaining
                    .into_iter()
                    .partition(|step| step.depends.iter().all(|dep| outcome.results.contains_key(dep)));
                remaining = blocked;

                if ready.is_empty() {
                    // Nothing newly ready and nothing left to block on:
                    // either we're done or the DAG has an unsatisfiable dep.
                    break;
                }

                for step in ready {
                    if self.is_cancelled() {
                        break;
                    }
                    let result = self.run_step(step, subdag, bundle).await?;
                    let succeeded = result.success();
                    outcome.results.insert(step.name.clone(), result);
                    if !succeeded {
                        info!(subdag = %subdag.name, step = %step.name, "Scheduler::run_subdag: step failed, dependents stay blocked");
                    }
                }
            }

            Ok(outcome)
        })
    }

    async fn run_step(&self, step: &super::dag::Step, subdag: &SubDAG, bundle: &DAGBundle) -> Result<StepResult> {
        match &step.action {
            StepAction::Call(target) => {
                let target_subdag = bundle
                    .subdags
                    .iter()
                    .find(|s| &s.name == target)
                    .ok_or_else(|| SchedulerError::UnknownSubDag(target.clone()))?;
                let sub_outcome = self.run_subdag(target_subdag, bundle).await?;
                Ok(synthesize_call_result(sub_outcome.all_succeeded()))
            }
            StepAction::Command(argv) => self.run_command_step(step, subdag, argv).await,
        }
    }

    async fn run_command_step(&self, step: &super::dag::Step, subdag: &SubDAG, argv: &[String]) -> Result<StepResult> {
        let full_step_name = format!("{}.{}", subdag.name, step.name);

        if let Some(task_id) = extract_task_id(argv) {
            let short_step = &step.name;
            if self.restart.as_ref().is_some_and(|ctx| ctx.should_skip(&task_id, short_step)) {
                let mut store = self.run_store.lock().await;
                if let Some(prior) = store.load_output(&full_step_name)? {
                    let skipped = skip_result(&prior);
                    store.record(&full_step_name, &skipped)?;
                    return Ok(skipped);
                }
            }
        }

        let _permit = if step.queue == Some(QueueKind::Ai) { Some(self.ai_queue.acquire().await) } else { None };

        // `run-test` and a failed `review` retry in place up to
        // `max_retries` (spec.md §7/§8-S4): the same step re-runs with an
        // incrementing `--retry` flag until it passes or the bound is
        // exhausted, at which point the task is committed as terminally
        // failed rather than left blocking its dependents forever.
        let retryable = matches!(step.name.as_str(), "run-test" | "review");
        let mut attempt = 0u32;
        let result = loop {
            let mut attempt_argv = argv.to_vec();
            if retryable {
                attempt_argv.push("--retry".to_string());
                attempt_argv.push(attempt.to_string());
            }

            let inv = Invocation::new(attempt_argv, std::env::current_dir().unwrap_or_default()).with_timeout(self.step_timeout);
            let output = self.runner.run(inv).await?;

            let candidate = if output.timed_out {
                StepResult::Hook(crate::pipeline::HookResult {
                    preamble: StepPreamble::failed(chrono::Utc::now(), "step-timeout"),
                    hook_kind: "command".to_string(),
                    output: serde_json::Value::Null,
                })
            } else {
                parse_step_output(&output.stdout_string()).unwrap_or_else(|| {
                    StepResult::Hook(crate::pipeline::HookResult {
                        preamble: StepPreamble::failed(chrono::Utc::now(), "unparseable-output"),
                        hook_kind: "command".to_string(),
                        output: serde_json::Value::String(output.stdout_string()),
                    })
                })
            };

            if candidate.success() || !retryable || attempt >= self.max_retries {
                break (candidate, attempt);
            }
            info!(step = %step.name, attempt, max_retries = self.max_retries, "Scheduler::run_command_step: retrying after failure");
            attempt += 1;
        };
        let (result, attempt) = result;

        if retryable && !result.success() && attempt >= self.max_retries {
            if let Some(task_id) = extract_task_id(argv) {
                self.commit_terminal_failure(argv, &task_id).await?;
            }
        }

        let mut store = self.run_store.lock().await;
        store.record(&full_step_name, &result)?;
        Ok(result)
    }

    /// Run a one-off `arb step complete` to record the task's terminal
    /// `Result=fail` commit once `run-test`/`review` retries are exhausted.
    /// Outside the generated DAG's own step set, so not itself recorded in
    /// the run store.
    async fn commit_terminal_failure(&self, argv: &[String], task_id: &str) -> Result<()> {
        let Some(spec_id) = extract_flag(argv, "--spec") else {
            return Ok(());
        };
        let fail_argv = vec![
            "arb".to_string(),
            "step".to_string(),
            "complete".to_string(),
            "--task".to_string(),
            task_id.to_string(),
            "--spec".to_string(),
            spec_id,
        ];
        let inv = Invocation::new(fail_argv, std::env::current_dir().unwrap_or_default())
            .with_timeout(self.step_timeout)
            .with_env("ARBORIST_STEP_RESULT", "fail");
        self.runner.run(inv).await?;
        Ok(())
    }
}

fn synthesize_call_result(succeeded: bool) -> StepResult {
    let preamble = if succeeded {
        StepPreamble::ok(chrono::Utc::now())
    } else {
        StepPreamble::failed(chrono::Utc::now(), "subdag-failed")
    };
    StepResult::Hook(crate::pipeline::HookResult {
        preamble,
        hook_kind: "call".to_string(),
        output: serde_json::Value::Null,
    })
}

fn skip_result(prior: &StepResult) -> StepResult {
    match prior.clone() {
        StepResult::Sync(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::Sync(r)
        }
        StepResult::ContainerUp(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::ContainerUp(r)
        }
        StepResult::Run(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::Run(r)
        }
        StepResult::Commit(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::Commit(r)
        }
        StepResult::Test(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::Test(r)
        }
        StepResult::Review(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::Review(r)
        }
        StepResult::Merge(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::Merge(r)
        }
        StepResult::Cleanup(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::Cleanup(r)
        }
        StepResult::Hook(mut r) => {
            r.preamble = StepPreamble::skip(&r.preamble, "prior run");
            StepResult::Hook(r)
        }
    }
}

/// Pull `--task <id>` out of a step's argv; steps with no `--task` flag
/// (e.g. `branches-setup`) are never restart-skippable by task id.
fn extract_task_id(argv: &[String]) -> Option<String> {
    extract_flag(argv, "--task")
}

/// Pull the value following `flag` out of a step's argv.
fn extract_flag(argv: &[String], flag: &str) -> Option<String> {
    argv.iter().position(|a| a == flag).and_then(|i| argv.get(i + 1)).cloned()
}

fn parse_step_output(stdout: &str) -> Option<StepResult> {
    let last_line = stdout.lines().filter(|l| !l.trim().is_empty()).next_back()?;
    serde_json::from_str(last_line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::{Manifest, VcsKind};
    use crate::scheduler::dag::generate_dag_bundle;
    use crate::tree::{TaskNode, TaskTree};

    fn echo_json_step(name: &str, json: &str) -> super::super::dag::Step {
        super::super::dag::Step::command(name, vec!["sh".to_string(), "-c".to_string(), format!("echo '{json}'")], Vec::new())
    }

    #[tokio::test]
    async fn runs_a_linear_two_step_subdag_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let run_store = RunStore::open(dir.path(), "hello", "run1").unwrap();
        let scheduler = Scheduler::new(
            SchedulerConfig {
                max_ai_tasks: 2,
                step_timeout: Duration::from_secs(5),
                max_retries: 0,
            },
            run_store,
            None,
        );

        let step_a = echo_json_step(
            "a",
            r#"{"kind":"commit","success":true,"timestamp":"2026-01-01T00:00:00Z","skipped":false,"commit_sha":"abc","was_fallback":false}"#,
        );
        let mut step_b = echo_json_step(
            "b",
            r#"{"kind":"commit","success":true,"timestamp":"2026-01-01T00:00:00Z","skipped":false,"commit_sha":"def","was_fallback":false}"#,
        );
        step_b.depends = vec!["a".to_string()];

        let subdag = SubDAG {
            name: "test.root".to_string(),
            env: HashMap::new(),
            description: String::new(),
            steps: vec![step_a, step_b],
            is_root: true,
        };
        let bundle = DAGBundle { root: subdag, subdags: Vec::new() };

        let outcome = scheduler.run(&bundle).await.unwrap();
        assert!(outcome.all_succeeded());
        assert_eq!(outcome.results.len(), 2);
    }

    #[tokio::test]
    async fn generated_bundle_for_single_leaf_completes() {
        let tree = TaskTree::new(vec![
            TaskNode {
                id: "phase1".to_string(),
                name: "phase1".to_string(),
                description: String::new(),
                parent: None,
                children: vec!["T001".to_string()],
                depends_on: Vec::new(),
                test_commands: Vec::new(),
            },
            TaskNode {
                id: "T001".to_string(),
                name: "T001".to_string(),
                description: String::new(),
                parent: Some("phase1".to_string()),
                children: Vec::new(),
                depends_on: Vec::new(),
                test_commands: Vec::new(),
            },
        ])
        .unwrap();
        let manifest = Manifest::generate(&tree, "hello", "main", VcsKind::Git).unwrap();
        let bundle = generate_dag_bundle(&manifest, &tree);

        // Sanity: bundle shape is well-formed even though running it for
        // real would invoke the `arb` binary, which isn't built here.
        assert_eq!(bundle.root.steps[0].name, "branches-setup");
        assert_eq!(bundle.subdags.len(), 2);
    }

    #[test]
    fn extract_task_id_reads_the_flag() {
        let argv = vec!["arb".to_string(), "step".to_string(), "run".to_string(), "--task".to_string(), "T001".to_string()];
        assert_eq!(extract_task_id(&argv), Some("T001".to_string()));
        assert_eq!(extract_task_id(&["arb".to_string()]), None);
    }
}
