//! Command-line interface: `run`/`resume`/`scan` for operators, plus
//! `step`/`run-hook` — internal sub-commands the scheduler re-invokes for
//! every DAG step (spec.md §4.6: "every step runs the engine's own CLI with
//! step-specific arguments"). Shape mirrors the teacher's `src/cli.rs`
//! `Cli{config, verbose, command}` + `Subcommand` enum.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(name = "arb", about = "Agent Arborist: a task-tree execution engine", version)]
pub struct Cli {
    /// Path to an explicit config file; overrides the usual fallback chain.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose (debug-level) logging.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Plan a spec's task tree into a manifest and DAG, then run it.
    Run {
        /// Identifier for the spec being executed; scopes commit trailers
        /// and the manifest/run-store paths.
        #[arg(long)]
        spec: String,
        /// Path to the task tree definition (JSON).
        #[arg(long)]
        tree: PathBuf,
        /// Ref the root branch is created from.
        #[arg(long, default_value = "main")]
        source_ref: String,
        /// Identifier for this run, used as the run-store directory name.
        /// Defaults to a freshly generated id.
        #[arg(long)]
        run_id: Option<String>,
    },
    /// Resume a prior run: rebuild the `RestartContext` from the run store
    /// and re-execute the DAG, skipping steps already completed.
    Resume {
        #[arg(long)]
        spec: String,
        #[arg(long)]
        tree: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    /// Scan repository history and print every task's derived state without
    /// running anything (the State Oracle, exposed directly).
    Scan {
        #[arg(long)]
        spec: String,
        #[arg(long, default_value = "main")]
        base_branch: String,
    },
    /// Internal: run exactly one pipeline step for one task, printing its
    /// `StepResult` as the last line of stdout. Invoked by the scheduler's
    /// generated DAG, never by an operator directly.
    #[command(hide = true)]
    Step {
        /// Step name (`pre-sync`, `container-up`, `run`, `commit`,
        /// `run-test`, `review`, `post-merge`, `post-cleanup`,
        /// `branches-setup`, `complete`).
        name: String,
        #[arg(long)]
        task: Option<String>,
        #[arg(long)]
        spec: String,
        /// Retry attempt number for the retryable steps (`run-test`,
        /// `review`); recorded in the `Arborist-Retry` trailer of any
        /// commit the step makes. Ignored by every other step.
        #[arg(long, default_value_t = 0)]
        retry: u32,
    },
    /// Internal: run one injected hook step, printing a `StepResult` as the
    /// last line of stdout.
    #[command(hide = true)]
    RunHook {
        #[arg(long)]
        kind: String,
        #[arg(long)]
        spec: String,
        #[arg(long)]
        task: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_with_defaults() {
        let cli = Cli::parse_from(["arb", "run", "--spec", "hello", "--tree", "tree.json"]);
        match cli.command {
            Command::Run { spec, source_ref, run_id, .. } => {
                assert_eq!(spec, "hello");
                assert_eq!(source_ref, "main");
                assert!(run_id.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_step_without_task_for_branches_setup() {
        let cli = Cli::parse_from(["arb", "step", "branches-setup", "--spec", "hello"]);
        match cli.command {
            Command::Step { name, task, spec, retry } => {
                assert_eq!(name, "branches-setup");
                assert_eq!(task, None);
                assert_eq!(spec, "hello");
                assert_eq!(retry, 0);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn verbose_and_config_are_global() {
        let cli = Cli::parse_from(["arb", "-v", "--config", "arb.yml", "scan", "--spec", "hello"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("arb.yml")));
    }
}
