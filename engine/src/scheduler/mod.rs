//! Workflow Engine / Scheduler (spec.md §4.7/§5): executes a `DAGBundle`
//! built from the manifest, bounding AI-tagged steps to `max_ai_tasks` in
//! flight and skipping steps a prior run already completed.

pub mod core;
pub mod dag;
pub mod queue;

pub use core::{Scheduler, SchedulerConfig, SchedulerError, SubDagOutcome};
pub use dag::{DAGBundle, QueueKind, Step, StepAction, SubDAG, generate_dag_bundle};
pub use queue::AiQueue;
