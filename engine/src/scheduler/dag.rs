//! DAG data model: `DAGBundle`/`SubDAG`/`Step` exactly per spec.md §3.
//! Grounded on the manifest's `dagu/dags/<spec_id>.json` discovery path
//! (the original implementation emits dagu-compatible DAG definitions) —
//! `generate_dag_bundle` builds the same shape directly from a `Manifest`
//! instead of going through dagu's own YAML format.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::manifest::Manifest;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Ai,
}

/// Exactly one of `command` or `call`, enforced at construction rather than
/// relying on serde's "both absent/present" ambiguity (spec.md §9's
/// command/call union guidance).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepAction {
    Command(Vec<String>),
    Call(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    #[serde(default)]
    pub depends: Vec<String>,
    #[serde(default)]
    pub queue: Option<QueueKind>,
    #[serde(default)]
    pub output_capture: Option<String>,
}

impl Step {
    pub fn command(name: impl Into<String>, argv: Vec<String>, depends: Vec<String>) -> Self {
        let name = name.into();
        let output_capture = Some(format!("{name}_result"));
        Self {
            name,
            action: StepAction::Command(argv),
            depends,
            queue: None,
            output_capture,
        }
    }

    pub fn call(name: impl Into<String>, subdag: impl Into<String>, depends: Vec<String>) -> Self {
        Self {
            name: name.into(),
            action: StepAction::Call(subdag.into()),
            depends,
            queue: None,
            output_capture: None,
        }
    }

    pub fn with_queue(mut self, queue: QueueKind) -> Self {
        self.queue = Some(queue);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubDAG {
    pub name: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    pub is_root: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DAGBundle {
    pub root: SubDAG,
    pub subdags: Vec<SubDAG>,
}

/// Name of a leaf task's sub-DAG: `task.<task_id>`.
pub fn leaf_subdag_name(task_id: &str) -> String {
    format!("task.{task_id}")
}

/// Name of a phase (internal-task) sub-DAG: `phase.<task_id>`.
pub fn phase_subdag_name(task_id: &str) -> String {
    format!("phase.{task_id}")
}

const LEAF_STEP_NAMES: &[&str] = &[
    "pre-sync",
    "container-up",
    "run",
    "commit",
    "run-test",
    "review",
    "post-merge",
    "post-cleanup",
];

/// Build the sub-DAG for one leaf task: the eight-step pipeline in order,
/// each step re-invoking the engine's own `arb step <name> --task <id>`
/// (spec.md §4.6: "every step runs the engine's own CLI with step-specific
/// arguments").
fn leaf_subdag(task_id: &str, spec_id: &str) -> SubDAG {
    let mut steps = Vec::new();
    let mut prev: Option<String> = None;
    for step_name in LEAF_STEP_NAMES {
        let depends = prev.clone().into_iter().collect::<Vec<_>>();
        let argv = vec![
            "arb".to_string(),
            "step".to_string(),
            step_name.to_string(),
            "--task".to_string(),
            task_id.to_string(),
            "--spec".to_string(),
            spec_id.to_string(),
        ];
        let mut step = Step::command(*step_name, argv, depends);
        if matches!(*step_name, "run" | "post-merge") {
            step = step.with_queue(QueueKind::Ai);
        }
        prev = Some(step.name.clone());
        steps.push(step);
    }

    SubDAG {
        name: leaf_subdag_name(task_id),
        env: HashMap::new(),
        description: format!("leaf pipeline for {task_id}"),
        steps,
        is_root: false,
    }
}

/// Build the sub-DAG for an internal (phase) task: call each child's
/// sub-DAG in the tree's execution order, then a terminal `complete` step
/// recording the phase's own completion trailer.
fn phase_subdag(task_id: &str, children: &[String], spec_id: &str) -> SubDAG {
    let mut steps = Vec::new();
    let mut prev: Option<String> = None;
    for child_subdag_name in children {
        let step_name = format!("call_{child_subdag_name}");
        let depends = prev.clone().into_iter().collect::<Vec<_>>();
        let step = Step::call(step_name.clone(), child_subdag_name.clone(), depends);
        prev = Some(step_name);
        steps.push(step);
    }

    let complete_depends = prev.clone().into_iter().collect::<Vec<_>>();
    let argv = vec![
        "arb".to_string(),
        "step".to_string(),
        "complete".to_string(),
        "--task".to_string(),
        task_id.to_string(),
        "--spec".to_string(),
        spec_id.to_string(),
    ];
    steps.push(Step::command("complete", argv, complete_depends));

    SubDAG {
        name: phase_subdag_name(task_id),
        env: HashMap::new(),
        description: format!("phase sub-DAG for {task_id}"),
        steps,
        is_root: false,
    }
}

/// Build the full `DAGBundle` for a manifest: a root DAG with a
/// `branches-setup` step, then one `call` per root phase, plus every
/// phase/leaf sub-DAG.
pub fn generate_dag_bundle(manifest: &Manifest, tree: &crate::tree::TaskTree) -> DAGBundle {
    let mut subdags = Vec::new();

    for node in tree.nodes.values() {
        if node.is_leaf() {
            subdags.push(leaf_subdag(&node.id, &manifest.spec_id));
        } else {
            let child_names: Vec<String> = node
                .children
                .iter()
                .map(|child_id| match tree.nodes.get(child_id) {
                    Some(child) if child.is_leaf() => leaf_subdag_name(child_id),
                    _ => phase_subdag_name(child_id),
                })
                .collect();
            subdags.push(phase_subdag(&node.id, &child_names, &manifest.spec_id));
        }
    }

    let mut root_steps = vec![Step::command(
        "branches-setup",
        vec![
            "arb".to_string(),
            "step".to_string(),
            "branches-setup".to_string(),
            "--spec".to_string(),
            manifest.spec_id.clone(),
        ],
        Vec::new(),
    )];

    let mut prev = Some("branches-setup".to_string());
    for root_id in &tree.roots {
        let step_name = format!("call_{root_id}");
        let target = match tree.nodes.get(root_id) {
            Some(n) if n.is_leaf() => leaf_subdag_name(root_id),
            _ => phase_subdag_name(root_id),
        };
        let depends = prev.clone().into_iter().collect::<Vec<_>>();
        let step = Step::call(step_name.clone(), target, depends);
        prev = Some(step_name);
        root_steps.push(step);
    }

    let root = SubDAG {
        name: format!("{}.root", manifest.spec_id),
        env: HashMap::new(),
        description: format!("root DAG for spec {}", manifest.spec_id),
        steps: root_steps,
        is_root: true,
    };

    DAGBundle { root, subdags }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::VcsKind;
    use crate::tree::{TaskNode, TaskTree};

    fn node(id: &str, parent: Option<&str>, children: &[&str]) -> TaskNode {
        TaskNode {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            parent: parent.map(str::to_string),
            children: children.iter().map(|s| s.to_string()).collect(),
            depends_on: Vec::new(),
            test_commands: Vec::new(),
        }
    }

    #[test]
    fn root_dag_calls_every_root_phase_after_branches_setup() {
        let tree = TaskTree::new(vec![node("phase1", None, &["T001"]), node("T001", Some("phase1"), &[])]).unwrap();
        let manifest = Manifest::generate(&tree, "hello", "main", VcsKind::Git).unwrap();
        let bundle = generate_dag_bundle(&manifest, &tree);

        assert_eq!(bundle.root.steps[0].name, "branches-setup");
        assert!(bundle.root.steps.iter().any(|s| matches!(&s.action, StepAction::Call(target) if target == "phase.phase1")));
        assert!(bundle.subdags.iter().any(|s| s.name == "phase.phase1"));
        assert!(bundle.subdags.iter().any(|s| s.name == "task.T001"));
    }

    #[test]
    fn leaf_subdag_chains_the_eight_steps_in_order() {
        let sub = leaf_subdag("T001", "hello");
        let names: Vec<&str> = sub.steps.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, LEAF_STEP_NAMES);
        assert!(sub.steps[2].queue == Some(QueueKind::Ai)); // `run`
        assert!(sub.steps[6].queue == Some(QueueKind::Ai)); // `post-merge`
        assert!(sub.steps[0].depends.is_empty());
        assert_eq!(sub.steps[1].depends, vec!["pre-sync".to_string()]);
        match &sub.steps[0].action {
            StepAction::Command(argv) => assert!(argv.contains(&"--spec".to_string()) && argv.contains(&"hello".to_string())),
            StepAction::Call(_) => panic!("expected a command step"),
        }
    }
}
