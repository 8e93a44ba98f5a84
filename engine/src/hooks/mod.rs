//! Hook Injector: rewrites a generated `DAGBundle` to insert extra steps at
//! six named points. New relative to the teacher's codebase (the teacher
//! has no DAG-rewriting system), built in its idiom: plain builder-style
//! transform functions over the `DAGBundle` value, concrete types rather
//! than trait objects, matching the teacher's general preference for
//! concrete structs over dynamic dispatch in its domain/scheduler layers.

use glob::Pattern;
use serde::{Deserialize, Serialize};

use crate::scheduler::dag::{DAGBundle, QueueKind, Step, StepAction, SubDAG};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookKind {
    Shell,
    LlmEval,
    QualityCheck,
    Python,
}

/// An operator-defined step, either a shell command or a reference to the
/// engine's `run-hook` sub-command for the richer kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub kind: HookKind,
    pub name: String,
    /// Shell command for `Shell`; inline spec (prompt, script path, ...)
    /// for the other kinds, passed through to `arb run-hook` verbatim.
    pub spec: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPoint {
    PreRoot,
    PostRoots,
    PreTask,
    PostTask,
    Final,
}

impl HookPoint {
    fn label(self) -> &'static str {
        match self {
            HookPoint::PreRoot => "pre_root",
            HookPoint::PostRoots => "post_roots",
            HookPoint::PreTask => "pre_task",
            HookPoint::PostTask => "post_task",
            HookPoint::Final => "final",
        }
    }
}

/// One hook configuration: where to inject, what to run, and (for the
/// task-level points) which task ids qualify.
#[derive(Debug, Clone)]
pub struct HookConfig {
    pub point: HookPoint,
    pub step: StepDefinition,
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
}

impl HookConfig {
    fn matches_task(&self, task_id: &str) -> bool {
        if !self.include_globs.is_empty()
            && !self
                .include_globs
                .iter()
                .any(|pattern| Pattern::new(pattern).is_ok_and(|p| p.matches(task_id)))
        {
            return false;
        }
        !self
            .exclude_globs
            .iter()
            .any(|pattern| Pattern::new(pattern).is_ok_and(|p| p.matches(task_id)))
    }
}

fn hook_step_name(point: HookPoint, base: &str, task_id: Option<&str>) -> String {
    match task_id {
        Some(task_id) => format!("hook_{}_{}_{}", point.label(), base, task_id),
        None => format!("hook_{}_{}", point.label(), base),
    }
}

fn build_step(point: HookPoint, def: &StepDefinition, task_id: Option<&str>, depends: Vec<String>) -> Step {
    let name = hook_step_name(point, &def.name, task_id);
    let mut argv = vec!["arb".to_string(), "run-hook".to_string(), "--kind".to_string(), hook_kind_arg(def.kind).to_string()];
    argv.push("--spec".to_string());
    argv.push(def.spec.clone());
    if let Some(task_id) = task_id {
        argv.push("--task".to_string());
        argv.push(task_id.to_string());
    }

    let mut step = Step::command(name.clone(), argv, depends);
    step.output_capture = Some(format!("{name}_result"));
    if matches!(def.kind, HookKind::LlmEval) {
        step = step.with_queue(QueueKind::Ai);
    }
    step
}

fn hook_kind_arg(kind: HookKind) -> &'static str {
    match kind {
        HookKind::Shell => "shell",
        HookKind::LlmEval => "llm_eval",
        HookKind::QualityCheck => "quality_check",
        HookKind::Python => "python",
    }
}

/// Apply every configured hook to `bundle`, returning the rewritten bundle.
/// Hooks are applied in the order given; each sees the bundle as modified
/// by the previous ones.
pub fn inject_hooks(mut bundle: DAGBundle, hooks: &[HookConfig]) -> DAGBundle {
    for hook in hooks {
        bundle = match hook.point {
            HookPoint::PreRoot => inject_pre_root(bundle, hook),
            HookPoint::PostRoots => inject_post_roots(bundle, hook),
            HookPoint::Final => inject_final(bundle, hook),
            HookPoint::PreTask => inject_task_point(bundle, hook, true),
            HookPoint::PostTask => inject_task_point(bundle, hook, false),
        };
    }
    bundle
}

/// Insert immediately after `branches-setup` in the root DAG; any step that
/// previously depended on `branches-setup` is rewired onto the new step.
fn inject_pre_root(mut bundle: DAGBundle, hook: &HookConfig) -> DAGBundle {
    let anchor = "branches-setup".to_string();
    let new_step = build_step(hook.point, &hook.step, None, vec![anchor.clone()]);
    let new_name = new_step.name.clone();

    for step in bundle.root.steps.iter_mut() {
        if step.name != new_name && step.depends.contains(&anchor) {
            step.depends.retain(|d| d != &anchor);
            step.depends.push(new_name.clone());
        }
    }
    insert_after(&mut bundle.root, &anchor, new_step);
    bundle
}

/// Insert after the last `call` step in the root DAG.
fn inject_post_roots(mut bundle: DAGBundle, hook: &HookConfig) -> DAGBundle {
    let last_call = bundle
        .root
        .steps
        .iter()
        .filter(|s| matches!(s.action, StepAction::Call(_)))
        .last()
        .map(|s| s.name.clone());

    let Some(anchor) = last_call else {
        return bundle;
    };
    let new_step = build_step(hook.point, &hook.step, None, vec![anchor.clone()]);
    insert_after(&mut bundle.root, &anchor, new_step);
    bundle
}

/// Insert as the very last step of the root DAG, depending on the current
/// last step.
fn inject_final(mut bundle: DAGBundle, hook: &HookConfig) -> DAGBundle {
    let Some(last) = bundle.root.steps.last().map(|s| s.name.clone()) else {
        return bundle;
    };
    let new_step = build_step(hook.point, &hook.step, None, vec![last]);
    bundle.root.steps.push(new_step);
    bundle
}

/// `pre_task`/`post_task`: applied to every leaf sub-DAG whose task id
/// matches the hook's glob filters.
fn inject_task_point(mut bundle: DAGBundle, hook: &HookConfig, is_pre: bool) -> DAGBundle {
    for subdag in bundle.subdags.iter_mut() {
        let Some(task_id) = subdag.name.strip_prefix("task.") else {
            continue;
        };
        if !hook.matches_task(task_id) {
            continue;
        }

        if is_pre {
            let Some(first) = subdag.steps.first().map(|s| s.name.clone()) else {
                continue;
            };
            let new_step = build_step(hook.point, &hook.step, Some(task_id), Vec::new());
            let new_name = new_step.name.clone();
            for step in subdag.steps.iter_mut() {
                if step.name == first {
                    step.depends.push(new_name.clone());
                }
            }
            subdag.steps.insert(0, new_step);
        } else {
            let Some(last) = subdag.steps.last().map(|s| s.name.clone()) else {
                continue;
            };
            let new_step = build_step(hook.point, &hook.step, Some(task_id), vec![last]);
            subdag.steps.push(new_step);
        }
    }
    bundle
}

fn insert_after(subdag: &mut SubDAG, anchor: &str, new_step: Step) {
    let position = subdag.steps.iter().position(|s| s.name == anchor).map(|i| i + 1).unwrap_or(subdag.steps.len());
    subdag.steps.insert(position, new_step);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_bundle() -> DAGBundle {
        let root = SubDAG {
            name: "hello.root".to_string(),
            env: HashMap::new(),
            description: String::new(),
            steps: vec![
                Step::command("branches-setup", vec!["arb".to_string()], Vec::new()),
                Step::call("call_phase1", "phase.phase1", vec!["branches-setup".to_string()]),
            ],
            is_root: true,
        };
        let leaf = SubDAG {
            name: "task.T001".to_string(),
            env: HashMap::new(),
            description: String::new(),
            steps: vec![
                Step::command("pre-sync", vec!["arb".to_string()], Vec::new()),
                Step::command("run", vec!["arb".to_string()], vec!["pre-sync".to_string()]),
            ],
            is_root: false,
        };
        DAGBundle { root, subdags: vec![leaf] }
    }

    fn shell_hook(point: HookPoint, name: &str) -> HookConfig {
        HookConfig {
            point,
            step: StepDefinition {
                kind: HookKind::Shell,
                name: name.to_string(),
                spec: "echo hi".to_string(),
            },
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }

    #[test]
    fn pre_root_rewires_the_old_dependent() {
        let bundle = inject_hooks(sample_bundle(), &[shell_hook(HookPoint::PreRoot, "lint")]);
        let hook_name = "hook_pre_root_lint".to_string();
        assert!(bundle.root.steps.iter().any(|s| s.name == hook_name));

        let call_step = bundle.root.steps.iter().find(|s| s.name == "call_phase1").unwrap();
        assert_eq!(call_step.depends, vec![hook_name]);
    }

    #[test]
    fn final_hook_is_last_and_depends_on_prior_last() {
        let bundle = inject_hooks(sample_bundle(), &[shell_hook(HookPoint::Final, "report")]);
        let last = bundle.root.steps.last().unwrap();
        assert_eq!(last.name, "hook_final_report");
        assert_eq!(last.depends, vec!["call_phase1".to_string()]);
    }

    #[test]
    fn pre_task_only_applies_to_matching_glob() {
        let hook = HookConfig {
            point: HookPoint::PreTask,
            step: StepDefinition {
                kind: HookKind::QualityCheck,
                name: "complexity".to_string(),
                spec: "max-cyclomatic:10".to_string(),
            },
            include_globs: vec!["T0*".to_string()],
            exclude_globs: Vec::new(),
        };
        let bundle = inject_hooks(sample_bundle(), &[hook]);
        let leaf = bundle.subdags.iter().find(|s| s.name == "task.T001").unwrap();
        assert_eq!(leaf.steps[0].name, "hook_pre_task_complexity_T001");
        assert_eq!(leaf.steps[1].name, "pre-sync");
        assert!(leaf.steps[1].depends.contains(&"hook_pre_task_complexity_T001".to_string()));
    }

    #[test]
    fn exclude_glob_skips_task() {
        let hook = HookConfig {
            point: HookPoint::PostTask,
            step: StepDefinition {
                kind: HookKind::Shell,
                name: "notify".to_string(),
                spec: "echo done".to_string(),
            },
            include_globs: Vec::new(),
            exclude_globs: vec!["T001".to_string()],
        };
        let bundle = inject_hooks(sample_bundle(), &[hook]);
        let leaf = bundle.subdags.iter().find(|s| s.name == "task.T001").unwrap();
        assert!(!leaf.steps.iter().any(|s| s.name.starts_with("hook_post_task")));
    }

    #[test]
    fn llm_eval_hooks_are_ai_queue_tagged() {
        let hook = HookConfig {
            point: HookPoint::Final,
            step: StepDefinition {
                kind: HookKind::LlmEval,
                name: "final-review".to_string(),
                spec: "assess overall quality".to_string(),
            },
            include_globs: Vec::new(),
            exclude_globs: Vec::new(),
        };
        let bundle = inject_hooks(sample_bundle(), &[hook]);
        let last = bundle.root.steps.last().unwrap();
        assert_eq!(last.queue, Some(QueueKind::Ai));
    }
}
