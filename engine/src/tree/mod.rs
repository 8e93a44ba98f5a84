//! Task Tree Model: an in-memory hierarchical graph of tasks plus the
//! leaf-only topological sort that drives scheduling order. Grounded on
//! `src/domain/plan.rs`'s id-indexed tree representation (no back-pointers;
//! every edge is an id lookup through the tree's map, per spec.md §9) and on
//! `src/scheduler/core.rs`'s `BinaryHeap`-based ready-queue idiom, adapted
//! here to Kahn's algorithm with a structural tie-break instead of priority
//! values.

use std::collections::{BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("unknown task id: {0}")]
    UnknownId(String),
    #[error("cycle detected in task tree")]
    Cycle,
    #[error("dependency {0} -> {1} does not refer to siblings")]
    NonSiblingDependency(String, String),
}

pub type Result<T> = std::result::Result<T, TreeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestKind {
    Unit,
    Integration,
    E2e,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestCommand {
    pub kind: TestKind,
    pub command: String,
    #[serde(default)]
    pub framework: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub children: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub test_commands: Vec<TestCommand>,
}

impl TaskNode {
    pub fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }
}

/// The tree itself: an id-indexed map plus the ordered list of root ids.
/// Every traversal goes through `nodes`, never a back-pointer, so the
/// structure is trivially `Clone` and cycle-checked once at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskTree {
    pub roots: Vec<String>,
    pub nodes: HashMap<String, TaskNode>,
}

impl TaskTree {
    /// Build a tree from a flat node list, validating parent/child
    /// consistency and sibling-scoped dependency edges.
    pub fn new(nodes: Vec<TaskNode>) -> Result<Self> {
        let mut map = HashMap::new();
        for node in nodes {
            map.insert(node.id.clone(), node);
        }

        let roots: Vec<String> = map
            .values()
            .filter(|n| n.parent.is_none())
            .map(|n| n.id.clone())
            .collect();

        let tree = Self { roots, nodes: map };
        tree.validate()?;
        Ok(tree)
    }

    fn validate(&self) -> Result<()> {
        for node in self.nodes.values() {
            if let Some(parent_id) = &node.parent {
                let parent = self.nodes.get(parent_id).ok_or_else(|| TreeError::UnknownId(parent_id.clone()))?;
                if !parent.children.contains(&node.id) {
                    return Err(TreeError::UnknownId(node.id.clone()));
                }
            }
            for dep in &node.depends_on {
                let dep_node = self.nodes.get(dep).ok_or_else(|| TreeError::UnknownId(dep.clone()))?;
                if dep_node.parent != node.parent {
                    return Err(TreeError::NonSiblingDependency(dep.clone(), node.id.clone()));
                }
            }
        }
        self.detect_cycle()
    }

    fn detect_cycle(&self) -> Result<()> {
        let mut visiting = HashSet::new();
        let mut visited = HashSet::new();
        for id in self.nodes.keys() {
            if !visited.contains(id) && self.visit(id, &mut visiting, &mut visited) {
                return Err(TreeError::Cycle);
            }
        }
        Ok(())
    }

    fn visit(&self, id: &str, visiting: &mut HashSet<String>, visited: &mut HashSet<String>) -> bool {
        if visiting.contains(id) {
            return true;
        }
        if visited.contains(id) {
            return false;
        }
        visiting.insert(id.to_string());
        if let Some(node) = self.nodes.get(id) {
            for child in &node.children {
                if self.visit(child, visiting, visited) {
                    return true;
                }
            }
        }
        visiting.remove(id);
        visited.insert(id.to_string());
        false
    }

    pub fn get(&self, id: &str) -> Result<&TaskNode> {
        self.nodes.get(id).ok_or_else(|| TreeError::UnknownId(id.to_string()))
    }

    /// Sequence of child-index positions from the root to `id`, used to
    /// tie-break the topological sort so that sibling order in the source
    /// spec wins over lexicographic id comparison (e.g. `M2` before `M10`).
    pub fn structural_key(&self, id: &str) -> Vec<usize> {
        let mut path = Vec::new();
        let mut current = id.to_string();
        loop {
            let Some(node) = self.nodes.get(&current) else {
                break;
            };
            let siblings: &[String] = match &node.parent {
                Some(parent_id) => self.nodes.get(parent_id).map(|p| p.children.as_slice()).unwrap_or(&[]),
                None => &self.roots,
            };
            let index = siblings.iter().position(|s| s == &current).unwrap_or(0);
            path.push(index);
            match &node.parent {
                Some(parent_id) => current = parent_id.clone(),
                None => break,
            }
        }
        path.reverse();
        path
    }

    /// Topmost ancestor of `id` (the "phase" it belongs to); `id` itself if
    /// it's already a root.
    pub fn root_phase(&self, id: &str) -> Result<&str> {
        let mut current = self.get(id)?;
        while let Some(parent_id) = &current.parent {
            current = self.get(parent_id)?;
        }
        Ok(&current.id)
    }

    /// All leaf descendants of `id`, including `id` itself if it's a leaf.
    /// Iterative, per spec.md §9's "no unbounded recursion" guidance.
    pub fn leaves_under(&self, id: &str) -> Result<Vec<String>> {
        let mut stack = vec![id.to_string()];
        let mut leaves = Vec::new();
        while let Some(current) = stack.pop() {
            let node = self.get(&current)?;
            if node.is_leaf() {
                leaves.push(current);
            } else {
                stack.extend(node.children.iter().cloned());
            }
        }
        Ok(leaves)
    }

    fn all_leaf_ids(&self) -> Vec<String> {
        self.nodes.values().filter(|n| n.is_leaf()).map(|n| n.id.clone()).collect()
    }

    /// Leaf-to-leaf dependency edges only; a `depends_on` entry naming a
    /// non-leaf sibling is ignored (spec.md §4.3).
    fn leaf_dependencies(&self, leaf: &TaskNode) -> Vec<String> {
        leaf.depends_on
            .iter()
            .filter(|dep| self.nodes.get(*dep).is_some_and(|n| n.is_leaf()))
            .cloned()
            .collect()
    }

    /// Kahn's algorithm over leaves only, tie-broken by structural key so
    /// sibling order in the spec wins over lexicographic id comparison.
    pub fn compute_execution_order(&self) -> Result<Vec<String>> {
        let leaves = self.all_leaf_ids();
        let mut in_degree: HashMap<String, usize> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();

        for leaf_id in &leaves {
            in_degree.entry(leaf_id.clone()).or_insert(0);
        }
        for leaf_id in &leaves {
            let leaf = self.get(leaf_id)?;
            for dep in self.leaf_dependencies(leaf) {
                *in_degree.entry(leaf_id.clone()).or_insert(0) += 1;
                dependents.entry(dep).or_default().push(leaf_id.clone());
            }
        }

        let mut ready: BTreeSet<(Vec<usize>, String)> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| (self.structural_key(id), id.clone()))
            .collect();

        let mut order = Vec::new();
        while let Some((_, id)) = ready.iter().next().cloned() {
            ready.remove(&(self.structural_key(&id), id.clone()));
            order.push(id.clone());
            if let Some(dependent_ids) = dependents.get(&id) {
                for dependent in dependent_ids {
                    let degree = in_degree.get_mut(dependent).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        ready.insert((self.structural_key(dependent), dependent.clone()));
                    }
                }
            }
        }

        if order.len() != leaves.len() {
            return Err(TreeError::Cycle);
        }
        Ok(order)
    }

    /// Leaves whose dependencies are all satisfied and are not themselves
    /// already complete.
    pub fn ready_leaves(&self, completed: &HashSet<String>) -> Vec<String> {
        let mut ready: Vec<String> = self
            .all_leaf_ids()
            .into_iter()
            .filter(|id| !completed.contains(id))
            .filter(|id| {
                let leaf = self.nodes.get(id).unwrap();
                self.leaf_dependencies(leaf).iter().all(|dep| completed.contains(dep))
            })
            .collect();
        ready.sort_by_key(|id| self.structural_key(id));
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, parent: Option<&str>, depends_on: &[&str]) -> TaskNode {
        TaskNode {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            parent: parent.map(str::to_string),
            children: Vec::new(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            test_commands: Vec::new(),
        }
    }

    fn with_children(mut n: TaskNode, children: &[&str]) -> TaskNode {
        n.children = children.iter().map(|s| s.to_string()).collect();
        n
    }

    #[test]
    fn topological_soundness_for_dependency_edge() {
        let tree = TaskTree::new(vec![
            with_children(node("phase1", None, &[]), &["T001", "T002"]),
            node("T001", Some("phase1"), &[]),
            node("T002", Some("phase1"), &["T001"]),
        ])
        .unwrap();

        let order = tree.compute_execution_order().unwrap();
        let pos_a = order.iter().position(|x| x == "T001").unwrap();
        let pos_b = order.iter().position(|x| x == "T002").unwrap();
        assert!(pos_a < pos_b);
    }

    #[test]
    fn structural_tie_break_beats_lexicographic_order() {
        let tree = TaskTree::new(vec![
            with_children(node("root", None, &[]), &["M2", "M10"]),
            with_children(node("M2", Some("root"), &[]), &["T1"]),
            with_children(node("M10", Some("root"), &[]), &["T1b"]),
            node("T1", Some("M2"), &[]),
            node("T1b", Some("M10"), &[]),
        ])
        .unwrap();

        let order = tree.compute_execution_order().unwrap();
        let pos_m2_leaf = order.iter().position(|x| x == "T1").unwrap();
        let pos_m10_leaf = order.iter().position(|x| x == "T1b").unwrap();
        assert!(pos_m2_leaf < pos_m10_leaf, "M2's leaf must precede M10's leaf despite lexicographic order");
    }

    #[test]
    fn dependency_on_non_leaf_sibling_is_ignored() {
        // A leaf depending on an internal sibling id shouldn't create an
        // in-degree edge that can never resolve.
        let tree = TaskTree::new(vec![
            with_children(node("root", None, &[]), &["group", "T001"]),
            with_children(node("group", Some("root"), &[]), &["T000"]),
            node("T000", Some("group"), &[]),
            node("T001", Some("root"), &["group"]),
        ])
        .unwrap();

        let order = tree.compute_execution_order().unwrap();
        assert_eq!(order.len(), 2);
    }

    #[test]
    fn ready_leaves_respects_completion_set() {
        let tree = TaskTree::new(vec![
            with_children(node("phase1", None, &[]), &["T001", "T002"]),
            node("T001", Some("phase1"), &[]),
            node("T002", Some("phase1"), &["T001"]),
        ])
        .unwrap();

        let completed = HashSet::new();
        assert_eq!(tree.ready_leaves(&completed), vec!["T001".to_string()]);

        let mut completed = HashSet::new();
        completed.insert("T001".to_string());
        assert_eq!(tree.ready_leaves(&completed), vec!["T002".to_string()]);
    }

    #[test]
    fn leaves_under_collects_recursive_descendants() {
        let tree = TaskTree::new(vec![
            with_children(node("root", None, &[]), &["group"]),
            with_children(node("group", Some("root"), &[]), &["T1", "T2"]),
            node("T1", Some("group"), &[]),
            node("T2", Some("group"), &[]),
        ])
        .unwrap();

        let mut leaves = tree.leaves_under("root").unwrap();
        leaves.sort();
        assert_eq!(leaves, vec!["T1".to_string(), "T2".to_string()]);
    }

    #[test]
    fn root_phase_walks_to_topmost_ancestor() {
        let tree = TaskTree::new(vec![
            with_children(node("root", None, &[]), &["group"]),
            with_children(node("group", Some("root"), &[]), &["T1"]),
            node("T1", Some("group"), &[]),
        ])
        .unwrap();

        assert_eq!(tree.root_phase("T1").unwrap(), "root");
    }

    #[test]
    fn non_sibling_dependency_is_rejected() {
        let result = TaskTree::new(vec![
            with_children(node("phase1", None, &[]), &["T001"]),
            with_children(node("phase2", None, &[]), &["T002"]),
            node("T001", Some("phase1"), &[]),
            node("T002", Some("phase2"), &["T001"]),
        ]);
        assert!(matches!(result, Err(TreeError::NonSiblingDependency(_, _))));
    }
}
