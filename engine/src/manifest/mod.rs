//! Branch/Change Manifest: a deterministic, pre-computed mapping from task
//! id to VCS identifier, generated from the tree in a single topological
//! pass and persisted as JSON. Grounded on `src/domain/plan.rs`'s
//! `Store<T: Record>`-backed persistence pattern, retargeted from a
//! free-running `Plan` record onto the fixed manifest shape spec.md §3/§6
//! requires.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tree::{TaskTree, TestCommand};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("unknown task id in manifest: {0}")]
    UnknownId(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ManifestError>;

/// Which VCS back-end a manifest targets. Only `Git` is fully supported; the
/// `Jj` variant is recorded for forward-compatibility with a change-oriented
/// back-end (spec.md §9, left as an open, unimplemented target).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VcsKind {
    Git,
    Jj,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub task_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub test_commands: Vec<TestCommand>,
    pub branch_or_change: String,
    pub parent_branch_or_change: String,
    pub parent_task: Option<String>,
    pub children: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub vcs: VcsKind,
    pub spec_id: String,
    pub source_ref: String,
    pub base_ref: String,
    pub created_at: DateTime<Utc>,
    pub tasks: HashMap<String, TaskAssignment>,
}

impl Manifest {
    /// Generate the manifest from `tree` and `source_ref` in one topological
    /// pass: each task's `parent_branch_or_change` is read off its
    /// already-processed parent (or the base for roots), so parents are
    /// always assigned before children (spec.md §3's creation-order
    /// invariant).
    pub fn generate(tree: &TaskTree, spec_id: &str, source_ref: &str, vcs: VcsKind) -> Result<Self> {
        let base = format!("{source_ref}_a");
        let mut tasks = HashMap::new();

        // Topological pass over the tree itself (not leaves only): a
        // breadth-first walk from roots guarantees parents are visited
        // before children.
        let mut queue: Vec<String> = tree.roots.clone();
        let mut index = 0;
        while index < queue.len() {
            let id = queue[index].clone();
            index += 1;

            let node = tree.get(&id).map_err(|_| ManifestError::UnknownId(id.clone()))?;
            let parent_branch = match &node.parent {
                Some(parent_id) => tasks
                    .get(parent_id)
                    .map(|a: &TaskAssignment| a.branch_or_change.clone())
                    .ok_or_else(|| ManifestError::UnknownId(parent_id.clone()))?,
                None => base.clone(),
            };

            let branch = format!("{parent_branch}_{id}");
            tasks.insert(
                id.clone(),
                TaskAssignment {
                    task_id: id.clone(),
                    description: node.description.clone(),
                    test_commands: node.test_commands.clone(),
                    branch_or_change: branch,
                    parent_branch_or_change: parent_branch,
                    parent_task: node.parent.clone(),
                    children: node.children.clone(),
                    depends_on: node.depends_on.clone(),
                },
            );

            queue.extend(node.children.iter().cloned());
        }

        Ok(Self {
            vcs,
            spec_id: spec_id.to_string(),
            source_ref: source_ref.to_string(),
            base_ref: base,
            created_at: Utc::now(),
            tasks,
        })
    }

    pub fn assignment(&self, task_id: &str) -> Result<&TaskAssignment> {
        self.tasks.get(task_id).ok_or_else(|| ManifestError::UnknownId(task_id.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, json)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Discover the manifest file for `spec_id`: the engine's dedicated
    /// environment variable first, then the well-known paths spec.md §6
    /// lists, in order.
    pub fn discover_path(home: &Path, git_root: Option<&Path>, spec_id: &str) -> PathBuf {
        if let Ok(explicit) = std::env::var("ARBORIST_MANIFEST") {
            return PathBuf::from(explicit);
        }
        let dagu_path = home.join("dagu").join("dags").join(format!("{spec_id}.json"));
        if dagu_path.exists() {
            return dagu_path;
        }
        let home_path = home.join(format!("{spec_id}.json"));
        if home_path.exists() {
            return home_path;
        }
        if let Some(root) = git_root {
            let repo_path = root.join("specs").join(spec_id).join("manifest.json");
            if repo_path.exists() {
                return repo_path;
            }
        }
        home_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{TaskNode, TaskTree};

    fn node(id: &str, parent: Option<&str>, children: &[&str], depends_on: &[&str]) -> TaskNode {
        TaskNode {
            id: id.to_string(),
            name: id.to_string(),
            description: String::new(),
            parent: parent.map(str::to_string),
            children: children.iter().map(|s| s.to_string()).collect(),
            depends_on: depends_on.iter().map(|s| s.to_string()).collect(),
            test_commands: Vec::new(),
        }
    }

    fn sample_tree() -> TaskTree {
        TaskTree::new(vec![
            node("phase1", None, &["T001", "T004"], &[]),
            node("T001", Some("phase1"), &[], &[]),
            node("T004", Some("phase1"), &[], &["T001"]),
        ])
        .unwrap()
    }

    #[test]
    fn branch_naming_follows_underscore_join_rule() {
        let manifest = Manifest::generate(&sample_tree(), "hello", "main", VcsKind::Git).unwrap();
        let t001 = manifest.assignment("T001").unwrap();
        assert_eq!(t001.branch_or_change, "main_a_T001");
        let t004 = manifest.assignment("T004").unwrap();
        assert_eq!(t004.branch_or_change, "main_a_T001_T004");
        assert_eq!(t004.parent_branch_or_change, "main_a_T001");
    }

    #[test]
    fn generation_is_deterministic() {
        let tree = sample_tree();
        let a = Manifest::generate(&tree, "hello", "main", VcsKind::Git).unwrap();
        let b = Manifest::generate(&tree, "hello", "main", VcsKind::Git).unwrap();
        let mut ids_a: Vec<_> = a.tasks.values().map(|t| t.branch_or_change.clone()).collect();
        let mut ids_b: Vec<_> = b.tasks.values().map(|t| t.branch_or_change.clone()).collect();
        ids_a.sort();
        ids_b.sort();
        assert_eq!(ids_a, ids_b);
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.json");
        let manifest = Manifest::generate(&sample_tree(), "hello", "main", VcsKind::Git).unwrap();
        manifest.save(&path).unwrap();
        let reloaded = Manifest::load(&path).unwrap();
        assert_eq!(reloaded.spec_id, "hello");
        assert_eq!(reloaded.tasks.len(), manifest.tasks.len());
    }

    #[test]
    fn discover_path_prefers_env_var() {
        let dir = tempfile::tempdir().unwrap();
        unsafe {
            std::env::set_var("ARBORIST_MANIFEST", "/tmp/explicit-manifest.json");
        }
        let path = Manifest::discover_path(dir.path(), None, "hello");
        assert_eq!(path, PathBuf::from("/tmp/explicit-manifest.json"));
        unsafe {
            std::env::remove_var("ARBORIST_MANIFEST");
        }
    }
}
