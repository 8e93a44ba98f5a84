//! Devcontainer prefixing: transparently re-targets a command into a dev
//! container per spec.md §4.1. Grounded in the teacher's subprocess-wrapping
//! idiom (`tools/builtin/run_command.rs`), extended with the
//! `devcontainer exec` argv-prefix rule and an idempotent "ensure up" check.

use std::path::Path;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};

use super::{Invocation, ProcessRunner};
use crate::config::ContainerMode;

#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("container mode is `enabled` but no devcontainer is present at {0}")]
    Missing(String),
    #[error("failed to start container: {0}")]
    StartFailed(String),
    #[error("container started but health check failed: git not found inside")]
    HealthFailed,
}

/// Whether a given workspace's container is known to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    NotNeeded,
    Running,
}

/// Wraps invocations destined for a worktree with the devcontainer-exec
/// prefix, according to the configured `ContainerMode`.
pub struct ContainerRunner {
    runner: ProcessRunner,
    mode: ContainerMode,
}

impl ContainerRunner {
    pub fn new(runner: ProcessRunner, mode: ContainerMode) -> Self {
        Self { runner, mode }
    }

    fn should_wrap(&self, workspace: &Path) -> Result<bool, ContainerError> {
        match self.mode {
            ContainerMode::Disabled => Ok(false),
            ContainerMode::Enabled => {
                if !super::has_devcontainer(workspace) {
                    return Err(ContainerError::Missing(workspace.display().to_string()));
                }
                Ok(true)
            }
            ContainerMode::Auto => Ok(super::has_devcontainer(workspace)),
        }
    }

    /// Prefix `argv` with `devcontainer exec --workspace-folder ...
    /// --remote-env K=V ...` when the mode calls for it. Only the variables
    /// listed in `env_overlay` are forwarded — no ambient process
    /// environment leaks into the container.
    pub fn wrap(&self, mut inv: Invocation, workspace: &Path) -> Result<Invocation, ContainerError> {
        if !self.should_wrap(workspace)? {
            return Ok(inv);
        }

        let mut prefixed = vec![
            "devcontainer".to_string(),
            "exec".to_string(),
            "--workspace-folder".to_string(),
            workspace.display().to_string(),
        ];
        for (key, value) in &inv.env_overlay {
            prefixed.push("--remote-env".to_string());
            prefixed.push(format!("{key}={value}"));
        }
        prefixed.extend(inv.argv.drain(..));
        inv.argv = prefixed;
        Ok(inv)
    }

    /// Idempotently ensure a container is running for `workspace`: if
    /// already up, no-op; otherwise run `devcontainer up` with a long
    /// timeout and health-check that `git` exists inside.
    pub async fn ensure_up(&self, workspace: &Path) -> Result<ContainerState, ContainerError> {
        if !self.should_wrap(workspace)? {
            return Ok(ContainerState::NotNeeded);
        }

        if self.health_check(workspace).await {
            debug!(workspace = %workspace.display(), "ContainerRunner::ensure_up: already running");
            return Ok(ContainerState::Running);
        }

        let up = Invocation::new(
            ["devcontainer", "up", "--workspace-folder", &workspace.display().to_string()],
            workspace,
        )
        .with_timeout(Duration::from_secs(300));

        let output = self
            .runner
            .run(up)
            .await
            .map_err(|e| ContainerError::StartFailed(e.to_string()))?;
        if !output.success() {
            return Err(ContainerError::StartFailed(output.stderr_string()));
        }

        info!(workspace = %workspace.display(), "ContainerRunner::ensure_up: container started");

        if !self.health_check(workspace).await {
            return Err(ContainerError::HealthFailed);
        }

        Ok(ContainerState::Running)
    }

    async fn health_check(&self, workspace: &Path) -> bool {
        let inv = self
            .wrap(Invocation::new(["git", "--version"], workspace), workspace)
            .unwrap_or_else(|_| Invocation::new(["git", "--version"], workspace));
        matches!(self.runner.run(inv).await, Ok(output) if output.success())
    }
}
