//! Process Runner: a uniform wrapper around external executables with
//! timeout, byte-accurate capture, and an optional container-exec prefix.
//! Grounded on `tools/builtin/run_command.rs`'s timeout/output-capture
//! idiom, generalized from a single hardcoded `sh -c` tool into a reusable
//! argv-based runner and extended with process-group kill semantics and
//! devcontainer prefixing per spec.md §4.1.

mod container;

pub use container::{ContainerError, ContainerRunner, ContainerState};

use std::collections::HashMap;
use std::os::unix::process::CommandExt as _;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

use crate::constants::KILL_GRACE;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("executable not found or not runnable: {0}")]
    SpawnError(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// What to feed the child's stdin.
#[derive(Debug, Clone, Default)]
pub enum Stdin {
    #[default]
    None,
    Pipe(Vec<u8>),
    Devnull,
}

/// One external-command invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
    pub env_overlay: HashMap<String, String>,
    pub timeout: Option<Duration>,
    pub stdin: Stdin,
}

impl Invocation {
    pub fn new(argv: impl IntoIterator<Item = impl Into<String>>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            argv: argv.into_iter().map(Into::into).collect(),
            cwd: cwd.into(),
            env_overlay: HashMap::new(),
            timeout: None,
            stdin: Stdin::default(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overlay.insert(key.into(), value.into());
        self
    }

    pub fn with_stdin(mut self, stdin: Stdin) -> Self {
        self.stdin = stdin;
        self
    }
}

/// Outcome of running one `Invocation`.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub timed_out: bool,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Executes invocations in their own process group and enforces timeouts.
/// Never interprets stdout; callers parse whatever structured fragments the
/// child printed.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    pub async fn run(&self, inv: Invocation) -> Result<ProcessOutput, ProcessError> {
        let Some((program, args)) = inv.argv.split_first() else {
            return Err(ProcessError::SpawnError("empty argv".to_string()));
        };

        debug!(program, ?args, cwd = %inv.cwd.display(), "ProcessRunner::run: spawning");

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .current_dir(&inv.cwd)
            .envs(&inv.env_overlay)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        cmd.stdin(match inv.stdin {
            Stdin::None => Stdio::inherit(),
            Stdin::Pipe(_) => Stdio::piped(),
            Stdin::Devnull => Stdio::null(),
        });

        // Launch in its own process group so a timeout kills the whole
        // subtree, not just the direct child.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                Ok(())
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound || e.raw_os_error() == Some(libc_enotdir()) => {
                return Err(ProcessError::SpawnError(format!("{program}: {e}")));
            }
            Err(e) => return Err(ProcessError::Io(e)),
        };

        if let Stdin::Pipe(bytes) = &inv.stdin {
            use tokio::io::AsyncWriteExt;
            if let Some(mut stdin) = child.stdin.take() {
                let _ = stdin.write_all(bytes).await;
            }
        }

        let pid = child.id().map(|p| p as i32);

        let wait = child.wait_with_output();
        let (output, timed_out) = match inv.timeout {
            Some(duration) => match tokio::time::timeout(duration, wait).await {
                Ok(result) => (result?, false),
                Err(_) => {
                    warn!(program, ?duration, "ProcessRunner::run: timed out, killing process group");
                    if let Some(pid) = pid {
                        terminate_group(pid).await;
                    }
                    return Ok(ProcessOutput {
                        exit_code: None,
                        stdout: Vec::new(),
                        stderr: Vec::new(),
                        timed_out: true,
                    });
                }
            },
            None => (wait.await?, false),
        };

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
            timed_out,
        })
    }

    /// Send SIGTERM to the process group, wait a grace period, then SIGKILL.
    /// Used directly by the scheduler's cancellation path.
    pub async fn cancel(&self, pid: i32) {
        terminate_group(pid).await;
    }
}

async fn terminate_group(pid: i32) {
    let pgid = Pid::from_raw(pid);
    let _ = killpg(pgid, Signal::SIGTERM);
    tokio::time::sleep(KILL_GRACE).await;
    let _ = killpg(pgid, Signal::SIGKILL);
}

fn libc_enotdir() -> i32 {
    // ENOTDIR surfaces on some platforms when the program path component
    // isn't a directory; treated the same as "not found" for spawn purposes.
    20
}

/// True iff `.devcontainer/devcontainer.json` exists directly under
/// `workspace`, with no upward search (spec.md §4.1 / the original's
/// `devcontainer.py`).
pub fn has_devcontainer(workspace: &Path) -> bool {
    workspace.join(crate::constants::DEVCONTAINER_MANIFEST).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runs_and_captures_stdout() {
        let runner = ProcessRunner::new();
        let inv = Invocation::new(["echo", "hello"], std::env::temp_dir());
        let out = runner.run(inv).await.unwrap();
        assert!(out.success());
        assert_eq!(out.stdout_string().trim(), "hello");
    }

    #[tokio::test]
    async fn nonzero_exit_is_not_spawn_error() {
        let runner = ProcessRunner::new();
        let inv = Invocation::new(["false"], std::env::temp_dir());
        let out = runner.run(inv).await.unwrap();
        assert!(!out.success());
        assert!(!out.timed_out);
        assert_eq!(out.exit_code, Some(1));
    }

    #[tokio::test]
    async fn missing_binary_is_spawn_error() {
        let runner = ProcessRunner::new();
        let inv = Invocation::new(["definitely-not-a-real-binary-xyz"], std::env::temp_dir());
        let err = runner.run(inv).await.unwrap_err();
        assert!(matches!(err, ProcessError::SpawnError(_)));
    }

    #[tokio::test]
    async fn timeout_is_reported() {
        let runner = ProcessRunner::new();
        let inv = Invocation::new(["sleep", "5"], std::env::temp_dir()).with_timeout(Duration::from_millis(50));
        let out = runner.run(inv).await.unwrap();
        assert!(out.timed_out);
    }

    #[test]
    fn devcontainer_detection_is_root_only() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_devcontainer(dir.path()));
        std::fs::create_dir_all(dir.path().join(".devcontainer")).unwrap();
        std::fs::write(dir.path().join(".devcontainer/devcontainer.json"), "{}").unwrap();
        assert!(has_devcontainer(dir.path()));
    }
}
