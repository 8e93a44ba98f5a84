//! Central constants shared across the engine, mirroring the original
//! Python implementation's `constants.py` rather than scattering magic
//! strings through every module that needs the commit-trailer prefix.

/// Prefix shared by every commit trailer the engine writes or reads.
pub const TRAILER_PREFIX: &str = "Arborist";

/// Separator between formatted commit blocks in `log_since` output.
pub const COMMIT_SEP: &str = "---COMMIT_SEP---";

/// Default `max_ai_tasks` (AI-queue admission bound).
pub const DEFAULT_MAX_AI_TASKS: usize = 2;

/// Default `max_retries` before a task transitions to `failed`.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Grace period between SIGTERM and SIGKILL when a process group is killed
/// on timeout or cancellation.
pub const KILL_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// Name of the devcontainer manifest the Process Runner looks for, checked
/// only at the workspace root (no upward search).
pub const DEVCONTAINER_MANIFEST: &str = ".devcontainer/devcontainer.json";

/// Subject line for the sentinel commit fencing restart scope.
pub fn run_start_subject(spec_id: &str) -> String {
    format!("task({spec_id}@@run-start): run started")
}

/// Fixed-string grep prefix identifying every commit belonging to `spec_id`.
pub fn spec_scope_prefix(spec_id: &str) -> String {
    format!("task({spec_id}@")
}

/// Canonical commit subject for one pipeline step.
pub fn step_subject(spec_id: &str, task_id: &str, step: &str, subject: &str) -> String {
    format!("task({spec_id}@{task_id}@{step}): {subject}")
}

/// Full commit message for one pipeline step: canonical subject, a blank
/// line, then the trailer block every step commit carries (spec.md
/// §4.2/§6). `trailers` supplies step-specific keys (`Step`/`Result`/`Retry`
/// plus whatever else the step records) in the order they should appear;
/// each key is prefixed with [`TRAILER_PREFIX`].
pub fn step_commit_message(spec_id: &str, task_id: &str, step: &str, subject: &str, trailers: &[(&str, String)]) -> String {
    let mut message = step_subject(spec_id, task_id, step, subject);
    message.push_str("\n\n");
    for (i, (key, value)) in trailers.iter().enumerate() {
        if i > 0 {
            message.push('\n');
        }
        message.push_str(&format!("{TRAILER_PREFIX}-{key}: {value}"));
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subjects_are_well_formed() {
        assert_eq!(run_start_subject("hello"), "task(hello@@run-start): run started");
        assert_eq!(spec_scope_prefix("hello"), "task(hello@");
        assert_eq!(
            step_subject("hello", "T001", "complete", "done"),
            "task(hello@T001@complete): done"
        );
    }

    #[test]
    fn commit_message_carries_trailer_block() {
        let message = step_commit_message(
            "hello",
            "T001",
            "complete",
            "done",
            &[("Step", "complete".to_string()), ("Result", "pass".to_string()), ("Retry", "0".to_string())],
        );
        assert_eq!(
            message,
            "task(hello@T001@complete): done\n\nArborist-Step: complete\nArborist-Result: pass\nArborist-Retry: 0"
        );
    }
}
