//! XDG-aware home-directory resolution for engine state (manifest cache,
//! run-capture store). Grounded on the original implementation's
//! `home.py`: `ARBORIST_HOME` wins outright, otherwise fall back to the
//! platform's local-share data directory.

use std::path::PathBuf;

/// Resolve the engine's state directory.
pub fn arborist_home() -> PathBuf {
    if let Ok(home) = std::env::var("ARBORIST_HOME") {
        return PathBuf::from(home);
    }
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("arborist")
}

/// Directory holding per-run capture directories for `spec_id`.
pub fn runs_dir(spec_id: &str) -> PathBuf {
    arborist_home().join("runs").join(spec_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn explicit_env_wins() {
        // SAFETY: tests run single-threaded per module here, and this is
        // restored before the function returns.
        unsafe { env::set_var("ARBORIST_HOME", "/tmp/explicit-arborist-home") };
        assert_eq!(arborist_home(), PathBuf::from("/tmp/explicit-arborist-home"));
        unsafe { env::remove_var("ARBORIST_HOME") };
    }
}
