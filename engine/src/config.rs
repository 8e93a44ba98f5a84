//! Engine configuration types and loading.

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::constants::{DEFAULT_MAX_AI_TASKS, DEFAULT_MAX_RETRIES};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub concurrency: ConcurrencyConfig,
    pub vcs: VcsConfig,
    pub container: ContainerConfig,
}

impl Config {
    /// Load configuration with the same fallback chain as the teacher's
    /// `.taskdaemon.yml`/user-config lookup: explicit path, project-local
    /// file, user config directory, then defaults.
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".arborist.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => tracing::warn!("Failed to load config from {}: {}", local_config.display(), e),
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("arborist").join("arborist.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => tracing::warn!("Failed to load config from {}: {}", user_config.display(), e),
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }
}

/// Concurrency limits governing the scheduler's AI admission queue and the
/// per-task retry loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    #[serde(rename = "max-ai-tasks")]
    pub max_ai_tasks: usize,
    #[serde(rename = "max-retries")]
    pub max_retries: u32,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            max_ai_tasks: DEFAULT_MAX_AI_TASKS,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

/// VCS-level defaults: trailer prefix and base ref for scans.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VcsConfig {
    #[serde(rename = "trailer-prefix")]
    pub trailer_prefix: String,
    #[serde(rename = "base-ref")]
    pub base_ref: String,
}

impl Default for VcsConfig {
    fn default() -> Self {
        Self {
            trailer_prefix: crate::constants::TRAILER_PREFIX.to_string(),
            base_ref: "main".to_string(),
        }
    }
}

/// Container mode for the Process Runner's devcontainer prefixing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerMode {
    Disabled,
    #[default]
    Auto,
    Enabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub mode: ContainerMode,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            mode: ContainerMode::Auto,
        }
    }
}

/// Process-wide environment resolved once at the CLI boundary and threaded
/// by parameter thereafter (spec.md §9: no hidden process-wide singletons
/// inside the engine).
#[derive(Debug, Clone)]
pub struct Environment {
    pub config: Config,
    pub home: PathBuf,
    pub manifest_path: Option<PathBuf>,
    pub spec_id: String,
    pub source_ref: String,
}

impl Environment {
    pub fn from_env(config: Config, spec_id: impl Into<String>) -> Self {
        Self {
            home: crate::home::arborist_home(),
            manifest_path: std::env::var("ARBORIST_MANIFEST").ok().map(PathBuf::from),
            source_ref: std::env::var("ARBORIST_SOURCE_REV").unwrap_or_else(|_| config.vcs.base_ref.clone()),
            config,
            spec_id: spec_id.into(),
        }
    }

    /// Environment variables forwarded into a container: every variable
    /// whose name starts with the engine's prefix, per spec.md §4.1.
    pub fn container_env_overlay(&self) -> Vec<(String, String)> {
        std::env::vars().filter(|(k, _)| k.starts_with("ARBORIST_")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = Config::default();
        assert_eq!(cfg.concurrency.max_ai_tasks, 2);
        assert_eq!(cfg.concurrency.max_retries, 5);
        assert_eq!(cfg.container.mode, ContainerMode::Auto);
    }

    #[test]
    fn load_from_explicit_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.yml");
        std::fs::write(
            &path,
            "concurrency:\n  max-ai-tasks: 7\n  max-retries: 1\nvcs:\n  trailer-prefix: Foo\n  base-ref: trunk\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.concurrency.max_ai_tasks, 7);
        assert_eq!(cfg.vcs.trailer_prefix, "Foo");
        assert_eq!(cfg.vcs.base_ref, "trunk");
    }
}
