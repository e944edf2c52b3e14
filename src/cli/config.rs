use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

use crate::engine::executor::{ExecutorConfig, MAX_CONCURRENT_ACTIVITIES_ENV};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "replayflow.yaml";

/// Configuration loaded from `replayflow.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct ReplayflowConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub store_dir: Option<String>,
    /// Path segment states are served under (default `workflows`).
    pub collection: Option<String>,
    pub auth_key: Option<String>,
    pub max_body: Option<usize>,
    /// Only read through [`ReplayflowConfig::executor_config`].
    pub max_concurrent_activities: Option<usize>,
}

impl ReplayflowConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `replayflow.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        Self::parse(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))
    }

    pub fn parse(contents: &str) -> Result<Self> {
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yml::from_str(contents)?)
    }

    /// Executor settings for applications that embed an `Executor` next to
    /// the served store. The environment wins over the file.
    ///
    /// The `serve` command itself never runs workflows.
    pub fn executor_config(&self) -> ExecutorConfig {
        let mut config = ExecutorConfig::from_env();
        if std::env::var_os(MAX_CONCURRENT_ACTIVITIES_ENV).is_none()
            && let Some(n) = self.max_concurrent_activities.filter(|n| *n > 0)
        {
            config.max_concurrent_activities = n;
        }
        config
    }
}
