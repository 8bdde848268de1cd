//! Agent configuration
//!
//! Handles:
//! - Listen address of the agent API
//! - Location of the command definitions file
//! - Security policy (PIN, whitelist, rate limit)
//! - Cross-platform config file location
//!
//! A missing file or a missing `[security]` table is fatal: the agent
//! refuses to start rather than run with an undefined policy.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use shellgate_shared::SecurityPolicy;
use std::path::{Path, PathBuf};

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "SHELLGATE_AGENT_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default = "default_commands_file")]
    pub commands_file: PathBuf,
    /// Upper bound applied to every execution deadline
    #[serde(default = "default_max_timeout_ms")]
    pub max_timeout_ms: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    pub security: SecurityPolicy,
}

fn default_listen() -> String {
    "0.0.0.0:50051".to_string()
}

fn default_commands_file() -> PathBuf {
    PathBuf::from("commands.yaml")
}

fn default_max_timeout_ms() -> u64 {
    300_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl AgentConfig {
    /// Load config from `SHELLGATE_AGENT_CONFIG` or the OS-specific location
    pub async fn load() -> Result<Self> {
        let path = match std::env::var(CONFIG_ENV) {
            Ok(p) if !p.is_empty() => PathBuf::from(p),
            _ => Self::config_file_path()?,
        };
        Self::load_from(&path).await
    }

    pub async fn load_from(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read agent config {}", path.display()))?;
        let mut config = Self::from_toml_str(&content)
            .with_context(|| format!("Invalid agent config {}", path.display()))?;

        // commands_file is relative to the config file, not the working dir
        if config.commands_file.is_relative() {
            if let Some(parent) = path.parent() {
                config.commands_file = parent.join(&config.commands_file);
            }
        }
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse agent config")
    }

    /// Get OS-specific config file path
    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;

        path.push("shellgate-agent");
        path.push("config.toml");
        Ok(path)
    }
}
