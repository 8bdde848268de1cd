//! Command definitions and execution results
//!
//! A `CommandDefinition` maps platform names (`linux`, `windows`, `macos`,
//! or the `all` fallback) to either one shell string or an ordered list of
//! steps. Definitions come from the agent's command repository and are
//! read-only to the execution engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Platform key used when no platform-specific entry exists
pub const ALL_PLATFORMS: &str = "all";

/// Default command timeout when a definition omits one
pub const DEFAULT_COMMAND_TIMEOUT_MS: u64 = 30_000;

/// Longest accepted command id
pub const MAX_COMMAND_ID_LEN: usize = 128;

/// Command ids travel as a single URL path segment: ASCII letters, digits,
/// `_`, `-` and `.`, but never `.` or `..` alone.
pub fn is_valid_command_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_COMMAND_ID_LEN
        && id != "."
        && id != ".."
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

/// A named, platform-keyed description of what to run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
    /// Shown in the homepage subset
    #[serde(default)]
    pub homepage: bool,
    pub platforms: HashMap<String, PlatformCommand>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub security: SecurityFlags,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_MS
}

/// Per-command security flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityFlags {
    #[serde(default = "default_true")]
    pub requires_pin: bool,
    /// Allowed even when not listed in the policy whitelist
    #[serde(default)]
    pub whitelisted: bool,
    #[serde(default)]
    pub admin_only: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SecurityFlags {
    fn default() -> Self {
        Self {
            requires_pin: true,
            whitelisted: false,
            admin_only: false,
        }
    }
}

/// What a platform entry resolves to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PlatformCommand {
    Single(String),
    Sequence(Vec<CommandStep>),
}

impl PlatformCommand {
    /// Every shell string this entry would run, in order
    pub fn shell_commands(&self) -> Vec<&str> {
        match self {
            PlatformCommand::Single(cmd) => vec![cmd.as_str()],
            PlatformCommand::Sequence(steps) => steps
                .iter()
                .filter_map(|step| match step {
                    CommandStep::Shell { command } => Some(command.as_str()),
                    _ => None,
                })
                .collect(),
        }
    }

    /// Human-readable form used by ListCommands
    pub fn display(&self) -> String {
        match self {
            PlatformCommand::Single(cmd) => cmd.clone(),
            PlatformCommand::Sequence(steps) => steps
                .iter()
                .map(CommandStep::display)
                .collect::<Vec<_>>()
                .join(" ; "),
        }
    }
}

/// One step of a command sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandStep {
    Shell {
        command: String,
    },
    Delay {
        #[serde(alias = "duration")]
        duration_ms: u64,
    },
    /// Any step type this agent does not know; aborts a sequence
    #[serde(other)]
    Unsupported,
}

impl CommandStep {
    pub fn kind(&self) -> &'static str {
        match self {
            CommandStep::Shell { .. } => "shell",
            CommandStep::Delay { .. } => "delay",
            CommandStep::Unsupported => "unsupported",
        }
    }

    fn display(&self) -> String {
        match self {
            CommandStep::Shell { command } => command.clone(),
            CommandStep::Delay { duration_ms } => format!("<delay {}ms>", duration_ms),
            CommandStep::Unsupported => "<unsupported>".to_string(),
        }
    }
}

/// Outcome of running a command or a step sequence
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: i32,
    pub duration_ms: u64,
    /// 1-based number of the step that aborted a sequence
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step: Option<usize>,
}
