//! Wire contracts between the kernel and the agents
//!
//! The four calls (ExecuteCommand, ListCommands, ReloadConfig, HealthCheck)
//! travel as JSON over HTTP. Routes and header names live here so both
//! sides agree on them.

use serde::{Deserialize, Serialize};

use crate::command::ExecutionResult;

/// PIN supplied by the caller
pub const PIN_HEADER: &str = "x-pin";
/// Remaining deadline propagated by the kernel, in milliseconds
pub const DEADLINE_HEADER: &str = "x-request-timeout-ms";
/// Correlation id set by the kernel on every forwarded call
pub const REQUEST_ID_HEADER: &str = "x-request-id";

pub const HEALTH_PATH: &str = "/api/v1/health";
pub const COMMANDS_PATH: &str = "/api/v1/commands";
pub const HOMEPAGE_PATH: &str = "/api/v1/commands/homepage";
pub const RELOAD_PATH: &str = "/api/v1/reload";

/// Agent route for ExecuteCommand; clients push the id as one encoded
/// path segment after `COMMANDS_PATH`, then `EXECUTE_SEGMENT`
pub const EXECUTE_ROUTE: &str = "/api/v1/commands/{id}/execute";
pub const EXECUTE_SEGMENT: &str = "execute";

/// Health status values reported by an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServingStatus {
    Serving,
    NotServing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecuteCommandRequest {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

pub type ExecuteCommandResponse = ExecutionResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSummary {
    pub id: String,
    pub description: String,
    pub platform_supported: bool,
    pub platform_command: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListCommandsResponse {
    pub commands: Vec<CommandSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadConfigResponse {
    pub success: bool,
    pub message: String,
    pub commands_loaded: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub status: ServingStatus,
    pub version: String,
    pub uptime_seconds: u64,
    #[serde(default)]
    pub hostname: Option<String>,
}

impl HealthCheckResponse {
    pub fn is_serving(&self) -> bool {
        self.status == ServingStatus::Serving
    }
}
