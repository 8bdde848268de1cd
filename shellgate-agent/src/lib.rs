//! Shellgate agent
//!
//! Runs on each managed device and serves the command API consumed by the
//! kernel: command definitions come from a YAML repository, every call goes
//! through the local security gate, and executions are bounded by a deadline.

pub mod config;
pub mod execution;
pub mod http;
pub mod repository;
pub mod service;

pub use config::AgentConfig;
pub use execution::{ExecutionEngine, ExecutionError};
pub use repository::{CommandRepository, RepositoryError, YamlCommandRepository};
pub use service::{AgentError, AgentService, CallContext};
