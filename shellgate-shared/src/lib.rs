//! Shellgate shared crate
//!
//! Pieces used on both sides of the kernel ↔ agent link:
//! - wire contracts for the four calls (execute, list, reload, health)
//! - the `CommandDefinition` model and `ExecutionResult`
//! - the `ErrorKind` taxonomy
//! - the `SecurityGate` (PIN, rate limiting, whitelist)

pub mod command;
pub mod contracts;
pub mod error;
pub mod security;

pub use command::{
    is_valid_command_id, CommandDefinition, CommandStep, ExecutionResult, PlatformCommand, SecurityFlags,
};
pub use error::{ErrorBody, ErrorKind};
pub use security::{SecurityError, SecurityGate, SecurityPolicy};
