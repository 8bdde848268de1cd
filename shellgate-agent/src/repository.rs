//! Command definition repository
//!
//! The agent only reads definitions; where they come from is behind the
//! `CommandRepository` trait. The bundled implementation reads a YAML file
//! and swaps its in-memory set atomically on reload, so a broken file on
//! reload leaves the previous definitions in place.
//!
//! File format:
//! ```yaml
//! commands:
//!   - id: echo_test
//!     description: Echo a greeting
//!     platforms:
//!       all: echo hello
//! ```

use parking_lot::RwLock;
use serde::Deserialize;
use shellgate_shared::{is_valid_command_id, CommandDefinition, ErrorKind};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid command file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("duplicate command id: {0}")]
    DuplicateId(String),
    #[error("invalid command id {0:?}: use letters, digits, '_', '-' or '.'")]
    InvalidId(String),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Internal
    }
}

/// Read-only source of command definitions
pub trait CommandRepository: Send + Sync {
    fn get(&self, id: &str) -> Option<CommandDefinition>;
    fn list(&self) -> Vec<CommandDefinition>;
    fn by_category(&self, category: &str) -> Vec<CommandDefinition>;
    /// Subset flagged for the homepage
    fn homepage(&self) -> Vec<CommandDefinition>;
    /// Re-read the backing store; returns the number of definitions loaded
    fn reload(&self) -> Result<usize, RepositoryError>;
}

#[derive(Debug, Deserialize)]
struct CommandFile {
    #[serde(default)]
    commands: Vec<CommandDefinition>,
}

/// YAML-file backed repository
pub struct YamlCommandRepository {
    path: PathBuf,
    commands: RwLock<Vec<CommandDefinition>>,
}

impl YamlCommandRepository {
    /// Load the file; failure here is fatal for the agent
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RepositoryError> {
        let path = path.as_ref().to_path_buf();
        let commands = read_commands(&path)?;
        info!("Loaded {} commands from {}", commands.len(), path.display());
        Ok(Self {
            path,
            commands: RwLock::new(commands),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CommandRepository for YamlCommandRepository {
    fn get(&self, id: &str) -> Option<CommandDefinition> {
        self.commands.read().iter().find(|c| c.id == id).cloned()
    }

    fn list(&self) -> Vec<CommandDefinition> {
        self.commands.read().clone()
    }

    fn by_category(&self, category: &str) -> Vec<CommandDefinition> {
        self.commands
            .read()
            .iter()
            .filter(|c| c.category.as_deref() == Some(category))
            .cloned()
            .collect()
    }

    fn homepage(&self) -> Vec<CommandDefinition> {
        self.commands.read().iter().filter(|c| c.homepage).cloned().collect()
    }

    fn reload(&self) -> Result<usize, RepositoryError> {
        let fresh = read_commands(&self.path)?;
        let count = fresh.len();
        *self.commands.write() = fresh;
        info!("Reloaded {} commands from {}", count, self.path.display());
        Ok(count)
    }
}

fn read_commands(path: &Path) -> Result<Vec<CommandDefinition>, RepositoryError> {
    let content = std::fs::read_to_string(path).map_err(|source| RepositoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(Vec::new());
    }

    let file: CommandFile = serde_yaml::from_str(&content)?;
    let mut seen = HashSet::new();
    for command in &file.commands {
        if !is_valid_command_id(&command.id) {
            return Err(RepositoryError::InvalidId(command.id.clone()));
        }
        if !seen.insert(command.id.as_str()) {
            return Err(RepositoryError::DuplicateId(command.id.clone()));
        }
    }
    Ok(file.commands)
}
