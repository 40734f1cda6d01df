//! CLI error types and result alias.

use miette::Diagnostic;
use thiserror::Error;

use migraph_migrate::{ErrorKind, MigrationError};

/// Result type alias for CLI operations
pub type CliResult<T> = Result<T, CliError>;

/// CLI error types
#[derive(Error, Debug, Diagnostic)]
pub enum CliError {
    /// IO error
    #[error("IO error: {0}")]
    #[diagnostic(code(migraph::io))]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    #[diagnostic(code(migraph::config))]
    Config(String),

    /// Validation error
    #[error("Validation error: {0}")]
    #[diagnostic(code(migraph::validation))]
    Validation(String),

    /// Migration error
    #[error("{message}")]
    #[diagnostic(code(migraph::migration))]
    Migration {
        /// Rendered engine error
        message: String,
        /// Remediation hint
        #[help]
        help: Option<String>,
        /// Steps that completed before a failed step
        completed: Vec<String>,
    },

    /// Database error
    #[error("Database error: {0}")]
    #[diagnostic(code(migraph::database))]
    Database(String),

    /// Command error
    #[error("Command error: {0}")]
    #[diagnostic(code(migraph::command))]
    Command(String),
}

impl CliError {
    /// Remediation hint, if any
    pub fn hint(&self) -> Option<&str> {
        match self {
            CliError::Migration { help, .. } => help.as_deref(),
            CliError::Config(_) => Some("check migraph.toml or pass --config"),
            _ => None,
        }
    }

    /// Steps that completed before the failure
    pub fn completed_steps(&self) -> &[String] {
        match self {
            CliError::Migration { completed, .. } => completed,
            _ => &[],
        }
    }
}

impl From<MigrationError> for CliError {
    fn from(err: MigrationError) -> Self {
        match err {
            MigrationError::Database(message) => CliError::Database(message),
            MigrationError::Io(e) => CliError::Io(e),
            err => {
                let help = err.help().map(str::to_string).or_else(|| match err.kind() {
                    ErrorKind::Validation => Some("see `migraph migration --help`".to_string()),
                    _ => None,
                });
                let completed = match &err {
                    MigrationError::Execution {
                        completed_steps, ..
                    } => completed_steps.clone(),
                    _ => Vec::new(),
                };
                CliError::Migration {
                    message: err.to_string(),
                    help,
                    completed,
                }
            }
        }
    }
}

impl From<toml::de::Error> for CliError {
    fn from(err: toml::de::Error) -> Self {
        CliError::Config(format!("Failed to parse TOML: {}", err))
    }
}

impl From<serde_json::Error> for CliError {
    fn from(err: serde_json::Error) -> Self {
        CliError::Command(format!("Failed to render JSON: {}", err))
    }
}
