//! Error types for the migration engine.

use thiserror::Error;

use crate::definition::MigrationId;

/// Result type alias for migration operations.
pub type MigrateResult<T> = Result<T, MigrationError>;

/// Coarse classification of a [`MigrationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The inputs cannot be reconciled as given; the operator must act first.
    Validation,
    /// An external resource (binary, container, database) misbehaved.
    Resource,
    /// A plan step failed part way through execution.
    Execution,
}

/// Errors that can occur during migration operations.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// File system error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Database operation error.
    #[error("Database error: {0}")]
    Database(String),

    /// Invalid migration file or format.
    #[error("Invalid migration: {0}")]
    InvalidMigration(String),

    /// Metadata file could not be read or written.
    #[error("Invalid metadata in {path}: {message}")]
    Metadata {
        /// Path to the metadata file.
        path: String,
        /// Parser or serializer message.
        message: String,
    },

    /// Migration not found.
    #[error("Migration '{0}' not found")]
    NotFound(String),

    /// The migration graph is malformed.
    #[error("Invalid migration graph: {0}")]
    Graph(String),

    /// Migrations on the trunk are absent locally.
    #[error(
        "Schema '{schema}' is missing migrations {missing:?} from the main branch; rebase first"
    )]
    RebaseRequired {
        /// Schema name.
        schema: String,
        /// IDs defined on the main branch but not locally.
        missing: Vec<MigrationId>,
    },

    /// No single migration dominates the squash boundary.
    #[error("No common ancestor dominates migrations {0:?}; cannot squash this region")]
    NoDominator(Vec<MigrationId>),

    /// No schema changes detected (the executor's no-op sentinel).
    #[error("No schema changes detected")]
    NoChanges,

    /// A release version could not be turned into a squash target.
    #[error("Invalid release '{release}': {message}")]
    InvalidRelease {
        /// Release as given.
        release: String,
        /// What is wrong with it.
        message: String,
    },

    /// Version control command failed.
    #[error("Version control error: {0}")]
    Vcs(String),

    /// An external program ran and failed.
    #[error("Command `{program}` failed: {message}")]
    Command {
        /// Program name.
        program: String,
        /// Stderr or exit status.
        message: String,
    },

    /// An external program could not be started at all.
    #[error("Could not start `{program}`: {source}")]
    Spawn {
        /// Program name.
        program: String,
        /// Why the spawn failed.
        #[source]
        source: std::io::Error,
    },

    /// Disposable database error.
    #[error("Disposable database error: {0}")]
    ShadowDatabaseError(String),

    /// A plan step failed; earlier steps stay applied.
    #[error("Step '{step}' failed after {completed} completed step(s): {source}")]
    Execution {
        /// Description of the failed step.
        step: String,
        /// Number of steps that completed before the failure.
        completed: usize,
        /// Descriptions of the completed steps, in execution order.
        completed_steps: Vec<String>,
        /// Underlying failure.
        #[source]
        source: Box<MigrationError>,
    },

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// General migration error.
    #[error("Migration error: {0}")]
    Other(String),
}

impl MigrationError {
    /// Create a database error.
    pub fn database(msg: impl Into<String>) -> Self {
        Self::Database(msg.into())
    }

    /// Create a graph error.
    pub fn graph(msg: impl Into<String>) -> Self {
        Self::Graph(msg.into())
    }

    /// Create a version control error.
    pub fn vcs(msg: impl Into<String>) -> Self {
        Self::Vcs(msg.into())
    }

    /// Create a command error.
    pub fn command(program: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            program: program.into(),
            message: msg.into(),
        }
    }

    /// Create a spawn error.
    pub fn spawn(program: impl Into<String>, source: std::io::Error) -> Self {
        Self::Spawn {
            program: program.into(),
            source,
        }
    }

    /// Create an other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Create a disposable database error.
    pub fn shadow_database(msg: impl Into<String>) -> Self {
        Self::ShadowDatabaseError(msg.into())
    }

    /// Create a migration file error.
    pub fn migration_file(msg: impl Into<String>) -> Self {
        Self::InvalidMigration(msg.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidMigration(_)
            | Self::Metadata { .. }
            | Self::NotFound(_)
            | Self::Graph(_)
            | Self::RebaseRequired { .. }
            | Self::NoDominator(_)
            | Self::InvalidRelease { .. }
            | Self::NoChanges => ErrorKind::Validation,
            Self::Execution { .. } => ErrorKind::Execution,
            Self::Io(_)
            | Self::Database(_)
            | Self::Vcs(_)
            | Self::Command { .. }
            | Self::Spawn { .. }
            | Self::ShadowDatabaseError(_)
            | Self::Cancelled
            | Self::Other(_) => ErrorKind::Resource,
        }
    }

    /// Check if this is the executor's "nothing to do" sentinel.
    pub fn is_no_change(&self) -> bool {
        matches!(self, Self::NoChanges)
    }

    /// Check if this error is worth retrying while a database warms up.
    ///
    /// A program that ran and exited non-zero may succeed later; one that
    /// could not be started will not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ShadowDatabaseError(_) | Self::Database(_) | Self::Command { .. }
        )
    }

    /// Operator-facing remediation hint, when one exists.
    pub fn help(&self) -> Option<&'static str> {
        match self {
            Self::RebaseRequired { .. } => {
                Some("rebase your branch onto the main branch, then run fixup again")
            }
            Self::NoDominator(_) => {
                Some("pick an older release so that a single migration bounds the squashed region")
            }
            Self::Execution { .. } => Some(
                "completed steps were not reverted; re-run the command or reset the completed steps",
            ),
            Self::Spawn { .. } => Some("make sure the program is installed and on your PATH"),
            Self::InvalidRelease { .. } => Some("pass the current release as vMAJOR.MINOR.PATCH"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = MigrationError::NotFound("42".to_string());
        assert!(err.to_string().contains("42"));
    }

    #[test]
    fn test_rebase_required_display() {
        let err = MigrationError::RebaseRequired {
            schema: "frontend".to_string(),
            missing: vec![3, 4],
        };
        let msg = err.to_string();
        assert!(msg.contains("frontend"));
        assert!(msg.contains("[3, 4]"));
        assert!(msg.contains("rebase first"));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.help().is_some());
    }

    #[test]
    fn test_execution_error_keeps_cause() {
        let err = MigrationError::Execution {
            step: "roll back 2".to_string(),
            completed: 1,
            completed_steps: vec!["hide 2".to_string()],
            source: Box::new(MigrationError::database("connection refused")),
        };
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert!(err.to_string().contains("connection refused"));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_is_retryable() {
        assert!(MigrationError::shadow_database("not ready").is_retryable());
        assert!(!MigrationError::NoChanges.is_retryable());
        assert!(MigrationError::NoChanges.is_no_change());
        assert!(MigrationError::command("pg_isready", "no response").is_retryable());

        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        let err = MigrationError::spawn("pg_isready", missing);
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), ErrorKind::Resource);
        assert!(err.help().unwrap().contains("PATH"));
        assert!(!MigrationError::Cancelled.is_retryable());
    }
}
