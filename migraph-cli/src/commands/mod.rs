//! CLI command implementations.

pub mod migration;
pub mod version;

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use migraph_migrate::{Git, MigrationFileManager, RevisionLoader};

use crate::config::{Config, MIGRATIONS_DIR, SchemaConfig};

/// State shared by every command.
pub struct Context {
    /// Loaded configuration
    pub config: Config,
    /// Project root; schema directories are relative to it
    pub root: PathBuf,
    /// Cancelled on Ctrl-C
    pub cancel: CancellationToken,
}

impl Context {
    /// Create a context.
    pub fn new(config: Config, root: PathBuf, cancel: CancellationToken) -> Self {
        Self {
            config,
            root,
            cancel,
        }
    }

    /// File manager for a schema's working-tree directory.
    pub fn files(&self, schema: &SchemaConfig) -> MigrationFileManager {
        MigrationFileManager::new(self.root.join(&schema.directory))
    }

    /// Loader for every configured schema, at any revision.
    pub fn loader(&self) -> RevisionLoader<Git> {
        self.config.schemas.iter().fold(
            RevisionLoader::new(Git::new(&self.root), MIGRATIONS_DIR),
            |loader, schema| loader.with_schema_dir(&schema.name, &schema.directory),
        )
    }
}
