//! Loading migration sets from the working tree or from a revision.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Component, Path, PathBuf};

use tokio_util::sync::CancellationToken;

use crate::definition::{Migration, MigrationId, parse_migration_name};
use crate::error::MigrateResult;
use crate::file::MigrationFileManager;
use crate::set::MigrationSet;
use crate::vcs::VersionControl;

/// Where to read migrations from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    /// Files currently on disk.
    WorkingTree,
    /// A commit, branch or tag.
    Ref(String),
}

impl Revision {
    /// A named revision.
    pub fn reference(name: impl Into<String>) -> Self {
        Self::Ref(name.into())
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Revision::WorkingTree => write!(f, "working tree"),
            Revision::Ref(name) => write!(f, "{}", name),
        }
    }
}

/// Produces the migration set of a schema at a revision.
#[async_trait::async_trait]
pub trait MigrationSetLoader: Send + Sync {
    /// Every migration entry of `schema` at `revision`, possibly with duplicate IDs.
    async fn list_at(
        &self,
        schema: &str,
        revision: &Revision,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<Migration>>;

    /// Migrations of `schema` with at least one file that differs between
    /// the revisions `from` and `to`.
    async fn changed_between(
        &self,
        schema: &str,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<Migration>>;

    /// The ID → migration map of `schema` at `revision`.
    async fn load_at(
        &self,
        schema: &str,
        revision: &Revision,
        cancel: &CancellationToken,
    ) -> MigrateResult<MigrationSet> {
        Ok(MigrationSet::from_migrations(
            self.list_at(schema, revision, cancel).await?,
        ))
    }
}

/// Loads schemas laid out as `<migrations_root>/<schema>/` inside a repository.
#[derive(Debug, Clone)]
pub struct RevisionLoader<V> {
    vcs: V,
    migrations_root: PathBuf,
    schema_dirs: BTreeMap<String, PathBuf>,
}

impl<V: VersionControl> RevisionLoader<V> {
    /// `migrations_root` is relative to the repository root.
    pub fn new(vcs: V, migrations_root: impl Into<PathBuf>) -> Self {
        Self {
            vcs,
            migrations_root: migrations_root.into(),
            schema_dirs: BTreeMap::new(),
        }
    }

    /// Keep `schema` in `dir` (relative to the repository root) instead of
    /// under the migrations root.
    pub fn with_schema_dir(mut self, schema: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        self.schema_dirs.insert(schema.into(), dir.into());
        self
    }

    /// Schema directory relative to the repository root.
    pub fn schema_path(&self, schema: &str) -> PathBuf {
        self.schema_dirs
            .get(schema)
            .cloned()
            .unwrap_or_else(|| self.migrations_root.join(schema))
    }

    /// Schema directory in the working tree.
    pub fn schema_dir(&self, schema: &str) -> PathBuf {
        self.vcs.root().join(self.schema_path(schema))
    }

    /// File manager for a schema in the working tree.
    pub fn file_manager(&self, schema: &str) -> MigrationFileManager {
        MigrationFileManager::new(self.schema_dir(schema))
    }

    /// Version control accessor.
    pub fn vcs(&self) -> &V {
        &self.vcs
    }
}

#[async_trait::async_trait]
impl<V: VersionControl> MigrationSetLoader for RevisionLoader<V> {
    async fn list_at(
        &self,
        schema: &str,
        revision: &Revision,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<Migration>> {
        match revision {
            Revision::WorkingTree => self.file_manager(schema).list_migrations().await,
            Revision::Ref(name) => {
                let schema_path = self.schema_path(schema);
                let files = self.vcs.list_files_at(name, &schema_path, cancel).await?;
                let migrations =
                    migrations_from_listing(&files, &schema_path, &self.schema_dir(schema));
                tracing::debug!(
                    schema,
                    revision = %name,
                    count = migrations.len(),
                    "Loaded migrations from revision"
                );
                Ok(migrations)
            }
        }
    }

    async fn changed_between(
        &self,
        schema: &str,
        from: &str,
        to: &str,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<Migration>> {
        let schema_path = self.schema_path(schema);
        let files = self.vcs.diff_names(from, to, &schema_path, cancel).await?;
        Ok(migrations_from_listing(
            &files,
            &schema_path,
            &self.schema_dir(schema),
        ))
    }
}

/// Parse repository-relative file paths into name-only migrations.
///
/// Only files nested inside a migration directory count; the resulting paths
/// point at `working_dir`.
fn migrations_from_listing(
    files: &[String],
    schema_path: &Path,
    working_dir: &Path,
) -> Vec<Migration> {
    let mut found: BTreeMap<(MigrationId, String), Migration> = BTreeMap::new();

    for file in files {
        let Ok(relative) = Path::new(file).strip_prefix(schema_path) else {
            continue;
        };
        let mut components = relative.components();
        let Some(Component::Normal(dir)) = components.next() else {
            continue;
        };
        if components.next().is_none() {
            continue;
        }
        let Some(dir) = dir.to_str() else {
            continue;
        };
        let Some((id, slug)) = parse_migration_name(dir) else {
            continue;
        };

        found.entry((id, slug.clone())).or_insert_with(|| {
            let mut migration = Migration::new(id, slug.as_str()).with_path(working_dir.join(dir));
            migration.name = slug;
            migration
        });
    }

    found.into_values().collect()
}
