//! Migration file management.

use std::path::{Path, PathBuf};

use crate::definition::{
    DOWN_FILE, METADATA_FILE, Metadata, Migration, MigrationId, UP_FILE, parse_migration_name,
};
use crate::error::{MigrateResult, MigrationError};
use crate::graph::MigrationGraph;

/// Migration directory reader/writer for one schema.
#[derive(Debug, Clone)]
pub struct MigrationFileManager {
    /// Directory where migrations are stored.
    migrations_dir: PathBuf,
}

impl MigrationFileManager {
    /// Create a new file manager.
    pub fn new(migrations_dir: impl Into<PathBuf>) -> Self {
        Self {
            migrations_dir: migrations_dir.into(),
        }
    }

    /// Get the migrations directory.
    pub fn migrations_dir(&self) -> &Path {
        &self.migrations_dir
    }

    /// Ensure the migrations directory exists.
    pub async fn ensure_dir(&self) -> MigrateResult<()> {
        tokio::fs::create_dir_all(&self.migrations_dir)
            .await
            .map_err(MigrationError::Io)?;
        Ok(())
    }

    /// List all migrations on disk, ordered by ID then name.
    ///
    /// Entries whose names do not parse as migrations (including hidden ones)
    /// are skipped. Two entries may share an ID.
    pub async fn list_migrations(&self) -> MigrateResult<Vec<Migration>> {
        let mut migrations = Vec::new();

        if !self.migrations_dir.exists() {
            return Ok(migrations);
        }

        let mut entries = tokio::fs::read_dir(&self.migrations_dir)
            .await
            .map_err(MigrationError::Io)?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(MigrationError::Io)? {
            let path = entry.path();
            if !entry.file_type().await.map_err(MigrationError::Io)?.is_dir() {
                continue;
            }
            let Some(dir_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if let Some((id, slug)) = parse_migration_name(dir_name) {
                paths.push((id, slug, path));
            }
        }

        paths.sort();

        for (id, slug, path) in paths {
            migrations.push(self.read_migration(id, slug, &path).await?);
        }

        Ok(migrations)
    }

    /// Load the migration graph currently on disk.
    pub async fn load_graph(&self) -> MigrateResult<MigrationGraph> {
        MigrationGraph::new(self.list_migrations().await?)
    }

    /// Read a migration from a directory.
    async fn read_migration(
        &self,
        id: MigrationId,
        slug: String,
        path: &Path,
    ) -> MigrateResult<Migration> {
        let up_query = read_optional(&path.join(UP_FILE)).await?;
        let down_query = read_optional(&path.join(DOWN_FILE)).await?;

        let metadata_path = path.join(METADATA_FILE);
        let metadata = match read_optional(&metadata_path).await? {
            content if content.is_empty() => Metadata::default(),
            content => Metadata::parse(&content, &metadata_path)?,
        };

        let title = if metadata.name.is_empty() {
            slug.clone()
        } else {
            metadata.name
        };

        Ok(Migration {
            id,
            name: slug,
            title,
            parents: Vec::new(),
            up_query,
            down_query,
            privileged: metadata.privileged,
            non_idempotent: metadata.non_idempotent,
            path: path.to_path_buf(),
        }
        .with_parents(metadata.parents))
    }

    /// Write a migration into `<migrations_dir>/<id>_<slug>/`.
    pub async fn write_migration(&self, migration: &Migration) -> MigrateResult<PathBuf> {
        self.write_migration_in(&self.migrations_dir, migration)
            .await
    }

    /// Write a migration into a directory under `parent`.
    pub async fn write_migration_in(
        &self,
        parent: &Path,
        migration: &Migration,
    ) -> MigrateResult<PathBuf> {
        let migration_dir = parent.join(migration.dir_name());

        tokio::fs::create_dir_all(&migration_dir)
            .await
            .map_err(MigrationError::Io)?;

        tokio::fs::write(migration_dir.join(UP_FILE), &migration.up_query)
            .await
            .map_err(MigrationError::Io)?;
        tokio::fs::write(migration_dir.join(DOWN_FILE), &migration.down_query)
            .await
            .map_err(MigrationError::Io)?;

        let metadata_path = migration_dir.join(METADATA_FILE);
        let metadata = migration.metadata().render(&metadata_path)?;
        tokio::fs::write(&metadata_path, metadata)
            .await
            .map_err(MigrationError::Io)?;

        Ok(migration_dir)
    }

    /// Create a new, empty migration after the current leaves.
    pub async fn create_migration(&self, name: &str) -> MigrateResult<Migration> {
        self.ensure_dir().await?;

        let graph = self.load_graph().await?;
        let id = graph.max_id().unwrap_or(0) + 1;
        let parents: Vec<_> = graph.leaves().iter().map(|m| m.id).collect();

        let mut migration = Migration::new(id, name)
            .with_parents(parents)
            .with_queries("-- Perform migration here.\n", "-- Undo the migration here.\n");
        if migration.name.is_empty() {
            return Err(MigrationError::migration_file(format!(
                "migration name '{}' has no usable characters",
                name
            )));
        }

        migration.path = self.write_migration(&migration).await?;
        Ok(migration)
    }

    /// Rename a migration directory, failing if the destination exists.
    pub async fn rename(&self, from: &Path, to: &Path) -> MigrateResult<()> {
        if tokio::fs::try_exists(to).await.map_err(MigrationError::Io)? {
            return Err(MigrationError::migration_file(format!(
                "cannot rename {} to {}: destination exists",
                from.display(),
                to.display()
            )));
        }
        tokio::fs::rename(from, to)
            .await
            .map_err(MigrationError::Io)
    }

    /// Move a migration to a new ID, keeping its slug. Returns the new path.
    pub async fn renumber(&self, migration: &Migration, new_id: MigrationId) -> MigrateResult<PathBuf> {
        let mut moved = migration.clone();
        moved.id = new_id;
        let to = migration.path.with_file_name(moved.dir_name());
        self.rename(&migration.path, &to).await?;
        Ok(to)
    }

    /// Rewrite the `parents` list in a migration's metadata.
    pub async fn rewrite_parents(&self, dir: &Path, parents: &[MigrationId]) -> MigrateResult<()> {
        let metadata_path = dir.join(METADATA_FILE);
        let mut metadata = match read_optional(&metadata_path).await? {
            content if content.is_empty() => Metadata::default(),
            content => Metadata::parse(&content, &metadata_path)?,
        };

        let mut parents = parents.to_vec();
        parents.sort_unstable();
        parents.dedup();
        if metadata.parents == parents {
            return Ok(());
        }
        metadata.parents = parents;

        let rendered = metadata.render(&metadata_path)?;
        tokio::fs::write(&metadata_path, rendered)
            .await
            .map_err(MigrationError::Io)
    }

    /// Delete a migration directory.
    pub async fn remove(&self, dir: &Path) -> MigrateResult<()> {
        tokio::fs::remove_dir_all(dir)
            .await
            .map_err(MigrationError::Io)
    }
}

async fn read_optional(path: &Path) -> MigrateResult<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Ok(content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(MigrationError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::hidden_path;

    async fn manager() -> (tempfile::TempDir, MigrationFileManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = MigrationFileManager::new(dir.path().join("frontend"));
        manager.ensure_dir().await.unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn test_write_then_list() {
        let (_dir, manager) = manager().await;
        let migration = Migration::new(1, "Create users")
            .with_queries("CREATE TABLE users();", "DROP TABLE users;");
        let path = manager.write_migration(&migration).await.unwrap();
        assert!(path.ends_with("1_create_users"));

        let listed = manager.list_migrations().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, 1);
        assert_eq!(listed[0].name, "create_users");
        assert_eq!(listed[0].title, "Create users");
        assert_eq!(listed[0].up_query, "CREATE TABLE users();");
        assert_eq!(listed[0].path, path);
    }

    #[tokio::test]
    async fn test_list_skips_hidden_and_stray_entries() {
        let (_dir, manager) = manager().await;
        let root = manager.migrations_dir().to_path_buf();
        manager
            .write_migration(&Migration::new(1, "init"))
            .await
            .unwrap();
        tokio::fs::create_dir_all(root.join("_2_hidden")).await.unwrap();
        tokio::fs::create_dir_all(root.join("notes")).await.unwrap();
        tokio::fs::write(root.join("3_file.sql"), "SELECT 1;").await.unwrap();

        let ids: Vec<_> = manager
            .list_migrations()
            .await
            .unwrap()
            .iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec![1]);
    }

    #[tokio::test]
    async fn test_create_migration_follows_leaves() {
        let (_dir, manager) = manager().await;
        let first = manager.create_migration("init").await.unwrap();
        let second = manager.create_migration("Add teams!").await.unwrap();

        assert_eq!(first.id, 1);
        assert!(first.parents.is_empty());
        assert_eq!(second.id, 2);
        assert_eq!(second.parents, vec![1]);
        assert!(second.path.ends_with("2_add_teams"));

        assert!(manager.create_migration("!!!").await.is_err());
    }

    #[tokio::test]
    async fn test_hide_renumber_and_rewrite_parents() {
        let (_dir, manager) = manager().await;
        manager
            .write_migration(&Migration::new(1, "init"))
            .await
            .unwrap();
        let path = manager
            .write_migration(&Migration::new(2, "users").with_parents([1]))
            .await
            .unwrap();

        let hidden = hidden_path(&path);
        manager.rename(&path, &hidden).await.unwrap();
        assert_eq!(manager.list_migrations().await.unwrap().len(), 1);
        manager.rename(&hidden, &path).await.unwrap();

        let listed = manager.list_migrations().await.unwrap();
        let moved = manager.renumber(&listed[1], 5).await.unwrap();
        assert!(moved.ends_with("5_users"));
        manager.rewrite_parents(&moved, &[1, 1]).await.unwrap();

        let graph = manager.load_graph().await.unwrap();
        assert_eq!(graph.ids(), vec![1, 5]);
        assert_eq!(graph.get_by_id(5).unwrap().parents, vec![1]);
    }

    #[tokio::test]
    async fn test_rename_refuses_to_clobber() {
        let (_dir, manager) = manager().await;
        let a = manager.write_migration(&Migration::new(1, "a")).await.unwrap();
        let b = manager.write_migration(&Migration::new(2, "b")).await.unwrap();
        assert!(manager.rename(&a, &b).await.is_err());
    }
}
