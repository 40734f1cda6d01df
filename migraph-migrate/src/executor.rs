//! The database side of migrations: applying, reverting, and reporting versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::definition::MigrationId;
use crate::error::MigrateResult;

/// Bookkeeping table recording applied migrations.
pub const BOOKKEEPING_TABLE: &str = "migration_logs";

/// SQL for initializing the bookkeeping table (PostgreSQL).
pub const POSTGRES_INIT_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS migration_logs (
    schema TEXT NOT NULL,
    version BIGINT NOT NULL,
    name TEXT NOT NULL,
    applied_at TIMESTAMP WITH TIME ZONE NOT NULL DEFAULT NOW(),
    PRIMARY KEY (schema, version)
);
"#;

/// SQL for an advisory lock around migration runs (PostgreSQL).
pub const POSTGRES_LOCK_SQL: &str = "SELECT pg_advisory_lock(42424242)";
/// SQL releasing [`POSTGRES_LOCK_SQL`].
pub const POSTGRES_UNLOCK_SQL: &str = "SELECT pg_advisory_unlock(42424242)";

/// A record of an applied migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Migration ID.
    pub id: MigrationId,
    /// Slug of the migration when it was applied.
    pub name: String,
    /// When the migration was applied.
    pub applied_at: DateTime<Utc>,
}

/// Runs migrations against a live database.
///
/// Every method returns [`MigrationError::NoChanges`](crate::MigrationError::NoChanges)
/// when the database is already where the caller asked it to be.
#[async_trait::async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Move the schema to `target`: revert applied migrations above it, then
    /// apply whatever `target` still depends on.
    async fn migrate_to(&self, schema: &str, target: MigrationId) -> MigrateResult<()>;

    /// Highest applied migration ID, or 0 for a fresh database.
    async fn current_version(&self, schema: &str) -> MigrateResult<MigrationId>;

    /// Apply every pending migration.
    async fn migrate_up(&self, schema: &str) -> MigrateResult<()>;
}

/// Opens an executor against an arbitrary connection string.
#[async_trait::async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// Connect to `dsn` and serve migrations of `schema`.
    async fn open(&self, schema: &str, dsn: &str) -> MigrateResult<Box<dyn MigrationExecutor>>;
}

/// Treat the executor's no-op sentinel as success.
pub fn allow_no_change(result: MigrateResult<()>) -> MigrateResult<bool> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_no_change() => Ok(false),
        Err(e) => Err(e),
    }
}
