//! Migration executors used by the CLI.
//!
//! [`PostgresExecutor`] applies migration directories to a live PostgreSQL
//! database and records them in `migration_logs`. [`OfflineExecutor`] stands
//! in when database access is disabled.

use std::collections::BTreeSet;

use migraph_migrate::{
    ExecutorFactory, MigrateResult, MigrationError, MigrationExecutor, MigrationFileManager,
    MigrationGraph, MigrationId, MigrationSteps,
};

use crate::error::CliResult;

/// Applied IDs the graph knows about; others are logged and ignored.
#[cfg_attr(not(feature = "postgres"), allow(dead_code))]
fn known_applied(graph: &MigrationGraph, applied: Vec<MigrationId>) -> BTreeSet<MigrationId> {
    let (known, unknown): (BTreeSet<_>, BTreeSet<_>) = applied
        .into_iter()
        .partition(|id| graph.get_by_id(*id).is_some());
    if !unknown.is_empty() {
        tracing::warn!(?unknown, "Database records migrations with no definition on disk");
    }
    known
}

/// Steps applying the next `count` pending migrations (all when `None`).
pub fn next_steps(
    graph: &MigrationGraph,
    applied: &BTreeSet<MigrationId>,
    count: Option<usize>,
) -> MigrationSteps {
    let mut up = graph.plan_up(applied);
    if let Some(count) = count {
        up.truncate(count);
    }
    MigrationSteps {
        down: Vec::new(),
        up,
    }
}

/// Steps reverting the `count` most recent applied migrations, dependents first.
pub fn last_steps(
    graph: &MigrationGraph,
    applied: &BTreeSet<MigrationId>,
    count: usize,
) -> MigrationSteps {
    MigrationSteps {
        down: graph
            .topological_order()
            .iter()
            .rev()
            .filter(|id| applied.contains(id))
            .take(count)
            .copied()
            .collect(),
        up: Vec::new(),
    }
}

#[cfg(feature = "postgres")]
pub use postgres::{PostgresExecutor, PostgresExecutorFactory};

/// Executor type returned by [`connect`].
#[cfg(feature = "postgres")]
pub type Executor = PostgresExecutor;

/// Executor type returned by [`connect`].
#[cfg(not(feature = "postgres"))]
pub type Executor = OfflineExecutor;

/// Connect to `url` and serve the migrations managed by `files`.
#[cfg(feature = "postgres")]
pub async fn connect(url: &str, files: MigrationFileManager) -> CliResult<Executor> {
    Ok(PostgresExecutor::connect(url, files).await?)
}

/// Connect to `url` and serve the migrations managed by `files`.
#[cfg(not(feature = "postgres"))]
pub async fn connect(_url: &str, _files: MigrationFileManager) -> CliResult<Executor> {
    Err(crate::error::CliError::Config(
        "migraph was built without the `postgres` feature".to_string(),
    ))
}

/// Factory opening executors against shadow databases.
#[cfg(feature = "postgres")]
pub fn factory(files: MigrationFileManager) -> CliResult<Box<dyn ExecutorFactory>> {
    Ok(Box::new(PostgresExecutorFactory::new(files)))
}

/// Factory opening executors against shadow databases.
#[cfg(not(feature = "postgres"))]
pub fn factory(_files: MigrationFileManager) -> CliResult<Box<dyn ExecutorFactory>> {
    Err(crate::error::CliError::Config(
        "migraph was built without the `postgres` feature".to_string(),
    ))
}

#[cfg(feature = "postgres")]
mod postgres {
    use tokio::sync::Mutex;
    use tokio_postgres::{Client, NoTls};

    use migraph_migrate::executor::{POSTGRES_INIT_SQL, POSTGRES_LOCK_SQL, POSTGRES_UNLOCK_SQL};
    use migraph_migrate::{Migration, MigrationRecord};

    use super::*;

    fn db_err(e: tokio_postgres::Error) -> MigrationError {
        MigrationError::database(e.to_string())
    }

    fn step_err(action: &str, migration: &Migration, e: tokio_postgres::Error) -> MigrationError {
        MigrationError::database(format!("failed to {} {}: {}", action, migration.label(), e))
    }

    /// PostgreSQL migration executor.
    pub struct PostgresExecutor {
        client: Mutex<Client>,
        files: MigrationFileManager,
    }

    impl PostgresExecutor {
        /// Connect and make sure the bookkeeping table exists.
        pub async fn connect(url: &str, files: MigrationFileManager) -> MigrateResult<Self> {
            let (client, connection) = tokio_postgres::connect(url, NoTls)
                .await
                .map_err(|e| MigrationError::database(format!("Failed to connect: {}", e)))?;

            // Spawn the connection handler
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::error!(error = %e, "Connection error");
                }
            });

            client.batch_execute(POSTGRES_INIT_SQL).await.map_err(db_err)?;

            Ok(Self {
                client: Mutex::new(client),
                files,
            })
        }

        /// Applied migrations of `schema`, oldest first.
        pub async fn applied_records(&self, schema: &str) -> MigrateResult<Vec<MigrationRecord>> {
            let client = self.client.lock().await;
            let rows = client
                .query(
                    "SELECT version, name, applied_at FROM migration_logs \
                     WHERE schema = $1 ORDER BY applied_at, version",
                    &[&schema],
                )
                .await
                .map_err(db_err)?;

            rows.iter()
                .map(|row| {
                    Ok(MigrationRecord {
                        id: row.try_get(0).map_err(db_err)?,
                        name: row.try_get(1).map_err(db_err)?,
                        applied_at: row.try_get(2).map_err(db_err)?,
                    })
                })
                .collect()
        }

        async fn state(&self, schema: &str) -> MigrateResult<(MigrationGraph, BTreeSet<MigrationId>)> {
            let graph = self.files.load_graph().await?;
            let records = self.applied_records(schema).await?;
            let applied = known_applied(&graph, records.into_iter().map(|r| r.id).collect());
            Ok((graph, applied))
        }

        /// Apply the next `count` pending migrations.
        pub async fn apply_next(&self, schema: &str, count: Option<usize>) -> MigrateResult<usize> {
            let (graph, applied) = self.state(schema).await?;
            let steps = next_steps(&graph, &applied, count);
            self.run_steps(schema, &graph, &steps).await?;
            Ok(steps.up.len())
        }

        /// Revert the `count` most recently applied migrations.
        pub async fn revert_last(&self, schema: &str, count: usize) -> MigrateResult<usize> {
            let (graph, applied) = self.state(schema).await?;
            let steps = last_steps(&graph, &applied, count);
            self.run_steps(schema, &graph, &steps).await?;
            Ok(steps.down.len())
        }

        async fn run_steps(
            &self,
            schema: &str,
            graph: &MigrationGraph,
            steps: &MigrationSteps,
        ) -> MigrateResult<()> {
            if steps.is_empty() {
                return Err(MigrationError::NoChanges);
            }

            let mut client = self.client.lock().await;
            client.batch_execute(POSTGRES_LOCK_SQL).await.map_err(db_err)?;
            let result = apply_steps(&mut client, schema, graph, steps).await;
            let unlock = client.batch_execute(POSTGRES_UNLOCK_SQL).await.map_err(db_err);
            result.and(unlock)
        }
    }

    async fn apply_steps(
        client: &mut Client,
        schema: &str,
        graph: &MigrationGraph,
        steps: &MigrationSteps,
    ) -> MigrateResult<()> {
        let lookup = |id: &MigrationId| {
            graph
                .get_by_id(*id)
                .ok_or_else(|| MigrationError::NotFound(id.to_string()))
        };

        for migration in steps.down.iter().map(lookup) {
            let migration = migration?;
            let tx = client.transaction().await.map_err(db_err)?;
            tx.batch_execute(&migration.down_query)
                .await
                .map_err(|e| step_err("revert", migration, e))?;
            tx.execute(
                "DELETE FROM migration_logs WHERE schema = $1 AND version = $2",
                &[&schema, &migration.id],
            )
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            tracing::info!(schema, id = migration.id, "Reverted migration");
        }

        for migration in steps.up.iter().map(lookup) {
            let migration = migration?;
            let tx = client.transaction().await.map_err(db_err)?;
            tx.batch_execute(&migration.up_query)
                .await
                .map_err(|e| step_err("apply", migration, e))?;
            tx.execute(
                "INSERT INTO migration_logs (schema, version, name) VALUES ($1, $2, $3)",
                &[&schema, &migration.id, &migration.name],
            )
            .await
            .map_err(db_err)?;
            tx.commit().await.map_err(db_err)?;
            tracing::info!(schema, id = migration.id, "Applied migration");
        }

        Ok(())
    }

    #[async_trait::async_trait]
    impl MigrationExecutor for PostgresExecutor {
        async fn migrate_to(&self, schema: &str, target: MigrationId) -> MigrateResult<()> {
            let (graph, applied) = self.state(schema).await?;
            let steps = graph.plan_to(&applied, target)?;
            self.run_steps(schema, &graph, &steps).await
        }

        async fn current_version(&self, schema: &str) -> MigrateResult<MigrationId> {
            let client = self.client.lock().await;
            let row = client
                .query_one(
                    "SELECT COALESCE(MAX(version), 0) FROM migration_logs WHERE schema = $1",
                    &[&schema],
                )
                .await
                .map_err(db_err)?;
            row.try_get(0).map_err(db_err)
        }

        async fn migrate_up(&self, schema: &str) -> MigrateResult<()> {
            self.apply_next(schema, None).await.map(|_| ())
        }
    }

    /// Opens [`PostgresExecutor`]s over one schema's migration files.
    pub struct PostgresExecutorFactory {
        files: MigrationFileManager,
    }

    impl PostgresExecutorFactory {
        /// Create a factory.
        pub fn new(files: MigrationFileManager) -> Self {
            Self { files }
        }
    }

    #[async_trait::async_trait]
    impl ExecutorFactory for PostgresExecutorFactory {
        async fn open(&self, _schema: &str, dsn: &str) -> MigrateResult<Box<dyn MigrationExecutor>> {
            let executor = PostgresExecutor::connect(dsn, self.files.clone()).await?;
            Ok(Box::new(executor))
        }
    }
}

/// Executor for runs that must not touch a database.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineExecutor;

impl OfflineExecutor {
    fn disabled() -> MigrationError {
        MigrationError::database("database access is disabled for this run")
    }

    /// Always fails: there is no database.
    pub async fn apply_next(&self, _schema: &str, _count: Option<usize>) -> MigrateResult<usize> {
        Err(Self::disabled())
    }

    /// Always fails: there is no database.
    pub async fn revert_last(&self, _schema: &str, _count: usize) -> MigrateResult<usize> {
        Err(Self::disabled())
    }
}

#[async_trait::async_trait]
impl MigrationExecutor for OfflineExecutor {
    async fn migrate_to(&self, _schema: &str, _target: MigrationId) -> MigrateResult<()> {
        Err(Self::disabled())
    }

    async fn current_version(&self, _schema: &str) -> MigrateResult<MigrationId> {
        Err(Self::disabled())
    }

    async fn migrate_up(&self, _schema: &str) -> MigrateResult<()> {
        Err(Self::disabled())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use migraph_migrate::Migration;

    fn graph() -> MigrationGraph {
        MigrationGraph::new(vec![
            Migration::new(1, "init"),
            Migration::new(2, "users").with_parents([1]),
            Migration::new(3, "teams").with_parents([1]),
            Migration::new(4, "members").with_parents([2, 3]),
        ])
        .unwrap()
    }

    #[test]
    fn test_next_steps() {
        let graph = graph();
        let applied = BTreeSet::from([1]);
        assert_eq!(next_steps(&graph, &applied, None).up, vec![2, 3, 4]);
        assert_eq!(next_steps(&graph, &applied, Some(1)).up, vec![2]);
        assert!(next_steps(&graph, &BTreeSet::from([1, 2, 3, 4]), None).is_empty());
    }

    #[test]
    fn test_last_steps_revert_dependents_first() {
        let graph = graph();
        let applied = BTreeSet::from([1, 2, 3, 4]);
        assert_eq!(last_steps(&graph, &applied, 1).down, vec![4]);
        assert_eq!(last_steps(&graph, &applied, 2).down, vec![4, 3]);
        assert_eq!(last_steps(&graph, &BTreeSet::from([1]), 5).down, vec![1]);
    }

    #[test]
    fn test_known_applied_drops_unknown_ids() {
        let graph = graph();
        assert_eq!(known_applied(&graph, vec![1, 2, 99]), BTreeSet::from([1, 2]));
    }

    #[tokio::test]
    async fn test_offline_executor_refuses() {
        let executor = OfflineExecutor;
        assert!(executor.current_version("frontend").await.is_err());
        assert!(executor.migrate_up("frontend").await.is_err());
        assert!(executor.apply_next("frontend", None).await.is_err());
    }
}
