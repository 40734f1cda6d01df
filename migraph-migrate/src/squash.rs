//! Collapsing old migrations into a single replacement root.
//!
//! The migrations that existed at an older release are replayed into a
//! shadow database, its schema is dumped, and the dump replaces every
//! migration up to and including the chosen root:
//!
//! ```text
//! before:  1 -> 2 -> 3 -> 4 -> 5        (release tag knew 1..3)
//! after:   2' -> 3' -> 4 -> 5           (2' privileged statements, 3' dump)
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::LazyLock;

use regex_lite::Regex;
use tokio_util::sync::CancellationToken;

use crate::definition::{Migration, MigrationId};
use crate::dump::{DumpOptions, SchemaDumper, dump_database, split_privileged};
use crate::error::{MigrateResult, MigrationError};
use crate::executor::{ExecutorFactory, allow_no_change};
use crate::file::MigrationFileManager;
use crate::graph::MigrationGraph;
use crate::loader::{MigrationSetLoader, Revision};
use crate::shadow::{DatabaseProvisioner, ShadowDatabase};

/// Down body of squashed migrations.
pub const SQUASHED_DOWN: &str = "-- Nothing to do: squashed migrations cannot be reverted.\n";

/// Name of the replacement root.
pub const SQUASHED_NAME: &str = "squashed migrations";

/// Name of the privileged sibling of the replacement root.
pub const SQUASHED_PRIVILEGED_NAME: &str = "squashed migrations (privileged)";

/// Minor releases that must stay downgradeable after a squash.
pub const DEFAULT_SQUASH_DISTANCE: i64 = 2;

/// Staging area inside the schema directory; hidden from listings.
const STAGING_DIR: &str = "_squash_staging";

static RELEASE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^v?(\d+)\.(\d+)(?:\.(\d+))?$").expect("valid regex")
});

/// Tag to squash up to, given the current release.
///
/// `v5.3.1` with distance 2 maps to `v5.0.0`.
pub fn squash_target_revision(current_release: &str, distance: i64) -> MigrateResult<String> {
    let invalid = |message: &str| MigrationError::InvalidRelease {
        release: current_release.to_string(),
        message: message.to_string(),
    };

    let captures = RELEASE
        .captures(current_release.trim())
        .ok_or_else(|| invalid("expected vMAJOR.MINOR[.PATCH]"))?;
    let major: i64 = captures[1]
        .parse()
        .map_err(|_| invalid("major version out of range"))?;
    let minor: i64 = captures[2]
        .parse()
        .map_err(|_| invalid("minor version out of range"))?;

    let target_minor = minor - distance - 1;
    if target_minor < 0 {
        return Err(invalid(&format!(
            "squashing {} minor releases back from {} leaves no earlier release of major {}",
            distance + 1,
            current_release,
            major
        )));
    }

    Ok(format!("v{}.{}.0", major, target_minor))
}

/// Pick the migration that replaces everything defined at an older revision.
///
/// `versions` are the IDs that existed at that revision. The root is the
/// deepest migration among them dominating both their leaves and every one
/// of them that a newer migration builds upon.
pub fn select_new_root(
    graph: &MigrationGraph,
    versions: &[MigrationId],
) -> MigrateResult<Migration> {
    let present: Vec<MigrationId> = versions
        .iter()
        .copied()
        .filter(|id| graph.get_by_id(*id).is_some())
        .collect();
    let filtered = graph.filter(&present)?;

    let boundary: BTreeSet<MigrationId> = graph
        .all()
        .filter(|m| filtered.get_by_id(m.id).is_none())
        .flat_map(|m| m.parents.iter().copied())
        .filter(|parent| filtered.get_by_id(*parent).is_some())
        .collect();
    let boundary: Vec<MigrationId> = boundary.into_iter().collect();

    let root = filtered.leaf_dominator(&boundary).ok_or_else(|| {
        let mut ids: Vec<MigrationId> = filtered.leaves().iter().map(|m| m.id).collect();
        ids.extend(&boundary);
        ids.sort_unstable();
        ids.dedup();
        MigrationError::NoDominator(ids)
    })?;

    tracing::debug!(root = root.id, ?boundary, "Selected squash root");

    graph
        .get_by_id(root.id)
        .cloned()
        .ok_or_else(|| MigrationError::NotFound(root.id.to_string()))
}

/// Replacement migrations produced by a squash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SquashedMigrations {
    /// The new root, reusing the old root's ID.
    pub root: Migration,
    /// Privileged statements, reusing the old root's smallest parent ID.
    pub privileged: Option<Migration>,
}

impl SquashedMigrations {
    /// Build the replacements for `old_root` from a sanitized dump.
    pub fn from_dump(old_root: &Migration, dump: &str) -> Self {
        let (unprivileged, privileged) = split_privileged(dump);

        if privileged.is_empty() {
            return Self {
                root: Migration::new(old_root.id, SQUASHED_NAME)
                    .with_queries(unprivileged, SQUASHED_DOWN),
                privileged: None,
            };
        }

        match old_root.parents.iter().min() {
            Some(&sibling_id) => Self {
                root: Migration::new(old_root.id, SQUASHED_NAME)
                    .with_parents([sibling_id])
                    .with_queries(unprivileged, SQUASHED_DOWN),
                privileged: Some(
                    Migration::new(sibling_id, SQUASHED_PRIVILEGED_NAME)
                        .with_queries(privileged, SQUASHED_DOWN)
                        .privileged(true),
                ),
            },
            None => Self {
                root: Migration::new(old_root.id, SQUASHED_NAME)
                    .with_queries(dump, SQUASHED_DOWN)
                    .privileged(true),
                privileged: None,
            },
        }
    }

    /// Replacements in write order.
    pub fn migrations(&self) -> impl Iterator<Item = &Migration> {
        self.privileged.iter().chain(std::iter::once(&self.root))
    }
}

/// What a squash changed on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SquashReport {
    /// ID of the new root.
    pub root: MigrationId,
    /// ID of the privileged sibling, if one was written.
    pub privileged: Option<MigrationId>,
    /// IDs whose directories were removed.
    pub deleted: Vec<MigrationId>,
    /// Directories written.
    pub written: Vec<PathBuf>,
}

/// Replace every migration that is not a descendant of the new root.
///
/// The replacements are written to a staging directory first, so a failed
/// write leaves the schema directory untouched.
pub async fn apply_squash(
    files: &MigrationFileManager,
    graph: &MigrationGraph,
    squashed: &SquashedMigrations,
) -> MigrateResult<SquashReport> {
    let keep: BTreeSet<MigrationId> = graph
        .down(&graph.ids(), &[squashed.root.id])?
        .iter()
        .map(|m| m.id)
        .collect();
    let collapsed: Vec<&Migration> = graph.all().filter(|m| !keep.contains(&m.id)).collect();

    let staging = files.migrations_dir().join(STAGING_DIR);
    if tokio::fs::try_exists(&staging).await? {
        files.remove(&staging).await?;
    }

    let mut staged = Vec::new();
    for migration in squashed.migrations() {
        match files.write_migration_in(&staging, migration).await {
            Ok(path) => staged.push(path),
            Err(e) => {
                let _ = files.remove(&staging).await;
                return Err(e);
            }
        }
    }

    let mut report = SquashReport {
        root: squashed.root.id,
        privileged: squashed.privileged.as_ref().map(|m| m.id),
        ..SquashReport::default()
    };

    for migration in &collapsed {
        files.remove(&migration.path).await?;
        report.deleted.push(migration.id);
    }

    for path in staged {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = files.migrations_dir().join(name);
        files.rename(&path, &target).await?;
        report.written.push(target);
    }

    files.remove(&staging).await?;

    tracing::info!(
        root = report.root,
        deleted = report.deleted.len(),
        "Squashed migrations"
    );

    Ok(report)
}

/// Runs squashes with a set of collaborators.
pub struct Squasher<'a> {
    provisioner: &'a dyn DatabaseProvisioner,
    dumper: &'a dyn SchemaDumper,
    executors: &'a dyn ExecutorFactory,
    options: DumpOptions,
}

impl<'a> Squasher<'a> {
    /// Create a squasher.
    pub fn new(
        provisioner: &'a dyn DatabaseProvisioner,
        dumper: &'a dyn SchemaDumper,
        executors: &'a dyn ExecutorFactory,
        options: DumpOptions,
    ) -> Self {
        Self {
            provisioner,
            dumper,
            executors,
            options,
        }
    }

    /// Replay migrations up to `root` in a shadow database and build the replacements.
    ///
    /// The shadow database is torn down whether or not this succeeds.
    pub async fn generate(
        &self,
        schema: &str,
        root: &Migration,
        cancel: &CancellationToken,
    ) -> MigrateResult<SquashedMigrations> {
        let mut database = self.provisioner.provision(cancel).await?;

        let dumped = self.migrate_and_dump(schema, root, &database, cancel).await;

        // Teardown must outlive a cancelled caller.
        let teardown = self
            .provisioner
            .teardown(&mut database, &CancellationToken::new())
            .await;

        match (dumped, teardown) {
            (Ok(dump), Ok(())) => Ok(SquashedMigrations::from_dump(root, &dump)),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(teardown_error)) => {
                tracing::warn!(error = %teardown_error, "Failed to tear down shadow database");
                Err(e)
            }
        }
    }

    async fn migrate_and_dump(
        &self,
        schema: &str,
        root: &Migration,
        database: &ShadowDatabase,
        cancel: &CancellationToken,
    ) -> MigrateResult<String> {
        let executor = self.executors.open(schema, database.url()).await?;
        allow_no_change(executor.migrate_to(schema, root.id).await)?;
        tracing::info!(schema, root = root.id, "Replayed migrations into shadow database");
        dump_database(self.dumper, database, &self.options, cancel).await
    }

    /// Squash everything `schema` defined at `revision` into one root.
    pub async fn run(
        &self,
        schema: &str,
        loader: &dyn MigrationSetLoader,
        files: &MigrationFileManager,
        revision: &str,
        cancel: &CancellationToken,
    ) -> MigrateResult<SquashReport> {
        let mut versions: Vec<MigrationId> = loader
            .list_at(schema, &Revision::reference(revision), cancel)
            .await?
            .iter()
            .map(|m| m.id)
            .collect();
        versions.dedup();
        if versions.is_empty() {
            return Err(MigrationError::NotFound(format!(
                "migrations of {} at {}",
                schema, revision
            )));
        }

        let graph = files.load_graph().await?;
        let root = select_new_root(&graph, &versions)?;
        tracing::info!(schema, revision, root = root.id, "Squashing migrations");

        let squashed = self.generate(schema, &root, cancel).await?;
        apply_squash(files, &graph, &squashed).await
    }
}
