//! Reconciling migration IDs that collided across branches.
//!
//! When a branch and the main branch both mint migration `N`, the branch's
//! copy is moved to a fresh ID above everything main defines, later branch
//! migrations shift up to make room, and the local database is walked back
//! and forth so it ends up matching the renumbered files.
//!
//! # Plan shape
//!
//! ```text
//! hide main's file          (only if the database applied a colliding ID)
//! roll back local N..B      (descending, only IDs the database applied)
//! restore main's file
//! renumber local conflict   (ascending; IDs allocated above max(main))
//! shift later local-only migrations by the conflict count
//! migrate database up to latest
//! ```
//!
//! Plans are computed by [`plan_fixup`] from two in-memory [`MigrationSet`]s
//! and executed by [`execute_plan`] one step at a time.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::definition::{Migration, MigrationId, hidden_path};
use crate::error::{MigrateResult, MigrationError};
use crate::executor::{MigrationExecutor, allow_no_change};
use crate::file::MigrationFileManager;
use crate::loader::{MigrationSetLoader, Revision};
use crate::set::{
    MigrationConflict, MigrationSet, find_conflicting_migrations, find_missing_migrations,
};

/// Hands out fresh migration IDs, one per renumbered conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdAllocator {
    next: MigrationId,
}

impl IdAllocator {
    /// Allocate IDs starting right above `max`.
    pub fn starting_after(max: MigrationId) -> Self {
        Self { next: max + 1 }
    }

    /// Take the next free ID.
    pub fn allocate(&mut self) -> MigrationId {
        let id = self.next;
        self.next += 1;
        id
    }

    /// The ID the next [`allocate`](Self::allocate) will return.
    pub fn peek(&self) -> MigrationId {
        self.next
    }

    /// Give back the most recently allocated ID.
    pub fn release(&mut self, id: MigrationId) {
        if id + 1 == self.next {
            self.next = id;
        }
    }
}

/// Receives human-readable progress lines.
pub trait ProgressSink: Send {
    /// Record one line.
    fn line(&mut self, line: String);
}

impl ProgressSink for Vec<String> {
    fn line(&mut self, line: String) {
        self.push(line);
    }
}

/// A file move performed by a renumbering step, kept so it can be undone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Renumbering {
    /// ID before the move.
    pub old_id: MigrationId,
    /// ID after the move.
    pub new_id: MigrationId,
    /// Directory before the move.
    pub old_path: PathBuf,
    /// Directory after the move.
    pub new_path: PathBuf,
    /// Parents recorded in the metadata before the move.
    pub old_parents: Vec<MigrationId>,
}

/// Shared context threaded through plan execution.
pub struct OperationOptions<'a> {
    /// Schema being reconciled.
    pub schema: &'a str,
    /// File manager of the schema's working-tree directory.
    pub files: &'a MigrationFileManager,
    /// Database executor.
    pub executor: &'a dyn MigrationExecutor,
    /// Source of fresh IDs.
    pub allocator: &'a mut IdAllocator,
    /// Whether database steps actually run.
    pub run_database: bool,
    /// Progress output.
    pub progress: &'a mut dyn ProgressSink,
    /// Checked between steps.
    pub cancel: &'a CancellationToken,
    /// Renumberings performed so far, keyed by old ID.
    pub journal: BTreeMap<MigrationId, Renumbering>,
}

impl<'a> OperationOptions<'a> {
    /// Create options with an empty journal.
    pub fn new(
        schema: &'a str,
        files: &'a MigrationFileManager,
        executor: &'a dyn MigrationExecutor,
        allocator: &'a mut IdAllocator,
        progress: &'a mut dyn ProgressSink,
        cancel: &'a CancellationToken,
    ) -> Self {
        Self {
            schema,
            files,
            executor,
            allocator,
            run_database: true,
            progress,
            cancel,
            journal: BTreeMap::new(),
        }
    }

    /// Set whether database steps run.
    pub fn run_database(mut self, run: bool) -> Self {
        self.run_database = run;
        self
    }

    fn remap(&self, parents: &[MigrationId]) -> Vec<MigrationId> {
        parents
            .iter()
            .map(|parent| self.journal.get(parent).map_or(*parent, |r| r.new_id))
            .collect()
    }
}

/// One reconciliation step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Hide main's definition of a colliding ID from migration tooling.
    HideMain(Migration),
    /// Undo [`Operation::HideMain`].
    RestoreMain(Migration),
    /// Revert one migration the local database applied.
    RollbackLocal(Migration),
    /// Move the local side of a conflict to a freshly allocated ID.
    RenumberConflict(MigrationConflict),
    /// Move a local-only migration up by a fixed offset.
    Shift {
        /// Migration to move.
        migration: Migration,
        /// Offset added to its ID.
        magnitude: MigrationId,
    },
    /// Bring the database up to the latest migration.
    SyncToLatest,
}

impl Operation {
    /// Short machine-readable kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::HideMain(_) => "hide_main",
            Operation::RestoreMain(_) => "restore_main",
            Operation::RollbackLocal(_) => "rollback_local",
            Operation::RenumberConflict(_) => "renumber_conflict",
            Operation::Shift { .. } => "shift",
            Operation::SyncToLatest => "sync_to_latest",
        }
    }

    /// ID the step acts on.
    pub fn migration_id(&self) -> Option<MigrationId> {
        match self {
            Operation::HideMain(m) | Operation::RestoreMain(m) | Operation::RollbackLocal(m) => {
                Some(m.id)
            }
            Operation::RenumberConflict(conflict) => Some(conflict.id),
            Operation::Shift { migration, .. } => Some(migration.id),
            Operation::SyncToLatest => None,
        }
    }

    /// Human-readable description for previews.
    pub fn describe(&self) -> String {
        match self {
            Operation::HideMain(m) => format!("Hide main's migration {}", m.label()),
            Operation::RestoreMain(m) => format!("Restore main's migration {}", m.label()),
            Operation::RollbackLocal(m) => {
                format!("Roll back local migration {} in the database", m.label())
            }
            Operation::RenumberConflict(conflict) => format!(
                "Renumber local migration {} (collides with main's {}) to the next free ID",
                conflict.local.label(),
                conflict.main.label()
            ),
            Operation::Shift {
                migration,
                magnitude,
            } => format!(
                "Shift local migration {} up by {} to {}",
                migration.label(),
                magnitude,
                migration.id + magnitude
            ),
            Operation::SyncToLatest => "Migrate the database up to the latest migration".into(),
        }
    }

    /// Perform the step.
    pub async fn execute(&self, options: &mut OperationOptions<'_>) -> MigrateResult<()> {
        match self {
            Operation::HideMain(m) => {
                let hidden = hidden_path(&m.path);
                options.files.rename(&m.path, &hidden).await?;
                options
                    .progress
                    .line(format!("Hid {} as {}", m.label(), display_name(&hidden)));
            }
            Operation::RestoreMain(m) => {
                options.files.rename(&hidden_path(&m.path), &m.path).await?;
                options.progress.line(format!("Restored {}", m.label()));
            }
            Operation::RollbackLocal(m) => {
                if options.run_database {
                    let changed =
                        allow_no_change(options.executor.migrate_to(options.schema, m.id - 1).await)?;
                    options.progress.line(if changed {
                        format!("Rolled back {}", m.label())
                    } else {
                        format!("{} was not applied; nothing to roll back", m.label())
                    });
                } else {
                    options
                        .progress
                        .line(format!("Skipped rolling back {} (database disabled)", m.label()));
                }
            }
            Operation::RenumberConflict(conflict) => {
                let new_id = options.allocator.allocate();
                if let Err(e) = move_migration(&conflict.local, new_id, options).await {
                    options.allocator.release(new_id);
                    return Err(e);
                }
            }
            Operation::Shift {
                migration,
                magnitude,
            } => {
                move_migration(migration, migration.id + magnitude, options).await?;
            }
            Operation::SyncToLatest => {
                if options.run_database {
                    let changed = allow_no_change(options.executor.migrate_up(options.schema).await)?;
                    options.progress.line(if changed {
                        "Migrated the database up to the latest migration".to_string()
                    } else {
                        "Database already at the latest migration".to_string()
                    });
                } else {
                    options
                        .progress
                        .line("Skipped migrating the database (database disabled)".to_string());
                }
            }
        }

        Ok(())
    }

    /// Undo a completed step.
    ///
    /// File moves are restored exactly. A rollback is undone by migrating the
    /// database back up to the rolled-back ID. Syncing to latest cannot be
    /// undone and only reports that.
    pub async fn reset(&self, options: &mut OperationOptions<'_>) -> MigrateResult<()> {
        match self {
            Operation::HideMain(m) => {
                options.files.rename(&hidden_path(&m.path), &m.path).await?;
                options.progress.line(format!("Un-hid {}", m.label()));
            }
            Operation::RestoreMain(m) => {
                options.files.rename(&m.path, &hidden_path(&m.path)).await?;
                options.progress.line(format!("Re-hid {}", m.label()));
            }
            Operation::RollbackLocal(m) => {
                if options.run_database {
                    allow_no_change(options.executor.migrate_to(options.schema, m.id).await)?;
                    options.progress.line(format!("Re-applied {}", m.label()));
                }
            }
            Operation::RenumberConflict(conflict) => {
                if let Some(renumbering) = unmove_migration(conflict.local.id, options).await? {
                    options.allocator.release(renumbering.new_id);
                }
            }
            Operation::Shift { migration, .. } => {
                unmove_migration(migration.id, options).await?;
            }
            Operation::SyncToLatest => {
                options
                    .progress
                    .line("Database stays at the latest migration".to_string());
            }
        }

        Ok(())
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

async fn move_migration(
    migration: &Migration,
    new_id: MigrationId,
    options: &mut OperationOptions<'_>,
) -> MigrateResult<()> {
    let new_path = options.files.renumber(migration, new_id).await?;
    let parents = options.remap(&migration.parents);
    if let Err(e) = options.files.rewrite_parents(&new_path, &parents).await {
        // Put the directory back so the tree matches the journal.
        if let Err(undo) = options.files.rename(&new_path, &migration.path).await {
            tracing::warn!(
                from = %new_path.display(),
                to = %migration.path.display(),
                error = %undo,
                "Failed to move migration back after a failed renumbering"
            );
        }
        return Err(e);
    }

    options.progress.line(format!(
        "Renumbered {} to {}",
        migration.label(),
        display_name(&new_path)
    ));
    options.journal.insert(
        migration.id,
        Renumbering {
            old_id: migration.id,
            new_id,
            old_path: migration.path.clone(),
            new_path,
            old_parents: migration.parents.clone(),
        },
    );

    Ok(())
}

async fn unmove_migration(
    old_id: MigrationId,
    options: &mut OperationOptions<'_>,
) -> MigrateResult<Option<Renumbering>> {
    let Some(renumbering) = options.journal.remove(&old_id) else {
        return Ok(None);
    };

    options
        .files
        .rename(&renumbering.new_path, &renumbering.old_path)
        .await?;
    options
        .files
        .rewrite_parents(&renumbering.old_path, &renumbering.old_parents)
        .await?;
    options.progress.line(format!(
        "Moved {} back to {}",
        display_name(&renumbering.new_path),
        display_name(&renumbering.old_path)
    ));

    Ok(Some(renumbering))
}

fn display_name(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

/// The computed reconciliation for one schema.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FixupPlan {
    /// Colliding IDs, ascending.
    pub conflicts: Vec<MigrationConflict>,
    /// Steps to run, in order.
    pub operations: Vec<Operation>,
    /// Whether the local database applied any colliding ID.
    pub should_change_db: bool,
    /// Highest ID on main; fresh IDs start right above it.
    pub max_main: MigrationId,
}

impl FixupPlan {
    /// Check if there is nothing to do.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Allocator positioned for this plan.
    pub fn allocator(&self) -> IdAllocator {
        IdAllocator::starting_after(self.max_main)
    }
}

/// Compute the reconciliation plan of `local` against `main`.
///
/// `current_version` is the highest ID the local database applied. Fails
/// with [`MigrationError::RebaseRequired`] when main defines IDs the local
/// set lacks.
pub fn plan_fixup(
    schema: &str,
    main: &MigrationSet,
    local: &MigrationSet,
    current_version: MigrationId,
) -> MigrateResult<FixupPlan> {
    let conflicts = find_conflicting_migrations(main, local);
    let missing = find_missing_migrations(main, local);
    if !missing.is_empty() {
        return Err(MigrationError::RebaseRequired {
            schema: schema.to_string(),
            missing: missing.iter().map(|m| m.id).collect(),
        });
    }

    let max_main = main.max_id();
    let max_local = local.max_id();

    if conflicts.is_empty() && current_version == max_local {
        return Ok(FixupPlan {
            max_main,
            ..FixupPlan::default()
        });
    }

    let branching_version = conflicts
        .iter()
        .map(|c| c.id)
        .fold(max_main, MigrationId::min);
    let should_change_db = conflicts.iter().any(|c| c.id <= current_version);

    tracing::debug!(
        schema,
        conflicts = conflicts.len(),
        branching_version,
        current_version,
        should_change_db,
        "Planning migration fixup"
    );

    let mut operations = Vec::new();

    if should_change_db {
        for conflict in &conflicts {
            operations.push(Operation::HideMain(conflict.main.clone()));
        }

        for migration in local.iter().rev() {
            if migration.id < branching_version {
                break;
            }
            if migration.id <= current_version {
                operations.push(Operation::RollbackLocal(migration.clone()));
            }
        }

        for conflict in &conflicts {
            operations.push(Operation::RestoreMain(conflict.main.clone()));
        }
    }

    for conflict in &conflicts {
        operations.push(Operation::RenumberConflict(conflict.clone()));
    }

    if let Some(first) = conflicts.first() {
        let magnitude = conflicts.len() as MigrationId;
        for migration in local.iter() {
            let renumbered = conflicts.iter().any(|c| c.id == migration.id);
            if migration.id > first.id && !renumbered && !main.contains(migration.id) {
                operations.push(Operation::Shift {
                    migration: migration.clone(),
                    magnitude,
                });
            }
        }
    }

    operations.push(Operation::SyncToLatest);

    Ok(FixupPlan {
        conflicts,
        operations,
        should_change_db,
        max_main,
    })
}

/// One rendered plan step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanLine {
    /// Position in the plan, starting at 1.
    pub step: usize,
    /// Machine-readable kind.
    pub kind: &'static str,
    /// ID the step acts on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<MigrationId>,
    /// ID the migration ends up with.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_id: Option<MigrationId>,
    /// Description.
    pub description: String,
}

impl fmt::Display for PlanLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.new_id {
            Some(new_id) => write!(f, "{} (-> {})", self.description, new_id),
            None => f.write_str(&self.description),
        }
    }
}

/// Render a plan for preview, simulating ID allocation on a copy of `allocator`.
pub fn render_plan(operations: &[Operation], allocator: &IdAllocator) -> Vec<PlanLine> {
    let mut allocator = allocator.clone();

    operations
        .iter()
        .enumerate()
        .map(|(index, operation)| {
            let new_id = match operation {
                Operation::RenumberConflict(_) => Some(allocator.allocate()),
                Operation::Shift {
                    migration,
                    magnitude,
                } => Some(migration.id + magnitude),
                _ => None,
            };
            PlanLine {
                step: index + 1,
                kind: operation.kind(),
                id: operation.migration_id(),
                new_id,
                description: operation.describe(),
            }
        })
        .collect()
}

/// Steps that ran before a plan finished or failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlanReport {
    /// Descriptions of completed steps, in order.
    pub completed: Vec<String>,
}

/// Run `operations` in order, stopping at the first failure.
///
/// On failure the error is [`MigrationError::Execution`], naming the failed
/// step and how many steps completed. Completed steps are left in place;
/// pass `&operations[..completed]` to [`reset_plan`] to undo them.
pub async fn execute_plan(
    operations: &[Operation],
    options: &mut OperationOptions<'_>,
) -> MigrateResult<PlanReport> {
    let mut report = PlanReport::default();

    for operation in operations {
        let result = if options.cancel.is_cancelled() {
            Err(MigrationError::Cancelled)
        } else {
            operation.execute(options).await
        };

        if let Err(source) = result {
            tracing::warn!(
                schema = options.schema,
                step = %operation,
                completed = report.completed.len(),
                error = %source,
                "Fixup step failed"
            );
            return Err(MigrationError::Execution {
                step: operation.describe(),
                completed: report.completed.len(),
                completed_steps: report.completed,
                source: Box::new(source),
            });
        }

        tracing::info!(schema = options.schema, step = %operation, "Fixup step completed");
        report.completed.push(operation.describe());
    }

    Ok(report)
}

/// Undo completed steps in reverse order.
pub async fn reset_plan(
    completed: &[Operation],
    options: &mut OperationOptions<'_>,
) -> MigrateResult<()> {
    for (index, operation) in completed.iter().enumerate().rev() {
        if let Err(source) = operation.reset(options).await {
            return Err(MigrationError::Execution {
                step: format!("reset: {}", operation.describe()),
                completed: completed.len() - index - 1,
                completed_steps: completed[index + 1..]
                    .iter()
                    .rev()
                    .map(|op| format!("reset: {}", op.describe()))
                    .collect(),
                source: Box::new(source),
            });
        }
    }
    Ok(())
}

/// What [`run_fixup`] should do.
#[derive(Debug, Clone)]
pub struct FixupRequest<'a> {
    /// Schema name.
    pub schema: &'a str,
    /// Revision holding the trunk's migrations.
    pub main_revision: &'a str,
    /// Whether database steps run.
    pub run_database: bool,
    /// Only compute and render the plan.
    pub dry_run: bool,
}

/// Result of [`run_fixup`].
#[derive(Debug, Clone)]
pub struct FixupOutcome {
    /// The computed plan.
    pub plan: FixupPlan,
    /// Rendered plan lines.
    pub lines: Vec<PlanLine>,
    /// Execution report, absent on a dry run.
    pub report: Option<PlanReport>,
    /// IDs whose files the branch changed relative to main.
    pub branch_changes: Vec<MigrationId>,
}

/// Load both sides, plan, and (unless dry-running) execute the fixup of one schema.
///
/// Without database access the local database is treated as untouched, so no
/// rollback steps are planned, and a schema without conflicts has nothing to do.
pub async fn run_fixup<L: MigrationSetLoader + ?Sized>(
    loader: &L,
    files: &MigrationFileManager,
    executor: &dyn MigrationExecutor,
    request: &FixupRequest<'_>,
    progress: &mut dyn ProgressSink,
    cancel: &CancellationToken,
) -> MigrateResult<FixupOutcome> {
    let main = loader
        .load_at(
            request.schema,
            &Revision::reference(request.main_revision),
            cancel,
        )
        .await?;
    let entries = loader
        .list_at(request.schema, &Revision::WorkingTree, cancel)
        .await?;
    let local = MigrationSet::resolve_local(entries, &main);

    let current_version = if request.run_database {
        executor.current_version(request.schema).await?
    } else {
        0
    };

    let mut plan = plan_fixup(request.schema, &main, &local, current_version)?;
    if !request.run_database && plan.conflicts.is_empty() {
        plan.operations.clear();
    }
    let lines = render_plan(&plan.operations, &plan.allocator());

    let branch_changes = match loader
        .changed_between(request.schema, request.main_revision, "HEAD", cancel)
        .await
    {
        Ok(changed) => {
            let mut ids: Vec<MigrationId> = changed.iter().map(|m| m.id).collect();
            ids.dedup();
            ids
        }
        Err(e) => {
            tracing::warn!(
                schema = request.schema,
                error = %e,
                "Could not diff the branch against main"
            );
            Vec::new()
        }
    };

    if request.dry_run || plan.is_empty() {
        return Ok(FixupOutcome {
            plan,
            lines,
            report: None,
            branch_changes,
        });
    }

    let mut allocator = plan.allocator();
    let mut options = OperationOptions::new(
        request.schema,
        files,
        executor,
        &mut allocator,
        progress,
        cancel,
    )
    .run_database(request.run_database);
    let report = execute_plan(&plan.operations, &mut options).await?;

    Ok(FixupOutcome {
        plan,
        lines,
        report: Some(report),
        branch_changes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use pretty_assertions::assert_eq;

    fn set(entries: &[(MigrationId, &str)]) -> MigrationSet {
        entries
            .iter()
            .map(|(id, name)| {
                let parents = if *id > 1 { vec![id - 1] } else { Vec::new() };
                Migration::new(*id, *name).with_parents(parents)
            })
            .collect()
    }

    fn kinds(plan: &FixupPlan) -> Vec<(&'static str, Option<MigrationId>)> {
        plan.operations
            .iter()
            .map(|op| (op.kind(), op.migration_id()))
            .collect()
    }

    #[test]
    fn test_identical_sets_are_clean() {
        let main = set(&[(1, "init"), (2, "users")]);
        let plan = plan_fixup("frontend", &main, &main.clone(), 2).unwrap();
        assert!(plan.conflicts.is_empty());
        assert!(plan.is_empty());

        // A database behind the files only gets a sync.
        let plan = plan_fixup("frontend", &main, &main.clone(), 1).unwrap();
        assert_eq!(kinds(&plan), vec![("sync_to_latest", None)]);
    }

    #[test]
    fn test_trunk_ahead_requires_rebase() {
        let main = set(&[(1, "init"), (2, "users")]);
        let local = set(&[(1, "init")]);
        let err = plan_fixup("frontend", &main, &local, 1).unwrap_err();
        match err {
            MigrationError::RebaseRequired { missing, .. } => assert_eq!(missing, vec![2]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_branch_ahead_is_clean() {
        let main = set(&[(1, "init")]);
        let local = set(&[(1, "init"), (2, "users")]);
        let plan = plan_fixup("frontend", &main, &local, 2).unwrap();
        assert!(plan.conflicts.is_empty());
        assert!(plan.is_empty());
    }

    #[test]
    fn test_unapplied_conflict_only_renumbers() {
        let main = set(&[(1, "init"), (2, "users")]);
        let local = set(&[(1, "init"), (2, "teams")]);
        let plan = plan_fixup("frontend", &main, &local, 1).unwrap();

        assert!(!plan.should_change_db);
        assert_eq!(
            kinds(&plan),
            vec![("renumber_conflict", Some(2)), ("sync_to_latest", None)]
        );
    }

    #[test]
    fn test_applied_conflict_round_trips_database() {
        let main = set(&[(1, "init"), (2, "users")]);
        let local = set(&[(1, "init"), (2, "teams")]);
        let plan = plan_fixup("frontend", &main, &local, 2).unwrap();

        assert!(plan.should_change_db);
        assert_eq!(
            kinds(&plan),
            vec![
                ("hide_main", Some(2)),
                ("rollback_local", Some(2)),
                ("restore_main", Some(2)),
                ("renumber_conflict", Some(2)),
                ("sync_to_latest", None),
            ]
        );
        match &plan.operations[1] {
            Operation::RollbackLocal(m) => assert_eq!(m.name, "teams"),
            other => panic!("unexpected operation: {other}"),
        }
        match &plan.operations[0] {
            Operation::HideMain(m) => assert_eq!(m.name, "users"),
            other => panic!("unexpected operation: {other}"),
        }
    }

    #[test]
    fn test_sequential_conflicts_roll_back_descending() {
        let main = set(&[(1, "init"), (2, "users"), (3, "orgs")]);
        let local = set(&[(1, "init"), (2, "teams"), (3, "roles")]);
        let plan = plan_fixup("frontend", &main, &local, 3).unwrap();

        assert_eq!(
            kinds(&plan),
            vec![
                ("hide_main", Some(2)),
                ("hide_main", Some(3)),
                ("rollback_local", Some(3)),
                ("rollback_local", Some(2)),
                ("restore_main", Some(2)),
                ("restore_main", Some(3)),
                ("renumber_conflict", Some(2)),
                ("renumber_conflict", Some(3)),
                ("sync_to_latest", None),
            ]
        );
    }

    #[test]
    fn test_lopsided_branch_shifts_local_only_migrations() {
        let main = set(&[(1, "init"), (2, "users")]);
        let local = set(&[(1, "init"), (2, "teams"), (3, "roles"), (4, "grants")]);
        let plan = plan_fixup("frontend", &main, &local, 1).unwrap();

        assert_eq!(
            kinds(&plan),
            vec![
                ("renumber_conflict", Some(2)),
                ("shift", Some(3)),
                ("shift", Some(4)),
                ("sync_to_latest", None),
            ]
        );
        for op in &plan.operations {
            if let Operation::Shift { magnitude, .. } = op {
                assert_eq!(*magnitude, 1);
            }
        }

        let lines = render_plan(&plan.operations, &plan.allocator());
        let new_ids: Vec<_> = lines.iter().map(|l| l.new_id).collect();
        assert_eq!(new_ids, vec![Some(3), Some(4), Some(5), None]);
    }

    #[test]
    fn test_rollback_skips_ids_the_database_never_applied() {
        let main = set(&[(1, "init"), (2, "users")]);
        let local = set(&[(1, "init"), (2, "teams"), (3, "roles")]);
        let plan = plan_fixup("frontend", &main, &local, 2).unwrap();

        let rollbacks: Vec<_> = plan
            .operations
            .iter()
            .filter(|op| op.kind() == "rollback_local")
            .filter_map(Operation::migration_id)
            .collect();
        assert_eq!(rollbacks, vec![2]);
    }

    #[test]
    fn test_allocator() {
        let mut allocator = IdAllocator::starting_after(7);
        assert_eq!(allocator.peek(), 8);
        assert_eq!(allocator.allocate(), 8);
        assert_eq!(allocator.allocate(), 9);
        allocator.release(9);
        assert_eq!(allocator.peek(), 9);
        allocator.release(3);
        assert_eq!(allocator.peek(), 9);
    }

    #[derive(Default)]
    struct RecordingExecutor {
        calls: Mutex<Vec<String>>,
        fail_up: bool,
    }

    #[async_trait::async_trait]
    impl MigrationExecutor for RecordingExecutor {
        async fn migrate_to(&self, schema: &str, target: MigrationId) -> MigrateResult<()> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{schema}: to {target}"));
            Ok(())
        }

        async fn current_version(&self, _schema: &str) -> MigrateResult<MigrationId> {
            Ok(2)
        }

        async fn migrate_up(&self, schema: &str) -> MigrateResult<()> {
            self.calls.lock().unwrap().push(format!("{schema}: up"));
            if self.fail_up {
                Err(MigrationError::database("connection reset"))
            } else {
                Err(MigrationError::NoChanges)
            }
        }
    }

    async fn write_tree(files: &MigrationFileManager, entries: &[(MigrationId, &str)]) {
        files.ensure_dir().await.unwrap();
        for (id, name) in entries {
            let parents = if *id > 1 { vec![id - 1] } else { Vec::new() };
            files
                .write_migration(&Migration::new(*id, *name).with_parents(parents))
                .await
                .unwrap();
        }
    }

    async fn on_disk(files: &MigrationFileManager) -> Vec<String> {
        files
            .list_migrations()
            .await
            .unwrap()
            .iter()
            .map(|m| format!("{}:{:?}", m.dir_name(), m.parents))
            .collect()
    }

    #[tokio::test]
    async fn test_execute_and_reset_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let files = MigrationFileManager::new(dir.path());
        write_tree(
            &files,
            &[(1, "init"), (2, "users"), (2, "teams"), (3, "roles")],
        )
        .await;

        let main = MigrationSet::from_migrations(
            files
                .list_migrations()
                .await
                .unwrap()
                .into_iter()
                .filter(|m| m.name == "init" || m.name == "users"),
        );
        let local = MigrationSet::resolve_local(files.list_migrations().await.unwrap(), &main);
        let plan = plan_fixup("frontend", &main, &local, 2).unwrap();

        let executor = RecordingExecutor::default();
        let mut allocator = plan.allocator();
        let mut progress: Vec<String> = Vec::new();
        let cancel = CancellationToken::new();
        let mut options = OperationOptions::new(
            "frontend",
            &files,
            &executor,
            &mut allocator,
            &mut progress,
            &cancel,
        );

        let report = execute_plan(&plan.operations, &mut options).await.unwrap();
        assert_eq!(report.completed.len(), plan.operations.len());
        assert_eq!(
            on_disk(&files).await,
            vec!["1_init:[]", "2_users:[1]", "3_teams:[1]", "4_roles:[3]"]
        );

        reset_plan(&plan.operations, &mut options).await.unwrap();
        assert_eq!(
            on_disk(&files).await,
            vec!["1_init:[]", "2_teams:[1]", "2_users:[1]", "3_roles:[2]"]
        );
        assert_eq!(allocator.peek(), 3);

        let calls = executor.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec!["frontend: to 1", "frontend: up", "frontend: to 2"]
        );
    }

    #[tokio::test]
    async fn test_failure_reports_completed_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let files = MigrationFileManager::new(dir.path());
        write_tree(&files, &[(1, "init"), (2, "users"), (2, "teams")]).await;

        let main = MigrationSet::from_migrations(
            files
                .list_migrations()
                .await
                .unwrap()
                .into_iter()
                .filter(|m| m.name != "teams"),
        );
        let local = MigrationSet::resolve_local(files.list_migrations().await.unwrap(), &main);
        let plan = plan_fixup("frontend", &main, &local, 1).unwrap();

        let executor = RecordingExecutor {
            fail_up: true,
            ..Default::default()
        };
        let mut allocator = plan.allocator();
        let mut progress: Vec<String> = Vec::new();
        let cancel = CancellationToken::new();
        let mut options = OperationOptions::new(
            "frontend",
            &files,
            &executor,
            &mut allocator,
            &mut progress,
            &cancel,
        );

        let err = execute_plan(&plan.operations, &mut options)
            .await
            .unwrap_err();
        match err {
            MigrationError::Execution {
                completed,
                completed_steps,
                step,
                ..
            } => {
                assert_eq!(completed, 1);
                assert!(completed_steps[0].contains("2_teams"));
                assert!(step.contains("latest"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // The renumbering stays in place.
        assert_eq!(
            on_disk(&files).await,
            vec!["1_init:[]", "2_users:[1]", "3_teams:[1]"]
        );
    }

    #[tokio::test]
    async fn test_failed_metadata_rewrite_moves_migration_back() {
        let dir = tempfile::tempdir().unwrap();
        let files = MigrationFileManager::new(dir.path());
        write_tree(&files, &[(1, "init"), (2, "teams")]).await;

        let teams = files
            .list_migrations()
            .await
            .unwrap()
            .into_iter()
            .find(|m| m.name == "teams")
            .unwrap();
        // Metadata that cannot be read back makes the parents rewrite fail.
        let metadata = teams.path.join(crate::definition::METADATA_FILE);
        tokio::fs::remove_file(&metadata).await.unwrap();
        tokio::fs::create_dir(&metadata).await.unwrap();

        let conflict = MigrationConflict {
            id: 2,
            main: Migration::new(2, "users").with_parents([1]),
            local: teams.clone(),
        };
        let operations = vec![Operation::RenumberConflict(conflict)];

        let executor = RecordingExecutor::default();
        let mut allocator = IdAllocator::starting_after(2);
        let mut progress: Vec<String> = Vec::new();
        let cancel = CancellationToken::new();
        let mut options = OperationOptions::new(
            "frontend",
            &files,
            &executor,
            &mut allocator,
            &mut progress,
            &cancel,
        );

        let err = execute_plan(&operations, &mut options).await.unwrap_err();
        assert!(matches!(err, MigrationError::Execution { completed: 0, .. }));
        assert!(options.journal.is_empty());
        drop(options);

        assert!(teams.path.exists());
        assert!(!dir.path().join("3_teams").exists());
        assert_eq!(allocator.peek(), 3);
    }

    #[tokio::test]
    async fn test_database_steps_skipped_when_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let files = MigrationFileManager::new(dir.path());
        write_tree(&files, &[(1, "init")]).await;

        let executor = RecordingExecutor::default();
        let mut allocator = IdAllocator::starting_after(1);
        let mut progress: Vec<String> = Vec::new();
        let cancel = CancellationToken::new();
        let mut options = OperationOptions::new(
            "frontend",
            &files,
            &executor,
            &mut allocator,
            &mut progress,
            &cancel,
        )
        .run_database(false);

        execute_plan(&[Operation::SyncToLatest], &mut options)
            .await
            .unwrap();
        assert!(executor.calls.lock().unwrap().is_empty());
        assert!(progress[0].contains("Skipped"));
    }

    #[tokio::test]
    async fn test_cancelled_plan_stops_before_first_step() {
        let dir = tempfile::tempdir().unwrap();
        let files = MigrationFileManager::new(dir.path());
        let executor = RecordingExecutor::default();
        let mut allocator = IdAllocator::starting_after(1);
        let mut progress: Vec<String> = Vec::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut options = OperationOptions::new(
            "frontend",
            &files,
            &executor,
            &mut allocator,
            &mut progress,
            &cancel,
        );

        let err = execute_plan(&[Operation::SyncToLatest], &mut options)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MigrationError::Execution { completed: 0, .. }
        ));
    }
}
