//! # migraph-migrate
//!
//! Engine for maintaining a directory of dependency-ordered SQL migrations.
//!
//! This crate provides functionality for:
//! - Loading per-schema migration graphs from disk or from a historical revision
//! - Reconciling migration IDs that collided across branches ("fixup")
//! - Squashing old migrations into a single root by replaying them into a
//!   disposable database and dumping the result
//! - The collaborator seams the engines drive: a database executor, version
//!   control, shadow database provisioning and schema dumping
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ VCS / disk   │────▶│ Set Loader     │────▶│ Fixup planner    │
//! └──────────────┘     └────────────────┘     └──────────────────┘
//!        │                                             │
//!        ▼                                             ▼
//! ┌──────────────┐     ┌────────────────┐     ┌──────────────────┐
//! │ Graph Store  │────▶│ Squash engine  │     │ Operation runner │
//! └──────────────┘     └────────────────┘     └──────────────────┘
//!                         │          │                 │
//!                         ▼          ▼                 ▼
//!                  ┌──────────┐ ┌─────────┐    ┌──────────────┐
//!                  │ Shadow DB│ │ pg_dump │    │ DB executor  │
//!                  └──────────┘ └─────────┘    └──────────────┘
//! ```
//!
//! ## Migration Files
//!
//! Each schema keeps one directory per migration:
//!
//! ```text
//! migrations/frontend/
//! ├── 1_init/
//! │   ├── up.sql
//! │   ├── down.sql
//! │   └── metadata.toml     # name, parents, privileged, non_idempotent
//! └── 2_add_users/
//!     └── ...
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use migraph_migrate::{Git, MigrationSet, RevisionLoader, Revision, plan_fixup};
//!
//! let loader = RevisionLoader::new(Git::new("."), "migrations");
//! let main = loader.load_at("frontend", &Revision::reference("main"), &cancel).await?;
//! let local = loader.load_at("frontend", &Revision::WorkingTree, &cancel).await?;
//!
//! let plan = plan_fixup("frontend", &main, &local, current_version)?;
//! for line in render_plan(&plan.operations, &plan.allocator()) {
//!     println!("{}", line);
//! }
//! ```

pub mod command;
pub mod definition;
pub mod dump;
pub mod error;
pub mod executor;
pub mod file;
pub mod fixup;
pub mod graph;
pub mod loader;
pub mod set;
pub mod shadow;
pub mod squash;
pub mod vcs;

// Re-exports
pub use definition::{Metadata, Migration, MigrationId, hidden_path, sanitize_name};
pub use dump::{DumpOptions, PgDump, SchemaDumper, sanitize_dump, split_privileged};
pub use error::{ErrorKind, MigrateResult, MigrationError};
pub use executor::{ExecutorFactory, MigrationExecutor, MigrationRecord, allow_no_change};
pub use file::MigrationFileManager;
pub use fixup::{
    FixupOutcome, FixupPlan, FixupRequest, IdAllocator, Operation, OperationOptions, PlanLine,
    PlanReport, ProgressSink, execute_plan, plan_fixup, render_plan, reset_plan, run_fixup,
};
pub use graph::{MigrationGraph, MigrationSteps};
pub use loader::{MigrationSetLoader, Revision, RevisionLoader};
pub use set::{MigrationConflict, MigrationSet, find_conflicting_migrations, find_missing_migrations};
pub use shadow::{
    DatabaseProvisioner, DockerProvisioner, LocalProvisioner, ShadowConfig, ShadowDatabase,
    ShadowState,
};
pub use squash::{
    SquashReport, SquashedMigrations, Squasher, apply_squash, select_new_root,
    squash_target_revision,
};
pub use vcs::{Git, VersionControl};
