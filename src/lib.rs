//! # migraph
//!
//! Dependency-graph tooling for SQL migrations.
//!
//! Migrations live one directory per migration, each naming its parents, so
//! the set of migrations forms a DAG rather than a sequence. migraph provides:
//! - Fixup: after a rebase, renumber local migrations whose IDs collided with
//!   the main branch, rolling the local database back and forth as needed
//! - Squash: replace everything older than a few releases with one root
//!   generated from a real database dump
//! - Graph queries: leaves, dominators, and up/down planning
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use migraph::prelude::*;
//!
//! let cancel = CancellationToken::new();
//! let loader = RevisionLoader::new(Git::new("."), "migrations");
//! let files = loader.file_manager("frontend");
//!
//! let request = FixupRequest {
//!     schema: "frontend",
//!     main_revision: "main",
//!     run_database: false,
//!     dry_run: true,
//! };
//! let outcome = run_fixup(&loader, &files, &executor, &request, &mut Vec::new(), &cancel).await?;
//! for line in &outcome.lines {
//!     println!("{}", line);
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

/// The migration engine.
pub mod migrate {
    pub use migraph_migrate::*;
}

/// Prelude module for convenient imports.
pub mod prelude {
    pub use migraph_migrate::{
        FixupRequest, Git, Migration, MigrationError, MigrationExecutor, MigrationFileManager,
        MigrationGraph, MigrationSet, Revision, RevisionLoader, Squasher, run_fixup,
    };
}

// Re-export key types at the crate root
pub use migraph_migrate::{MigrateResult, MigrationError, MigrationGraph};
