//! CLI argument definitions using clap.

use clap::{ArgAction, Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::CONFIG_FILE_NAME;

/// migraph - dependency-graph tooling for SQL migrations
#[derive(Parser, Debug)]
#[command(name = "migraph")]
#[command(version)]
#[command(about = "migraph - dependency-graph tooling for SQL migrations", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, global = true, default_value = CONFIG_FILE_NAME)]
    pub config: PathBuf,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Migration graph maintenance commands
    Migration(MigrationArgs),

    /// Display version information
    Version,
}

// =============================================================================
// Migration Command
// =============================================================================

/// Arguments for the `migration` command
#[derive(Args, Debug)]
pub struct MigrationArgs {
    /// Migration subcommand
    #[command(subcommand)]
    pub command: MigrationSubcommand,
}

/// Migration subcommands
#[derive(Subcommand, Debug)]
pub enum MigrationSubcommand {
    /// Add a new migration after the current leaves
    Add(AddArgs),

    /// Apply pending migrations
    Up(UpArgs),

    /// Revert applied migrations
    Down(DownArgs),

    /// Collapse migrations older than a few releases into one
    Squash(SquashArgs),

    /// Renumber migrations that collide with the main branch
    Fixup(FixupArgs),

    /// Show the current leaves and their dominator
    Leaves(LeavesArgs),
}

/// Database connection override shared by commands touching a database
#[derive(Args, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Database URL (overrides the configuration)
    #[arg(long, env = "MIGRAPH_DATABASE_URL")]
    pub url: Option<String>,
}

/// Arguments for `migration add`
#[derive(Args, Debug)]
pub struct AddArgs {
    /// Schema to add the migration to
    #[arg(long, default_value = "frontend")]
    pub db: String,

    /// Human readable migration name
    pub name: String,
}

/// Arguments for `migration up`
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Schema to migrate
    #[arg(long, default_value = "frontend")]
    pub db: String,

    /// Only apply the next N migrations
    #[arg(short = 'n')]
    pub count: Option<usize>,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `migration down`
#[derive(Args, Debug)]
pub struct DownArgs {
    /// Schema to migrate
    #[arg(long, default_value = "frontend")]
    pub db: String,

    /// Number of migrations to revert
    #[arg(short = 'n', default_value_t = 1)]
    pub count: usize,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `migration squash`
#[derive(Args, Debug)]
pub struct SquashArgs {
    /// Schema to squash
    #[arg(long, default_value = "frontend")]
    pub db: String,

    /// Only dump the schema, not the configured data tables
    #[arg(long)]
    pub skip_data: bool,

    /// Create the scratch database on a local server instead of in Docker
    #[arg(long)]
    pub local: bool,

    /// Current release, e.g. v5.3.0
    pub current_release: String,
}

/// Arguments for `migration fixup`
#[derive(Args, Debug)]
pub struct FixupArgs {
    /// Schema to fix up, or `all`
    #[arg(long, default_value = "all")]
    pub db: String,

    /// Revision holding the main branch's migrations
    #[arg(long, default_value = "main")]
    pub main: String,

    /// Roll the local database back and forth as needed
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub run: bool,

    /// Only print the plan
    #[arg(long)]
    pub dry_run: bool,

    /// Print the plan as JSON
    #[arg(long)]
    pub json: bool,

    #[command(flatten)]
    pub connection: ConnectionArgs,
}

/// Arguments for `migration leaves`
#[derive(Args, Debug)]
pub struct LeavesArgs {
    /// Schema to inspect
    #[arg(long, default_value = "frontend")]
    pub db: String,
}
