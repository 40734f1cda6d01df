//! Extracting and cleaning up `pg_dump` output.

use std::sync::LazyLock;

use regex_lite::Regex;
use tokio_util::sync::CancellationToken;

use crate::command;
use crate::error::{MigrateResult, MigrationError};
use crate::shadow::ShadowDatabase;

/// Lines starting with any of these are dropped from dumps.
const REMOVED_PREFIXES: &[&str] = &[
    "--",
    "SET ",
    "SELECT pg_catalog.set_config('search_path'",
];

/// Statements needing elevated privileges.
const PRIVILEGED_PREFIXES: &[&str] = &["CREATE EXTENSION", "COMMENT ON EXTENSION"];

static PUBLIC_QUALIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bpublic\.").expect("valid regex"));

static BLANK_RUNS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

/// Produces raw SQL dumps of a shadow database.
#[async_trait::async_trait]
pub trait SchemaDumper: Send + Sync {
    /// Dump `database` with extra `pg_dump` flags.
    async fn dump(
        &self,
        database: &ShadowDatabase,
        flags: &[String],
        cancel: &CancellationToken,
    ) -> MigrateResult<String>;
}

/// [`SchemaDumper`] backed by the `pg_dump` binary.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDump;

#[async_trait::async_trait]
impl SchemaDumper for PgDump {
    async fn dump(
        &self,
        database: &ShadowDatabase,
        flags: &[String],
        cancel: &CancellationToken,
    ) -> MigrateResult<String> {
        let (program, mut args) = database.client_command("pg_dump");
        args.extend(flags.iter().cloned());
        let output = command::run(&program, &args, &[], cancel).await?;
        Ok(output.stdout)
    }
}

/// What goes into a squashed migration besides the schema.
#[derive(Debug, Clone)]
pub struct DumpOptions {
    /// Tables whose rows are dumped as `INSERT` statements.
    pub data_tables: Vec<String>,
    /// Tables seeded with a single zero row.
    pub count_tables: Vec<String>,
    /// Dump the schema only.
    pub skip_data: bool,
    /// `--exclude-table` pattern for bookkeeping tables.
    pub exclude_table: String,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            data_tables: Vec::new(),
            count_tables: Vec::new(),
            skip_data: false,
            exclude_table: "*migration_logs".to_string(),
        }
    }
}

/// Dump the schema (and configured data) of `database` and sanitize it.
pub async fn dump_database(
    dumper: &dyn SchemaDumper,
    database: &ShadowDatabase,
    options: &DumpOptions,
    cancel: &CancellationToken,
) -> MigrateResult<String> {
    let schema_flags = vec![
        "--schema-only".to_string(),
        "--no-owner".to_string(),
        format!("--exclude-table={}", options.exclude_table),
    ];
    let schema = dumper.dump(database, &schema_flags, cancel).await?;
    if schema.trim().is_empty() {
        return Err(MigrationError::InvalidMigration(format!(
            "schema-only dump of {} is empty",
            database.name()
        )));
    }

    let mut contents = vec![schema];

    if !options.skip_data {
        for table in &options.data_tables {
            let flags = vec![
                "--data-only".to_string(),
                "--inserts".to_string(),
                format!("--table={}", table),
            ];
            tracing::debug!(table = %table, "Dumping table data");
            contents.push(dumper.dump(database, &flags, cancel).await?);
        }
    }

    for table in &options.count_tables {
        contents.push(format!("INSERT INTO {} VALUES (0);\n", table));
    }

    Ok(sanitize_dump(&contents.join("\n")))
}

/// Strip comments, settings and the default schema qualifier from a dump,
/// and collapse runs of blank lines into one.
pub fn sanitize_dump(dump: &str) -> String {
    let kept: Vec<&str> = dump
        .lines()
        .filter(|line| {
            !REMOVED_PREFIXES
                .iter()
                .any(|prefix| line.trim_start().starts_with(prefix))
        })
        .map(str::trim_end)
        .collect();

    let joined = PUBLIC_QUALIFIER.replace_all(&kept.join("\n"), "").into_owned();
    let collapsed = BLANK_RUNS.replace_all(&joined, "\n\n").into_owned();
    format!("{}\n", collapsed.trim())
}

/// Split privileged statements out of a sanitized dump.
///
/// Returns `(unprivileged, privileged)`; the privileged part is empty when
/// there are no such statements.
pub fn split_privileged(dump: &str) -> (String, String) {
    let mut unprivileged = Vec::new();
    let mut privileged = Vec::new();

    for line in dump.lines() {
        if PRIVILEGED_PREFIXES
            .iter()
            .any(|prefix| line.starts_with(prefix))
        {
            privileged.push(line);
        } else {
            unprivileged.push(line);
        }
    }

    let unprivileged = BLANK_RUNS
        .replace_all(&unprivileged.join("\n"), "\n\n")
        .trim()
        .to_string();
    let privileged = privileged.join("\n");

    (
        if unprivileged.is_empty() {
            unprivileged
        } else {
            format!("{}\n", unprivileged)
        },
        if privileged.is_empty() {
            privileged
        } else {
            format!("{}\n", privileged)
        },
    )
}
