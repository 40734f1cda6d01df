//! `migraph migration` commands - migration graph maintenance.

use serde::Serialize;

use migraph_migrate::{
    DatabaseProvisioner, DockerProvisioner, FixupRequest, LocalProvisioner, MigrationExecutor,
    MigrationId, PgDump, PlanLine, ProgressSink, Squasher, run_fixup, squash_target_revision,
};

use crate::cli::{
    AddArgs, DownArgs, FixupArgs, LeavesArgs, MigrationArgs, MigrationSubcommand, SquashArgs,
    UpArgs,
};
use crate::commands::Context;
use crate::config::SchemaConfig;
use crate::database::{self, OfflineExecutor};
use crate::error::CliResult;
use crate::output::{self, kv, success};

/// Run the migration command
pub async fn run(args: MigrationArgs, ctx: &Context) -> CliResult<()> {
    match args.command {
        MigrationSubcommand::Add(args) => run_add(args, ctx).await,
        MigrationSubcommand::Up(args) => run_up(args, ctx).await,
        MigrationSubcommand::Down(args) => run_down(args, ctx).await,
        MigrationSubcommand::Squash(args) => run_squash(args, ctx).await,
        MigrationSubcommand::Fixup(args) => run_fixup_command(args, ctx).await,
        MigrationSubcommand::Leaves(args) => run_leaves(args, ctx).await,
    }
}

/// Run `migraph migration add`
async fn run_add(args: AddArgs, ctx: &Context) -> CliResult<()> {
    let schema = ctx.config.schema(&args.db)?;
    let files = ctx.files(schema);

    let migration = files.create_migration(&args.name).await?;

    output::header("Add Migration");
    kv("Schema", &schema.name);
    kv("Migration", &migration.label());
    kv("Parents", &join_ids(&migration.parents));
    output::newline();
    success(&format!("Created {}", migration.path.display()));

    Ok(())
}

/// Run `migraph migration up`
async fn run_up(args: UpArgs, ctx: &Context) -> CliResult<()> {
    let schema = ctx.config.schema(&args.db)?;
    let url = ctx.config.database_url(schema, args.connection.url.as_deref())?;

    output::header("Migrate Up");
    kv("Schema", &schema.name);

    let executor = database::connect(&url, ctx.files(schema)).await?;
    match executor.apply_next(&schema.name, args.count).await {
        Ok(applied) => success(&format!("Applied {} migration(s)", applied)),
        Err(e) if e.is_no_change() => output::info("Database is already up to date"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

/// Run `migraph migration down`
async fn run_down(args: DownArgs, ctx: &Context) -> CliResult<()> {
    let schema = ctx.config.schema(&args.db)?;
    let url = ctx.config.database_url(schema, args.connection.url.as_deref())?;

    output::header("Migrate Down");
    kv("Schema", &schema.name);

    let executor = database::connect(&url, ctx.files(schema)).await?;
    match executor.revert_last(&schema.name, args.count).await {
        Ok(reverted) => success(&format!("Reverted {} migration(s)", reverted)),
        Err(e) if e.is_no_change() => output::info("No applied migrations to revert"),
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

/// Run `migraph migration squash`
async fn run_squash(args: SquashArgs, ctx: &Context) -> CliResult<()> {
    let schema = ctx.config.schema(&args.db)?;
    let settings = &ctx.config.squash;
    let revision = squash_target_revision(&args.current_release, settings.distance)?;

    output::header("Squash Migrations");
    kv("Schema", &schema.name);
    kv("Current release", &args.current_release);
    kv("Squashing up to", &revision);
    kv(
        "Database",
        if args.local {
            "local server"
        } else {
            settings.image.as_str()
        },
    );
    output::newline();

    let files = ctx.files(schema);
    let provisioner: Box<dyn DatabaseProvisioner> = if args.local {
        Box::new(LocalProvisioner::new(settings.shadow_config()))
    } else {
        Box::new(DockerProvisioner::new(settings.shadow_config()))
    };
    let executors = database::factory(files.clone())?;
    let options = schema.dump_options(args.skip_data || settings.skip_data);

    let squasher = Squasher::new(provisioner.as_ref(), &PgDump, executors.as_ref(), options);
    let report = squasher
        .run(&schema.name, &ctx.loader(), &files, &revision, &ctx.cancel)
        .await?;

    kv("New root", &report.root.to_string());
    if let Some(privileged) = report.privileged {
        kv("Privileged root", &privileged.to_string());
    }
    kv("Removed", &format!("{} migration(s)", report.deleted.len()));
    for path in &report.written {
        output::list_item(&path.display().to_string());
    }
    output::newline();
    success(&format!("Squashed {} migrations up to {}", schema.name, revision));

    Ok(())
}

/// Prints progress lines as list items.
struct TerminalProgress;

impl ProgressSink for TerminalProgress {
    fn line(&mut self, line: String) {
        output::list_item(&line);
    }
}

/// JSON rendering of one schema's fixup.
#[derive(Debug, Serialize)]
struct FixupSummary {
    schema: String,
    conflicts: Vec<MigrationId>,
    branch_changes: Vec<MigrationId>,
    should_change_db: bool,
    dry_run: bool,
    steps: Vec<PlanLine>,
    executed: Option<Vec<String>>,
    log: Vec<String>,
}

/// Run `migraph migration fixup`
async fn run_fixup_command(args: FixupArgs, ctx: &Context) -> CliResult<()> {
    let schemas: Vec<&SchemaConfig> = if args.db == "all" {
        ctx.config.schemas.iter().collect()
    } else {
        vec![ctx.config.schema(&args.db)?]
    };
    let loader = ctx.loader();
    let mut summaries = Vec::new();

    for schema in schemas {
        let files = ctx.files(schema);
        let executor: Box<dyn MigrationExecutor> = if args.run {
            let url = ctx.config.database_url(schema, args.connection.url.as_deref())?;
            Box::new(database::connect(&url, files.clone()).await?)
        } else {
            Box::new(OfflineExecutor)
        };

        let request = FixupRequest {
            schema: &schema.name,
            main_revision: &args.main,
            run_database: args.run,
            dry_run: args.dry_run,
        };

        if args.json {
            let mut log: Vec<String> = Vec::new();
            let outcome = run_fixup(
                &loader,
                &files,
                executor.as_ref(),
                &request,
                &mut log,
                &ctx.cancel,
            )
            .await?;
            summaries.push(FixupSummary {
                schema: schema.name.clone(),
                conflicts: outcome.plan.conflicts.iter().map(|c| c.id).collect(),
                branch_changes: outcome.branch_changes,
                should_change_db: outcome.plan.should_change_db,
                dry_run: args.dry_run,
                steps: outcome.lines,
                executed: outcome.report.map(|r| r.completed),
                log,
            });
            continue;
        }

        output::header(&format!("Fixup {}", schema.name));
        let outcome = run_fixup(
            &loader,
            &files,
            executor.as_ref(),
            &request,
            &mut TerminalProgress,
            &ctx.cancel,
        )
        .await?;

        kv("Changed on branch", &join_ids(&outcome.branch_changes));

        if outcome.plan.is_empty() {
            success(&format!("{} has no conflicts with {}", schema.name, args.main));
            continue;
        }

        output::section("Steps");
        let total = outcome.lines.len();
        for line in &outcome.lines {
            output::step(line.step, total, &line.to_string());
        }
        output::newline();

        if outcome.report.is_none() {
            output::dim("Dry run: nothing was changed");
        } else {
            success(&format!(
                "Fixed up {} conflict(s) in {}",
                outcome.plan.conflicts.len(),
                schema.name
            ));
        }
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
    }

    Ok(())
}

/// Run `migraph migration leaves`
async fn run_leaves(args: LeavesArgs, ctx: &Context) -> CliResult<()> {
    let schema = ctx.config.schema(&args.db)?;
    let graph = ctx.files(schema).load_graph().await?;

    output::header(&format!("Leaves of {}", schema.name));
    if graph.is_empty() {
        output::info("No migrations defined");
        return Ok(());
    }

    for leaf in graph.leaves() {
        output::list_item(&leaf.label());
    }
    output::newline();

    match graph.leaf_dominator(&[]) {
        Some(dominator) => kv("Dominator", &dominator.label()),
        None => output::warn("The leaves share no single dominator"),
    }

    Ok(())
}

fn join_ids(ids: &[MigrationId]) -> String {
    if ids.is_empty() {
        return "none".to_string();
    }
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_ids() {
        assert_eq!(join_ids(&[]), "none");
        assert_eq!(join_ids(&[3, 7]), "3, 7");
    }

    #[test]
    fn test_summary_serializes_plan_lines() {
        let summary = FixupSummary {
            schema: "frontend".to_string(),
            conflicts: vec![3],
            branch_changes: vec![3, 4],
            should_change_db: false,
            dry_run: true,
            steps: vec![PlanLine {
                step: 1,
                kind: "renumber_conflict",
                id: Some(3),
                new_id: Some(5),
                description: "Renumber 3_local".to_string(),
            }],
            executed: None,
            log: Vec::new(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["steps"][0]["new_id"], 5);
        assert_eq!(json["conflicts"][0], 3);
        assert_eq!(json["branch_changes"][1], 4);
        assert!(json["executed"].is_null());
    }
}
