//! migraph CLI - dependency-graph tooling for SQL migrations.

use clap::Parser;
use tokio_util::sync::CancellationToken;

use migraph_cli::cli::{Cli, Command};
use migraph_cli::commands::{self, Context};
use migraph_cli::config::Config;
use migraph_cli::error::CliResult;
use migraph_cli::{logging, output};

#[tokio::main]
async fn main() {
    // Run the CLI and handle errors
    if let Err(e) = run().await {
        output::newline();
        output::error(&e.to_string());
        let completed = e.completed_steps();
        if !completed.is_empty() {
            eprintln!("  Completed before the failure:");
            for step in completed {
                eprintln!("    - {}", step);
            }
        }
        if let Some(hint) = e.hint() {
            output::hint(hint);
        }
        std::process::exit(1);
    }
}

async fn run() -> CliResult<()> {
    // Parse CLI arguments
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    // Run the appropriate command
    match cli.command {
        Command::Migration(args) => {
            let config = Config::load_or_default(&cli.config)?;
            let root = std::env::current_dir()?;
            let ctx = Context::new(config, root, cancel);
            commands::migration::run(args, &ctx).await
        }
        Command::Version => commands::version::run().await,
    }
}
