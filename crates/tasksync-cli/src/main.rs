//! tasksync CLI - local-first records from the terminal
//!
//! Every command works offline against the local database; `sync` talks to
//! the remote task service.

mod cli;
mod commands;
mod error;

use clap::Parser;
use tasksync_core::config::EngineConfig;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::add::run_add;
use crate::commands::common::resolve_db_path;
use crate::commands::delete::{run_delete, run_purge, run_restore};
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::sync::{
    run_sync, run_sync_conflicts, run_sync_daemon, run_sync_failures, run_sync_outbox,
    run_sync_reset_import, run_sync_status,
};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "tasksync=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let db_path = resolve_db_path(cli.db_path);

    match cli.command {
        Commands::Add { kind, title, set } => run_add(kind, &title, &set, &db_path).await?,
        Commands::Edit {
            kind,
            id,
            set,
            unset,
        } => run_edit(kind, &id, &set, &unset, &db_path).await?,
        Commands::Delete { kind, id } => run_delete(kind, &id, &db_path).await?,
        Commands::Restore { kind, id } => run_restore(kind, &id, &db_path).await?,
        Commands::Purge { kind, id } => run_purge(kind, &id, &db_path).await?,
        Commands::List { kind, filter, json } => run_list(kind, &filter, json, &db_path).await?,
        Commands::Sync { command } => match command {
            None => run_sync(&db_path, EngineConfig::from_env()?).await?,
            Some(SyncCommands::Run) => run_sync_daemon(&db_path, EngineConfig::from_env()?).await?,
            Some(SyncCommands::Status { json }) => run_sync_status(json, &db_path).await?,
            Some(SyncCommands::Outbox { limit, json }) => {
                run_sync_outbox(limit, json, &db_path).await?;
            }
            Some(SyncCommands::Conflicts { limit, json }) => {
                run_sync_conflicts(limit, json, &db_path).await?;
            }
            Some(SyncCommands::Failures { limit, json }) => {
                run_sync_failures(limit, json, &db_path).await?;
            }
            Some(SyncCommands::ResetImport) => run_sync_reset_import(&db_path).await?,
        },
    }

    Ok(())
}
