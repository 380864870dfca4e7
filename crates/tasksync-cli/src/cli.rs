use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use tasksync_core::models::SyncStatus;
use tasksync_core::EntityKind;

use crate::commands::common::{parse_assignment, parse_date};

#[derive(Parser)]
#[command(name = "tasksync")]
#[command(about = "Local-first tasks, projects, time entries and notes, synced with a remote task service")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a record
    #[command(alias = "new")]
    Add {
        /// task, project, time-entry or note
        kind: EntityKind,
        /// Title (or name/description, depending on the kind)
        title: Vec<String>,
        /// Extra field as key=value; values parse as JSON when they can
        #[arg(short, long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
        set: Vec<(String, Value)>,
    },
    /// Edit a record; opens $EDITOR when no field is given
    Edit {
        kind: EntityKind,
        /// Record ID or unique ID prefix
        id: String,
        /// Field to change as key=value
        #[arg(short, long = "set", value_name = "KEY=VALUE", value_parser = parse_assignment)]
        set: Vec<(String, Value)>,
        /// Field to clear
        #[arg(long, value_name = "KEY")]
        unset: Vec<String>,
    },
    /// Move a record to the trash
    Delete {
        kind: EntityKind,
        /// Record ID or unique ID prefix
        id: String,
    },
    /// Bring a record back from the trash
    Restore {
        kind: EntityKind,
        /// Record ID or unique ID prefix
        id: String,
    },
    /// Permanently remove a trashed record
    Purge {
        kind: EntityKind,
        /// Record ID or unique ID prefix
        id: String,
    },
    /// List records
    List {
        kind: EntityKind,
        #[command(flatten)]
        filter: ListArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run one sync cycle now
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
}

#[derive(Args, Debug)]
pub struct ListArgs {
    /// Number of records to show
    #[arg(short, long, default_value = "20")]
    pub limit: usize,
    /// Number of records to skip
    #[arg(long, default_value = "0")]
    pub offset: usize,
    /// Workflow status, e.g. todo or done
    #[arg(long)]
    pub status: Option<String>,
    /// local, pending, synced or trashed
    #[arg(long)]
    pub sync_status: Option<SyncStatus>,
    /// Earliest date (YYYY-MM-DD or RFC 3339), inclusive
    #[arg(long, value_parser = parse_date)]
    pub from: Option<i64>,
    /// Latest date (YYYY-MM-DD or RFC 3339), exclusive
    #[arg(long, value_parser = parse_date)]
    pub to: Option<i64>,
    /// Match the kind's flag field (completed, archived, billable, pinned)
    #[arg(long)]
    pub flag: Option<bool>,
    /// Remote ID of the related project or task
    #[arg(long, value_name = "REMOTE_ID")]
    pub related_to: Option<String>,
    /// Include trashed records
    #[arg(long)]
    pub trashed: bool,
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Keep syncing on the poll interval until interrupted
    Run,
    /// Show pending changes and import progress
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List queued local changes
    Outbox {
        /// Number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List changes abandoned after repeated push failures
    Failures {
        /// Number of entries to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget import and pull progress so the next cycle re-imports everything
    ResetImport,
}
