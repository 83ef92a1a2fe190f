//! CLI argument definitions for Bulkhead.

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

/// Bulkhead - damage containment for agents that modify their own source tree.
///
/// Validate a request with `bh validate`, prove a plan with `bh sandbox`, then
/// land it with `bh apply`. `bh backup emergency-restore` is the last resort.
#[derive(Parser, Debug)]
#[command(name = "bh")]
#[command(author, version = env!("BH_VERSION"), about = "Safe self-modification for autonomous agents", long_about = None)]
pub struct Cli {
    /// Output in human-readable format instead of JSON
    #[arg(short = 'H', long = "human", global = true)]
    pub human_readable: bool,

    /// Run as if bh was started in <path> instead of the current directory.
    /// The path must exist and is used literally, without git root detection.
    #[arg(short = 'C', long = "repo", global = true, env = "BH_REPO")]
    pub repo_path: Option<PathBuf>,

    /// Directory holding transactions, backups and history
    #[arg(long = "data-dir", global = true)]
    pub data_dir: Option<PathBuf>,

    /// Emit diagnostics on stderr as JSON lines
    #[arg(long = "log-json", global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// An improvement request, inline or from a JSON file.
#[derive(Args, Debug, Clone, Serialize)]
pub struct RequestArgs {
    /// Free-text description of the improvement
    pub text: Option<String>,

    /// Read the request (text, scope, constraints) from a JSON file
    #[arg(long = "request-file", conflicts_with = "text")]
    pub request_file: Option<PathBuf>,

    /// Declared scope: specific or general
    #[arg(long)]
    pub scope: Option<String>,

    /// Most files the plan may touch
    #[arg(long)]
    pub max_files: Option<usize>,

    /// Require tests for every modification
    #[arg(long)]
    pub require_tests: bool,

    /// Require public interfaces to stay intact
    #[arg(long)]
    pub preserve_interfaces: bool,
}

/// Top-level commands
#[derive(Subcommand, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Commands {
    /// Decide whether an improvement request may proceed
    Validate {
        #[command(flatten)]
        request: RequestArgs,
    },

    /// Review a modification plan without running it
    Safety {
        /// Plan JSON file
        #[arg(long)]
        plan: PathBuf,

        /// Dependency graph JSON file (target -> dependents)
        #[arg(long)]
        graph: Option<PathBuf>,

        /// Most files the plan may touch
        #[arg(long)]
        max_files: Option<usize>,

        /// Require tests for every modification
        #[arg(long)]
        require_tests: bool,
    },

    /// Run a plan against a disposable copy of the tree
    Sandbox {
        /// Plan JSON file
        #[arg(long)]
        plan: PathBuf,

        /// Test against this backup instead of the working tree
        #[arg(long)]
        backup: Option<String>,
    },

    /// Validate, sandbox and apply a plan in one transaction
    Apply {
        #[command(flatten)]
        request: RequestArgs,

        /// Plan JSON file
        #[arg(long)]
        plan: PathBuf,

        /// Dependency graph JSON file (target -> dependents)
        #[arg(long)]
        graph: Option<PathBuf>,

        /// Take a full backup before touching the tree
        #[arg(long)]
        backup_first: bool,
    },

    /// Transaction management commands
    Tx {
        #[command(subcommand)]
        command: TxCommands,
    },

    /// Backup management commands
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Improvement history commands
    History {
        #[command(subcommand)]
        command: HistoryCommands,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

impl Commands {
    /// Command path used in the action log, e.g. "tx rollback".
    pub fn name(&self) -> String {
        match self {
            Commands::Validate { .. } => "validate".to_string(),
            Commands::Safety { .. } => "safety".to_string(),
            Commands::Sandbox { .. } => "sandbox".to_string(),
            Commands::Apply { .. } => "apply".to_string(),
            Commands::Tx { command } => format!("tx {}", command.name()),
            Commands::Backup { command } => format!("backup {}", command.name()),
            Commands::History { command } => match command {
                HistoryCommands::List { .. } => "history list".to_string(),
                HistoryCommands::Clear => "history clear".to_string(),
            },
            Commands::Config { command } => match command {
                ConfigCommands::Show => "config show".to_string(),
                ConfigCommands::Init { .. } => "config init".to_string(),
            },
        }
    }

    /// Arguments as JSON for the action log.
    pub fn args_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Transaction subcommands
#[derive(Subcommand, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TxCommands {
    /// Start a transaction
    Begin {
        /// What the transaction is for
        #[arg(short, long)]
        description: Option<String>,
    },

    /// Record an operation and perform it
    Apply {
        /// Transaction ID (e.g., tx-a1b2c3d4e5f6)
        id: String,

        /// Operation type: create, update, delete or manifest_update
        #[arg(long = "type")]
        op_type: String,

        /// File path relative to the repository
        #[arg(long)]
        path: String,

        /// New content
        #[arg(long, conflicts_with = "content_file")]
        content: Option<String>,

        /// Read new content from a file
        #[arg(long)]
        content_file: Option<PathBuf>,

        /// Only back up and record; the caller performs the change
        #[arg(long)]
        record_only: bool,
    },

    /// Commit an active transaction
    Commit {
        /// Transaction ID
        id: String,
    },

    /// Undo every recorded operation in reverse order
    Rollback {
        /// Transaction ID
        id: String,

        /// Keep undoing after a failed step
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Show a transaction
    Show {
        /// Transaction ID
        id: String,
    },

    /// List transactions, most recent first
    List {
        /// Show at most this many
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Show the most recent transaction
    Last,

    /// Remove finished transactions past the retention period
    Cleanup {
        /// Retention in days (default from config)
        #[arg(long)]
        days: Option<u32>,
    },
}

impl TxCommands {
    fn name(&self) -> &'static str {
        match self {
            TxCommands::Begin { .. } => "begin",
            TxCommands::Apply { .. } => "apply",
            TxCommands::Commit { .. } => "commit",
            TxCommands::Rollback { .. } => "rollback",
            TxCommands::Show { .. } => "show",
            TxCommands::List { .. } => "list",
            TxCommands::Last => "last",
            TxCommands::Cleanup { .. } => "cleanup",
        }
    }
}

/// Backup subcommands
#[derive(Subcommand, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupCommands {
    /// Snapshot the working tree
    Create {
        /// Human-readable label
        #[arg(short, long)]
        label: Option<String>,

        /// Capture only these files (comma-separated)
        #[arg(long, value_delimiter = ',')]
        files: Option<Vec<String>>,

        /// Metadata as key=value (repeatable)
        #[arg(long = "meta")]
        metadata: Vec<String>,
    },

    /// Restore the working tree from a backup
    Restore {
        /// Backup ID (e.g., bk-a1b2c3d4e5f6)
        id: String,

        /// Report what would change without touching the tree
        #[arg(long)]
        dry_run: bool,
    },

    /// Check an archive against its manifest
    Verify {
        /// Backup ID
        id: String,
    },

    /// List backups, newest first
    List {
        /// Only backups created at or after this time (RFC 3339)
        #[arg(long)]
        since: Option<DateTime<Utc>>,

        /// Only backups created at or before this time (RFC 3339)
        #[arg(long)]
        until: Option<DateTime<Utc>>,

        /// Only backups whose label contains this text
        #[arg(short, long)]
        label: Option<String>,
    },

    /// Delete a backup and its archive
    Delete {
        /// Backup ID
        id: String,
    },

    /// Write a backup to a portable bundle
    Export {
        /// Backup ID
        id: String,

        /// Bundle path
        dest: PathBuf,
    },

    /// Add a bundle written by `bh backup export`
    Import {
        /// Bundle path
        src: PathBuf,
    },

    /// Restore the session's backup, or the newest one
    EmergencyRestore,
}

impl BackupCommands {
    fn name(&self) -> &'static str {
        match self {
            BackupCommands::Create { .. } => "create",
            BackupCommands::Restore { .. } => "restore",
            BackupCommands::Verify { .. } => "verify",
            BackupCommands::List { .. } => "list",
            BackupCommands::Delete { .. } => "delete",
            BackupCommands::Export { .. } => "export",
            BackupCommands::Import { .. } => "import",
            BackupCommands::EmergencyRestore => "emergency-restore",
        }
    }
}

/// History subcommands
#[derive(Subcommand, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryCommands {
    /// List validated requests, most recent first
    List {
        /// Show at most this many
        #[arg(short = 'n', long)]
        limit: Option<usize>,
    },

    /// Forget every recorded request
    Clear,
}

/// Config subcommands
#[derive(Subcommand, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigCommands {
    /// Show resolved settings and where each came from
    Show,

    /// Write the effective settings to <repo>/bulkhead.kdl
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_command_names() {
        let cli = Cli::parse_from(["bh", "tx", "rollback", "tx-0123456789ab", "--continue-on-error"]);
        assert_eq!(cli.command.name(), "tx rollback");

        let cli = Cli::parse_from(["bh", "backup", "emergency-restore"]);
        assert_eq!(cli.command.name(), "backup emergency-restore");
    }

    #[test]
    fn test_args_json_for_action_log() {
        let cli = Cli::parse_from([
            "bh",
            "backup",
            "create",
            "--label",
            "nightly",
            "--files",
            "a.js,b.js",
        ]);
        let args = cli.command.args_json();
        let create = &args["backup"]["command"]["create"];
        assert_eq!(create["label"], "nightly");
        assert_eq!(create["files"], serde_json::json!(["a.js", "b.js"]));
    }

    #[test]
    fn test_request_text_conflicts_with_file() {
        let result = Cli::try_parse_from([
            "bh",
            "validate",
            "Add retry to fetch",
            "--request-file",
            "req.json",
        ]);
        assert!(result.is_err());
    }
}
