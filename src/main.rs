//! Bulkhead CLI - safe self-modification for autonomous agents.

use bulkhead::action_log::ActionLogger;
use bulkhead::cli::{
    BackupCommands, Cli, Commands, ConfigCommands, HistoryCommands, RequestArgs, TxCommands,
};
use bulkhead::commands::{self, CommandResult, Context, RequestInput};
use bulkhead::config::{ConfigOverrides, resolve_config};
use bulkhead::models::Constraints;
use bulkhead::process::CancelToken;
use bulkhead::storage::find_git_root;
use clap::Parser;
use std::env;
use std::path::PathBuf;
use std::process;
use std::time::Instant;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the diagnostics filter.
const LOG_ENV: &str = "BH_LOG";

/// Exit status when a command ran but did not reach its goal.
const EXIT_NOT_ACHIEVED: i32 = 2;

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;
    init_tracing(cli.log_json);

    let repo_path = resolve_repo_path(cli.repo_path, human);

    let cancel = CancelToken::new();
    let handler_token = cancel.clone();
    // First ctrl-c lets a running sandbox wind down and clean up; a second one exits.
    let handler = move || {
        if handler_token.is_cancelled() {
            process::exit(130);
        }
        handler_token.cancel();
    };
    if let Err(e) = ctrlc::set_handler(handler) {
        warn!(error = %e, "could not install ctrl-c handler");
    }

    let mut overrides = ConfigOverrides::new();
    if let Some(dir) = cli.data_dir {
        overrides = overrides.with_data_dir(dir);
    }
    let config = match resolve_config(&repo_path, &overrides) {
        Ok(config) => config,
        Err(e) => fail(&e.to_string(), human),
    };
    let log_path = config.data().action_log_path();
    let log_enabled = config.action_log_enabled.value;
    let ctx = Context::new(&repo_path, config, cancel);

    let cmd_name = cli.command.name();
    let args_json = cli.command.args_json();

    let start = Instant::now();
    let result = run_command(cli.command, &ctx, human);
    let duration = start.elapsed().as_millis() as u64;

    let logged = match &result {
        Ok(_) => Ok(()),
        Err(e) => Err(e.to_string()),
    };
    ActionLogger::new(&log_path, log_enabled).record(&repo_path, &cmd_name, args_json, logged, duration);

    match result {
        Ok(true) => {}
        Ok(false) => process::exit(EXIT_NOT_ACHIEVED),
        Err(e) => fail(&e.to_string(), human),
    }
}

/// Diagnostics go to stderr so stdout stays machine-readable.
fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("Warning: failed to initialise logging: {}", e);
    }
}

fn fail(message: &str, human: bool) -> ! {
    if human {
        eprintln!("Error: {}", message);
    } else {
        eprintln!("{}", serde_json::json!({ "error": message }));
    }
    process::exit(1);
}

/// Resolve the repository path.
///
/// Priority: --repo flag > BH_REPO env var > git root detection > current working directory.
/// An explicit path is used literally so a subdirectory of a git checkout can be targeted.
fn resolve_repo_path(explicit_path: Option<PathBuf>, human: bool) -> PathBuf {
    match explicit_path {
        Some(path) => {
            if !path.is_dir() {
                fail(
                    &format!("Specified repo path does not exist: {}", path.display()),
                    human,
                );
            }
            path
        }
        None => {
            let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            find_git_root(&cwd).unwrap_or(cwd)
        }
    }
}

fn request_input(args: RequestArgs) -> RequestInput {
    RequestInput {
        text: args.text,
        file: args.request_file,
        scope: args.scope,
        max_files: args.max_files,
        require_tests: args.require_tests,
        preserve_interfaces: args.preserve_interfaces,
    }
}

/// Print the result and report whether it reached its goal.
fn output<T: CommandResult>(result: &T, human: bool) -> bool {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
    result.success()
}

fn run_command(command: Commands, ctx: &Context, human: bool) -> Result<bool, bulkhead::Error> {
    let achieved = match command {
        Commands::Validate { request } => {
            let request = commands::build_request(&request_input(request))?;
            output(&commands::validate(ctx, &request)?, human)
        }
        Commands::Safety {
            plan,
            graph,
            max_files,
            require_tests,
        } => {
            let constraints = Constraints {
                max_files,
                require_tests: require_tests.then_some(true),
                preserve_interfaces: None,
            };
            output(
                &commands::safety(ctx, &plan, graph.as_deref(), &constraints)?,
                human,
            )
        }
        Commands::Sandbox { plan, backup } => {
            output(&commands::sandbox(ctx, &plan, backup.as_deref())?, human)
        }
        Commands::Apply {
            request,
            plan,
            graph,
            backup_first,
        } => {
            let request = commands::build_request(&request_input(request))?;
            output(
                &commands::apply(ctx, &request, &plan, graph.as_deref(), backup_first)?,
                human,
            )
        }
        Commands::Tx { command } => run_tx(command, ctx, human)?,
        Commands::Backup { command } => run_backup(command, ctx, human)?,
        Commands::History { command } => match command {
            HistoryCommands::List { limit } => output(&commands::history_list(ctx, limit)?, human),
            HistoryCommands::Clear => output(&commands::history_clear(ctx)?, human),
        },
        Commands::Config { command } => match command {
            ConfigCommands::Show => output(&commands::config_show(ctx)?, human),
            ConfigCommands::Init { force } => output(&commands::config_init(ctx, force)?, human),
        },
    };
    Ok(achieved)
}

fn run_tx(command: TxCommands, ctx: &Context, human: bool) -> Result<bool, bulkhead::Error> {
    Ok(match command {
        TxCommands::Begin { description } => output(&commands::tx_begin(ctx, description)?, human),
        TxCommands::Apply {
            id,
            op_type,
            path,
            content,
            content_file,
            record_only,
        } => output(
            &commands::tx_apply(
                ctx,
                &id,
                &op_type,
                &path,
                content,
                content_file.as_deref(),
                record_only,
            )?,
            human,
        ),
        TxCommands::Commit { id } => output(&commands::tx_commit(ctx, &id)?, human),
        TxCommands::Rollback {
            id,
            continue_on_error,
        } => output(&commands::tx_rollback(ctx, &id, continue_on_error)?, human),
        TxCommands::Show { id } => output(&commands::tx_show(ctx, &id)?, human),
        TxCommands::List { limit } => output(&commands::tx_list(ctx, limit)?, human),
        TxCommands::Last => output(&commands::tx_last(ctx)?, human),
        TxCommands::Cleanup { days } => output(&commands::tx_cleanup(ctx, days)?, human),
    })
}

fn run_backup(
    command: BackupCommands,
    ctx: &Context,
    human: bool,
) -> Result<bool, bulkhead::Error> {
    Ok(match command {
        BackupCommands::Create {
            label,
            files,
            metadata,
        } => output(&commands::backup_create(ctx, label, files, &metadata)?, human),
        BackupCommands::Restore { id, dry_run } => {
            output(&commands::backup_restore(ctx, &id, dry_run)?, human)
        }
        BackupCommands::Verify { id } => output(&commands::backup_verify(ctx, &id)?, human),
        BackupCommands::List {
            since,
            until,
            label,
        } => output(&commands::backup_list(ctx, since, until, label)?, human),
        BackupCommands::Delete { id } => output(&commands::backup_delete(ctx, &id)?, human),
        BackupCommands::Export { id, dest } => {
            output(&commands::backup_export(ctx, &id, &dest)?, human)
        }
        BackupCommands::Import { src } => output(&commands::backup_import(ctx, &src)?, human),
        BackupCommands::EmergencyRestore => {
            output(&commands::backup_emergency_restore(ctx)?, human)
        }
    })
}
