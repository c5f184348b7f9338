#![forbid(unsafe_code)]

mod cmd;
mod identity;
mod output;

use clap::{Parser, Subcommand};
use output::{CliError, OutputMode};
use std::env;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "tally: multi-tenant operational ledger",
    long_about = None
)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output format.
    #[arg(long, global = true, value_enum)]
    format: Option<OutputMode>,

    /// Shorthand for `--format json`.
    #[arg(long, global = true)]
    json: bool,

    /// Acting caller id (overrides `TALLY_USER`).
    #[arg(long = "as", global = true, value_name = "CALLER_ID")]
    as_caller: Option<String>,

    /// Tenant to operate on (overrides `TALLY_TENANT`).
    #[arg(long, global = true)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(
        next_help_heading = "Setup",
        about = "Initialize a tally project",
        after_help = "EXAMPLES:\n    tally init"
    )]
    Init(cmd::init::InitArgs),

    #[command(
        next_help_heading = "Setup",
        about = "Show the effective configuration"
    )]
    Config(cmd::config::ConfigArgs),

    #[command(
        next_help_heading = "Sequences",
        about = "Allocate the next number of a counter",
        after_help = "EXAMPLES:\n    # Next job number\n    tally allocate jobNumber\n\n    # Next cost ordinal within a job\n    tally allocate costs.ordinalNumber --scope d-1a2b3c"
    )]
    Allocate(cmd::allocate::AllocateArgs),

    #[command(
        next_help_heading = "Documents",
        about = "Create a document",
        after_help = "EXAMPLES:\n    tally create jobs --data '{\"title\":\"Kitchen\"}'\n\n    # As a disconnected client would (number backfilled after commit)\n    tally create jobs --offline --data '{\"title\":\"Deck\"}'"
    )]
    Create(cmd::create::CreateArgs),

    #[command(next_help_heading = "Documents", about = "Replace a document's fields")]
    Update(cmd::update::UpdateArgs),

    #[command(
        next_help_heading = "Documents",
        about = "Delete a document (jobs are archived)"
    )]
    Delete(cmd::update::DeleteArgs),

    #[command(next_help_heading = "Documents", about = "Show one document")]
    Show(cmd::show::ShowArgs),

    #[command(next_help_heading = "Documents", about = "List a collection")]
    List(cmd::show::ListArgs),

    #[command(
        next_help_heading = "Audit",
        about = "Query the audit trail",
        after_help = "EXAMPLES:\n    tally audit --collection costs --op delete --since 2024-02-01"
    )]
    Audit(cmd::audit::AuditArgs),

    #[command(next_help_heading = "Audit", about = "Purge expired audit snapshots")]
    Sweep(cmd::sweep::SweepArgs),

    #[command(
        next_help_heading = "Offline",
        about = "Queue a local write for the next sync",
        after_help = "EXAMPLES:\n    tally queue update jobs d-1a2b3c --data '{\"title\":\"Roof\"}' --base-version 4"
    )]
    Queue(cmd::queue::QueueArgs),

    #[command(next_help_heading = "Offline", about = "Show queued writes")]
    Pending(cmd::queue::PendingArgs),

    #[command(next_help_heading = "Offline", about = "Apply queued writes")]
    Sync(cmd::sync::SyncArgs),

    #[command(next_help_heading = "Offline", about = "List sync conflicts")]
    Conflicts(cmd::sync::ConflictsArgs),

    #[command(
        next_help_heading = "Offline",
        about = "Resolve a sync conflict",
        after_help = "EXAMPLES:\n    tally resolve c-0f1e2d3c4b5a retry\n    tally resolve c-0f1e2d3c4b5a recreate"
    )]
    Resolve(cmd::sync::ResolveArgs),
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_env("TALLY_LOG").unwrap_or_else(|_| {
        EnvFilter::new(if verbose || env::var("DEBUG").is_ok() {
            "tally=debug,tally_core=debug,info"
        } else {
            "tally=info,tally_core=warn,warn"
        })
    });

    let format = env::var("TALLY_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string());
    let registry = tracing_subscriber::registry().with(filter);

    match format.as_str() {
        "json" => {
            registry
                .with(fmt::layer().json().with_ansi(false).with_writer(std::io::stderr))
                .init();
        }
        _ => {
            registry
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .init();
        }
    }
}

fn run(cli: &Cli, output: OutputMode, user: tally_core::config::UserConfig) -> anyhow::Result<()> {
    let project_root = env::current_dir()?;
    let ctx = cmd::Context {
        project_root: &project_root,
        output,
        tenant: identity::resolve_tenant(cli.tenant.as_deref()),
        as_flag: cli.as_caller.as_deref(),
        user,
    };

    match cli.command {
        Commands::Init(ref args) => cmd::init::run_init(args, &ctx),
        Commands::Config(ref args) => cmd::config::run_config(args, &ctx),
        Commands::Allocate(ref args) => cmd::allocate::run_allocate(args, &ctx),
        Commands::Create(ref args) => cmd::create::run_create(args, &ctx),
        Commands::Update(ref args) => cmd::update::run_update(args, &ctx),
        Commands::Delete(ref args) => cmd::update::run_delete(args, &ctx),
        Commands::Show(ref args) => cmd::show::run_show(args, &ctx),
        Commands::List(ref args) => cmd::show::run_list(args, &ctx),
        Commands::Audit(ref args) => cmd::audit::run_audit(args, &ctx),
        Commands::Sweep(ref args) => cmd::sweep::run_sweep(args, &ctx),
        Commands::Queue(ref args) => cmd::queue::run_queue(args, &ctx),
        Commands::Pending(ref args) => cmd::queue::run_pending(args, &ctx),
        Commands::Sync(ref args) => cmd::sync::run_sync(args, &ctx),
        Commands::Conflicts(ref args) => cmd::sync::run_conflicts(args, &ctx),
        Commands::Resolve(ref args) => cmd::sync::run_resolve(args, &ctx),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let (user, user_err) = match tally_core::config::load_user_config() {
        Ok(user) => (user, None),
        Err(err) => (tally_core::config::UserConfig::default(), Some(err)),
    };
    let output = output::resolve_output_mode(cli.format, cli.json, user.output.as_deref());

    let result = user_err.map_or_else(|| run(&cli, output, user), Err);
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::debug!(error = ?err, "command failed");
            if output::render_error(output, &CliError::from_anyhow(&err)).is_err() {
                eprintln!("error: {err:#}");
            }
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_parse_after_subcommand() {
        let cli = Cli::parse_from(["tally", "list", "jobs", "--json", "--tenant", "acme"]);
        assert!(cli.json);
        assert_eq!(cli.tenant.as_deref(), Some("acme"));
        assert!(matches!(cli.command, Commands::List(_)));
    }

    #[test]
    fn as_flag_sets_caller() {
        let cli = Cli::parse_from(["tally", "--as", "u-ana", "create", "jobs"]);
        assert_eq!(cli.as_caller.as_deref(), Some("u-ana"));
    }

    #[test]
    fn format_flag_accepts_modes() {
        let cli = Cli::parse_from(["tally", "--format", "text", "pending"]);
        assert_eq!(cli.format, Some(OutputMode::Text));
    }

    #[test]
    fn id_requires_offline() {
        assert!(Cli::try_parse_from(["tally", "create", "jobs", "--id", "d-1"]).is_err());
        assert!(Cli::try_parse_from(["tally", "create", "jobs", "--offline", "--id", "d-1"]).is_ok());
    }

    #[test]
    fn all_subcommands_parse() {
        let subcommands: [&[&str]; 15] = [
            &["tally", "init"],
            &["tally", "config"],
            &["tally", "allocate", "jobNumber"],
            &["tally", "create", "jobs", "--data", "{}"],
            &["tally", "update", "jobs", "d-1", "--data", "{}"],
            &["tally", "delete", "jobs", "d-1"],
            &["tally", "show", "jobs", "d-1"],
            &["tally", "list", "jobs/d-1/costs"],
            &["tally", "audit", "--op", "delete"],
            &["tally", "sweep", "--daemon"],
            &["tally", "queue", "update", "jobs", "d-1", "--data", "{}"],
            &["tally", "pending", "--state", "conflict"],
            &["tally", "sync"],
            &["tally", "conflicts", "--status", "all"],
            &["tally", "resolve", "c-1", "retry"],
        ];
        for args in subcommands {
            let result = Cli::try_parse_from(args.iter());
            assert!(result.is_ok(), "failed to parse {args:?}: {:?}", result.err());
        }
    }
}
