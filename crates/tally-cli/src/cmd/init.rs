use anyhow::{Context as _, Result};
use clap::Args;
use serde::Serialize;

use tally_core::Ledger;
use tally_core::config::{self as ledger_config, TALLY_DIR};

use super::Context;
use crate::output::{pretty_kv, render_mode};

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Rewrite `config.toml` even if the project is already initialized.
    #[arg(long)]
    pub force: bool,
}

const CONFIG_TOML: &str = "[sequence]\n\
    max_attempts = 5\n\
    retry_delay_ms = 10\n\
    \n\
    [audit]\n\
    retention_days = 365\n\
    monitored = [\"jobs\", \"team_members\", \"vehicles\", \"machines\", \"costs\", \"advances\", \"events\"]\n\
    \n\
    [retention]\n\
    batch_size = 500\n\
    max_attempts = 3\n\
    base_backoff_ms = 100\n\
    interval_hours = 24\n";

const GITIGNORE: &str = "ledger.sqlite3*\nsweep.lock\n";

#[derive(Debug, Serialize)]
struct InitReport {
    store: String,
    config: String,
    config_written: bool,
}

/// Execute `tally init`: create `.tally/`, write the default config and
/// migrate the store.
///
/// ```text
/// .tally/
///   config.toml
///   ledger.sqlite3
///   .gitignore
/// ```
///
/// # Errors
///
/// Returns an error if any filesystem operation or the migration fails.
pub fn run_init(args: &InitArgs, ctx: &Context<'_>) -> Result<()> {
    let dir = ctx.project_root.join(TALLY_DIR);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let config_path = dir.join("config.toml");
    let config_written = args.force || !config_path.exists();
    if config_written {
        std::fs::write(&config_path, CONFIG_TOML)
            .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
    }
    let gitignore = dir.join(".gitignore");
    if !gitignore.exists() {
        std::fs::write(&gitignore, GITIGNORE)
            .with_context(|| format!("Failed to write {}", gitignore.display()))?;
    }

    // Opening migrates the schema.
    Ledger::open(ctx.project_root)?;
    tracing::info!(root = %ctx.project_root.display(), "initialized tally project");

    let report = InitReport {
        store: ledger_config::store_path(ctx.project_root).display().to_string(),
        config: config_path.display().to_string(),
        config_written,
    };
    render_mode(
        ctx.output,
        &report,
        |r, w| writeln!(w, "{}\t{}", r.store, r.config),
        |r, w| {
            writeln!(w, "✓ Initialized {TALLY_DIR}/")?;
            pretty_kv(w, "Store", &r.store)?;
            pretty_kv(
                w,
                "Config",
                if r.config_written {
                    r.config.clone()
                } else {
                    format!("{} (kept)", r.config)
                },
            )
        },
    )
}
