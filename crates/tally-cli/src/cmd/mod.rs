pub mod allocate;
pub mod audit;
pub mod config;
pub mod create;
pub mod init;
pub mod queue;
pub mod show;
pub mod sweep;
pub mod sync;
pub mod update;

use anyhow::{Context as _, Result, bail};
use std::io::Read;
use std::path::Path;

use tally_core::Ledger;
use tally_core::config::{LedgerConfig, TALLY_DIR, UserConfig};
use tally_core::model::document::parse_fields;
use tally_core::model::{Actor, CollectionPath, Fields};

use crate::identity;
use crate::output::OutputMode;

/// Everything a command handler needs besides its own arguments.
pub struct Context<'a> {
    pub project_root: &'a Path,
    pub output: OutputMode,
    pub tenant: String,
    pub as_flag: Option<&'a str>,
    pub user: UserConfig,
}

impl Context<'_> {
    /// Open the project ledger.
    ///
    /// # Errors
    ///
    /// Fails when the project has not been initialized or the store cannot
    /// be opened.
    pub fn ledger(&self) -> Result<Ledger> {
        if !self.project_root.join(TALLY_DIR).is_dir() {
            bail!(
                "{}: no {TALLY_DIR}/ directory here. Run `tally init` first.",
                tally_core::ErrorCode::NotInitialized.code()
            );
        }
        Ledger::open(self.project_root)
    }

    pub fn actor(&self) -> Result<Actor> {
        identity::require_actor(self.as_flag, &self.user)
    }

    pub fn ledger_config(&self) -> Result<LedgerConfig> {
        tally_core::config::load_ledger_config(self.project_root)
    }
}

pub fn parse_path(raw: &str) -> Result<CollectionPath> {
    raw.parse::<CollectionPath>()
        .with_context(|| format!("bad collection path '{raw}'"))
}

/// Read a JSON object from `--data`, or from stdin when the value is `-`.
pub fn read_fields(data: Option<&str>) -> Result<Fields> {
    match data {
        None => Ok(Fields::new()),
        Some("-") => {
            let mut raw = String::new();
            std::io::stdin()
                .read_to_string(&mut raw)
                .context("read document body from stdin")?;
            Ok(parse_fields(&raw)?)
        }
        Some(raw) => Ok(parse_fields(raw)?),
    }
}
