//! Command-line front end: one-shot queries and Markdown documents with
//! `sql` blocks.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use sqlcell_core::ExecEngine;
use sqlcell_core::ExecStatus;
use sqlcell_core::SqlCellConfig;

mod progress;
pub mod query_cmd;
pub mod run_cmd;

pub use progress::TerminalProgress;

/// Flags shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct EngineArgs {
    /// Config file. Defaults to `$SQLCELL_HOME/config.toml`.
    #[arg(long = "config", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    /// Engine executable; overrides `engine_path` from the config file.
    #[arg(long = "engine", value_name = "PATH", global = true)]
    pub engine: Option<PathBuf>,

    /// Show pending executions on stderr while waiting.
    #[arg(long = "progress", global = true)]
    pub progress: bool,
}

impl EngineArgs {
    pub fn load_config(&self) -> Result<SqlCellConfig> {
        let mut config = match self.config.as_deref() {
            Some(path) => SqlCellConfig::load(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => SqlCellConfig::load_default().context("failed to load default config")?,
        };
        if let Some(engine) = self.engine.clone() {
            config.engine_path = engine;
        }
        Ok(config)
    }

    pub fn build_engine(&self) -> Result<ExecEngine> {
        let engine = ExecEngine::new(self.load_config()?);
        if self.progress {
            engine.set_progress_display(Arc::new(TerminalProgress::new()));
        }
        Ok(engine)
    }
}

/// Exit code 1 once any execution ended in `error`.
pub fn exit_code(failed: bool) -> ExitCode {
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

pub(crate) fn is_failure(status: ExecStatus) -> bool {
    status == ExecStatus::Error
}
