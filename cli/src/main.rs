use std::process::ExitCode;

use clap::Parser;
use clap::Subcommand;
use sqlcell_cli::EngineArgs;
use sqlcell_cli::query_cmd::QueryCli;
use sqlcell_cli::query_cmd::run_query;
use sqlcell_cli::run_cmd::RunCli;
use sqlcell_cli::run_cmd::run_document;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const INTERRUPTED_EXIT_CODE: u8 = 130;

/// Run SQL through an engine CLI with persistent sessions.
#[derive(Debug, Parser)]
#[command(name = "sqlcell", version)]
struct Cli {
    #[command(flatten)]
    engine: EngineArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run one query and print its result.
    Query(QueryCli),

    /// Execute the `sql` blocks of a Markdown document.
    Run(RunCli),
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let Cli {
        engine: engine_args,
        command,
    } = Cli::parse();
    setup_tracing();

    let engine = engine_args.build_engine()?;
    let work = async {
        match command {
            Command::Query(cli) => run_query(&engine, cli).await,
            Command::Run(cli) => run_document(&engine, cli).await,
        }
    };
    let code = tokio::select! {
        code = work => code,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; closing sessions");
            Ok(ExitCode::from(INTERRUPTED_EXIT_CODE))
        }
    };
    engine.shutdown().await;
    code
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
