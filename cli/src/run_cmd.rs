use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use sqlcell_core::CollectingSink;
use sqlcell_core::ExecEngine;
use sqlcell_core::ExecutionResult;
use sqlcell_core::document::SqlBlock;
use sqlcell_core::document::find_sql_blocks;
use sqlcell_core::document::splice_results;
use tracing::info;
use tracing::warn;

use crate::exit_code;
use crate::is_failure;

#[derive(Debug, Parser)]
pub struct RunCli {
    /// Markdown document holding fenced `sql` blocks.
    #[arg(value_name = "DOC")]
    pub document: PathBuf,

    /// Write the results back into DOC instead of printing the document.
    #[arg(long = "in-place")]
    pub in_place: bool,
}

enum BlockOutcome {
    Finished(ExecutionResult),
    /// The block never produced a result, e.g. its session did not start.
    Failed(String),
}

impl BlockOutcome {
    fn failed(&self) -> bool {
        match self {
            Self::Finished(result) => is_failure(result.status),
            Self::Failed(_) => true,
        }
    }

    fn render(&self) -> String {
        match self {
            Self::Finished(result) => result.render(),
            Self::Failed(reason) => format!("**error**\n{reason}\n"),
        }
    }
}

/// Runs every block in document order. `async` blocks are submitted without
/// waiting; their results are collected once the last block was started.
pub async fn run_document(engine: &ExecEngine, cli: RunCli) -> Result<ExitCode> {
    let markdown = std::fs::read_to_string(&cli.document)
        .with_context(|| format!("failed to read {}", cli.document.display()))?;
    let blocks = find_sql_blocks(&markdown);
    info!(document = %cli.document.display(), blocks = blocks.len(), "running document");

    let outcomes = execute_blocks(engine, &blocks).await;

    let mut failed = false;
    let mut rendered = HashMap::new();
    for (block, outcome) in blocks.iter().zip(&outcomes) {
        failed |= outcome.failed();
        if block.options.side {
            eprintln!("-- block {} --\n{}", block.index + 1, outcome.render());
        } else {
            rendered.insert(block.index, outcome.render());
        }
    }

    let updated = splice_results(&markdown, &blocks, &rendered);
    if cli.in_place {
        std::fs::write(&cli.document, updated)
            .with_context(|| format!("failed to write {}", cli.document.display()))?;
    } else {
        print!("{updated}");
    }
    Ok(exit_code(failed))
}

/// One outcome per block, in block order.
async fn execute_blocks(engine: &ExecEngine, blocks: &[SqlBlock]) -> Vec<BlockOutcome> {
    let sink = Arc::new(CollectingSink::new());
    let mut submitted = HashMap::new();
    let mut outcomes = HashMap::new();

    for block in blocks {
        let request = block.to_request();
        if block.options.run_async {
            match engine.submit(request, sink.clone()).await {
                Ok(exec_id) => {
                    submitted.insert(block.index, exec_id);
                }
                Err(err) => {
                    warn!(block = block.index, "failed to submit block: {err}");
                    outcomes.insert(block.index, BlockOutcome::Failed(err.to_string()));
                }
            }
            continue;
        }
        let outcome = match engine.run_sync(request).await {
            Ok(result) => BlockOutcome::Finished(result),
            Err(err) => BlockOutcome::Failed(err.to_string()),
        };
        outcomes.insert(block.index, outcome);
    }

    for (index, exec_id) in submitted {
        outcomes.insert(index, BlockOutcome::Finished(sink.wait_for(exec_id).await));
    }

    blocks
        .iter()
        .map(|block| {
            outcomes
                .remove(&block.index)
                .unwrap_or_else(|| BlockOutcome::Failed("block was not executed".to_string()))
        })
        .collect()
}
