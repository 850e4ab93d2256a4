use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use serde_json::Map;
use serde_json::Value;
use sqlcell_core::CollectingSink;
use sqlcell_core::ExecEngine;
use sqlcell_core::ExecRequest;
use sqlcell_core::OutputFormat;
use sqlcell_core::RenderOptions;
use sqlcell_core::ResultTarget;
use tracing::debug;

use crate::exit_code;
use crate::is_failure;

#[derive(Debug, Parser)]
pub struct QueryCli {
    /// Run inside this named session instead of a one-off process.
    #[arg(long = "session", value_name = "NAME")]
    pub session: Option<String>,

    /// Database file for a new session or the one-off process.
    #[arg(long = "db", value_name = "PATH")]
    pub database: Option<PathBuf>,

    /// Submit without blocking and print the result once it is delivered.
    #[arg(long = "async")]
    pub run_async: bool,

    /// Print the engine's own display mode instead of a Markdown table.
    #[arg(long = "raw")]
    pub raw: bool,

    /// Keep at most N result lines (0 keeps everything).
    #[arg(long = "max-lines", value_name = "N")]
    pub max_lines: Option<usize>,

    /// Values for `{{ name }}` placeholders, as a JSON object.
    #[arg(long = "params", value_name = "JSON")]
    pub params: Option<String>,

    /// Print the result record as JSON.
    #[arg(long = "json")]
    pub json: bool,

    #[arg(value_name = "SQL")]
    pub sql: String,
}

impl QueryCli {
    fn to_request(&self) -> Result<ExecRequest> {
        let mut request = ExecRequest::new(self.sql.clone()).with_options(RenderOptions {
            format: if self.raw {
                OutputFormat::Raw
            } else {
                OutputFormat::Table
            },
            target: ResultTarget::Inline,
            max_lines: self.max_lines,
        });
        if let Some(session) = self.session.clone() {
            request = request.in_session(session);
        }
        if let Some(database) = self.database.clone() {
            request = request.with_database(database);
        }
        if let Some(raw) = self.params.as_deref() {
            request = request.with_params(parse_params(raw)?);
        }
        Ok(request)
    }
}

pub async fn run_query(engine: &ExecEngine, cli: QueryCli) -> Result<ExitCode> {
    let request = cli.to_request()?;
    let result = if cli.run_async {
        let sink = Arc::new(CollectingSink::new());
        let exec_id = engine.submit(request, sink.clone()).await?;
        debug!(%exec_id, "submitted; waiting for delivery");
        sink.wait_for(exec_id).await
    } else {
        engine.run_sync(request).await?
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print!("{}", result.render());
    }
    Ok(exit_code(is_failure(result.status)))
}

pub(crate) fn parse_params(raw: &str) -> Result<Map<String, Value>> {
    match serde_json::from_str(raw).context("--params is not valid JSON")? {
        Value::Object(params) => Ok(params),
        other => bail!("--params must be a JSON object, got `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn params_must_be_an_object() {
        let params = parse_params(r#"{"limit": 3}"#).expect("object");
        assert_eq!(params.get("limit"), Some(&Value::from(3)));
        assert!(parse_params("[1]").is_err());
        assert!(parse_params("{").is_err());
    }

    #[test]
    fn flags_shape_the_request() {
        let cli = QueryCli::parse_from([
            "query",
            "--session",
            "s",
            "--raw",
            "--max-lines",
            "10",
            "SELECT 1",
        ]);
        let request = cli.to_request().expect("request");
        assert_eq!(request.session.as_deref(), Some("s"));
        assert_eq!(request.options.format, OutputFormat::Raw);
        assert_eq!(request.options.max_lines, Some(10));
        assert_eq!(request.params, None);
    }
}
