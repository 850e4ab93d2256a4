use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::sync::PoisonError;

use serde::Serialize;
use tokio::sync::Notify;

use crate::exec_id::ExecId;
use crate::protocol::OutputFormat;
use crate::status::ExecStatus;
use crate::tabular::parse_tabular;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultTarget {
    /// Below the query, in the document.
    #[default]
    Inline,
    /// In a separate view, leaving the document untouched.
    Side,
}

/// How a finished execution should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderOptions {
    pub format: OutputFormat,
    pub target: ResultTarget,
    /// Overrides the configured `max_result_lines` for this execution.
    pub max_lines: Option<usize>,
}

/// Everything the completion router learned about one execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub exec_id: ExecId,
    pub session: Option<String>,
    pub status: ExecStatus,
    pub detail: Option<String>,
    /// Result-file content, already cut to the line limit.
    pub output: String,
    /// Captured engine diagnostics.
    pub errors: String,
    /// Line limit that was applied, when the output exceeded it.
    pub truncated_to: Option<usize>,
    #[serde(skip)]
    pub format: OutputFormat,
}

impl ExecutionResult {
    /// Output with the truncation notice appended when lines were dropped.
    pub fn output_with_notice(&self) -> String {
        match self.truncated_to {
            Some(limit) => format!("{}{}\n", self.output, truncation_notice(limit)),
            None => self.output.clone(),
        }
    }

    /// Human-readable rendering of the outcome. Every status renders to
    /// something, with diagnostics included whenever they were captured.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.status != ExecStatus::Completed {
            let _ = writeln!(out, "**{}**", self.status);
            if let Some(detail) = self.detail.as_deref()
                && detail != self.errors.trim_end()
            {
                let _ = writeln!(out, "{detail}");
            }
            out.push('\n');
        }

        let body = match self.format {
            OutputFormat::Table => parse_tabular(&self.output).render(),
            OutputFormat::Raw => self.output.clone(),
        };
        if !body.trim().is_empty() {
            out.push_str(body.trim_end());
            out.push('\n');
        }
        if let Some(limit) = self.truncated_to {
            let _ = writeln!(out, "{}", truncation_notice(limit));
        }
        if !self.errors.trim().is_empty() {
            if !out.is_empty() {
                out.push('\n');
            }
            let _ = writeln!(out, "```text\n{}\n```", self.errors.trim_end());
        }
        out
    }
}

pub fn truncation_notice(limit: usize) -> String {
    format!("… output truncated to {limit} lines")
}

/// Receives finished results. Calls happen on session tasks, so
/// implementations should not block for long.
pub trait ResultSink: Send + Sync {
    fn insert_result(&self, result: &ExecutionResult, options: &RenderOptions);

    fn display_in_side_view(&self, result: &ExecutionResult);
}

/// Sink that keeps results in memory until someone asks for them.
#[derive(Debug, Default)]
pub struct CollectingSink {
    results: Mutex<HashMap<ExecId, ExecutionResult>>,
    arrived: Notify,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, result: &ExecutionResult) {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(result.exec_id, result.clone());
        self.arrived.notify_waiters();
    }

    pub fn take(&self, exec_id: ExecId) -> Option<ExecutionResult> {
        self.results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&exec_id)
    }

    /// Waits until the result for `exec_id` was delivered.
    pub async fn wait_for(&self, exec_id: ExecId) -> ExecutionResult {
        loop {
            let notified = self.arrived.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.take(exec_id) {
                return result;
            }
            notified.await;
        }
    }
}

impl ResultSink for CollectingSink {
    fn insert_result(&self, result: &ExecutionResult, _options: &RenderOptions) {
        self.store(result);
    }

    fn display_in_side_view(&self, result: &ExecutionResult) {
        self.store(result);
    }
}
