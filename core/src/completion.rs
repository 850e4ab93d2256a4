//! Completion routing: turns a finished execution into a terminal status
//! and delivered content, then releases the execution's temp files.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::LazyLock;

use regex_lite::Regex;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::error;
use tracing::warn;

use crate::exec_id::ExecId;
use crate::files::ExecutionFiles;
use crate::session::process::ExitInfo;
use crate::session::process::INTERRUPT_SIGNAL;
use crate::sink::ExecutionResult;
use crate::sink::RenderOptions;
use crate::sink::ResultSink;
use crate::sink::ResultTarget;
use crate::status::ExecStatus;
use crate::tracker::StatusTracker;

static KILL_VOCABULARY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)kill|terminat|interrupt|cancel|SIGINT|SIGTERM|SIGKILL").ok()
});

/// Finish signal handed to the router.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FinishEvent {
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub message: Option<String>,
}

impl FinishEvent {
    /// The head's marker appeared: the statement block ran to the end.
    pub(crate) fn marker_seen() -> Self {
        Self {
            exit_code: Some(0),
            ..Self::default()
        }
    }

    pub(crate) fn interrupted() -> Self {
        Self {
            exit_code: None,
            signal: Some(INTERRUPT_SIGNAL),
            message: Some("interrupted by cancel request".to_string()),
        }
    }

    pub(crate) fn exited(exit: ExitInfo) -> Self {
        Self {
            exit_code: exit.code,
            signal: exit.signal,
            message: None,
        }
    }

    pub(crate) fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Applies the ordered decision table. Returns the status and its detail.
pub fn classify(event: &FinishEvent, errors: &str, excerpt_lines: usize) -> (ExecStatus, Option<String>) {
    let errors = errors.trim_end();
    match event.exit_code {
        Some(code) if code != 0 => {
            let detail = if errors.is_empty() {
                format!("engine exited with code {code}")
            } else {
                errors.to_string()
            };
            (ExecStatus::Error, Some(detail))
        }
        Some(_) if !errors.is_empty() => (
            ExecStatus::CompletedWithErrors,
            Some(excerpt(errors, excerpt_lines)),
        ),
        Some(_) => (ExecStatus::Completed, None),
        None => {
            let message = event.message.as_deref().unwrap_or_default();
            let kill_text = KILL_VOCABULARY
                .as_ref()
                .is_some_and(|re| re.is_match(message));
            if event.signal.is_some() || kill_text {
                let detail = if message.is_empty() {
                    event
                        .signal
                        .map(|signal| format!("terminated by signal {signal}"))
                } else {
                    Some(message.to_string())
                };
                (ExecStatus::Cancelled, detail)
            } else {
                (
                    ExecStatus::Unknown,
                    event.message.clone().filter(|m| !m.is_empty()),
                )
            }
        }
    }
}

fn excerpt(text: &str, max_lines: usize) -> String {
    let total = text.lines().count();
    if max_lines == 0 || total <= max_lines {
        return text.to_string();
    }
    let mut out = text.lines().take(max_lines).collect::<Vec<_>>().join("\n");
    out.push_str(&format!("\n… {} more lines", total - max_lines));
    out
}

/// Keeps the first `max` lines. `None` and `Some(0)` mean unlimited. The
/// second element is the applied limit when lines were dropped.
pub fn truncate_lines(text: &str, max: Option<usize>) -> (String, Option<usize>) {
    let Some(max) = max.filter(|max| *max > 0) else {
        return (text.to_string(), None);
    };
    if text.lines().count() <= max {
        return (text.to_string(), None);
    }
    let mut kept = String::new();
    for line in text.lines().take(max) {
        kept.push_str(line);
        kept.push('\n');
    }
    (kept, Some(max))
}

/// Where a finished execution's content goes.
pub(crate) enum CompletionTarget {
    Sink {
        sink: Arc<dyn ResultSink>,
        options: RenderOptions,
    },
    Reply(oneshot::Sender<ExecutionResult>),
}

impl std::fmt::Debug for CompletionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sink { options, .. } => f.debug_struct("Sink").field("options", options).finish(),
            Self::Reply(_) => f.write_str("Reply"),
        }
    }
}

/// Per-execution state held until the router runs.
#[derive(Debug)]
pub(crate) struct CompletionJob {
    pub(crate) exec_id: ExecId,
    pub(crate) session: Option<String>,
    pub(crate) files: ExecutionFiles,
    pub(crate) options: RenderOptions,
    pub(crate) target: CompletionTarget,
}

#[derive(Debug, Clone)]
pub(crate) struct CompletionRouter {
    tracker: Arc<StatusTracker>,
    max_result_lines: Option<usize>,
    excerpt_lines: usize,
}

impl CompletionRouter {
    pub(crate) fn new(
        tracker: Arc<StatusTracker>,
        max_result_lines: Option<usize>,
        excerpt_lines: usize,
    ) -> Self {
        Self {
            tracker,
            max_result_lines,
            excerpt_lines,
        }
    }

    /// Runs exactly once per execution. Never panics and never returns an
    /// error: faults become an `error` status, and the temp files are
    /// removed whatever happens.
    pub(crate) fn complete(&self, job: CompletionJob, event: FinishEvent, stream_errors: String) {
        let CompletionJob {
            exec_id,
            session,
            files,
            options,
            target,
        } = job;

        let built = std::panic::catch_unwind(AssertUnwindSafe(|| {
            self.build_result(exec_id, session.clone(), &files, &options, &event, stream_errors)
        }));
        let result = match built {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                error!(%exec_id, "completion handler failed: {err}");
                self.fault_result(exec_id, session, &options, err.to_string())
            }
            Err(_) => {
                error!(%exec_id, "completion handler panicked");
                self.fault_result(exec_id, session, &options, "completion handler panicked".to_string())
            }
        };

        self.tracker
            .finish(exec_id, result.status, result.detail.clone());

        let delivered = std::panic::catch_unwind(AssertUnwindSafe(|| deliver(target, result)));
        if delivered.is_err() {
            error!(%exec_id, "result delivery panicked");
        }

        for err in files.remove_all() {
            warn!(%exec_id, "failed to remove temp file: {err}");
        }
        debug!(%exec_id, "execution finalized");
    }

    fn build_result(
        &self,
        exec_id: ExecId,
        session: Option<String>,
        files: &ExecutionFiles,
        options: &RenderOptions,
        event: &FinishEvent,
        stream_errors: String,
    ) -> std::io::Result<ExecutionResult> {
        let raw = read_lossy(files.result_path())?;
        let limit = options.max_lines.or(self.max_result_lines);
        let (output, truncated_to) = truncate_lines(&raw, limit);

        let mut errors = stream_errors;
        if let Some(path) = files.error_path() {
            let file_errors = read_lossy(path)?;
            if !file_errors.trim().is_empty() {
                if !errors.is_empty() {
                    errors.push('\n');
                }
                errors.push_str(file_errors.trim_end());
            }
        }

        let (status, detail) = classify(event, &errors, self.excerpt_lines);
        Ok(ExecutionResult {
            exec_id,
            session,
            status,
            detail,
            output,
            errors,
            truncated_to,
            format: options.format,
        })
    }

    fn fault_result(
        &self,
        exec_id: ExecId,
        session: Option<String>,
        options: &RenderOptions,
        detail: String,
    ) -> ExecutionResult {
        ExecutionResult {
            exec_id,
            session,
            status: ExecStatus::Error,
            detail: Some(detail),
            output: String::new(),
            errors: String::new(),
            truncated_to: None,
            format: options.format,
        }
    }

    /// Finalizes an execution that never reached the engine.
    pub(crate) fn skip(&self, job: CompletionJob, status: ExecStatus, detail: &str) {
        let CompletionJob {
            exec_id,
            session,
            files,
            options,
            target,
        } = job;
        self.tracker.finish(exec_id, status, Some(detail.to_string()));
        let result = ExecutionResult {
            exec_id,
            session,
            status,
            detail: Some(detail.to_string()),
            output: String::new(),
            errors: String::new(),
            truncated_to: None,
            format: options.format,
        };
        if std::panic::catch_unwind(AssertUnwindSafe(|| deliver(target, result))).is_err() {
            error!(%exec_id, "result delivery panicked");
        }
        for err in files.remove_all() {
            warn!(%exec_id, "failed to remove temp file: {err}");
        }
    }
}

fn deliver(target: CompletionTarget, result: ExecutionResult) {
    match target {
        CompletionTarget::Sink { sink, options } => match options.target {
            ResultTarget::Inline => sink.insert_result(&result, &options),
            ResultTarget::Side => sink.display_in_side_view(&result),
        },
        CompletionTarget::Reply(reply) => {
            // The waiter may have timed out already.
            let _ = reply.send(result);
        }
    }
}

fn read_lossy(path: &std::path::Path) -> std::io::Result<String> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err),
    }
}
