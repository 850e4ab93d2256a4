use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;

use crate::exec_id::ExecId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecStatus {
    Queued,
    Executing,
    Completed,
    CompletedWithErrors,
    Error,
    Cancelled,
    Unknown,
}

impl ExecStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Executing)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed-with-errors",
            Self::Error => "error",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }

    /// `queued -> cancelled` is the only edge that skips `executing`, and
    /// a provisional `completed` may still be refined by the router. The
    /// tracker refuses every change once the router finalized a record.
    pub fn can_transition_to(self, next: ExecStatus) -> bool {
        match self {
            Self::Queued => true,
            Self::Executing => next != Self::Queued,
            Self::Completed => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExecStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    pub exec_id: ExecId,
    /// `None` for one-off executions.
    pub session: Option<String>,
    pub command_preview: String,
    pub status: ExecStatus,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_path: Option<PathBuf>,
    pub detail: Option<String>,
    pub progress: Option<u8>,
    pub pid: Option<u32>,
    /// Set once the final status was recorded; the record no longer changes.
    pub finalized: bool,
}

impl ExecutionRecord {
    pub(crate) fn new(
        exec_id: ExecId,
        session: Option<String>,
        command_preview: String,
        result_path: Option<PathBuf>,
    ) -> Self {
        Self {
            exec_id,
            session,
            command_preview,
            status: ExecStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            result_path,
            detail: None,
            progress: None,
            pid: None,
            finalized: false,
        }
    }
}

/// Shortens a command for logs and progress lines.
pub(crate) fn preview_command(cmd: &str, max: usize) -> String {
    let flat = cmd.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max {
        return flat;
    }
    let keep = max.saturating_sub(1);
    let mut out: String = flat.chars().take(keep).collect();
    out.push('…');
    out
}
