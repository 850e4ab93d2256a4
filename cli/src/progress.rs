use std::io::Write;

use owo_colors::OwoColorize;
use sqlcell_core::ExecStatus;
use sqlcell_core::ExecutionRecord;
use sqlcell_core::ProgressDisplay;
use supports_color::Stream;

const CLEAR_LINE: &str = "\r\x1b[2K";

/// Single status line on stderr, redrawn on every refresh.
#[derive(Debug)]
pub struct TerminalProgress {
    color: bool,
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self {
            color: supports_color::on(Stream::Stderr).is_some(),
        }
    }

    fn summary_line(&self, pending: &[ExecutionRecord]) -> String {
        let running = pending
            .iter()
            .filter(|record| record.status == ExecStatus::Executing)
            .count();
        let queued = pending.len() - running;
        let counts = format!("{running} running, {queued} queued");
        let counts = if self.color {
            counts.bold().to_string()
        } else {
            counts
        };

        let Some(current) = pending
            .iter()
            .find(|record| record.status == ExecStatus::Executing)
        else {
            return counts;
        };
        let place = current.session.as_deref().unwrap_or("one-off");
        let mut line = if self.color {
            format!(
                "{counts}  {} {}",
                place.cyan(),
                current.command_preview.dimmed()
            )
        } else {
            format!("{counts}  {place} {}", current.command_preview)
        };
        if let Some(percent) = current.progress {
            line.push_str(&format!(" {percent}%"));
        }
        line
    }
}

impl ProgressDisplay for TerminalProgress {
    fn render(&self, pending: &[ExecutionRecord]) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "{CLEAR_LINE}{}", self.summary_line(pending));
        let _ = err.flush();
    }

    fn finish(&self) {
        let mut err = std::io::stderr().lock();
        let _ = write!(err, "{CLEAR_LINE}");
        let _ = err.flush();
    }
}
