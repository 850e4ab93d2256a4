//! Plain-text wire protocol spoken to the engine CLI over stdin.
//!
//! Every execution is a block of dot-directives followed by the query text
//! and a final `.print <marker>`; the marker line appearing on stdout is the
//! only completion signal the engine gives us.

use std::fmt::Write as _;
use std::path::Path;

use crate::config::DisplaySettings;

pub(crate) const QUIT_DIRECTIVE: &str = ".quit\n";

/// Token the engine echoes once it processes stdin; used as the readiness
/// pattern during session startup.
pub(crate) const READY_TOKEN: &str = "SQLCELL_READY";

/// How the engine should format result rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// JSON mode, parsed into structured records afterwards.
    #[default]
    Table,
    /// The configured raw display mode, passed through as text.
    Raw,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BailMode {
    /// Sessions keep running after a failed statement.
    Continue,
    /// One-off processes exit nonzero at the first failure.
    Exit,
}

pub(crate) fn readiness_probe() -> String {
    format!(".print {READY_TOKEN}\n")
}

/// Builds the full command block for one execution.
pub(crate) fn build_command_script(
    display: &DisplaySettings,
    format: OutputFormat,
    bail: BailMode,
    result_path: Option<&Path>,
    query: &str,
    marker: Option<&str>,
) -> String {
    let mut script = String::with_capacity(query.len() + 256);
    let mode = match format {
        OutputFormat::Table => "json",
        OutputFormat::Raw => display.raw_mode.as_str(),
    };
    let _ = writeln!(script, ".mode {mode}");
    let _ = writeln!(script, ".timer {}", on_off(display.timer));
    let _ = writeln!(script, ".headers {}", on_off(display.headers));
    let _ = writeln!(script, ".nullvalue {}", quote_arg(&display.null_value));
    if let Some(separator) = display.separator.as_deref() {
        let _ = writeln!(script, ".separator {}", quote_arg(separator));
    }
    script.push_str(".echo off\n");
    let _ = writeln!(
        script,
        ".bail {}",
        on_off(matches!(bail, BailMode::Exit))
    );
    script.push_str(".prompt '' ''\n");
    if let Some(path) = result_path {
        let _ = writeln!(script, ".output {}", quote_arg(&path.to_string_lossy()));
    }
    script.push_str(&terminate_statement(query));
    if result_path.is_some() {
        script.push_str(".output\n");
    }
    if let Some(marker) = marker {
        let _ = writeln!(script, ".print {marker}");
    }
    script
}

/// Ensures the query ends with `;` and a newline so the directives that
/// follow are parsed as directives rather than as statement continuation.
fn terminate_statement(query: &str) -> String {
    let trimmed = query.trim_end();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.ends_with(';') {
        format!("{trimmed}\n")
    } else {
        format!("{trimmed};\n")
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag { "on" } else { "off" }
}

fn quote_arg(raw: &str) -> String {
    if !raw.is_empty() && !raw.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
        return raw.to_string();
    }
    format!("'{}'", raw.replace('\'', "''"))
}
