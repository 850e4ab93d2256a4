use std::sync::LazyLock;

use regex_lite::Regex;
use tracing::trace;

use super::line_buffer::LineBuffer;
use crate::exec_id::ExecId;

/// Engine diagnostics worth surfacing: parser/binder/catalog-class errors
/// and the `LINE n:` context that follows them.
static ERROR_VOCABULARY: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(
        r"^\s*(?:(?:Parser|Syntax|Catalog|Binder|Conversion|Constraint|Dependency|Invalid Input|Invalid Configuration|Out of Range|Not implemented|Permission|Serialization|Transaction|IO|HTTP|Internal|Interrupt|INTERRUPT|Fatal|Runtime) )?Error:|^\s*LINE \d+:",
    )
    .ok()
});

static PROGRESS_FRAGMENT: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(\d{1,3})%\s*▕").ok());

pub(crate) fn is_error_line(line: &str) -> bool {
    ERROR_VOCABULARY
        .as_ref()
        .is_some_and(|re| re.is_match(line))
}

fn last_progress(chunk: &str) -> Option<u8> {
    let re = PROGRESS_FRAGMENT.as_ref()?;
    re.captures_iter(chunk)
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u8>().ok())
        .last()
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ScanEvent {
    Progress { exec_id: ExecId, percent: u8 },
    MarkerFound { exec_id: ExecId, errors: String },
}

#[derive(Debug)]
struct Watch {
    exec_id: ExecId,
    marker: String,
    errors: Vec<String>,
    in_error: bool,
}

/// Scans one session's merged output stream. Only the marker of the
/// execution currently at the head of the queue is ever looked for.
#[derive(Debug, Default)]
pub(crate) struct OutputScanner {
    lines: LineBuffer,
    watch: Option<Watch>,
}

impl OutputScanner {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Starts watching for `marker`, replacing any previous head.
    pub(crate) fn watch(&mut self, exec_id: ExecId, marker: String) {
        self.watch = Some(Watch {
            exec_id,
            marker,
            errors: Vec::new(),
            in_error: false,
        });
    }

    #[cfg(test)]
    pub(crate) fn watching(&self) -> Option<ExecId> {
        self.watch.as_ref().map(|watch| watch.exec_id)
    }

    /// Errors captured so far for the current head.
    pub(crate) fn take_errors(&mut self) -> String {
        self.watch
            .as_mut()
            .map(|watch| {
                watch.in_error = false;
                std::mem::take(&mut watch.errors).join("\n")
            })
            .unwrap_or_default()
    }

    pub(crate) fn scan(&mut self, chunk: &[u8]) -> Vec<ScanEvent> {
        let mut events = Vec::new();

        if let Some(watch) = self.watch.as_ref()
            && let Some(percent) = last_progress(&String::from_utf8_lossy(chunk))
        {
            events.push(ScanEvent::Progress {
                exec_id: watch.exec_id,
                percent,
            });
        }

        for line in self.lines.push_bytes(chunk) {
            let Some(watch) = self.watch.as_mut() else {
                trace!(line, "idle output");
                continue;
            };
            if line.trim() == watch.marker {
                let errors = std::mem::take(&mut watch.errors).join("\n");
                events.push(ScanEvent::MarkerFound {
                    exec_id: watch.exec_id,
                    errors,
                });
                self.watch = None;
                continue;
            }
            if is_error_line(&line) {
                watch.in_error = true;
                watch.errors.push(line);
            } else if watch.in_error && !line.trim().is_empty() {
                watch.errors.push(line);
            } else {
                watch.in_error = false;
                trace!(line, exec_id = %watch.exec_id, "engine output");
            }
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn marker_split_across_chunks_is_found() {
        let mut scanner = OutputScanner::new();
        let id = ExecId::new();
        let marker = id.async_marker();
        scanner.watch(id, marker.clone());

        let (left, right) = marker.split_at(10);
        assert!(scanner.scan(left.as_bytes()).is_empty());
        let events = scanner.scan(format!("{right}\n").as_bytes());
        assert_eq!(
            events,
            vec![ScanEvent::MarkerFound {
                exec_id: id,
                errors: String::new()
            }]
        );
        assert_eq!(scanner.watching(), None);
    }

    #[test]
    fn only_the_watched_marker_completes() {
        let mut scanner = OutputScanner::new();
        let head = ExecId::new();
        let later = ExecId::new();
        scanner.watch(head, head.async_marker());

        let events = scanner.scan(format!("{}\n", later.async_marker()).as_bytes());
        assert!(events.is_empty());
        assert_eq!(scanner.watching(), Some(head));
    }

    #[test]
    fn error_lines_and_context_are_captured() {
        let mut scanner = OutputScanner::new();
        let id = ExecId::new();
        scanner.watch(id, id.async_marker());
        let output = format!(
            "Parser Error: syntax error at or near \"SELEC\"\n\
             LINE 1: SELEC 1;\n\
             \x20       ^\n\
             \n\
             unrelated chatter\n\
             {}\n",
            id.async_marker()
        );
        let events = scanner.scan(output.as_bytes());
        assert_eq!(
            events,
            vec![ScanEvent::MarkerFound {
                exec_id: id,
                errors: "Parser Error: syntax error at or near \"SELEC\"\nLINE 1: SELEC 1;\n        ^"
                    .to_string()
            }]
        );
    }

    #[test]
    fn progress_fragments_are_reported_for_the_head() {
        let mut scanner = OutputScanner::new();
        let id = ExecId::new();
        assert!(scanner.scan(" 10% ▕██▏\r".as_bytes()).is_empty());
        scanner.watch(id, id.async_marker());
        let events = scanner.scan(" 10% ▕██▏\r 45% ▕█████▏\r".as_bytes());
        assert_eq!(
            events,
            vec![ScanEvent::Progress {
                exec_id: id,
                percent: 45
            }]
        );
    }

    #[test]
    fn vocabulary_matches_engine_error_classes() {
        assert!(is_error_line("Catalog Error: Table with name t does not exist!"));
        assert!(is_error_line("Binder Error: Referenced column \"x\" not found"));
        assert!(is_error_line("Error: unknown command"));
        assert!(!is_error_line("ERROR handling is fine in data"));
        assert!(!is_error_line("row 1"));
    }
}
