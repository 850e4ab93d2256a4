/// Maximum bytes kept for a single unterminated line before it is flushed.
const MAX_LINE_BYTES: usize = 256 * 1024;
const TRUNCATED_LABEL: &str = "...[truncated]";

/// Reassembles complete lines from raw output chunks. Partial lines are kept
/// as bytes so multi-byte characters split across chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    partial: Vec<u8>,
}

impl LineBuffer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a chunk and returns the lines it completed, without their
    /// terminators. `\r\n` endings are normalized.
    pub(crate) fn push_bytes(&mut self, data: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = data;
        while let Some(pos) = rest.iter().position(|b| *b == b'\n') {
            self.partial.extend_from_slice(&rest[..pos]);
            rest = &rest[pos + 1..];
            lines.push(self.take_line());
        }
        self.partial.extend_from_slice(rest);
        if self.partial.len() > MAX_LINE_BYTES {
            // Flush oversized partial lines so memory stays bounded.
            let mut line = self.take_line();
            truncate_utf8_safe(&mut line, MAX_LINE_BYTES, TRUNCATED_LABEL);
            lines.push(line);
        }
        lines
    }

    /// Returns the trailing unterminated line, if any, and clears it.
    pub(crate) fn flush(&mut self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let bytes = std::mem::take(&mut self.partial);
        let trimmed = bytes.strip_suffix(b"\r").unwrap_or(&bytes);
        String::from_utf8_lossy(trimmed).into_owned()
    }
}

fn truncate_utf8_safe(s: &mut String, max_bytes: usize, marker: &str) {
    if s.len() <= max_bytes {
        return;
    }
    let mut cut = max_bytes;
    while cut > 0 && !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
    s.push_str(marker);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn handles_complete_lines() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push_bytes(b"a\nb\n"), vec!["a", "b"]);
        assert_eq!(buffer.flush(), None);
    }

    #[test]
    fn handles_partial_lines_across_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push_bytes(b"ASYNC_COMP").is_empty());
        assert!(buffer.push_bytes(b"LETE_").is_empty());
        assert_eq!(buffer.push_bytes(b"x\nnext"), vec!["ASYNC_COMPLETE_x"]);
        assert_eq!(buffer.flush(), Some("next".to_string()));
    }

    #[test]
    fn crlf_endings_are_normalized() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push_bytes(b"one\r\ntwo\r"), vec!["one"]);
        assert_eq!(buffer.push_bytes(b"\n"), vec!["two"]);
    }

    #[test]
    fn empty_lines_are_preserved() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push_bytes(b"\n\nx\n"), vec!["", "", "x"]);
    }

    #[test]
    fn multibyte_characters_split_across_chunks_decode() {
        let mut buffer = LineBuffer::new();
        let text = "héllo\n".as_bytes();
        // Split inside the two-byte `é`.
        assert!(buffer.push_bytes(&text[..2]).is_empty());
        assert_eq!(buffer.push_bytes(&text[2..]), vec!["héllo"]);
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        let mut buffer = LineBuffer::new();
        assert_eq!(buffer.push_bytes(b"\xff\n"), vec!["\u{FFFD}"]);
    }

    #[test]
    fn oversized_partial_line_is_flushed_truncated() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push_bytes(&vec![b'x'; MAX_LINE_BYTES + 10]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].ends_with(TRUNCATED_LABEL));
        assert_eq!(lines[0].len(), MAX_LINE_BYTES + TRUNCATED_LABEL.len());
    }
}
