//! Fenced `sql` blocks in Markdown documents and the result sections spliced
//! in below them.

use std::collections::HashMap;
use std::ops::Range;
use std::path::PathBuf;

use pulldown_cmark::CodeBlockKind;
use pulldown_cmark::Event;
use pulldown_cmark::Options;
use pulldown_cmark::Parser;
use pulldown_cmark::Tag;
use pulldown_cmark::TagEnd;
use tracing::warn;

use crate::engine::ExecRequest;
use crate::protocol::OutputFormat;
use crate::sink::RenderOptions;
use crate::sink::ResultTarget;

pub const RESULT_OPEN: &str = "<!-- sqlcell:result -->";
pub const RESULT_CLOSE: &str = "<!-- /sqlcell:result -->";

/// Options from a block's info string, e.g. ```` ```sql session=s async ````.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockOptions {
    pub session: Option<String>,
    pub run_async: bool,
    pub raw: bool,
    pub side: bool,
    pub max_lines: Option<usize>,
    pub database: Option<PathBuf>,
}

impl BlockOptions {
    /// Parses the words after the language tag. Unknown words are ignored.
    pub fn parse(words: &str) -> Self {
        let mut options = Self::default();
        for word in words.split_whitespace() {
            match word.split_once('=') {
                Some(("session", name)) if !name.is_empty() => {
                    options.session = Some(name.to_string());
                }
                Some(("db", path)) if !path.is_empty() => {
                    options.database = Some(PathBuf::from(path));
                }
                Some(("max-lines", n)) => match n.parse() {
                    Ok(n) => options.max_lines = Some(n),
                    Err(_) => warn!(value = n, "ignoring invalid max-lines"),
                },
                None if word == "async" => options.run_async = true,
                None if word == "raw" => options.raw = true,
                None if word == "side" => options.side = true,
                _ => warn!(option = word, "ignoring unknown block option"),
            }
        }
        options
    }

    pub fn render_options(&self) -> RenderOptions {
        RenderOptions {
            format: if self.raw {
                OutputFormat::Raw
            } else {
                OutputFormat::Table
            },
            target: if self.side {
                ResultTarget::Side
            } else {
                ResultTarget::Inline
            },
            max_lines: self.max_lines,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlBlock {
    /// Position among the document's sql blocks.
    pub index: usize,
    pub query: String,
    pub options: BlockOptions,
    /// Byte range of the whole fenced block.
    pub span: Range<usize>,
}

impl SqlBlock {
    pub fn to_request(&self) -> ExecRequest {
        ExecRequest {
            query: self.query.clone(),
            session: self.options.session.clone(),
            database: self.options.database.clone(),
            params: None,
            options: self.options.render_options(),
        }
    }
}

pub fn find_sql_blocks(markdown: &str) -> Vec<SqlBlock> {
    let mut blocks = Vec::new();
    let mut current: Option<(BlockOptions, Range<usize>, String)> = None;
    for (event, range) in Parser::new_ext(markdown, Options::empty()).into_offset_iter() {
        match event {
            Event::Start(Tag::CodeBlock(CodeBlockKind::Fenced(info))) => {
                let info = info.trim();
                let (lang, rest) = info.split_once(char::is_whitespace).unwrap_or((info, ""));
                if lang.eq_ignore_ascii_case("sql") {
                    current = Some((BlockOptions::parse(rest), range, String::new()));
                }
            }
            Event::Text(text) => {
                if let Some((_, _, query)) = current.as_mut() {
                    query.push_str(&text);
                }
            }
            Event::End(TagEnd::CodeBlock) => {
                if let Some((options, span, query)) = current.take() {
                    blocks.push(SqlBlock {
                        index: blocks.len(),
                        query,
                        options,
                        span,
                    });
                }
            }
            _ => {}
        }
    }
    blocks
}

/// Writes each rendered result below its block, replacing the result
/// section left by a previous run. Blocks without an entry keep whatever
/// they had.
pub fn splice_results(markdown: &str, blocks: &[SqlBlock], rendered: &HashMap<usize, String>) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut cursor = 0;
    for block in blocks {
        let Some(content) = rendered.get(&block.index) else {
            continue;
        };
        if block.span.end < cursor {
            continue;
        }
        out.push_str(&markdown[cursor..block.span.end]);
        cursor = block.span.end;
        if !out.ends_with('\n') && markdown[cursor..].starts_with('\n') {
            out.push('\n');
            cursor += 1;
        }
        if let Some(len) = existing_section_len(&markdown[cursor..]) {
            cursor += len;
        }
        if !out.ends_with('\n') {
            out.push('\n');
        }
        out.push('\n');
        out.push_str(RESULT_OPEN);
        out.push('\n');
        let content = content.trim_end();
        if !content.is_empty() {
            out.push_str(content);
            out.push('\n');
        }
        out.push_str(RESULT_CLOSE);
        out.push('\n');
    }
    out.push_str(&markdown[cursor..]);
    out
}

/// Length of a result section at the start of `rest` (after blank space),
/// including the newline that ends it.
fn existing_section_len(rest: &str) -> Option<usize> {
    let body = rest.trim_start();
    let skipped = rest.len() - body.len();
    if !body.starts_with(RESULT_OPEN) {
        return None;
    }
    let close = body.find(RESULT_CLOSE)?;
    let mut end = close + RESULT_CLOSE.len();
    if body[end..].starts_with('\n') {
        end += 1;
    }
    Some(skipped + end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const DOC: &str = "# Report\n\n```sql session=s async max-lines=5\nSELECT 1;\n```\n\ntext\n\n```python\nprint(1)\n```\n\n```sql raw side db=data.db\nSELECT 2;\n```\n";

    #[test]
    fn finds_only_sql_blocks_with_options() {
        let blocks = find_sql_blocks(DOC);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].query, "SELECT 1;\n");
        assert_eq!(
            blocks[0].options,
            BlockOptions {
                session: Some("s".to_string()),
                run_async: true,
                max_lines: Some(5),
                ..BlockOptions::default()
            }
        );
        assert_eq!(blocks[1].index, 1);
        assert_eq!(
            blocks[1].options.render_options(),
            RenderOptions {
                format: OutputFormat::Raw,
                target: ResultTarget::Side,
                max_lines: None,
            }
        );
        assert_eq!(blocks[1].options.database, Some(PathBuf::from("data.db")));
    }

    #[test]
    fn splicing_twice_replaces_the_previous_result() {
        let blocks = find_sql_blocks(DOC);
        let first: HashMap<usize, String> = HashMap::from([(0, "| 1 |\n".to_string())]);
        let once = splice_results(DOC, &blocks, &first);
        assert!(once.contains("```\n\n<!-- sqlcell:result -->\n| 1 |\n<!-- /sqlcell:result -->\n\ntext"));

        let blocks = find_sql_blocks(&once);
        let second: HashMap<usize, String> = HashMap::from([(0, "| 2 |".to_string())]);
        let twice = splice_results(&once, &blocks, &second);
        assert_eq!(twice, once.replace("| 1 |", "| 2 |"));
        assert_eq!(twice.matches(RESULT_OPEN).count(), 1);
    }

    #[test]
    fn blocks_without_results_are_left_alone() {
        let blocks = find_sql_blocks(DOC);
        assert_eq!(splice_results(DOC, &blocks, &HashMap::new()), DOC);
    }
}
