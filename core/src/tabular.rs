//! Turns engine JSON-mode output into structured tables.
//!
//! JSON mode prints one row object per line (`[{..},` / `{..},` / `{..}]`),
//! so rows are parsed line by line. That keeps line-truncated output
//! parseable.

use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Tabular {
    Structured(Vec<Table>),
    Raw(String),
}

pub fn parse_tabular(text: &str) -> Tabular {
    let mut tables: Vec<Table> = Vec::new();
    let mut open = false;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Run Time") {
            continue;
        }
        let starts_table = line.starts_with('[');
        let body = line.strip_prefix('[').unwrap_or(line).trim_start();
        let (body, closes_table) = match body.strip_suffix(']') {
            Some(rest) => (rest, true),
            None => (body, false),
        };
        let body = body.trim_end().trim_end_matches(',');

        if starts_table || !open {
            tables.push(Table::default());
        }
        open = !closes_table;
        if body.is_empty() {
            continue;
        }
        let Ok(Value::Object(row)) = serde_json::from_str::<Value>(body) else {
            return Tabular::Raw(text.to_string());
        };
        if let Some(table) = tables.last_mut() {
            table.push_row(row);
        }
    }
    if tables.is_empty() {
        Tabular::Raw(text.to_string())
    } else {
        Tabular::Structured(tables)
    }
}

impl Table {
    fn push_row(&mut self, row: Map<String, Value>) {
        for key in row.keys() {
            if !self.columns.iter().any(|column| column == key) {
                self.columns.push(key.clone());
                for existing in &mut self.rows {
                    existing.push(Value::Null);
                }
            }
        }
        let values = self
            .columns
            .iter()
            .map(|column| row.get(column).cloned().unwrap_or(Value::Null))
            .collect();
        self.rows.push(values);
    }

    pub fn to_markdown(&self) -> String {
        if self.columns.is_empty() {
            return String::new();
        }
        let mut out = String::new();
        out.push_str(&markdown_row(self.columns.iter().map(|c| escape_cell(c))));
        out.push_str(&markdown_row(self.columns.iter().map(|_| "---".to_string())));
        for row in &self.rows {
            out.push_str(&markdown_row(row.iter().map(cell_text)));
        }
        out
    }
}

impl Tabular {
    pub fn render(&self) -> String {
        match self {
            Tabular::Structured(tables) => tables
                .iter()
                .map(Table::to_markdown)
                .collect::<Vec<_>>()
                .join("\n"),
            Tabular::Raw(text) => text.clone(),
        }
    }
}

fn markdown_row(cells: impl Iterator<Item = String>) -> String {
    let cells: Vec<String> = cells.collect();
    format!("| {} |\n", cells.join(" | "))
}

fn cell_text(value: &Value) -> String {
    let text = match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    escape_cell(&text)
}

fn escape_cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn json_mode_rows_become_a_table() {
        let output = "[{\"id\":1,\"name\":\"a\"},\n{\"id\":2,\"name\":null}\n]\n";
        let Tabular::Structured(tables) = parse_tabular(output) else {
            panic!("expected structured output");
        };
        assert_eq!(
            tables,
            vec![Table {
                columns: vec!["id".to_string(), "name".to_string()],
                rows: vec![vec![json!(1), json!("a")], vec![json!(2), Value::Null]],
            }]
        );
        assert_eq!(
            tables[0].to_markdown(),
            "| id | name |\n| --- | --- |\n| 1 | a |\n| 2 | NULL |\n"
        );
    }

    #[test]
    fn each_statement_starts_a_new_table() {
        let output = "[{\"a\":1}]\nRun Time (s): real 0.001\n[{\"b\":2},\n{\"b\":3}]\n";
        let Tabular::Structured(tables) = parse_tabular(output) else {
            panic!("expected structured output");
        };
        assert_eq!(tables.len(), 2);
        assert_eq!(tables[1].columns, vec!["b".to_string()]);
        assert_eq!(tables[1].rows.len(), 2);
    }

    #[test]
    fn truncated_json_still_parses() {
        let output = "[{\"n\":1},\n{\"n\":2},\n";
        let Tabular::Structured(tables) = parse_tabular(output) else {
            panic!("expected structured output");
        };
        assert_eq!(tables[0].rows.len(), 2);
    }

    #[test]
    fn late_columns_backfill_nulls() {
        let output = "[{\"a\":1},\n{\"a\":2,\"b\":\"x|y\"}]\n";
        let Tabular::Structured(tables) = parse_tabular(output) else {
            panic!("expected structured output");
        };
        assert_eq!(tables[0].rows[0], vec![json!(1), Value::Null]);
        assert!(tables[0].to_markdown().contains("x\\|y"));
    }

    #[test]
    fn non_json_text_falls_back_to_raw() {
        let output = "┌───┐\n│ 1 │\n└───┘\n";
        assert_eq!(parse_tabular(output), Tabular::Raw(output.to_string()));
        assert_eq!(parse_tabular(""), Tabular::Raw(String::new()));
    }
}
