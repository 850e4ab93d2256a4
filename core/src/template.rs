//! `{{ name }}` placeholders in query text.
//!
//! `{{ name }}` inserts the parameter as an engine literal, `{{! name }}`
//! inserts its raw text (for identifiers and file names). Dotted names walk
//! into nested objects.

use std::sync::LazyLock;

use regex_lite::Captures;
use regex_lite::Regex;
use serde_json::Map;
use serde_json::Value;

use crate::error::Result;
use crate::error::SqlCellErr;
use crate::literal::value_to_literal;

static PLACEHOLDER: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*(!?)\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}").ok()
});

pub fn expand_template(body: &str, params: &Map<String, Value>) -> Result<String> {
    let Some(re) = PLACEHOLDER.as_ref() else {
        return Err(SqlCellErr::Template("placeholder pattern failed to compile".to_string()));
    };
    let mut missing = Vec::new();
    let expanded = re.replace_all(body, |caps: &Captures<'_>| {
        let raw = !caps[1].is_empty();
        let name = &caps[2];
        match lookup(params, name) {
            Some(value) if raw => raw_text(value),
            Some(value) => value_to_literal(value),
            None => {
                missing.push(name.to_string());
                String::new()
            }
        }
    });
    if !missing.is_empty() {
        return Err(SqlCellErr::Template(format!(
            "unknown parameter(s): {}",
            missing.join(", ")
        )));
    }
    Ok(expanded.into_owned())
}

fn lookup<'a>(params: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    let mut parts = name.split('.');
    let mut current = params.get(parts.next()?)?;
    for part in parts {
        current = match current {
            Value::Object(fields) => fields.get(part)?,
            Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn raw_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
