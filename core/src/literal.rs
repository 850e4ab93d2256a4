use serde_json::Value;

/// Renders a JSON value as an engine literal.
pub fn value_to_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => quote_string(text),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(value_to_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Object(fields) => {
            let fields: Vec<String> = fields
                .iter()
                .map(|(key, value)| format!("{}: {}", quote_string(key), value_to_literal(value)))
                .collect();
            format!("{{{}}}", fields.join(", "))
        }
    }
}

pub fn quote_string(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn scalars() {
        assert_eq!(value_to_literal(&json!(null)), "NULL");
        assert_eq!(value_to_literal(&json!(true)), "TRUE");
        assert_eq!(value_to_literal(&json!(-1.5)), "-1.5");
        assert_eq!(value_to_literal(&json!("O'Brien")), "'O''Brien'");
    }

    #[test]
    fn nested_values_become_lists_and_structs() {
        assert_eq!(value_to_literal(&json!([1, "a", null])), "[1, 'a', NULL]");
        assert_eq!(
            value_to_literal(&json!({"id": 7, "tags": ["x"]})),
            "{'id': 7, 'tags': ['x']}"
        );
    }
}
