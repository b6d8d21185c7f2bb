//! JSON and properties renderers for status replies.

use std::collections::HashSet;

use ajplb_common::protocol::error::Result;
use serde_json::Value;

use crate::command::Mime;
use crate::service::StatusReply;

/// Key prefix of every properties line.
pub const PROPERTY_PREFIX: &str = "ajplb";

pub fn render(reply: &StatusReply, mime: Mime) -> Result<String> {
    let value = serde_json::to_value(reply)?;
    match mime {
        Mime::Json => Ok(serde_json::to_string_pretty(&value)?),
        Mime::Prop => Ok(properties(&value)),
    }
}

/// Flattens a JSON value into `key=value` lines.
///
/// Array elements are keyed by their `name` field when every element has
/// a distinct one, by position otherwise. Nulls render as an empty value.
pub fn properties(value: &Value) -> String {
    let mut lines = Vec::new();
    flatten(PROPERTY_PREFIX.to_string(), value, &mut lines);
    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}

fn flatten(key: String, value: &Value, lines: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                flatten(format!("{}.{}", key, k), v, lines);
            }
        }
        Value::Array(items) => {
            let names = element_names(items);
            for (i, item) in items.iter().enumerate() {
                let segment = match &names {
                    Some(names) => names[i].to_string(),
                    None => i.to_string(),
                };
                flatten(format!("{}.{}", key, segment), item, lines);
            }
        }
        Value::Null => lines.push(format!("{}=", key)),
        Value::String(s) => lines.push(format!("{}={}", key, s)),
        other => lines.push(format!("{}={}", key, other)),
    }
}

fn element_names(items: &[Value]) -> Option<Vec<&str>> {
    let names: Vec<&str> = items
        .iter()
        .map(|item| item.get("name").and_then(Value::as_str))
        .collect::<Option<_>>()?;
    let distinct: HashSet<&str> = names.iter().copied().collect();
    (distinct.len() == names.len()).then_some(names)
}
