//! Parsing of the analysis engine's submission acknowledgment.
//!
//! The engine has answered with several JSON shapes over its versions:
//!
//! ```text
//! {"data": {"task_ids": [41]}}
//! {"task_ids": [41]}
//! {"task_id": 41}
//! ```
//!
//! Each shape is one entry in [`TASK_REF_RULES`]; the first rule that
//! matches wins.

use serde_json::Value;

use crate::model::TaskRef;

/// Parsed acknowledgment of a successful submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgment {
    /// `None` when the body carried no recognizable task identifier.
    pub task_ref: Option<TaskRef>,
    /// Response body exactly as received.
    pub raw: String,
}

/// Why an acknowledgment body doesn't count as success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection(pub String);

/// Outer `None`: the shape isn't present, try the next rule. `Some(None)`:
/// the shape is present but its id isn't an integer, and the search stops.
type Rule = fn(&Value) -> Option<Option<TaskRef>>;

/// Task identifier extraction rules, in precedence order.
pub const TASK_REF_RULES: &[(&str, Rule)] = &[
    ("data.task_ids", |v| first_id(v.get("data")?.get("task_ids")?)),
    ("task_ids", |v| first_id(v.get("task_ids")?)),
    ("task_id", |v| Some(Some(TaskRef(v.get("task_id")?.as_i64()?)))),
];

/// Interpret a 2xx response body.
///
/// Non-JSON bodies are tolerated (no task ref, raw text kept). A JSON object
/// with a truthy `error` field is a rejection even though the transport
/// succeeded.
pub fn parse(body: &str) -> Result<Acknowledgment, Rejection> {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return Ok(Acknowledgment {
            task_ref: None,
            raw: body.to_string(),
        });
    };

    if json.get("error").is_some_and(truthy) {
        let detail = match json.get("error_value") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(v) if truthy(v) => v.to_string(),
            _ => body.to_string(),
        };
        return Err(Rejection(detail));
    }

    Ok(Acknowledgment {
        task_ref: extract_task_ref(&json),
        raw: body.to_string(),
    })
}

/// Apply [`TASK_REF_RULES`] in order; first match wins.
pub fn extract_task_ref(json: &Value) -> Option<TaskRef> {
    if !json.is_object() {
        return None;
    }
    TASK_REF_RULES
        .iter()
        .find_map(|(_, rule)| rule(json))
        .flatten()
}

/// A non-empty list answers with its first element; a scalar integer
/// answers with itself.
fn first_id(v: &Value) -> Option<Option<TaskRef>> {
    match v {
        Value::Array(items) => items.first().map(|id| id.as_i64().map(TaskRef)),
        other => other.as_i64().map(|id| Some(TaskRef(id))),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
