//! Defensive extraction of the planner's and reviewer's JSON replies.
//!
//! Engines wrap JSON in prose, in ```json fences, or send it bare. Each
//! candidate is tried in turn; the first one that decodes into the expected
//! shape wins.

use crate::types::{Subtask, Verdict, WorkerRole};
use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*\n?(.*?)```").expect("valid fence regex"));

/// A decoded planner reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub direct_answer: Option<String>,
    pub subtasks: Vec<Subtask>,
}

/// A decoded reviewer reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Review {
    pub verdicts: Vec<Verdict>,
    /// Advisory only; completion is decided from the phases.
    pub all_done: bool,
}

/// JSON object candidates in `text`: fenced blocks first, then the whole
/// text, then the outermost braces.
pub fn json_candidates(text: &str) -> Vec<Value> {
    let mut raw: Vec<&str> = FENCE
        .captures_iter(text)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect();
    raw.push(text.trim());
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            raw.push(&text[start..=end]);
        }
    }
    raw.into_iter()
        .filter_map(|s| serde_json::from_str::<Value>(s.trim()).ok())
        .filter(Value::is_object)
        .collect()
}

/// Decodes a planner reply. `None` when no candidate has the plan shape.
pub fn parse_plan(text: &str) -> Option<Plan> {
    json_candidates(text).into_iter().find_map(|v| plan_from_value(&v))
}

/// Decodes a reviewer reply. `None` when no candidate has a `verdicts`
/// array.
pub fn parse_review(text: &str) -> Option<Review> {
    json_candidates(text)
        .into_iter()
        .find_map(|v| review_from_value(&v))
}

fn plan_from_value(v: &Value) -> Option<Plan> {
    let direct_answer = v
        .get("direct_answer")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    let subtasks = match v.get("subtasks") {
        Some(Value::Array(items)) => items.iter().filter_map(subtask_from_value).collect(),
        Some(Value::Null) | None if direct_answer.is_some() => Vec::new(),
        _ => return None,
    };
    Some(Plan {
        direct_answer,
        subtasks,
    })
}

fn subtask_from_value(v: &Value) -> Option<Subtask> {
    let agent = string_field(v, "agent")?;
    let task = string_field(v, "task")?;
    let role = v
        .get("role")
        .and_then(Value::as_str)
        .map(WorkerRole::parse_lenient)
        .unwrap_or(WorkerRole::Custom);
    let criteria = match v.get("criteria") {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(|s| format!("- {}", s.trim()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    };
    let files = v
        .get("files")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Some(Subtask {
        agent,
        role,
        task,
        criteria,
        files,
    })
}

fn review_from_value(v: &Value) -> Option<Review> {
    let items = v.get("verdicts")?.as_array()?;
    let verdicts = items
        .iter()
        .filter_map(|item| {
            let agent = string_field(item, "agent")?;
            let pass = match item.get("pass") {
                Some(Value::Bool(b)) => *b,
                Some(Value::String(s)) => {
                    matches!(s.trim().to_ascii_lowercase().as_str(), "pass" | "true" | "yes")
                }
                _ => false,
            };
            let feedback = item
                .get("feedback")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .trim()
                .to_string();
            Some(Verdict {
                agent,
                pass,
                feedback,
            })
        })
        .collect();
    let all_done = v.get("all_done").and_then(Value::as_bool).unwrap_or(false);
    Some(Review { verdicts, all_done })
}

fn string_field(v: &Value, key: &str) -> Option<String> {
    v.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
