use super::{event_type, push_opt, short_label, str_at, u64_at, EngineBackend, Invocation};
use crate::stream::{Label, ParsedEvent, Usage};
use foreman_core::EngineKind;
use serde_json::Value;

/// OpenAI `codex exec --json`.
pub struct CodexBackend;

impl EngineBackend for CodexBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Codex
    }

    fn build_args(&self, inv: &Invocation) -> Vec<String> {
        let mut args = vec!["exec".to_string()];
        if inv.is_resume() {
            args.push("resume".into());
            if let Some(sid) = inv.resume_session.as_deref() {
                args.push(sid.to_string());
            }
        }
        args.push("--json".into());
        args.push("--skip-git-repo-check".into());
        push_opt(&mut args, "-m", Some(inv.model.as_str()));
        if let Some(effort) = inv.effort.as_deref().filter(|e| !e.is_empty()) {
            args.push("-c".into());
            args.push(format!("model_reasoning_effort={effort}"));
        }
        if inv.permission_mode.is_auto() {
            args.push("--dangerously-bypass-approvals-and-sandbox".into());
        }
        // Prompt is read from stdin.
        args.push("-".into());
        args
    }

    fn parse_event(&self, event: &Value) -> ParsedEvent {
        match event_type(event) {
            "thread.started" => str_at(event, "/thread_id")
                .map(ParsedEvent::session)
                .unwrap_or_default(),
            "item.started" => item_label(event.get("item").unwrap_or(&Value::Null))
                .map(ParsedEvent::label)
                .unwrap_or_default(),
            "item.completed" => {
                let item = event.get("item").unwrap_or(&Value::Null);
                match str_at(item, "/type") {
                    Some("agent_message") => str_at(item, "/text")
                        .map(ParsedEvent::message)
                        .unwrap_or_default(),
                    Some("reasoning") => str_at(item, "/text")
                        .filter(|t| !t.trim().is_empty())
                        .map(|t| ParsedEvent::label(Label::thinking(short_label(t))))
                        .unwrap_or_default(),
                    Some("error") => str_at(item, "/message")
                        .map(ParsedEvent::error)
                        .unwrap_or_default(),
                    _ => ParsedEvent::default(),
                }
            }
            "turn.completed" => ParsedEvent::usage(Usage {
                input_tokens: u64_at(event, "/usage/input_tokens"),
                output_tokens: u64_at(event, "/usage/output_tokens"),
                cached_tokens: u64_at(event, "/usage/cached_input_tokens"),
                turns: Some(1),
                ..Usage::default()
            }),
            "turn.failed" => str_at(event, "/error/message")
                .map(ParsedEvent::error)
                .unwrap_or_default(),
            "error" => str_at(event, "/message")
                .map(ParsedEvent::error)
                .unwrap_or_default(),
            _ => ParsedEvent::default(),
        }
    }
}

fn item_label(item: &Value) -> Option<Label> {
    match str_at(item, "/type")? {
        "command_execution" => str_at(item, "/command").map(|c| Label::tool(short_label(c))),
        "mcp_tool_call" => {
            let tool = str_at(item, "/tool")?;
            Some(Label::tool(match str_at(item, "/server") {
                Some(server) => format!("{server}.{tool}"),
                None => tool.to_string(),
            }))
        }
        "web_search" => Some(Label::tool(format!(
            "web_search {}",
            short_label(str_at(item, "/query").unwrap_or_default())
        ))),
        "file_change" => Some(Label::tool("apply_patch")),
        _ => None,
    }
}
