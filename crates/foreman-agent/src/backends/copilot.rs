use super::{event_type, push_opt, short_label, str_at, EngineBackend, Invocation};
use crate::stream::{Label, ParsedEvent, Usage};
use foreman_core::EngineKind;
use serde_json::Value;

/// GitHub `copilot` CLI with JSON output.
pub struct CopilotBackend;

impl EngineBackend for CopilotBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Copilot
    }

    fn build_args(&self, inv: &Invocation) -> Vec<String> {
        let mut args = vec!["--output-format".to_string(), "json".to_string()];
        push_opt(&mut args, "--model", Some(inv.model.as_str()));
        if inv.permission_mode.is_auto() {
            args.push("--allow-all-tools".into());
        }
        if inv.is_resume() {
            push_opt(&mut args, "--resume", inv.resume_session.as_deref());
        }
        args
    }

    fn parse_event(&self, event: &Value) -> ParsedEvent {
        match event_type(event) {
            "session.start" => str_at(event, "/data/sessionId")
                .map(ParsedEvent::session)
                .unwrap_or_default(),
            "assistant.message_delta" => str_at(event, "/data/deltaContent")
                .map(ParsedEvent::text)
                .unwrap_or_default(),
            "assistant.reasoning" => str_at(event, "/data/content")
                .filter(|t| !t.trim().is_empty())
                .map(|t| ParsedEvent::label(Label::thinking(short_label(t))))
                .unwrap_or_default(),
            "tool.execution_start" => str_at(event, "/data/toolName")
                .map(|t| ParsedEvent::label(Label::tool(t)))
                .unwrap_or_default(),
            "result" => ParsedEvent::usage(Usage {
                input_tokens: first_u64(event, &["/usage/inputTokens", "/usage/input_tokens"]),
                output_tokens: first_u64(event, &["/usage/outputTokens", "/usage/output_tokens"]),
                duration_ms: event
                    .pointer("/usage/sessionDurationMs")
                    .and_then(Value::as_u64),
                turns: Some(1),
                ..Usage::default()
            }),
            "session.error" | "error" => str_at(event, "/data/message")
                .or_else(|| str_at(event, "/message"))
                .map(ParsedEvent::error)
                .unwrap_or_default(),
            _ => ParsedEvent::default(),
        }
    }
}

fn first_u64(event: &Value, pointers: &[&str]) -> u64 {
    pointers
        .iter()
        .find_map(|p| event.pointer(p).and_then(Value::as_u64))
        .unwrap_or(0)
}
