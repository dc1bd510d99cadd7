use super::{event_type, push_opt, short_label, str_at, u64_at, EngineBackend, Invocation};
use crate::stream::{Label, ParsedEvent, Usage};
use foreman_core::EngineKind;
use serde_json::Value;

/// `opencode run --format json`.
pub struct OpenCodeBackend;

impl EngineBackend for OpenCodeBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::OpenCode
    }

    fn build_args(&self, inv: &Invocation) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--format".to_string(), "json".to_string()];
        push_opt(&mut args, "-m", Some(inv.model.as_str()));
        if inv.is_resume() {
            push_opt(&mut args, "--session", inv.resume_session.as_deref());
        }
        args
    }

    fn parse_event(&self, event: &Value) -> ParsedEvent {
        let mut parsed = match event_type(event) {
            "text" => str_at(event, "/part/text")
                .map(ParsedEvent::message)
                .unwrap_or_default(),
            "tool_use" => str_at(event, "/part/tool")
                .map(|t| ParsedEvent::label(Label::tool(t)))
                .unwrap_or_default(),
            "reasoning" => str_at(event, "/part/text")
                .filter(|t| !t.trim().is_empty())
                .map(|t| ParsedEvent::label(Label::thinking(short_label(t))))
                .unwrap_or_default(),
            "step_finish" => ParsedEvent::usage(Usage {
                input_tokens: u64_at(event, "/part/tokens/input"),
                output_tokens: u64_at(event, "/part/tokens/output"),
                cached_tokens: u64_at(event, "/part/tokens/cache/read"),
                cost_usd: event.pointer("/part/cost").and_then(Value::as_f64),
                turns: Some(1),
                ..Usage::default()
            }),
            "error" => str_at(event, "/error/message")
                .or_else(|| str_at(event, "/error/data/message"))
                .map(ParsedEvent::error)
                .unwrap_or_default(),
            _ => ParsedEvent::default(),
        };
        // Every opencode event carries the session id; the first one wins.
        if event_type(event) == "step_start" || !parsed.is_empty() {
            parsed.session_id = str_at(event, "/sessionID")
                .or_else(|| str_at(event, "/part/sessionID"))
                .map(str::to_string);
        }
        parsed
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args() {
        let mut inv = Invocation::new(EngineKind::OpenCode, "anthropic/claude-sonnet-4", "x");
        assert_eq!(
            OpenCodeBackend.build_args(&inv),
            vec!["run", "--format", "json", "-m", "anthropic/claude-sonnet-4"]
        );
        inv.resume_session = Some("ses_1".into());
        assert!(OpenCodeBackend
            .build_args(&inv)
            .ends_with(&["--session".to_string(), "ses_1".to_string()]));
    }

    #[test]
    fn test_parse_stream() {
        let b = OpenCodeBackend;
        let start = b.parse_event(&json!({"type":"step_start","sessionID":"ses_1","part":{}}));
        assert_eq!(start.session_id.as_deref(), Some("ses_1"));

        let text = b.parse_event(&json!({"type":"text","sessionID":"ses_1","part":{"text":"Hi there"}}));
        assert_eq!(text.text.as_deref(), Some("Hi there"));

        let tool = b.parse_event(&json!({"type":"tool_use","part":{"tool":"bash","state":{}}}));
        assert_eq!(tool.labels, vec![Label::tool("bash")]);

        let finish = b.parse_event(&json!({
            "type":"step_finish",
            "part":{"cost":0.004,"tokens":{"input":30,"output":8,"cache":{"read":2,"write":0}}}
        }));
        let usage = finish.usage.unwrap();
        assert_eq!(usage.cost_usd, Some(0.004));
        assert_eq!((usage.input_tokens, usage.output_tokens, usage.cached_tokens), (30, 8, 2));
    }

    #[test]
    fn test_unknown_event_has_no_session() {
        let parsed = OpenCodeBackend.parse_event(&json!({"type":"snapshot","sessionID":"ses_1"}));
        assert!(parsed.is_empty());
    }
}
