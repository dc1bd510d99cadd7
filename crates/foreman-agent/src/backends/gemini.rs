use super::{event_type, push_opt, str_at, u64_at, EngineBackend, Invocation};
use crate::stream::{Label, ParsedEvent, Usage};
use foreman_core::EngineKind;
use serde_json::Value;

/// Google `gemini` CLI with `--output-format stream-json`.
pub struct GeminiBackend;

impl EngineBackend for GeminiBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Gemini
    }

    fn build_args(&self, inv: &Invocation) -> Vec<String> {
        let mut args = vec!["--output-format".to_string(), "stream-json".to_string()];
        push_opt(&mut args, "-m", Some(inv.model.as_str()));
        if inv.permission_mode.is_auto() {
            args.push("--yolo".into());
        }
        if inv.is_resume() {
            push_opt(&mut args, "--resume", inv.resume_session.as_deref());
        }
        args
    }

    fn parse_event(&self, event: &Value) -> ParsedEvent {
        match event_type(event) {
            "init" => str_at(event, "/session_id")
                .map(ParsedEvent::session)
                .unwrap_or_default(),
            "message" if str_at(event, "/role") == Some("assistant") => {
                let Some(content) = str_at(event, "/content") else {
                    return ParsedEvent::default();
                };
                let is_delta = event.pointer("/delta").and_then(Value::as_bool) == Some(true);
                if is_delta {
                    ParsedEvent::text(content)
                } else {
                    ParsedEvent::message(content)
                }
            }
            "tool_use" => str_at(event, "/tool_name")
                .map(|t| ParsedEvent::label(Label::tool(t)))
                .unwrap_or_default(),
            "result" => {
                let mut parsed = ParsedEvent::usage(Usage {
                    input_tokens: u64_at(event, "/stats/input_tokens"),
                    output_tokens: u64_at(event, "/stats/output_tokens"),
                    cached_tokens: u64_at(event, "/stats/cached"),
                    duration_ms: event.pointer("/stats/duration_ms").and_then(Value::as_u64),
                    ..Usage::default()
                });
                if str_at(event, "/status") == Some("error") {
                    parsed.error = str_at(event, "/error/message").map(str::to_string);
                }
                parsed
            }
            "error" => str_at(event, "/message")
                .map(ParsedEvent::error)
                .unwrap_or_default(),
            _ => ParsedEvent::default(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_args() {
        let mut inv = Invocation::new(EngineKind::Gemini, "gemini-2.5-pro", "x");
        assert_eq!(
            GeminiBackend.build_args(&inv),
            vec!["--output-format", "stream-json", "-m", "gemini-2.5-pro", "--yolo"]
        );
        inv.resume_session = Some("g-1".into());
        let args = GeminiBackend.build_args(&inv);
        assert_eq!(&args[args.len() - 2..], ["--resume", "g-1"]);
    }

    #[test]
    fn test_parse_stream() {
        let b = GeminiBackend;
        assert_eq!(
            b.parse_event(&json!({"type":"init","session_id":"g-1","model":"x"}))
                .session_id
                .as_deref(),
            Some("g-1")
        );
        let user = b.parse_event(&json!({"type":"message","role":"user","content":"hi"}));
        assert!(user.is_empty());
        let delta = b.parse_event(&json!({"type":"message","role":"assistant","content":"Hel","delta":true}));
        assert_eq!(delta.text.as_deref(), Some("Hel"));
        assert!(!delta.block_start);
        let tool = b.parse_event(&json!({"type":"tool_use","tool_name":"read_file","tool_id":"1"}));
        assert_eq!(tool.labels, vec![Label::tool("read_file")]);
        let result = b.parse_event(&json!({
            "type":"result","status":"success",
            "stats":{"input_tokens":12,"output_tokens":3,"duration_ms":900}
        }));
        let usage = result.usage.unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.duration_ms, Some(900));
    }
}
