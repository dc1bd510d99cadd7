use super::{event_type, push_opt, short_label, str_at, u64_at, EngineBackend, Invocation};
use crate::stream::{Label, ParsedEvent, Usage};
use foreman_core::EngineKind;
use serde_json::Value;

/// Anthropic `claude` CLI in headless `stream-json` mode.
///
/// The prompt goes over stdin; the context block rides on
/// `--append-system-prompt`.
pub struct ClaudeBackend;

impl EngineBackend for ClaudeBackend {
    fn kind(&self) -> EngineKind {
        EngineKind::Claude
    }

    fn build_args(&self, inv: &Invocation) -> Vec<String> {
        let mut args: Vec<String> = ["--print", "--verbose", "--output-format", "stream-json"]
            .iter()
            .map(|s| (*s).to_string())
            .collect();
        push_opt(&mut args, "--model", Some(inv.model.as_str()));
        args.push("--permission-mode".into());
        args.push(inv.permission_mode.as_flag().into());
        push_opt(&mut args, "--effort", inv.effort.as_deref());
        if inv.is_resume() {
            push_opt(&mut args, "--resume", inv.resume_session.as_deref());
        } else {
            push_opt(&mut args, "--append-system-prompt", inv.system_prompt.as_deref());
        }
        args
    }

    fn parse_event(&self, event: &Value) -> ParsedEvent {
        match event_type(event) {
            "system" if str_at(event, "/subtype") == Some("init") => str_at(event, "/session_id")
                .map(ParsedEvent::session)
                .unwrap_or_default(),
            "assistant" => {
                let mut parsed = ParsedEvent::default();
                let mut text = String::new();
                if let Some(blocks) = event.pointer("/message/content").and_then(Value::as_array) {
                    for block in blocks {
                        match event_type(block) {
                            "text" => text.push_str(str_at(block, "/text").unwrap_or_default()),
                            "tool_use" => {
                                if let Some(name) = str_at(block, "/name") {
                                    parsed.labels.push(Label::tool(name));
                                }
                            }
                            "thinking" => {
                                if let Some(t) = str_at(block, "/thinking").filter(|t| !t.trim().is_empty()) {
                                    parsed.labels.push(Label::thinking(short_label(t)));
                                }
                            }
                            _ => {}
                        }
                    }
                }
                if !text.is_empty() {
                    parsed.text = Some(text);
                    parsed.block_start = true;
                }
                parsed
            }
            "result" => {
                let usage = Usage {
                    input_tokens: u64_at(event, "/usage/input_tokens"),
                    output_tokens: u64_at(event, "/usage/output_tokens"),
                    cached_tokens: u64_at(event, "/usage/cache_read_input_tokens"),
                    cost_usd: event.pointer("/total_cost_usd").and_then(Value::as_f64),
                    turns: event
                        .pointer("/num_turns")
                        .and_then(Value::as_u64)
                        .and_then(|n| u32::try_from(n).ok()),
                    duration_ms: event.pointer("/duration_ms").and_then(Value::as_u64),
                };
                let mut parsed = ParsedEvent::usage(usage);
                parsed.session_id = str_at(event, "/session_id").map(str::to_string);
                if event.pointer("/is_error").and_then(Value::as_bool) == Some(true) {
                    parsed.error = str_at(event, "/result").map(str::to_string);
                }
                parsed
            }
            _ => ParsedEvent::default(),
        }
    }

    fn native_system_prompt(&self) -> bool {
        true
    }
}
