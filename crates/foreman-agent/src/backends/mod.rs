//! Per-engine protocol adapters: argument builders and stream parsers.

pub mod claude;
pub mod codex;
pub mod copilot;
pub mod gemini;
pub mod opencode;

use crate::config::PermissionMode;
use crate::failover::has_rate_limit_signature;
use crate::stream::ParsedEvent;
use foreman_core::EngineKind;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

pub use claude::ClaudeBackend;
pub use codex::CodexBackend;
pub use copilot::CopilotBackend;
pub use gemini::GeminiBackend;
pub use opencode::OpenCodeBackend;

/// Everything a backend needs to build one engine invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// Target engine.
    pub engine: EngineKind,
    /// Model name.
    pub model: String,
    /// Reasoning effort, for engines that support it.
    pub effort: Option<String>,
    /// Autonomy granted to the engine.
    pub permission_mode: PermissionMode,
    /// Context block for engines with a native system-prompt flag.
    pub system_prompt: Option<String>,
    /// Session to resume; `None` selects the fresh form.
    pub resume_session: Option<String>,
    /// The user prompt.
    pub prompt: String,
}

impl Invocation {
    /// A fresh invocation with no effort, system prompt or resume.
    pub fn new(engine: EngineKind, model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            engine,
            model: model.into(),
            effort: None,
            permission_mode: PermissionMode::default(),
            system_prompt: None,
            resume_session: None,
            prompt: prompt.into(),
        }
    }

    /// Whether the resume form applies.
    pub fn is_resume(&self) -> bool {
        self.resume_session.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Strategy for one engine's command line and event stream.
///
/// Each engine (claude, codex, gemini, opencode, copilot) implements this
/// trait; the supervisor never inspects engine-specific JSON itself.
///
/// To add a new engine:
/// 1. Create a new module in `backends/`
/// 2. Implement `EngineBackend` for your struct
/// 3. Add the variant to `EngineKind` in `foreman-core`
/// 4. Register it in `EngineRegistry::with_builtin()`
pub trait EngineBackend: Send + Sync {
    /// The engine this backend speaks for.
    fn kind(&self) -> EngineKind;

    /// Argument vector (without the binary) in fresh or resume form.
    fn build_args(&self, inv: &Invocation) -> Vec<String>;

    /// Text written to the engine's stdin. Fresh sessions of engines without
    /// a native system-prompt flag get the context block ahead of the prompt;
    /// resumed sessions get only the prompt.
    fn stdin_payload(&self, inv: &Invocation, context_block: Option<&str>) -> String {
        match context_block {
            Some(block)
                if !inv.is_resume() && !self.native_system_prompt() && !block.trim().is_empty() =>
            {
                format!("{}\n\n---\n\n{}", block.trim_end(), inv.prompt)
            }
            _ => inv.prompt.clone(),
        }
    }

    /// Normalizes one decoded stdout line. Unknown event types yield an
    /// empty [`ParsedEvent`].
    fn parse_event(&self, event: &Value) -> ParsedEvent;

    /// Whether a finished run failed because of rate limiting.
    ///
    /// `diagnostics` is stderr plus any in-band error events. The assistant
    /// text is only consulted when there are no diagnostics at all.
    fn is_rate_limited(&self, exit_code: Option<i32>, diagnostics: &str, text: &str) -> bool {
        if exit_code == Some(0) && !text.trim().is_empty() {
            return false;
        }
        if !diagnostics.trim().is_empty() {
            return has_rate_limit_signature(diagnostics);
        }
        has_rate_limit_signature(text)
    }

    /// Whether the engine takes the context block through a CLI flag.
    fn native_system_prompt(&self) -> bool {
        false
    }
}

/// Backends keyed by engine.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    backends: HashMap<EngineKind, Arc<dyn EngineBackend>>,
}

impl EngineRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in backend.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(ClaudeBackend));
        registry.register(Arc::new(CodexBackend));
        registry.register(Arc::new(GeminiBackend));
        registry.register(Arc::new(OpenCodeBackend));
        registry.register(Arc::new(CopilotBackend));
        registry
    }

    /// Adds or replaces the backend for its engine.
    pub fn register(&mut self, backend: Arc<dyn EngineBackend>) {
        self.backends.insert(backend.kind(), backend);
    }

    /// The backend for `kind`.
    pub fn get(&self, kind: EngineKind) -> Option<Arc<dyn EngineBackend>> {
        self.backends.get(&kind).cloned()
    }

    /// Argument vector for `inv`, or empty when no backend handles its
    /// engine.
    pub fn build_args(&self, inv: &Invocation) -> Vec<String> {
        self.get(inv.engine)
            .map(|b| b.build_args(inv))
            .unwrap_or_default()
    }

    /// Registered engines, sorted.
    pub fn kinds(&self) -> Vec<EngineKind> {
        let mut kinds: Vec<_> = self.backends.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

// ---------------------------------------------------------------------------
// JSON helpers shared by the backends
// ---------------------------------------------------------------------------

pub(crate) fn str_at<'a>(value: &'a Value, pointer: &str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

pub(crate) fn u64_at(value: &Value, pointer: &str) -> u64 {
    value.pointer(pointer).and_then(Value::as_u64).unwrap_or(0)
}

pub(crate) fn event_type(value: &Value) -> &str {
    str_at(value, "/type").unwrap_or_default()
}

/// Single-line label, cut to 80 characters.
pub(crate) fn short_label(text: &str) -> String {
    let line = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if line.chars().count() > 80 {
        let mut cut: String = line.chars().take(77).collect();
        cut.push_str("...");
        cut
    } else {
        line
    }
}

pub(crate) fn push_opt(args: &mut Vec<String>, flag: &str, value: Option<&str>) {
    if let Some(v) = value.filter(|v| !v.is_empty()) {
        args.push(flag.to_string());
        args.push(v.to_string());
    }
}
