use crate::failover::RetryPolicy;
use foreman_core::EngineKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// How much autonomy engines get over the working tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionMode {
    /// Engines may edit files and run commands without asking.
    #[default]
    Auto,
    /// Read-only planning.
    Plan,
    /// The engine's own default behaviour.
    Default,
}

impl PermissionMode {
    /// Value passed to engines that take a permission-mode flag.
    pub fn as_flag(&self) -> &'static str {
        match self {
            PermissionMode::Auto => "bypassPermissions",
            PermissionMode::Plan => "plan",
            PermissionMode::Default => "default",
        }
    }

    /// Whether engines should skip their approval prompts.
    pub fn is_auto(&self) -> bool {
        matches!(self, PermissionMode::Auto)
    }
}

/// Registry entry for one engine: binary, models and efforts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSpec {
    /// Executable name or path.
    pub binary: String,
    /// Model used when a request names none.
    pub default_model: String,
    /// Models offered for this engine.
    #[serde(default)]
    pub models: Vec<String>,
    /// Reasoning effort used when a request names none; empty for engines
    /// without the concept.
    #[serde(default)]
    pub default_effort: String,
    /// Efforts offered for this engine.
    #[serde(default)]
    pub efforts: Vec<String>,
}

impl EngineSpec {
    /// Built-in defaults for `kind`.
    pub fn builtin(kind: EngineKind) -> Self {
        let (model, models, effort, efforts) = match kind {
            EngineKind::Claude => ("sonnet", vec!["sonnet", "opus", "haiku"], "", vec![]),
            EngineKind::Codex => (
                "gpt-5-codex",
                vec!["gpt-5-codex", "gpt-5"],
                "medium",
                vec!["minimal", "low", "medium", "high"],
            ),
            EngineKind::Gemini => (
                "gemini-2.5-pro",
                vec!["gemini-2.5-pro", "gemini-2.5-flash"],
                "",
                vec![],
            ),
            EngineKind::OpenCode => (
                "anthropic/claude-sonnet-4",
                vec!["anthropic/claude-sonnet-4"],
                "",
                vec![],
            ),
            EngineKind::Copilot => ("claude-sonnet-4", vec!["claude-sonnet-4", "gpt-5"], "", vec![]),
        };
        Self {
            binary: kind.default_binary().to_string(),
            default_model: model.to_string(),
            models: models.into_iter().map(String::from).collect(),
            default_effort: effort.to_string(),
            efforts: efforts.into_iter().map(String::from).collect(),
        }
    }

    /// The effort to use, or `None` when the engine has no effort setting.
    pub fn effort(&self, requested: Option<&str>) -> Option<String> {
        requested
            .filter(|e| !e.is_empty())
            .or(Some(self.default_effort.as_str()).filter(|e| !e.is_empty()))
            .map(str::to_string)
    }
}

/// Everything the supervisor needs from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Permission mode handed to every engine.
    #[serde(default)]
    pub permission_mode: PermissionMode,
    /// Grace period between a terminate request and a forced kill.
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,
    /// Recent history messages included in a fresh session's context block.
    #[serde(default = "default_history_context")]
    pub history_context: usize,
    /// Same-engine retry budget for rate limits.
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Ordered engines tried when one becomes unavailable.
    #[serde(default = "default_fallback_order")]
    pub fallback_order: Vec<EngineKind>,
    /// Engine registry keyed by engine name; engines missing here use
    /// [`EngineSpec::builtin`].
    #[serde(default)]
    pub engines: BTreeMap<String, EngineSpec>,
}

fn default_kill_grace_ms() -> u64 {
    3000
}

fn default_history_context() -> usize {
    10
}

fn default_fallback_order() -> Vec<EngineKind> {
    vec![EngineKind::Claude, EngineKind::Codex, EngineKind::Gemini]
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            permission_mode: PermissionMode::default(),
            kill_grace_ms: default_kill_grace_ms(),
            history_context: default_history_context(),
            retry: RetryPolicy::default(),
            fallback_order: default_fallback_order(),
            engines: BTreeMap::new(),
        }
    }
}

impl SupervisorConfig {
    /// The registry entry for `kind`, falling back to built-in defaults.
    pub fn engine(&self, kind: EngineKind) -> EngineSpec {
        self.engines
            .get(kind.as_str())
            .cloned()
            .unwrap_or_else(|| EngineSpec::builtin(kind))
    }
}
