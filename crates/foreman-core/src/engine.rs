use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::ForemanError;

/// One external AI command-line tool with its own wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Anthropic `claude` CLI (`stream-json` output).
    Claude,
    /// OpenAI `codex exec --json`.
    Codex,
    /// Google `gemini` CLI (`stream-json` output).
    Gemini,
    /// `opencode run --format json`.
    OpenCode,
    /// GitHub `copilot` CLI (JSON output).
    Copilot,
}

impl EngineKind {
    /// Every supported engine, in default fallback order.
    pub const ALL: [EngineKind; 5] = [
        EngineKind::Claude,
        EngineKind::Codex,
        EngineKind::Gemini,
        EngineKind::OpenCode,
        EngineKind::Copilot,
    ];

    /// Stable lowercase identifier used in config files and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Claude => "claude",
            EngineKind::Codex => "codex",
            EngineKind::Gemini => "gemini",
            EngineKind::OpenCode => "opencode",
            EngineKind::Copilot => "copilot",
        }
    }

    /// Binary name used when the registry does not override it.
    pub fn default_binary(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = ForemanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "claude" => Ok(EngineKind::Claude),
            "codex" => Ok(EngineKind::Codex),
            "gemini" => Ok(EngineKind::Gemini),
            "opencode" => Ok(EngineKind::OpenCode),
            "copilot" => Ok(EngineKind::Copilot),
            other => Err(ForemanError::Engine(format!("unknown engine '{other}'"))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_agree() {
        for kind in EngineKind::ALL {
            let parsed: EngineKind = kind.to_string().parse().unwrap();
            assert_eq!(parsed, kind);
        }
        assert_eq!("  OpenCode ".parse::<EngineKind>().unwrap(), EngineKind::OpenCode);
    }

    #[test]
    fn test_unknown_engine_is_an_error() {
        let err = "cursor".parse::<EngineKind>().unwrap_err();
        assert!(err.to_string().contains("cursor"));
    }

    #[test]
    fn test_serde_uses_lowercase_ids() {
        let json = serde_json::to_string(&EngineKind::OpenCode).unwrap();
        assert_eq!(json, "\"opencode\"");
        let back: EngineKind = serde_json::from_str("\"codex\"").unwrap();
        assert_eq!(back, EngineKind::Codex);
    }
}
