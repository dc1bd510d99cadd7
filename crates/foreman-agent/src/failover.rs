//! Recovery bookkeeping for the supervisor: the same-engine retry budget,
//! exponential backoff, the table of degraded engines and failure
//! summaries.

use foreman_core::EngineKind;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::LazyLock;

/// Configures same-engine retries after a rate limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of same-engine retries before falling back.
    pub max_retries: u32,
    /// Base delay in milliseconds for exponential backoff.
    pub backoff_base_ms: u64,
    /// Maximum delay in milliseconds (cap for exponential backoff).
    pub backoff_max_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff_base_ms: 1000,
            backoff_max_ms: 30_000,
        }
    }
}

/// Computes the backoff delay for a given attempt using exponential backoff
/// capped at `backoff_max_ms`.
pub fn compute_backoff(policy: &RetryPolicy, attempt: u32) -> u64 {
    let delay = policy
        .backoff_base_ms
        .saturating_mul(2u64.saturating_pow(attempt));
    delay.min(policy.backoff_max_ms)
}

// A bare 429 only counts as an HTTP status token, never inside a number.
#[allow(clippy::expect_used)]
static RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)\brate[ _-]?limit|\btoo many requests\b|\busage limit\b|\bresource[ _]exhausted\b|\boverloaded\b|\btry again later\b|\b(?:http|status|code|error)\W{0,3}429\b|\b429\W{0,3}too many\b",
    )
    .expect("valid rate limit regex")
});

/// Whether `text` carries a rate-limit signature.
pub fn has_rate_limit_signature(text: &str) -> bool {
    RATE_LIMIT.is_match(text)
}

const AUTH_HINTS: &[&str] = &["login", "unauthorized", "401", "not authenticated", "api key"];
const QUOTA_HINTS: &[&str] = &["quota", "billing", "credit", "insufficient"];
const SUMMARY_LIMIT: usize = 400;

/// One-line diagnosis of a failed run built from the tail of its stderr.
pub fn failure_summary(engine: EngineKind, exit_code: Option<i32>, stderr: &str) -> String {
    let trimmed = stderr.trim();
    let tail: String = if trimmed.chars().count() > SUMMARY_LIMIT {
        let skip = trimmed.chars().count() - SUMMARY_LIMIT;
        trimmed.chars().skip(skip).collect()
    } else {
        trimmed.to_string()
    };

    let code = exit_code.map_or_else(|| "signal".to_string(), |c| c.to_string());
    let mut summary = if tail.is_empty() {
        format!("{engine} exited with {code} and no output")
    } else {
        format!("{engine} exited with {code}: {tail}")
    };

    let lower = trimmed.to_lowercase();
    if AUTH_HINTS.iter().any(|h| lower.contains(h)) {
        summary.push_str(&format!(" (hint: `{engine}` may need to log in again)"));
    }
    if QUOTA_HINTS.iter().any(|h| lower.contains(h)) {
        summary.push_str(" (hint: the account may be out of quota or credit)");
    }
    summary
}

/// Recovery state of one degraded engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackState {
    /// The degraded engine.
    pub engine: EngineKind,
    /// Same-engine retries still available.
    pub retries_left: u32,
    /// Engine chosen to stand in, once retries ran out.
    pub fallback: Option<EngineKind>,
}

/// Degraded engines. An entry exists only between an engine's first failure
/// and its next success (or a reset).
#[derive(Debug, Default)]
pub struct FallbackTable {
    entries: HashMap<EngineKind, FallbackState>,
}

impl FallbackTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// State for `engine`, if degraded.
    pub fn get(&self, engine: EngineKind) -> Option<&FallbackState> {
        self.entries.get(&engine)
    }

    /// Records a failure and returns the state, creating it with a full
    /// budget on first failure.
    pub fn record_failure(&mut self, engine: EngineKind, policy: &RetryPolicy) -> &mut FallbackState {
        self.entries.entry(engine).or_insert_with(|| FallbackState {
            engine,
            retries_left: policy.max_retries,
            fallback: None,
        })
    }

    /// Consumes one same-engine retry. Returns the zero-based retry number
    /// used for backoff, or `None` when the budget is spent.
    pub fn take_retry(&mut self, engine: EngineKind, policy: &RetryPolicy) -> Option<u32> {
        let state = self.record_failure(engine, policy);
        if state.retries_left == 0 {
            return None;
        }
        state.retries_left -= 1;
        Some(policy.max_retries - state.retries_left - 1)
    }

    /// Records the engine chosen to stand in for `engine`.
    pub fn set_fallback(&mut self, engine: EngineKind, to: EngineKind, policy: &RetryPolicy) {
        let state = self.record_failure(engine, policy);
        state.retries_left = 0;
        state.fallback = Some(to);
    }

    /// Removes `engine`'s state after a success. Returns whether it was
    /// degraded.
    pub fn clear(&mut self, engine: EngineKind) -> bool {
        self.entries.remove(&engine).is_some()
    }

    /// Drops every entry.
    pub fn reset(&mut self) {
        self.entries.clear();
    }

    /// Number of degraded engines.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no engine is degraded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Picks the next engine from `order` that has not been `tried`.
pub fn next_fallback(order: &[EngineKind], tried: &[EngineKind]) -> Option<EngineKind> {
    order.iter().copied().find(|e| !tried.contains(e))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
