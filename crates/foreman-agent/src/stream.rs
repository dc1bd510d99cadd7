use foreman_core::LabelKind;
use serde::{Deserialize, Serialize};

/// Token and cost accounting reported by an engine, merged across events.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    /// Input / prompt tokens.
    pub input_tokens: u64,
    /// Output / completion tokens.
    pub output_tokens: u64,
    /// Tokens served from the engine's prompt cache.
    pub cached_tokens: u64,
    /// Reported cost in USD, when the engine reports one.
    pub cost_usd: Option<f64>,
    /// Agentic turns, when reported.
    pub turns: Option<u32>,
    /// Wall time reported by the engine.
    pub duration_ms: Option<u64>,
}

impl Usage {
    /// Adds `other` into `self`. Counters sum; optional fields sum when both
    /// sides have a value and otherwise keep whichever is present.
    pub fn merge(&mut self, other: &Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.cost_usd = sum_opt(self.cost_usd, other.cost_usd);
        self.turns = sum_opt(self.turns, other.turns);
        self.duration_ms = sum_opt(self.duration_ms, other.duration_ms);
    }

    /// Whether nothing was reported.
    pub fn is_empty(&self) -> bool {
        *self == Usage::default()
    }
}

fn sum_opt<T: std::ops::Add<Output = T>>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a + b),
        (a, None) => a,
        (None, b) => b,
    }
}

/// A live-display label (tool name, thinking fragment).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// What the label describes.
    pub kind: LabelKind,
    /// Display text.
    pub text: String,
}

impl Label {
    /// A tool label.
    pub fn tool(text: impl Into<String>) -> Self {
        Self {
            kind: LabelKind::Tool,
            text: text.into(),
        }
    }

    /// A thinking label.
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            kind: LabelKind::Thinking,
            text: text.into(),
        }
    }
}

/// The canonical form every engine event is normalized into.
///
/// Events an engine emits that carry nothing of interest normalize to the
/// empty value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEvent {
    /// Assistant text carried by the event.
    pub text: Option<String>,
    /// The text starts a new message rather than continuing a delta stream.
    pub block_start: bool,
    /// Engine session / thread id announced by the event.
    pub session_id: Option<String>,
    /// Tool and thinking labels.
    pub labels: Vec<Label>,
    /// Usage reported by the event.
    pub usage: Option<Usage>,
    /// Error message reported in-band by the engine.
    pub error: Option<String>,
}

impl ParsedEvent {
    /// An event carrying only text.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// An event carrying a complete assistant message.
    pub fn message(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            block_start: true,
            ..Self::default()
        }
    }

    /// An event carrying an in-band error.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::default()
        }
    }

    /// An event carrying only a session id.
    pub fn session(id: impl Into<String>) -> Self {
        Self {
            session_id: Some(id.into()),
            ..Self::default()
        }
    }

    /// An event carrying a single label.
    pub fn label(label: Label) -> Self {
        Self {
            labels: vec![label],
            ..Self::default()
        }
    }

    /// An event carrying only usage.
    pub fn usage(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Self::default()
        }
    }

    /// Whether the event carries nothing.
    pub fn is_empty(&self) -> bool {
        self.text.is_none()
            && self.session_id.is_none()
            && self.labels.is_empty()
            && self.usage.is_none()
            && self.error.is_none()
    }
}

/// Splits a byte stream into complete lines. A trailing fragment stays
/// buffered until its newline arrives (or [`LineBuffer::finish`] is called).
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every line it completed, without the
    /// trailing `\n` / `\r\n`. Blank lines are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);
            if !line.trim().is_empty() {
                lines.push(line.to_string());
            }
        }
        lines
    }

    /// Flushes the unterminated remainder, if any.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&rest).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Parses one NDJSON line. Non-JSON lines (progress bars, banners) yield
/// `None` and are skipped by callers.
pub fn parse_line(line: &str) -> Option<serde_json::Value> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Folds [`ParsedEvent`]s into the final result of one invocation.
#[derive(Debug, Clone, Default)]
pub struct StreamAccumulator {
    text: String,
    session_id: Option<String>,
    labels: Vec<Label>,
    usage: Usage,
    errors: Vec<String>,
    events: usize,
}

impl StreamAccumulator {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one event: text is appended, the first session id wins, labels
    /// are collected and usage is merged. Whole messages are separated by a
    /// blank line.
    pub fn apply(&mut self, event: &ParsedEvent) {
        self.events += 1;
        if let Some(text) = &event.text {
            if event.block_start && !self.text.is_empty() && !self.text.ends_with("\n\n") {
                self.text.push_str(if self.text.ends_with('\n') { "\n" } else { "\n\n" });
            }
            self.text.push_str(text);
        }
        if let Some(err) = &event.error {
            self.errors.push(err.clone());
        }
        if self.session_id.is_none() {
            if let Some(id) = &event.session_id {
                if !id.is_empty() {
                    self.session_id = Some(id.clone());
                }
            }
        }
        self.labels.extend(event.labels.iter().cloned());
        if let Some(usage) = &event.usage {
            self.usage.merge(usage);
        }
    }

    /// Accumulated assistant text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// First session id seen.
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Every label seen, in order.
    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// In-band errors, in order.
    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    /// Merged usage.
    pub fn usage(&self) -> &Usage {
        &self.usage
    }

    /// Number of events folded.
    pub fn event_count(&self) -> usize {
        self.events
    }

    /// Compact trace of the labels, kept with the history entry.
    pub fn trace(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        let lines: Vec<String> = self
            .labels
            .iter()
            .map(|l| match l.kind {
                LabelKind::Tool => format!("tool: {}", l.text),
                LabelKind::Thinking => format!("thinking: {}", l.text),
            })
            .collect();
        Some(lines.join("\n"))
    }
}
