//! Decides whether a request is worth a multi-worker run.

use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)]
static FILE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:^|[\s`(])(?:\.{0,2}/)?(?:[\w.-]+/)+[\w.-]+|\b[\w-]+\.(?:rs|ts|tsx|js|jsx|py|go|java|kt|rb|c|h|cpp|cs|swift|md|toml|json|ya?ml|css|scss|html|sql|sh)\b",
    )
    .expect("valid path regex")
});

#[allow(clippy::expect_used)]
static LIST_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*(?:\d+[.)]|[-*•])\s+\S").expect("valid list regex"));

#[allow(clippy::expect_used)]
static SEQUENCE_WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:first|then|next|after that|afterwards|finally|lastly|second|third)\b")
        .expect("valid sequence regex")
});

/// One independent complexity signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// The request is at least the configured length.
    Length,
    /// A code fence or a file-path token.
    CodeOrPath,
    /// A list of two or more items, or two or more sequencing words.
    MultiStep,
}

/// Result of triaging one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assessment {
    pub signals: Vec<Signal>,
}

impl Assessment {
    /// Two independent signals are required to orchestrate.
    pub fn should_orchestrate(&self) -> bool {
        self.signals.len() >= 2
    }
}

/// Collects the complexity signals present in `text`.
pub fn assess(text: &str, min_len: usize) -> Assessment {
    let mut signals = Vec::new();
    if text.trim().chars().count() >= min_len {
        signals.push(Signal::Length);
    }
    if text.contains("```") || FILE_PATH.is_match(text) {
        signals.push(Signal::CodeOrPath);
    }
    if LIST_ITEM.find_iter(text).count() >= 2 || SEQUENCE_WORD.find_iter(text).count() >= 2 {
        signals.push(Signal::MultiStep);
    }
    Assessment { signals }
}
