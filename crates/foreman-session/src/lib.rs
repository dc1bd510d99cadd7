//! Durable state for Foreman: conversation history, per-engine session
//! bindings and the markdown worklog of orchestration runs.

/// Last known engine session, used to resume conversations.
pub mod bindings;
/// Conversation history store.
pub mod history;
/// Markdown worklog of orchestration runs.
pub mod worklog;

pub use bindings::{BindingStore, FileBindingStore, MemoryBindingStore, SessionBinding};
pub use history::{FileHistoryStore, HistoryStore, MemoryHistoryStore};
pub use worklog::{
    LogEntry, MatrixRow, PlanEntry, RowStatus, WorklogRun, WorklogStatus, WorklogStore,
};
