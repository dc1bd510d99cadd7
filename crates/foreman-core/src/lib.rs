//! Core types shared across all Foreman crates.
//!
//! Foreman drives external command-line AI engines as interchangeable
//! workers. This crate holds the pieces every other crate needs:
//!
//! - [`ForemanError`]: Unified error enum for all Foreman subsystems.
//! - [`ForemanResult`]: Convenience alias for `Result<T, ForemanError>`.
//! - [`EngineKind`]: Identifier of one supported engine wire protocol.
//! - [`Message`] / [`Origin`]: Conversation history entries and where they came from.
//! - [`BroadcastBus`] / [`BusEvent`]: Process-wide publish/subscribe channel.

/// Engine identifiers.
pub mod engine;
/// Unified error type.
pub mod error;
/// Broadcast bus and event taxonomy.
pub mod events;
/// Conversation message types.
pub mod message;

pub use engine::EngineKind;
pub use error::{ForemanError, ForemanResult};
pub use events::{AgentStatus, BroadcastBus, BusEvent, Envelope, LabelKind, ListenerId};
pub use message::{ChannelKey, Message, Origin, Role};
