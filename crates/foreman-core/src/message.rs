use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::EngineKind;

/// The role of the participant that authored a [`Message`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// A human end-user.
    User,
    /// A worker engine's answer.
    Assistant,
    /// A system-level notice (resets, fallbacks, steering).
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Front end that delivered a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Web UI / WebSocket clients.
    Web,
    /// Telegram bot forwarder.
    Telegram,
    /// The local command line.
    #[default]
    Cli,
    /// Produced by Foreman itself (resume prompts, summaries).
    Internal,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Web => write!(f, "web"),
            Origin::Telegram => write!(f, "telegram"),
            Origin::Cli => write!(f, "cli"),
            Origin::Internal => write!(f, "internal"),
        }
    }
}

/// Identifies one conversation: the front end plus its channel-scoped id
/// (e.g. a Telegram chat id). Queue fairness and event filtering key on it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelKey {
    /// Front end that owns the conversation.
    pub origin: Origin,
    /// Channel-scoped id, if the front end multiplexes conversations.
    #[serde(default)]
    pub channel_id: Option<String>,
}

impl ChannelKey {
    /// Creates a key for `origin` with an optional channel id.
    pub fn new(origin: Origin, channel_id: Option<String>) -> Self {
        Self { origin, channel_id }
    }
}

/// A single entry in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: Uuid,
    /// The role of the message author.
    pub role: Role,
    /// The textual content of the message.
    pub content: String,
    /// Engine that produced the message, for assistant entries.
    #[serde(default)]
    pub engine: Option<EngineKind>,
    /// Model that produced the message, for assistant entries.
    #[serde(default)]
    pub model: Option<String>,
    /// Raw event trace kept for debugging (tool labels, usage).
    #[serde(default)]
    pub trace: Option<String>,
    /// Conversation the message belongs to.
    #[serde(default)]
    pub channel: ChannelKey,
    /// UTC timestamp of when the message was created.
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a new message with the given role and content.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            engine: None,
            model: None,
            trace: None,
            channel: ChannelKey::default(),
            timestamp: Utc::now(),
        }
    }

    /// Creates a new message with [`Role::User`].
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    /// Creates a new message with [`Role::Assistant`].
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Creates a new message with [`Role::System`].
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    /// Tags the message with the engine and model that produced it.
    pub fn with_engine(mut self, engine: EngineKind, model: impl Into<String>) -> Self {
        self.engine = Some(engine);
        self.model = Some(model.into());
        self
    }

    /// Tags the message with its conversation.
    pub fn with_channel(mut self, channel: ChannelKey) -> Self {
        self.channel = channel;
        self
    }

    /// Attaches a raw trace.
    pub fn with_trace(mut self, trace: impl Into<String>) -> Self {
        self.trace = Some(trace.into());
        self
    }
}
