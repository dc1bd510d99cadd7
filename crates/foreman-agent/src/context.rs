use foreman_core::{Message, Role};

/// Context handed to a fresh engine session: the system prompt plus the
/// most recent history, rendered as a single text block.
///
/// Engines with a native system-prompt flag receive the block through that
/// flag; the rest get it on stdin ahead of the prompt.
pub struct ContextWindow {
    messages: Vec<Message>,
    system_prompt: Option<String>,
    max_messages: usize,
}

impl ContextWindow {
    /// Creates a window holding at most `max_messages` history entries.
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: Vec::new(),
            system_prompt: None,
            max_messages,
        }
    }

    /// Sets the system prompt.
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        self.system_prompt = (!prompt.trim().is_empty()).then_some(prompt);
    }

    /// The system prompt, if set.
    pub fn system_prompt(&self) -> Option<&str> {
        self.system_prompt.as_deref()
    }

    /// Adds a history entry, dropping the oldest beyond the limit.
    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.truncate();
    }

    /// Adds several entries, oldest first.
    pub fn extend(&mut self, messages: impl IntoIterator<Item = Message>) {
        for message in messages {
            self.push(message);
        }
    }

    /// Entries currently held.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    fn truncate(&mut self) {
        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(..excess);
        }
    }

    /// Renders the block, or `None` when there is nothing to send.
    pub fn render(&self) -> Option<String> {
        let mut parts = Vec::new();
        if let Some(sys) = &self.system_prompt {
            parts.push(sys.trim().to_string());
        }
        let turns: Vec<String> = self
            .messages
            .iter()
            .filter(|m| m.role != Role::System && !m.content.trim().is_empty())
            .map(|m| format!("[{}]: {}", m.role, m.content.trim()))
            .collect();
        if !turns.is_empty() {
            parts.push(format!(
                "<conversation_history>\n{}\n</conversation_history>",
                turns.join("\n\n")
            ));
        }
        (!parts.is_empty()).then(|| parts.join("\n\n"))
    }
}
