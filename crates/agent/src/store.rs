//! Owned conversation log.

use proto::{Message, Role, SessionError};

use crate::budget::{self, ContextLimits};
use crate::sanitize;

/// Size snapshot of the log, recorded around trims.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    pub messages: usize,
    pub chars: usize,
}

/// Ordered message log whose first entry is always the system prompt.
#[derive(Debug, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new(system_prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message::system(system_prompt)],
        }
    }

    /// Adopts an imported log after sanitizing it.
    pub fn from_messages(messages: Vec<Message>) -> Result<Self, SessionError> {
        match messages.first() {
            None => return Err(SessionError::Empty),
            Some(first) if first.role() != Role::System => return Err(SessionError::MissingSystem),
            Some(_) => {}
        }
        Ok(Self {
            messages: sanitize::sanitize(messages),
        })
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Always false: the system prompt is never removed.
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn system_prompt(&self) -> &str {
        self.messages.first().map(Message::content).unwrap_or_default()
    }

    /// Rewrites message 0 in place.
    pub fn replace_system_prompt(&mut self, prompt: impl Into<String>) {
        let prompt = prompt.into();
        match self.messages.first_mut() {
            Some(Message::System { content }) => *content = prompt,
            _ => self.messages.insert(0, Message::system(prompt)),
        }
    }

    /// Drops everything but the system prompt.
    pub fn reset(&mut self) {
        self.messages.truncate(1);
    }

    /// Total serialized size in characters.
    pub fn serialized_size(&self) -> usize {
        self.messages.iter().map(Message::serialized_len).sum()
    }

    pub fn stats(&self) -> LogStats {
        LogStats {
            messages: self.len(),
            chars: self.serialized_size(),
        }
    }

    pub fn sanitize(&mut self) {
        let messages = std::mem::take(&mut self.messages);
        self.messages = sanitize::sanitize(messages);
    }

    /// Sanitizes and trims; returns the before/after stats when anything changed.
    pub fn enforce(&mut self, limits: ContextLimits) -> Option<(LogStats, LogStats)> {
        let before = self.stats();
        let messages = std::mem::take(&mut self.messages);
        self.messages = budget::enforce(messages, limits);
        let after = self.stats();
        (before != after).then_some((before, after))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::ToolCall;

    #[test]
    fn reset_keeps_only_system_prompt() {
        let mut store = MessageStore::new("sys");
        store.push(Message::user("q"));
        store.push(Message::assistant("a"));
        store.reset();
        assert_eq!(store.messages(), &[Message::system("sys")]);
    }

    #[test]
    fn replace_system_prompt_rewrites_message_zero() {
        let mut store = MessageStore::new("old");
        store.push(Message::user("q"));
        store.replace_system_prompt("new");
        assert_eq!(store.system_prompt(), "new");
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn from_messages_requires_leading_system() {
        assert!(matches!(
            MessageStore::from_messages(vec![Message::user("q")]),
            Err(SessionError::MissingSystem)
        ));
        assert!(matches!(MessageStore::from_messages(vec![]), Err(SessionError::Empty)));
    }

    #[test]
    fn from_messages_sanitizes_import() {
        let store = MessageStore::from_messages(vec![
            Message::system("sys"),
            Message::assistant_tool_calls("", vec![ToolCall::new("tc1", "t", "{}")]),
            Message::user("q"),
        ])
        .expect("import");
        assert_eq!(store.messages(), &[Message::system("sys"), Message::user("q")]);
    }

    #[test]
    fn enforce_reports_changes_only() {
        let mut store = MessageStore::new("sys");
        store.push(Message::user("q"));
        assert!(store.enforce(ContextLimits::default()).is_none());

        for i in 0..10 {
            store.push(Message::user(format!("q{i}")));
        }
        let (before, after) = store
            .enforce(ContextLimits {
                max_messages: 5,
                max_chars: 100_000,
            })
            .expect("trimmed");
        assert_eq!(before.messages, 12);
        assert_eq!(after.messages, 5);
    }
}
