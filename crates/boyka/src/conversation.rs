use std::sync::Arc;

use crate::models::message::Message;

/// The ordered history of one conversation.
///
/// Messages are only ever appended; `clear` is the one way to drop them and it
/// empties the whole history at once. Mutation needs `&mut`, so the owner of
/// the store is its only writer.
#[derive(Debug, Default, Clone)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: Message) {
        self.messages.push(message);
    }

    pub fn extend<I: IntoIterator<Item = Message>>(&mut self, messages: I) {
        self.messages.extend(messages);
    }

    /// An immutable copy of the history at this point in time.
    pub fn snapshot(&self) -> Arc<[Message]> {
        Arc::from(self.messages.as_slice())
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::role::Role;

    #[test]
    fn test_snapshot_is_detached_from_later_appends() {
        let mut conversation = Conversation::new();
        conversation.append(Message::user_text("first"));

        let snapshot = conversation.snapshot();
        conversation.append(Message::assistant_text("second"));

        assert_eq!(snapshot.len(), 1);
        assert_eq!(conversation.len(), 2);
        assert_eq!(conversation.last().map(|m| m.role), Some(Role::Assistant));
    }

    #[test]
    fn test_clear_empties_everything() {
        let mut conversation = Conversation::new();
        conversation.extend(vec![
            Message::user_text("a"),
            Message::assistant_text("b"),
        ]);
        let before = conversation.snapshot();

        conversation.clear();

        assert!(conversation.is_empty());
        assert!(conversation.snapshot().is_empty());
        assert_eq!(before.len(), 2);
    }
}
