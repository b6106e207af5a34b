//! Observable chat transcript
//!
//! The orchestrator is the only writer. Readers subscribe and always see the
//! latest full snapshot.

use tokio::sync::watch;

use super::types::Message;

pub struct ConversationTranscript {
    messages: watch::Sender<Vec<Message>>,
}

impl ConversationTranscript {
    pub fn new() -> Self {
        let (messages, _) = watch::channel(Vec::new());
        Self { messages }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, message: Message) -> usize {
        let mut index = 0;
        self.messages.send_modify(|messages| {
            messages.push(message);
            index = messages.len() - 1;
        });
        index
    }

    /// Append the user turn and an empty assistant placeholder in one update.
    ///
    /// Returns the placeholder's index.
    pub fn begin_exchange(&self, user_text: &str) -> usize {
        let mut index = 0;
        self.messages.send_modify(|messages| {
            messages.push(Message::user(user_text));
            messages.push(Message::assistant(""));
            index = messages.len() - 1;
        });
        index
    }

    /// Replace the content of the entry at `index`. False if out of range.
    pub fn replace_content(&self, index: usize, content: String) -> bool {
        self.messages.send_if_modified(|messages| match messages.get_mut(index) {
            Some(message) if message.content != content => {
                *message = message.with_content(content);
                true
            }
            _ => false,
        })
    }

    pub fn reset(&self) {
        self.messages.send_if_modified(|messages| {
            if messages.is_empty() {
                false
            } else {
                messages.clear();
                true
            }
        });
    }
}

impl Default for ConversationTranscript {
    fn default() -> Self {
        Self::new()
    }
}
