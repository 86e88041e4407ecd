//! Conversation history handed to the workflow on every turn.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// One finished exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub user_text: String,
    pub assistant_text: String,
    /// The user barged in before the response finished playing.
    #[serde(default)]
    pub interrupted: bool,
}

/// Role of a rendered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// A role-tagged message rendered from the history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextMessage {
    pub role: Role,
    pub content: String,
}

/// Immutable snapshot of prior exchanges, oldest first.
///
/// Cloning is cheap; snapshots are shared with collaborators and never
/// observe later turns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationContext {
    entries: Arc<[ConversationEntry]>,
}

impl ConversationContext {
    pub fn new(entries: impl IntoIterator<Item = ConversationEntry>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recent assistant response.
    pub fn last_response(&self) -> Option<&str> {
        self.entries.last().map(|e| e.assistant_text.as_str())
    }

    /// Render as alternating user/assistant messages.
    ///
    /// Interrupted responses get a trailing marker so the workflow can tell
    /// the user did not hear all of it.
    pub fn to_messages(&self) -> Vec<ContextMessage> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for entry in self.entries.iter() {
            out.push(ContextMessage {
                role: Role::User,
                content: entry.user_text.clone(),
            });
            let content = if entry.interrupted {
                format!("{} [interrupted]", entry.assistant_text)
            } else {
                entry.assistant_text.clone()
            };
            out.push(ContextMessage {
                role: Role::Assistant,
                content,
            });
        }
        out
    }
}

/// Bounded, append-only record of exchanges owned by the coordinating task.
#[derive(Debug, Clone)]
pub struct ConversationHistory {
    entries: VecDeque<ConversationEntry>,
    max_turns: usize,
}

impl ConversationHistory {
    pub fn new(max_turns: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            max_turns,
        }
    }

    /// Seed from an existing snapshot, keeping the newest entries.
    pub fn from_context(context: &ConversationContext, max_turns: usize) -> Self {
        let mut history = Self::new(max_turns);
        for entry in context.entries() {
            history.record(entry.clone());
        }
        history
    }

    /// Append an exchange, evicting the oldest when full.
    pub fn record(&mut self, entry: ConversationEntry) {
        if self.max_turns == 0 {
            return;
        }
        while self.entries.len() >= self.max_turns {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> ConversationContext {
        ConversationContext::new(self.entries.iter().cloned())
    }
}
