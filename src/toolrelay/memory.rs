//! Bounded conversation memory for one orchestration session.
//!
//! [`ConversationMemory`] keeps the most recent `capacity` messages in arrival order and
//! evicts the oldest entry on overflow. Because eviction is blind to message structure, a
//! tool result can outlive its request, and a cancelled query can leave a request that was
//! never answered. [`snapshot_for_submission`] drops both kinds of orphan, and the assistant
//! messages that precede the first user turn, so a resubmitted conversation never violates
//! the backend's strict request/result pairing.
//!
//! A single rolling summary is stored next to the buffer. The orchestration loop refreshes
//! it periodically and, once older messages have been evicted, opens each submission with
//! [`context_message`](ConversationMemory::context_message). Memory itself never calls the LLM.
//!
//! [`snapshot_for_submission`]: ConversationMemory::snapshot_for_submission
//!
//! ```rust
//! use toolrelay::memory::ConversationMemory;
//! use toolrelay::message::Message;
//!
//! let mut memory = ConversationMemory::new(2);
//! memory.append(Message::user("one"));
//! memory.append(Message::user("two"));
//! memory.append(Message::user("three"));
//!
//! let texts: Vec<String> = memory.messages().map(|m| m.text()).collect();
//! assert_eq!(texts, vec!["two", "three"]);
//! ```

use crate::toolrelay::message::{Message, Role};
use std::collections::{HashSet, VecDeque};

/// Default number of messages retained.
pub const DEFAULT_MEMORY_CAPACITY: usize = 20;

/// Ordered, capacity-bounded message buffer plus a rolling summary.
#[derive(Debug, Clone)]
pub struct ConversationMemory {
    messages: VecDeque<Message>,
    capacity: usize,
    summary: Option<String>,
    evicted: bool,
}

impl ConversationMemory {
    /// Create an empty memory holding at most `capacity` messages (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ConversationMemory {
            messages: VecDeque::with_capacity(capacity),
            capacity,
            summary: None,
            evicted: false,
        }
    }

    /// Append a message, evicting the oldest one when the buffer is full.
    pub fn append(&mut self, message: Message) {
        if self.messages.len() == self.capacity {
            self.messages.pop_front();
            self.evicted = true;
        }
        self.messages.push_back(message);
    }

    /// Append a user text message.
    pub fn append_user(&mut self, text: impl Into<String>) {
        self.append(Message::user(text));
    }

    /// Append an assistant text message.
    pub fn append_assistant(&mut self, text: impl Into<String>) {
        self.append(Message::assistant(text));
    }

    /// Ordered messages that are safe to resubmit.
    ///
    /// The result opens with a user message, every tool result follows the request it
    /// answers, and every tool request is answered by a result held in the buffer. Messages
    /// that would break one of those rules are skipped; a request message is dropped as a
    /// whole, and so are the results that pointed at it.
    pub fn snapshot_for_submission(&self) -> Vec<Message> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::User)
            .flat_map(|m| m.tool_result_ids())
            .collect();

        let mut requested: HashSet<&str> = HashSet::new();
        let mut snapshot: Vec<Message> = Vec::with_capacity(self.messages.len());
        for message in &self.messages {
            if message.role == Role::Assistant {
                if snapshot.is_empty() {
                    continue;
                }
                if message.tool_request_ids().any(|id| !answered.contains(id)) {
                    continue;
                }
                requested.extend(message.tool_request_ids());
            }
            if message.tool_result_ids().any(|id| !requested.contains(id)) {
                continue;
            }
            snapshot.push(message.clone());
        }
        snapshot
    }

    /// Whether older messages have been evicted since creation or the last [`clear`](Self::clear).
    pub fn has_evicted(&self) -> bool {
        self.evicted
    }

    /// Iterate over the raw buffer, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Replace the rolling summary.
    pub fn set_summary(&mut self, text: impl Into<String>) {
        self.summary = Some(text.into());
    }

    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Empty the buffer and the summary.
    pub fn clear(&mut self) {
        self.messages.clear();
        self.summary = None;
        self.evicted = false;
    }

    /// A user message that re-establishes context, embedding the summary when present.
    ///
    /// Sent ahead of the snapshot once eviction has dropped the start of the conversation.
    pub fn context_message(&self) -> Message {
        match &self.summary {
            Some(summary) if !summary.is_empty() => Message::user(format!(
                "Let's continue our conversation. Here's a summary of what we've discussed so far: {}",
                summary
            )),
            _ => Message::user("Let's continue our conversation."),
        }
    }
}

impl Default for ConversationMemory {
    fn default() -> Self {
        Self::new(DEFAULT_MEMORY_CAPACITY)
    }
}
