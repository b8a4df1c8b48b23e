use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Local};

/// Default number of messages kept in the history.
pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// A message as it arrived from the broker, independent of any subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub topic: String,
    pub payload: String,
    pub received_at: DateTime<Local>,
}

impl fmt::Display for ReceivedMessage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let preview: String = self.payload.chars().take(10).collect();
        write!(f, "{} - {}", self.received_at.format("%H:%M:%S"), preview)
    }
}

impl ReceivedMessage {
    pub fn from_topic(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        ReceivedMessage {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Local::now(),
        }
    }

    pub fn render(&self) -> String {
        format!(
            "{}: {}\n{}",
            self.received_at.format("%Y-%m-%d %H:%M:%S"),
            self.topic,
            self.payload
        )
    }
}

/// Newest-first log of every received message, bounded to `limit` entries.
#[derive(Debug)]
pub struct MessageHistory {
    entries: VecDeque<ReceivedMessage>,
    limit: usize,
}

impl Default for MessageHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl MessageHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(limit.min(1024)),
            limit,
        }
    }

    /// Adds a message at the front, dropping the oldest once over the limit.
    pub fn record(&mut self, message: ReceivedMessage) {
        self.entries.push_front(message);
        while self.entries.len() > self.limit {
            self.entries.pop_back();
        }
    }

    /// Copy of the entries, newest first, optionally restricted to one topic.
    pub fn snapshot(&self, topic: Option<&str>) -> Vec<ReceivedMessage> {
        match topic {
            Some(topic) => self
                .entries
                .iter()
                .filter(|m| m.topic == topic)
                .cloned()
                .collect(),
            None => self.entries.iter().cloned().collect(),
        }
    }

    /// Removes all entries, or only those of one topic.
    pub fn clear(&mut self, topic: Option<&str>) {
        match topic {
            Some(topic) => self.entries.retain(|m| m.topic != topic),
            None => self.entries.clear(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
