//! Dead-letter store.
//!
//! Terminal home for messages that exhausted their retries. Bounded: past
//! capacity the oldest entries are purged, and every purge is counted so the
//! loss shows up in metrics.

use std::collections::VecDeque;

use courier_core::QueueMessage;

/// Why a message was dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    /// The failed message, status `failed`
    pub message: QueueMessage,
    /// Last failure reason
    pub reason: String,
    /// When it was dead-lettered (Unix millis)
    pub failed_at_ms: u64,
}

/// Bounded FIFO of dead letters.
#[derive(Debug, Clone)]
pub struct DeadLetterStore {
    entries: VecDeque<DeadLetter>,
    capacity: usize,
    purged: u64,
}

impl DeadLetterStore {
    /// Empty store holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self { entries: VecDeque::new(), capacity: capacity.max(1), purged: 0 }
    }

    /// Add an entry, purging the oldest when full. Returns how many were
    /// purged.
    pub fn push(&mut self, letter: DeadLetter) -> usize {
        let mut purged = 0;
        while self.entries.len() >= self.capacity {
            if let Some(old) = self.entries.pop_front() {
                tracing::warn!(message_id = %old.message.id, "dead letter purged");
            }
            purged += 1;
        }
        self.purged += purged as u64;
        self.entries.push_back(letter);
        purged
    }

    /// Entry for a message id.
    pub fn get(&self, message_id: &str) -> Option<&DeadLetter> {
        self.entries.iter().find(|l| l.message.id == message_id)
    }

    /// Entries, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &DeadLetter> {
        self.entries.iter()
    }

    /// Stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries purged since startup.
    pub fn purged(&self) -> u64 {
        self.purged
    }
}

#[cfg(test)]
mod tests {
    use courier_core::DeliveryOptions;
    use courier_proto::{MessageType, TargetType, payloads::queue::QueueSend};
    use proptest::prelude::*;

    use super::*;

    fn letter(id: usize) -> DeadLetter {
        let send = QueueSend {
            message_type: MessageType::Notification,
            payload: Vec::new(),
            to: vec!["bob".into()],
            target_type: TargetType::User,
            priority: None,
            options: None,
        };
        let message = QueueMessage::from_send(
            format!("m{id}"),
            "alice".into(),
            send,
            DeliveryOptions::default(),
            0,
            "s1",
        );
        DeadLetter { message, reason: "timeout".into(), failed_at_ms: 0 }
    }

    #[test]
    fn oldest_purged_first() {
        let mut store = DeadLetterStore::new(2);
        store.push(letter(1));
        store.push(letter(2));
        assert_eq!(store.push(letter(3)), 1);

        assert!(store.get("m1").is_none());
        let ids: Vec<_> = store.iter().map(|l| l.message.id.as_str()).collect();
        assert_eq!(ids, ["m2", "m3"]);
        assert_eq!(store.purged(), 1);
    }

    proptest! {
        #[test]
        fn size_never_exceeds_capacity(capacity in 1usize..50, pushes in 0usize..200) {
            let mut store = DeadLetterStore::new(capacity);
            for i in 0..pushes {
                store.push(letter(i));
                prop_assert!(store.len() <= capacity);
            }
            prop_assert_eq!(store.len() as u64 + store.purged(), pushes as u64);
        }
    }
}
