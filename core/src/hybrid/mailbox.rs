// Mailbox — addressed messages held per recipient for store-and-forward
//
// A recipient out of radio range misses the first broadcast. Its messages
// wait here and are re-sent when the peer is next discovered, until a
// delivery confirmation removes them or they expire. Each peer's box is
// bounded; on overflow the lowest-priority, oldest entry goes.

use super::message::HybridMessage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub message: HybridMessage,
    pub stored_at: u64,
    pub expires_at: u64,
    /// Times this entry was re-sent to its peer
    #[serde(default)]
    pub forwards: u32,
}

pub type PersistedMailbox = HashMap<String, Vec<StoredMessage>>;

pub struct Mailbox {
    boxes: HashMap<String, Vec<StoredMessage>>,
    per_peer: usize,
    expiry_ms: u64,
}

impl Mailbox {
    pub fn new(per_peer: usize, expiry_ms: u64) -> Self {
        Self {
            boxes: HashMap::new(),
            per_peer: per_peer.max(1),
            expiry_ms,
        }
    }

    /// Hold `message` for `peer_id`. Storing an id already held is a no-op.
    /// Returns the entry evicted to make room, if any.
    pub fn store(&mut self, peer_id: &str, message: HybridMessage, now: u64) -> Option<StoredMessage> {
        let entries = self.boxes.entry(peer_id.to_string()).or_default();
        if entries.iter().any(|e| e.message.id == message.id) {
            return None;
        }
        let evicted = if entries.len() >= self.per_peer {
            let victim = entries
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| {
                    a.message
                        .priority
                        .rank()
                        .cmp(&b.message.priority.rank())
                        .then(b.stored_at.cmp(&a.stored_at))
                })
                .map(|(index, _)| index);
            victim.map(|index| entries.remove(index))
        } else {
            None
        };
        entries.push(StoredMessage {
            message,
            stored_at: now,
            expires_at: now.saturating_add(self.expiry_ms),
            forwards: 0,
        });
        evicted
    }

    /// Live entries for `peer_id`, each counted as forwarded once more.
    /// Returned with the forward number they were sent under.
    pub fn take_for_forward(&mut self, peer_id: &str, now: u64) -> Vec<(HybridMessage, u32)> {
        let Some(entries) = self.boxes.get_mut(peer_id) else {
            return Vec::new();
        };
        entries
            .iter_mut()
            .filter(|e| e.expires_at > now)
            .map(|e| {
                e.forwards += 1;
                (e.message.clone(), e.forwards)
            })
            .collect()
    }

    /// Drop a message wherever it is held.
    pub fn remove(&mut self, message_id: &str) -> bool {
        let mut removed = false;
        for entries in self.boxes.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.message.id != message_id);
            removed |= entries.len() != before;
        }
        self.boxes.retain(|_, entries| !entries.is_empty());
        removed
    }

    /// Returns how many entries expired.
    pub fn purge_expired(&mut self, now: u64) -> usize {
        let mut purged = 0;
        for entries in self.boxes.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.expires_at > now);
            purged += before - entries.len();
        }
        self.boxes.retain(|_, entries| !entries.is_empty());
        purged
    }

    pub fn peer_len(&self, peer_id: &str) -> usize {
        self.boxes.get(peer_id).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.boxes.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.boxes.is_empty()
    }

    pub fn snapshot(&self) -> PersistedMailbox {
        self.boxes.clone()
    }

    pub fn restore(&mut self, persisted: PersistedMailbox) {
        self.boxes = persisted;
        self.boxes.retain(|_, entries| !entries.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hybrid::message::{MessagePriority, MessageSource};
    use crate::message::{Envelope, MessageKind};

    const DAY: u64 = 24 * 3600 * 1000;

    fn msg(id: &str, priority: MessagePriority) -> HybridMessage {
        let env = Envelope::new(id, "me", "bob", MessageKind::Chat, "x", 0);
        let mut m = HybridMessage::from_envelope(env, MessageSource::Hybrid);
        m.priority = priority;
        m
    }

    #[test]
    fn test_full_box_evicts_lowest_priority_oldest() {
        let mut mailbox = Mailbox::new(3, 7 * DAY);
        mailbox.store("bob", msg("h", MessagePriority::High), 1);
        mailbox.store("bob", msg("n1", MessagePriority::Normal), 2);
        mailbox.store("bob", msg("n2", MessagePriority::Normal), 3);

        let evicted = mailbox.store("bob", msg("c", MessagePriority::Critical), 4);
        assert_eq!(evicted.map(|e| e.message.id), Some("n1".to_string()));
        assert_eq!(mailbox.peer_len("bob"), 3);
        assert!(mailbox.store("bob", msg("c", MessagePriority::Critical), 5).is_none());
        assert_eq!(mailbox.peer_len("bob"), 3);
    }

    #[test]
    fn test_forward_counts_and_skips_expired() {
        let mut mailbox = Mailbox::new(10, DAY);
        mailbox.store("bob", msg("old", MessagePriority::Normal), 0);
        mailbox.store("bob", msg("new", MessagePriority::Normal), DAY / 2);

        let now = DAY + 1;
        let ids: Vec<(String, u32)> = mailbox
            .take_for_forward("bob", now)
            .into_iter()
            .map(|(m, n)| (m.id, n))
            .collect();
        assert_eq!(ids, vec![("new".to_string(), 1)]);
        assert_eq!(mailbox.take_for_forward("bob", now)[0].1, 2);
        assert!(mailbox.take_for_forward("carol", now).is_empty());

        assert_eq!(mailbox.purge_expired(now), 1);
        assert_eq!(mailbox.len(), 1);
    }

    #[test]
    fn test_remove_and_restore() {
        let mut mailbox = Mailbox::new(10, DAY);
        mailbox.store("bob", msg("a", MessagePriority::Normal), 0);
        mailbox.store("carol", msg("b", MessagePriority::Normal), 0);

        let json = serde_json::to_string(&mailbox.snapshot()).unwrap();
        assert!(mailbox.remove("a"));
        assert!(!mailbox.remove("a"));
        assert_eq!(mailbox.peer_len("bob"), 0);

        let mut restored = Mailbox::new(10, DAY);
        restored.restore(serde_json::from_str(&json).unwrap());
        assert_eq!(restored.len(), 2);
    }
}
