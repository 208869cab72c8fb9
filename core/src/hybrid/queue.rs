// Retry queue — outbound hybrid messages awaiting a successful send
//
// Bounded like the mesh lanes: on overflow the lowest-priority, oldest
// message is evicted and critical messages never are. Messages that run out
// of attempts move to a bounded failed list from which they can be revived.

use super::message::{HybridMessage, MessagePriority, MessageStatus};
use crate::store::QueueError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedQueue {
    pub queue: Vec<HybridMessage>,
    #[serde(default)]
    pub failed: Vec<HybridMessage>,
}

pub struct RetryQueue {
    queue: Vec<HybridMessage>,
    failed: VecDeque<HybridMessage>,
    max_size: usize,
    max_failed: usize,
}

impl RetryQueue {
    pub fn new(max_size: usize, max_failed: usize) -> Self {
        Self {
            queue: Vec::new(),
            failed: VecDeque::new(),
            max_size: max_size.max(1),
            max_failed,
        }
    }

    /// Add a message, evicting one lower-priority entry if the queue is at
    /// capacity. Returns the evicted message.
    pub fn push(&mut self, message: HybridMessage) -> Result<Option<HybridMessage>, QueueError> {
        let mut evicted = None;
        if self.queue.len() >= self.max_size {
            evicted = self.evict_one();
            if evicted.is_none() {
                return Err(QueueError::Full {
                    capacity: self.max_size,
                });
            }
        }
        self.queue.push(message);
        Ok(evicted)
    }

    fn evict_one(&mut self) -> Option<HybridMessage> {
        let victim = self
            .queue
            .iter()
            .enumerate()
            .filter(|(_, m)| m.priority != MessagePriority::Critical)
            .max_by(|(_, a), (_, b)| {
                a.priority
                    .rank()
                    .cmp(&b.priority.rank())
                    .then(b.timestamp.cmp(&a.timestamp))
            })
            .map(|(index, _)| index)?;
        Some(self.queue.remove(victim))
    }

    /// Ids of messages whose retry time has come, in processing order:
    /// priority first, then age.
    pub fn due(&self, now: u64) -> Vec<String> {
        let mut due: Vec<&HybridMessage> = self
            .queue
            .iter()
            .filter(|m| m.next_retry_at.map_or(true, |at| at <= now))
            .collect();
        due.sort_by(|a, b| {
            a.priority
                .rank()
                .cmp(&b.priority.rank())
                .then(a.timestamp.cmp(&b.timestamp))
        });
        due.into_iter().map(|m| m.id.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&HybridMessage> {
        self.queue.iter().find(|m| m.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut HybridMessage> {
        self.queue.iter_mut().find(|m| m.id == id)
    }

    pub fn remove(&mut self, id: &str) -> Option<HybridMessage> {
        let index = self.queue.iter().position(|m| m.id == id)?;
        Some(self.queue.remove(index))
    }

    /// Move a message to the failed list. The oldest failed entry is
    /// dropped when the list is full.
    pub fn mark_failed(&mut self, id: &str) -> Option<HybridMessage> {
        let mut message = self.remove(id)?;
        message.status = MessageStatus::Failed;
        message.next_retry_at = None;
        if self.max_failed > 0 {
            if self.failed.len() >= self.max_failed {
                self.failed.pop_front();
            }
            self.failed.push_back(message.clone());
        }
        Some(message)
    }

    /// Put every failed message back in the queue with a fresh retry budget.
    /// Returns the ids revived; messages that no longer fit stay failed.
    pub fn revive_failed(&mut self) -> Vec<String> {
        let mut revived = Vec::new();
        while let Some(mut message) = self.failed.pop_front() {
            message.status = MessageStatus::Pending;
            message.retry_count = 0;
            message.next_retry_at = None;
            let id = message.id.clone();
            match self.push(message.clone()) {
                Ok(_) => revived.push(id),
                Err(_) => {
                    message.status = MessageStatus::Failed;
                    self.failed.push_front(message);
                    break;
                }
            }
        }
        revived
    }

    pub fn pending_count(&self) -> usize {
        self.queue
            .iter()
            .filter(|m| matches!(m.status, MessageStatus::Pending | MessageStatus::Sending))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn snapshot(&self) -> PersistedQueue {
        PersistedQueue {
            queue: self.queue.clone(),
            failed: self.failed.iter().cloned().collect(),
        }
    }

    pub fn restore(&mut self, persisted: PersistedQueue) {
        self.queue = persisted.queue;
        self.failed = persisted.failed.into();
        while self.failed.len() > self.max_failed {
            self.failed.pop_front();
        }
    }
}
