// Cloud channel capability and an in-memory implementation
//
// The cloud is a per-target inbox: `save_message` writes one record into a
// target's inbox, `subscribe_to_messages` streams batches of records written
// to an inbox (starting with everything already there).

use super::message::{HybridMessage, MessagePriority};
use crate::message::{GeoPoint, MessageKind, BROADCAST};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CloudError {
    #[error("Cloud unavailable: {0}")]
    Unavailable(String),
    #[error("Cloud rejected request: {0}")]
    Rejected(String),
}

/// Message as stored in a cloud inbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudRecord {
    pub id: String,
    pub from_device_id: String,
    pub to_device_id: String,
    pub content: String,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub priority: MessagePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

impl From<&HybridMessage> for CloudRecord {
    fn from(message: &HybridMessage) -> Self {
        Self {
            id: message.id.clone(),
            from_device_id: message.sender_id.clone(),
            to_device_id: message
                .recipient_id
                .clone()
                .unwrap_or_else(|| BROADCAST.to_string()),
            content: message.content.clone(),
            timestamp: message.timestamp,
            kind: message.kind,
            priority: message.priority,
            sender_name: Some(message.sender_name.clone()),
            location: message.location,
        }
    }
}

impl CloudRecord {
    /// Receipt telling `to` that `from` has received `message_id`. The id is
    /// stable so repeated receipts for one message collapse.
    pub fn receipt(message_id: &str, from: &str, to: &str, now: u64) -> Self {
        Self {
            id: format!("receipt:{}:{}", message_id, from),
            from_device_id: from.to_string(),
            to_device_id: to.to_string(),
            content: message_id.to_string(),
            timestamp: now,
            kind: MessageKind::Receipt,
            priority: MessagePriority::High,
            sender_name: None,
            location: None,
        }
    }

    pub fn is_receipt(&self) -> bool {
        self.kind == MessageKind::Receipt
    }
}

/// Live inbox subscription; unsubscribes when dropped.
pub struct CloudSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CloudSubscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for CloudSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for CloudSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[async_trait]
pub trait CloudChannel: Send + Sync {
    /// Write a record into `target_id`'s inbox. `Ok(false)` means the write
    /// was not accepted.
    async fn save_message(&self, target_id: &str, record: &CloudRecord) -> Result<bool, CloudError>;

    async fn subscribe_to_messages(
        &self,
        target_id: &str,
        sink: mpsc::UnboundedSender<Vec<CloudRecord>>,
    ) -> Result<CloudSubscription, CloudError>;
}

#[derive(Default)]
struct CloudState {
    available: bool,
    inboxes: HashMap<String, Vec<CloudRecord>>,
    subscribers: HashMap<String, Vec<(u64, mpsc::UnboundedSender<Vec<CloudRecord>>)>>,
    writes: u64,
}

/// Shared in-memory cloud for tests and the simulator. Every clone talks to
/// the same inboxes.
#[derive(Clone)]
pub struct MemoryCloud {
    state: Arc<RwLock<CloudState>>,
    next_id: Arc<AtomicU64>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(CloudState {
                available: true,
                ..Default::default()
            })),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Simulate a backend outage.
    pub fn set_available(&self, available: bool) {
        self.state.write().available = available;
    }

    pub fn inbox(&self, target_id: &str) -> Vec<CloudRecord> {
        self.state
            .read()
            .inboxes
            .get(target_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Successful writes so far.
    pub fn write_count(&self) -> u64 {
        self.state.read().writes
    }

    pub fn subscriber_count(&self, target_id: &str) -> usize {
        self.state
            .read()
            .subscribers
            .get(target_id)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

#[async_trait]
impl CloudChannel for MemoryCloud {
    async fn save_message(&self, target_id: &str, record: &CloudRecord) -> Result<bool, CloudError> {
        let mut state = self.state.write();
        if !state.available {
            return Err(CloudError::Unavailable("backend offline".into()));
        }
        state
            .inboxes
            .entry(target_id.to_string())
            .or_default()
            .push(record.clone());
        state.writes += 1;
        if let Some(subscribers) = state.subscribers.get_mut(target_id) {
            subscribers.retain(|(_, sink)| sink.send(vec![record.clone()]).is_ok());
        }
        Ok(true)
    }

    async fn subscribe_to_messages(
        &self,
        target_id: &str,
        sink: mpsc::UnboundedSender<Vec<CloudRecord>>,
    ) -> Result<CloudSubscription, CloudError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = self.state.write();
            if !state.available {
                return Err(CloudError::Unavailable("backend offline".into()));
            }
            let existing = state.inboxes.get(target_id).cloned().unwrap_or_default();
            if !existing.is_empty() {
                let _ = sink.send(existing);
            }
            state
                .subscribers
                .entry(target_id.to_string())
                .or_default()
                .push((id, sink));
        }

        let state = Arc::downgrade(&self.state);
        let target = target_id.to_string();
        Ok(CloudSubscription::new(move || {
            if let Some(state) = state.upgrade() {
                if let Some(subscribers) = state.write().subscribers.get_mut(&target) {
                    subscribers.retain(|(sub_id, _)| *sub_id != id);
                }
            }
        }))
    }
}
