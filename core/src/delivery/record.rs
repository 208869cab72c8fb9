// Delivery records — per-message acknowledgement state

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Tracked, waiting for a (re)send
    Pending,
    /// Left this device, no acknowledgement expected yet
    Sent,
    /// Sent and waiting for an ACK with a timer armed
    AckWaiting,
    Delivered,
    Read,
    Failed,
}

impl DeliveryStatus {
    /// Still expecting an acknowledgement.
    pub fn is_outstanding(self) -> bool {
        matches!(
            self,
            DeliveryStatus::Pending | DeliveryStatus::Sent | DeliveryStatus::AckWaiting
        )
    }

    pub fn is_delivered(self) -> bool {
        matches!(self, DeliveryStatus::Delivered | DeliveryStatus::Read)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::AckWaiting => "ack_waiting",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
            DeliveryStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub recipient_id: String,
    /// Numeric id carried in mesh headers and ACK payloads
    pub wire_id: u32,
    /// Extra wire ids used by resends and store-and-forward copies
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attempt_wire_ids: Vec<u32>,
    pub status: DeliveryStatus,
    pub sent_at: u64,
    pub ack_received_at: Option<u64>,
    pub delivered_at: Option<u64>,
    pub read_at: Option<u64>,
    pub retry_count: u32,
    pub last_retry_at: Option<u64>,
    pub failed_reason: Option<String>,
}

impl DeliveryRecord {
    /// Every wire id an ACK for this message may carry.
    pub fn all_wire_ids(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.wire_id).chain(self.attempt_wire_ids.iter().copied())
    }

    pub fn new(message_id: &str, recipient_id: &str, wire_id: u32, now: u64) -> Self {
        Self {
            message_id: message_id.to_string(),
            recipient_id: recipient_id.to_string(),
            wire_id,
            attempt_wire_ids: Vec::new(),
            status: DeliveryStatus::Pending,
            sent_at: now,
            ack_received_at: None,
            delivered_at: None,
            read_at: None,
            retry_count: 0,
            last_retry_at: None,
            failed_reason: None,
        }
    }
}

/// Aggregate view over all tracked records.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeliveryMetrics {
    pub total: usize,
    pub pending: usize,
    pub delivered: usize,
    pub failed: usize,
    /// Mean time from send to delivery, in milliseconds
    pub avg_delivery_time_ms: f64,
}

impl DeliveryMetrics {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a DeliveryRecord>) -> Self {
        let mut metrics = DeliveryMetrics::default();
        let mut total_delivery_ms = 0u64;
        let mut timed = 0u64;

        for record in records {
            metrics.total += 1;
            if record.status.is_outstanding() {
                metrics.pending += 1;
            } else if record.status.is_delivered() {
                metrics.delivered += 1;
                if let Some(at) = record.delivered_at {
                    total_delivery_ms += at.saturating_sub(record.sent_at);
                    timed += 1;
                }
            } else {
                metrics.failed += 1;
            }
        }
        if timed > 0 {
            metrics.avg_delivery_time_ms = total_delivery_ms as f64 / timed as f64;
        }
        metrics
    }
}

/// Broadcast on every status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryUpdate {
    pub message_id: String,
    pub previous: DeliveryStatus,
    pub status: DeliveryStatus,
}
