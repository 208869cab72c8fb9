//! Delivery manager.
//!
//! Tracks acknowledgement state per outbound message independently of the
//! transport that carried it. Each tracked message gets an ACK timer; a
//! timeout schedules a resend after an exponential backoff indexed by the
//! retry count, and once the retry budget is spent the record fails for
//! good. Every status change is reported once to per-message callbacks and
//! to broadcast subscribers.

use super::record::{DeliveryMetrics, DeliveryRecord, DeliveryStatus, DeliveryUpdate};
use crate::config::DeliveryConfig;
use crate::now_ms;
use crate::retry::RetryBackoff;
use crate::store::{keys, load_json, save_json, KeyValueStore};
use crate::sync::{Debouncer, KeyedTimers};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const EXHAUSTED_REASON: &str = "ACK timeout - max retries exceeded";
const RESEND_REFUSED_REASON: &str = "Message no longer available for resend";

const UPDATE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Message {0} is already being tracked")]
    AlreadyTracked(String),
    #[error("Unknown message {0}")]
    UnknownMessage(String),
    #[error("Message {0} has not failed")]
    NotFailed(String),
    #[error("Retry budget exhausted for message {0}")]
    RetriesExhausted(String),
}

/// Re-sends a tracked message. Resolves to `false` when the message can no
/// longer be sent (e.g. it was purged from the outbound cache).
pub type RetryHandler = Arc<dyn Fn(DeliveryRecord) -> BoxFuture<'static, bool> + Send + Sync>;

pub type DeliveryCallback = Arc<dyn Fn(&str, DeliveryStatus) + Send + Sync>;

/// Handle returned by [`DeliveryManager::on_delivery_update`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackHandle(u64);

struct DeliveryInner {
    config: DeliveryConfig,
    backoff: RetryBackoff,
    store: Arc<dyn KeyValueStore>,
    records: Mutex<HashMap<String, DeliveryRecord>>,
    /// wire id -> message id
    wire_ids: Mutex<HashMap<u32, String>>,
    callbacks: RwLock<HashMap<String, Vec<(CallbackHandle, DeliveryCallback)>>>,
    next_callback: AtomicU64,
    updates: broadcast::Sender<DeliveryUpdate>,
    ack_timers: KeyedTimers<String>,
    retry_timers: KeyedTimers<String>,
    retry_handler: RwLock<Option<RetryHandler>>,
    /// Messages whose retry handler is currently running
    in_flight: Mutex<HashSet<String>>,
    persist: Debouncer,
    monitor: Mutex<Option<JoinHandle<()>>>,
    initialized: AtomicBool,
}

#[derive(Clone)]
pub struct DeliveryManager {
    inner: Arc<DeliveryInner>,
}

impl DeliveryManager {
    pub fn new(config: DeliveryConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(DeliveryInner {
                backoff: config.backoff(),
                persist: Debouncer::new(config.persist_debounce()),
                config,
                store,
                records: Mutex::new(HashMap::new()),
                wire_ids: Mutex::new(HashMap::new()),
                callbacks: RwLock::new(HashMap::new()),
                next_callback: AtomicU64::new(1),
                updates,
                ack_timers: KeyedTimers::new(),
                retry_timers: KeyedTimers::new(),
                retry_handler: RwLock::new(None),
                in_flight: Mutex::new(HashSet::new()),
                monitor: Mutex::new(None),
                initialized: AtomicBool::new(false),
            }),
        }
    }

    fn from_weak(weak: &Weak<DeliveryInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Load persisted records, re-arm timers for anything left waiting and
    /// start the stalled-record monitor. Idempotent.
    pub async fn initialize(&self) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        match load_json::<Vec<DeliveryRecord>>(self.inner.store.as_ref(), keys::DELIVERY_TRACKING)
            .await
        {
            Ok(Some(loaded)) => {
                let count = loaded.len();
                let mut records = self.inner.records.lock();
                let mut wire_ids = self.inner.wire_ids.lock();
                for record in loaded {
                    for wire_id in record.all_wire_ids() {
                        wire_ids.insert(wire_id, record.message_id.clone());
                    }
                    records.insert(record.message_id.clone(), record);
                }
                debug!("Loaded {} delivery record(s)", count);
            }
            Ok(None) => {}
            Err(e) => warn!("Failed to load delivery records: {}", e),
        }

        let resumed = self.sweep_stalled();
        if resumed > 0 {
            info!("Resumed ACK wait for {} record(s)", resumed);
        }

        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.monitor_interval();
        let handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(manager) = Self::from_weak(&weak) else {
                    break;
                };
                manager.sweep_stalled();
            }
        });
        if let Some(previous) = self.inner.monitor.lock().replace(handle) {
            previous.abort();
        }
        info!("Delivery manager initialized");
    }

    /// Cancel every timer and write records out.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.monitor.lock().take() {
            handle.abort();
        }
        self.inner.ack_timers.cancel_all();
        self.inner.retry_timers.cancel_all();
        self.flush().await;
    }

    pub fn set_retry_handler(&self, handler: RetryHandler) {
        *self.inner.retry_handler.write() = Some(handler);
    }

    /// Start tracking an outbound message and arm its ACK timer.
    pub fn track_message(
        &self,
        message_id: &str,
        recipient_id: &str,
        wire_id: u32,
    ) -> Result<(), DeliveryError> {
        {
            let mut records = self.inner.records.lock();
            if let Some(existing) = records.get(message_id) {
                if existing.status.is_outstanding() {
                    return Err(DeliveryError::AlreadyTracked(message_id.to_string()));
                }
            }
            records.insert(
                message_id.to_string(),
                DeliveryRecord::new(message_id, recipient_id, wire_id, now_ms()),
            );
        }
        self.inner
            .wire_ids
            .lock()
            .insert(wire_id, message_id.to_string());

        self.start_ack_timeout(message_id);
        debug!("Tracking {} for {}", message_id, recipient_id);
        Ok(())
    }

    /// Map another wire id onto a tracked message so an ACK for any copy
    /// resolves it. Returns false for unknown messages.
    pub fn register_wire_id(&self, message_id: &str, wire_id: u32) -> bool {
        {
            let mut records = self.inner.records.lock();
            let Some(record) = records.get_mut(message_id) else {
                return false;
            };
            if record.all_wire_ids().any(|id| id == wire_id) {
                return true;
            }
            record.attempt_wire_ids.push(wire_id);
        }
        self.inner
            .wire_ids
            .lock()
            .insert(wire_id, message_id.to_string());
        self.schedule_persist();
        true
    }

    /// ACK arrived. Returns whether a tracked record changed.
    pub fn on_ack_received(&self, message_id: &str) -> bool {
        self.inner.ack_timers.cancel(&message_id.to_string());
        self.inner.retry_timers.cancel(&message_id.to_string());

        let now = now_ms();
        let changed = self.transition(message_id, |record| {
            if record.status.is_delivered() {
                return None;
            }
            record.ack_received_at = Some(now);
            record.delivered_at = Some(now);
            record.failed_reason = None;
            Some(DeliveryStatus::Delivered)
        });
        if changed {
            debug!("ACK received for {}", message_id);
        }
        changed
    }

    /// ACK carrying only the numeric wire id (mesh ACK payloads).
    pub fn on_ack_for_wire_id(&self, wire_id: u32) -> bool {
        let message_id = self.inner.wire_ids.lock().get(&wire_id).cloned();
        match message_id {
            Some(id) => self.on_ack_received(&id),
            None => false,
        }
    }

    /// Read receipt. A read implies delivery, so this also resolves an
    /// outstanding ACK wait.
    pub fn on_read_confirmed(&self, message_id: &str) -> bool {
        self.inner.ack_timers.cancel(&message_id.to_string());
        self.inner.retry_timers.cancel(&message_id.to_string());

        let now = now_ms();
        self.transition(message_id, |record| {
            if record.status == DeliveryStatus::Read {
                return None;
            }
            record.delivered_at.get_or_insert(now);
            record.ack_received_at.get_or_insert(now);
            record.read_at = Some(now);
            record.failed_reason = None;
            Some(DeliveryStatus::Read)
        })
    }

    pub fn on_read_for_wire_id(&self, wire_id: u32) -> bool {
        let message_id = self.inner.wire_ids.lock().get(&wire_id).cloned();
        match message_id {
            Some(id) => self.on_read_confirmed(&id),
            None => false,
        }
    }

    /// Manually retry a failed record. Fails when the record has not failed
    /// or its retry budget is spent.
    pub fn retry_failed(&self, message_id: &str) -> Result<(), DeliveryError> {
        {
            let records = self.inner.records.lock();
            let record = records
                .get(message_id)
                .ok_or_else(|| DeliveryError::UnknownMessage(message_id.to_string()))?;
            if record.status != DeliveryStatus::Failed {
                return Err(DeliveryError::NotFailed(message_id.to_string()));
            }
            if record.retry_count >= self.inner.config.max_retries {
                return Err(DeliveryError::RetriesExhausted(message_id.to_string()));
            }
        }
        self.spawn_retry(message_id.to_string(), Duration::ZERO);
        Ok(())
    }

    /// Retry every failed record that still has budget. Returns how many
    /// were scheduled.
    pub fn retry_all_failed(&self) -> usize {
        let ids: Vec<String> = self.failed().into_iter().map(|r| r.message_id).collect();
        let total = ids.len();
        let retried = ids
            .iter()
            .filter(|id| self.retry_failed(id).is_ok())
            .count();
        info!("Retried {} of {} failed deliveries", retried, total);
        retried
    }

    /// Register a callback for status changes of one message.
    pub fn on_delivery_update(&self, message_id: &str, callback: DeliveryCallback) -> CallbackHandle {
        let handle = CallbackHandle(self.inner.next_callback.fetch_add(1, Ordering::Relaxed));
        self.inner
            .callbacks
            .write()
            .entry(message_id.to_string())
            .or_default()
            .push((handle, callback));
        handle
    }

    pub fn remove_delivery_callback(&self, message_id: &str, handle: CallbackHandle) {
        let mut callbacks = self.inner.callbacks.write();
        if let Some(list) = callbacks.get_mut(message_id) {
            list.retain(|(h, _)| *h != handle);
            if list.is_empty() {
                callbacks.remove(message_id);
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn record(&self, message_id: &str) -> Option<DeliveryRecord> {
        self.inner.records.lock().get(message_id).cloned()
    }

    /// Status of a message; untracked messages report `Pending`.
    pub fn status(&self, message_id: &str) -> DeliveryStatus {
        self.record(message_id)
            .map(|r| r.status)
            .unwrap_or(DeliveryStatus::Pending)
    }

    pub fn pending(&self) -> Vec<DeliveryRecord> {
        self.filtered(|r| r.status.is_outstanding())
    }

    pub fn failed(&self) -> Vec<DeliveryRecord> {
        self.filtered(|r| r.status == DeliveryStatus::Failed)
    }

    fn filtered(&self, keep: impl Fn(&DeliveryRecord) -> bool) -> Vec<DeliveryRecord> {
        let mut out: Vec<DeliveryRecord> = self
            .inner
            .records
            .lock()
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.sent_at);
        out
    }

    pub fn metrics(&self) -> DeliveryMetrics {
        DeliveryMetrics::from_records(self.inner.records.lock().values())
    }

    /// Drop delivered/read records older than the configured retention.
    pub fn clear_old_records(&self) -> usize {
        self.clear_old_records_at(now_ms(), self.inner.config.retention())
    }

    pub fn clear_old_records_at(&self, now: u64, max_age: Duration) -> usize {
        let cutoff = now.saturating_sub(max_age.as_millis() as u64);
        let removed: Vec<DeliveryRecord> = {
            let mut records = self.inner.records.lock();
            let stale: Vec<String> = records
                .values()
                .filter(|r| r.sent_at < cutoff && r.status.is_delivered())
                .map(|r| r.message_id.clone())
                .collect();
            stale.iter().filter_map(|id| records.remove(id)).collect()
        };
        if removed.is_empty() {
            return 0;
        }

        {
            let mut wire_ids = self.inner.wire_ids.lock();
            let mut callbacks = self.inner.callbacks.write();
            for record in &removed {
                for wire_id in record.all_wire_ids() {
                    wire_ids.remove(&wire_id);
                }
                callbacks.remove(&record.message_id);
            }
        }
        self.schedule_persist();
        info!("Cleared {} old delivery record(s)", removed.len());
        removed.len()
    }

    /// Re-arm ACK timers for outstanding records that have no timer running
    /// and no resend in progress. Returns how many were resumed.
    pub fn sweep_stalled(&self) -> usize {
        let stalled: Vec<String> = {
            let records = self.inner.records.lock();
            let in_flight = self.inner.in_flight.lock();
            records
                .values()
                .filter(|r| r.status.is_outstanding())
                .map(|r| r.message_id.clone())
                .filter(|id| {
                    !in_flight.contains(id)
                        && !self.inner.ack_timers.is_active(id)
                        && !self.inner.retry_timers.is_active(id)
                })
                .collect()
        };
        for id in &stalled {
            self.start_ack_timeout(id);
        }
        stalled.len()
    }

    // ------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------

    fn start_ack_timeout(&self, message_id: &str) {
        let weak = Arc::downgrade(&self.inner);
        let id = message_id.to_string();
        self.inner
            .ack_timers
            .schedule(id.clone(), self.inner.config.ack_timeout(), async move {
                if let Some(manager) = Self::from_weak(&weak) {
                    manager.handle_timeout(&id);
                }
            });
        self.transition(message_id, |record| {
            (record.status != DeliveryStatus::AckWaiting).then_some(DeliveryStatus::AckWaiting)
        });
    }

    /// ACK wait expired: schedule a retry or give up.
    pub fn handle_timeout(&self, message_id: &str) {
        let Some(record) = self.record(message_id) else {
            return;
        };
        if record.status != DeliveryStatus::AckWaiting {
            return;
        }

        if record.retry_count < self.inner.config.max_retries {
            let delay = self.inner.backoff.delay(record.retry_count);
            debug!(
                "ACK timeout for {}, retry {} in {:?}",
                message_id,
                record.retry_count + 1,
                delay
            );
            self.transition(message_id, |_| Some(DeliveryStatus::Pending));
            self.spawn_retry(message_id.to_string(), delay);
        } else {
            self.fail(message_id, EXHAUSTED_REASON);
            warn!("Delivery permanently failed: {}", message_id);
        }
    }

    fn spawn_retry(&self, message_id: String, delay: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let id = message_id.clone();
        self.inner.retry_timers.schedule(message_id, delay, async move {
            if let Some(manager) = Self::from_weak(&weak) {
                manager.perform_retry(&id).await;
            }
        });
    }

    /// Count the attempt, hand the message to the retry handler and wait
    /// for an ACK again.
    pub async fn perform_retry(&self, message_id: &str) {
        let now = now_ms();
        let record = {
            let mut records = self.inner.records.lock();
            let Some(record) = records.get_mut(message_id) else {
                return;
            };
            if !matches!(record.status, DeliveryStatus::Pending | DeliveryStatus::Failed) {
                return;
            }
            record.retry_count += 1;
            record.last_retry_at = Some(now);
            record.failed_reason = None;
            record.clone()
        };
        self.inner.in_flight.lock().insert(message_id.to_string());
        info!(
            "Retrying delivery of {} (attempt {})",
            message_id, record.retry_count
        );

        let handler = self.inner.retry_handler.read().clone();
        let resent = match handler {
            Some(handler) => handler(record).await,
            None => true,
        };
        self.inner.in_flight.lock().remove(message_id);

        if resent {
            self.start_ack_timeout(message_id);
        } else {
            self.fail(message_id, RESEND_REFUSED_REASON);
            warn!("Retry of {} refused by sender", message_id);
        }
        self.schedule_persist();
    }

    fn fail(&self, message_id: &str, reason: &str) {
        self.inner.ack_timers.cancel(&message_id.to_string());
        self.transition(message_id, |record| {
            record.failed_reason = Some(reason.to_string());
            (record.status != DeliveryStatus::Failed).then_some(DeliveryStatus::Failed)
        });
    }

    // ------------------------------------------------------------------
    // Transitions
    // ------------------------------------------------------------------

    /// Apply a mutation and, if it yields a new status, record it and notify.
    /// Returns whether the status changed.
    fn transition(
        &self,
        message_id: &str,
        apply: impl FnOnce(&mut DeliveryRecord) -> Option<DeliveryStatus>,
    ) -> bool {
        let previous = {
            let mut records = self.inner.records.lock();
            let Some(record) = records.get_mut(message_id) else {
                return false;
            };
            let previous = record.status;
            match apply(record) {
                Some(next) if next != previous => {
                    record.status = next;
                    previous
                }
                _ => return false,
            }
        };
        let status = self.status(message_id);
        self.schedule_persist();
        self.notify(message_id, previous, status);
        true
    }

    fn notify(&self, message_id: &str, previous: DeliveryStatus, status: DeliveryStatus) {
        let callbacks: Vec<DeliveryCallback> = self
            .inner
            .callbacks
            .read()
            .get(message_id)
            .map(|list| list.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        for callback in callbacks {
            callback(message_id, status);
        }
        let _ = self.inner.updates.send(DeliveryUpdate {
            message_id: message_id.to_string(),
            previous,
            status,
        });
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn schedule_persist(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.persist.schedule(async move {
            if let Some(manager) = Self::from_weak(&weak) {
                manager.persist_now().await;
            }
        });
    }

    async fn persist_now(&self) {
        let records: Vec<DeliveryRecord> = self.inner.records.lock().values().cloned().collect();
        if let Err(e) = save_json(
            self.inner.store.as_ref(),
            keys::DELIVERY_TRACKING,
            &records,
        )
        .await
        {
            warn!("Failed to save delivery records: {}", e);
        }
    }

    pub async fn flush(&self) {
        self.inner.persist.cancel();
        self.persist_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use futures::FutureExt;
    use std::sync::atomic::AtomicUsize;

    fn manager() -> DeliveryManager {
        DeliveryManager::new(DeliveryConfig::default(), Arc::new(MemoryStore::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_resolves_and_cancels_timer() {
        let dm = manager();
        dm.track_message("m1", "bob", 11).unwrap();
        assert_eq!(dm.status("m1"), DeliveryStatus::AckWaiting);

        assert!(dm.on_ack_for_wire_id(11));
        assert_eq!(dm.status("m1"), DeliveryStatus::Delivered);
        assert!(!dm.on_ack_received("m1"));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(dm.status("m1"), DeliveryStatus::Delivered);
        assert_eq!(dm.record("m1").unwrap().retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_returns_to_pending_then_resends() {
        let dm = manager();
        let resends = Arc::new(AtomicUsize::new(0));
        let counter = resends.clone();
        dm.set_retry_handler(Arc::new(move |_record| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }
            .boxed()
        }));

        dm.track_message("m1", "bob", 1).unwrap();
        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(dm.status("m1"), DeliveryStatus::Pending);

        // first backoff step is 1s
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(resends.load(Ordering::SeqCst), 1);
        assert_eq!(dm.status("m1"), DeliveryStatus::AckWaiting);
        assert_eq!(dm.record("m1").unwrap().retry_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fails_after_max_retries() {
        let dm = manager();
        let mut updates = dm.subscribe();
        dm.track_message("m1", "bob", 1).unwrap();

        // 6 ACK waits of 10s plus backoff 1+2+4+8+16s
        tokio::time::sleep(Duration::from_secs(60 + 31 + 1)).await;

        let record = dm.record("m1").unwrap();
        assert_eq!(record.status, DeliveryStatus::Failed);
        assert_eq!(record.retry_count, 5);
        assert_eq!(record.failed_reason.as_deref(), Some(EXHAUSTED_REASON));
        assert_eq!(
            dm.retry_failed("m1"),
            Err(DeliveryError::RetriesExhausted("m1".into()))
        );

        let mut failures = 0;
        while let Ok(update) = updates.try_recv() {
            if update.status == DeliveryStatus::Failed {
                failures += 1;
            }
        }
        assert_eq!(failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_resend_can_be_retried() {
        let dm = manager();
        let accept = Arc::new(AtomicBool::new(false));
        let gate = accept.clone();
        dm.set_retry_handler(Arc::new(move |_| {
            let ok = gate.load(Ordering::SeqCst);
            async move { ok }.boxed()
        }));

        dm.track_message("m1", "bob", 1).unwrap();
        tokio::time::sleep(Duration::from_millis(11_100)).await;
        assert_eq!(dm.status("m1"), DeliveryStatus::Failed);
        assert_eq!(dm.failed().len(), 1);

        accept.store(true, Ordering::SeqCst);
        assert_eq!(dm.retry_all_failed(), 1);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(dm.status("m1"), DeliveryStatus::AckWaiting);
        assert_eq!(dm.record("m1").unwrap().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_callbacks_fire_once_per_transition() {
        let dm = manager();
        let seen: Arc<Mutex<Vec<DeliveryStatus>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        dm.track_message("m1", "bob", 1).unwrap();
        let handle = dm.on_delivery_update(
            "m1",
            Arc::new(move |_: &str, status: DeliveryStatus| sink.lock().push(status)),
        );

        dm.on_ack_received("m1");
        dm.on_ack_received("m1");
        dm.on_read_confirmed("m1");
        dm.on_read_confirmed("m1");
        assert_eq!(
            *seen.lock(),
            vec![DeliveryStatus::Delivered, DeliveryStatus::Read]
        );

        dm.remove_delivery_callback("m1", handle);
        dm.track_message("m1", "bob", 1).unwrap();
        assert_eq!(seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_skips_resend_in_progress() {
        let dm = manager();
        let resends = Arc::new(AtomicUsize::new(0));
        let counter = resends.clone();
        dm.set_retry_handler(Arc::new(move |_record| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(3)).await;
                true
            }
            .boxed()
        }));

        dm.track_message("m1", "bob", 1).unwrap();
        // ACK wait plus the first 1s backoff; the handler is now mid-send
        tokio::time::sleep(Duration::from_millis(11_100)).await;
        assert_eq!(resends.load(Ordering::SeqCst), 1);
        assert_eq!(dm.status("m1"), DeliveryStatus::Pending);
        assert_eq!(dm.sweep_stalled(), 0);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(dm.status("m1"), DeliveryStatus::AckWaiting);
        assert_eq!(dm.record("m1").unwrap().retry_count, 1);
        assert_eq!(dm.sweep_stalled(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ack_for_any_attempt_resolves() {
        let dm = manager();
        dm.track_message("m1", "bob", 10).unwrap();
        assert!(dm.register_wire_id("m1", 11));
        assert!(dm.register_wire_id("m1", 11));
        assert!(!dm.register_wire_id("nope", 12));
        assert_eq!(dm.record("m1").unwrap().attempt_wire_ids, vec![11]);

        assert!(dm.on_ack_for_wire_id(11));
        assert_eq!(dm.status("m1"), DeliveryStatus::Delivered);
        assert!(!dm.on_ack_for_wire_id(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_wire_ids_survive_restart() {
        let store = Arc::new(MemoryStore::new());
        let first = DeliveryManager::new(DeliveryConfig::default(), store.clone());
        first.track_message("m1", "bob", 7).unwrap();
        first.register_wire_id("m1", 8);
        first.flush().await;
        first.shutdown().await;

        let second = DeliveryManager::new(DeliveryConfig::default(), store);
        second.initialize().await;
        assert!(second.on_ack_for_wire_id(8));
        assert_eq!(second.status("m1"), DeliveryStatus::Delivered);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_tracking_rejected() {
        let dm = manager();
        dm.track_message("m1", "bob", 1).unwrap();
        assert_eq!(
            dm.track_message("m1", "bob", 1),
            Err(DeliveryError::AlreadyTracked("m1".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_resumes_waiting_records() {
        let store = Arc::new(MemoryStore::new());
        let first = DeliveryManager::new(DeliveryConfig::default(), store.clone());
        first.track_message("m1", "bob", 7).unwrap();
        first.flush().await;
        first.shutdown().await;

        let second = DeliveryManager::new(DeliveryConfig::default(), store);
        second.initialize().await;
        assert_eq!(second.status("m1"), DeliveryStatus::AckWaiting);

        tokio::time::sleep(Duration::from_millis(10_100)).await;
        assert_eq!(second.status("m1"), DeliveryStatus::Pending);
        assert!(second.on_ack_for_wire_id(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_old_records_keeps_unresolved() {
        let dm = manager();
        dm.track_message("old", "bob", 1).unwrap();
        dm.track_message("waiting", "bob", 2).unwrap();
        dm.on_ack_received("old");

        let week = Duration::from_secs(7 * 24 * 3600);
        let later = now_ms() + week.as_millis() as u64 + 1_000;
        assert_eq!(dm.clear_old_records_at(later, week), 1);
        assert!(dm.record("old").is_none());
        assert!(dm.record("waiting").is_some());
        assert!(!dm.on_ack_for_wire_id(1));
    }
}
