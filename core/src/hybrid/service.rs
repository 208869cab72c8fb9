//! Hybrid message service.
//!
//! The public send/subscribe surface of the core. Every outbound message is
//! attempted on both channels at once: broadcast over the radio mesh and,
//! when the internet is reachable, written to the cloud. A message counts as
//! sent as soon as either channel accepts it; otherwise it waits in the
//! retry queue with jittered exponential backoff.
//!
//! Inbound traffic from the mesh and from cloud inboxes is deduplicated and
//! merged into one stream of [`HybridMessage`]s.

use super::cloud::{CloudChannel, CloudRecord, CloudSubscription};
use super::connectivity::Reachability;
use super::mailbox::{Mailbox, PersistedMailbox};
use super::message::{
    ConnectionMode, HybridMessage, MediaKind, MediaOptions, MessagePriority, MessageSource,
    MessageStatus, MessageUpdate, SendOptions,
};
use super::queue::{PersistedQueue, RetryQueue};
use super::typing::{TypingEvent, TypingIndicators, TypingSignal};
use crate::config::HybridConfig;
use crate::delivery::{DeliveryManager, DeliveryRecord, DeliveryStatus};
use crate::identity::IdentityProvider;
use crate::message::codec::dedup_key;
use crate::message::{
    message_id_for, sanitize_message, validate_message, AckKind, Envelope, GeoPoint,
    LocationPayload, MessageKind, PacketType, ParsedPayload, SosPayload, SourceToken,
    ValidationError, BROADCAST,
};
use crate::retry::RetryBackoff;
use crate::store::{keys, load_json, save_json, KeyValueStore, QueueError};
use crate::sync::{AsyncMutex, Debouncer, LruSet};
use crate::transport::{InboundMessage, MeshError, MeshEvent, MeshTransport};
use crate::{now_ms, AppLifecycle};
use futures::future::join_all;
use futures::FutureExt;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Status byte of a compact SOS beacon
const BEACON_STATUS_NEEDS_HELP: u8 = 1;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),
    #[error("Message queue full: {0}")]
    Queue(#[from] QueueError),
    #[error("Mesh error: {0}")]
    Mesh(#[from] MeshError),
}

/// Which channels accepted one send attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendOutcome {
    pub mesh: bool,
    pub cloud: bool,
}

impl SendOutcome {
    pub fn accepted(self) -> bool {
        self.mesh || self.cloud
    }
}

struct HybridInner {
    config: HybridConfig,
    backoff: RetryBackoff,
    critical_backoff: RetryBackoff,
    identity: Arc<dyn IdentityProvider>,
    mesh: MeshTransport,
    delivery: DeliveryManager,
    cloud: Arc<dyn CloudChannel>,
    reachability: Arc<dyn Reachability>,
    store: Arc<dyn KeyValueStore>,
    /// Held across send attempts so an immediate send and a queue pass
    /// never interleave
    queue: AsyncMutex<RetryQueue>,
    /// Sent, recipient-addressed messages kept for delivery retries
    awaiting_ack: Mutex<LruCache<String, HybridMessage>>,
    /// Addressed messages held for store-and-forward
    mailbox: Mutex<Mailbox>,
    seen: Mutex<LruSet<String>>,
    mode: watch::Sender<ConnectionMode>,
    inbound: broadcast::Sender<HybridMessage>,
    updates: broadcast::Sender<MessageUpdate>,
    typing: TypingIndicators,
    cloud_subscriptions: AsyncMutex<HashMap<String, CloudSubscription>>,
    cloud_sink: mpsc::UnboundedSender<Vec<CloudRecord>>,
    cloud_source: Mutex<Option<mpsc::UnboundedReceiver<Vec<CloudRecord>>>>,
    process_loop: Mutex<Option<JoinHandle<()>>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    queue_persist: Debouncer,
    seen_persist: Debouncer,
    active: AtomicBool,
    initialized: AtomicBool,
}

#[derive(Clone)]
pub struct HybridMessageService {
    inner: Arc<HybridInner>,
}

impl HybridMessageService {
    pub fn new(
        config: HybridConfig,
        identity: Arc<dyn IdentityProvider>,
        mesh: MeshTransport,
        delivery: DeliveryManager,
        cloud: Arc<dyn CloudChannel>,
        reachability: Arc<dyn Reachability>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let (mode, _) = watch::channel(ConnectionMode::Offline);
        let (inbound, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (updates, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (cloud_sink, cloud_source) = mpsc::unbounded_channel();
        let awaiting_capacity =
            NonZeroUsize::new(config.max_awaiting_ack).unwrap_or(NonZeroUsize::MIN);

        Self {
            inner: Arc::new(HybridInner {
                backoff: config.backoff(),
                critical_backoff: config.critical_backoff(),
                queue: AsyncMutex::new(RetryQueue::new(
                    config.max_queue_size,
                    config.max_failed_kept,
                )),
                awaiting_ack: Mutex::new(LruCache::new(awaiting_capacity)),
                mailbox: Mutex::new(Mailbox::new(
                    config.mailbox_per_peer,
                    config.mailbox_expiry_ms,
                )),
                seen: Mutex::new(LruSet::new(config.max_seen_ids)),
                typing: TypingIndicators::new(
                    Duration::from_millis(config.typing_throttle_ms),
                    Duration::from_millis(config.typing_debounce_ms),
                    Duration::from_millis(config.typing_auto_clear_ms),
                ),
                queue_persist: Debouncer::new(config.persist_debounce()),
                seen_persist: Debouncer::new(config.persist_debounce()),
                identity,
                mesh,
                delivery,
                cloud,
                reachability,
                store,
                mode,
                inbound,
                updates,
                cloud_subscriptions: AsyncMutex::new(HashMap::new()),
                cloud_sink,
                cloud_source: Mutex::new(Some(cloud_source)),
                process_loop: Mutex::new(None),
                background: Mutex::new(Vec::new()),
                active: AtomicBool::new(true),
                initialized: AtomicBool::new(false),
                config,
            }),
        }
    }

    fn from_weak(weak: &Weak<HybridInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Restore persisted state, hook up the delivery manager and start the
    /// queue, connectivity and inbound loops. Idempotent.
    pub async fn initialize(&self) {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            return;
        }

        self.restore().await;
        self.inner.delivery.initialize().await;
        self.install_retry_handler();

        if let Some(source) = self.inner.cloud_source.lock().take() {
            // Detached: ends when the service, which owns the sink, is dropped.
            drop(self.spawn_cloud_pump(source));
        }
        self.inner.background.lock().extend([
            self.spawn_mesh_pump(),
            self.spawn_delivery_pump(),
            self.spawn_connection_loop(),
        ]);
        self.start_process_loop();

        self.refresh_connection().await;
        info!(
            "Hybrid message service initialized ({} queued, mode {})",
            self.pending_count().await,
            self.connection_mode()
        );
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.process_loop.lock().take() {
            handle.abort();
        }
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
        self.clear_cloud_subscriptions().await;
        self.inner.typing.clear();
        self.flush().await;
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("Hybrid message service stopped");
    }

    /// Pause queue processing in the background and flush; resume on
    /// return to the foreground.
    pub async fn set_lifecycle(&self, lifecycle: AppLifecycle) {
        match lifecycle {
            AppLifecycle::Background => {
                self.inner.active.store(false, Ordering::SeqCst);
                if let Some(handle) = self.inner.process_loop.lock().take() {
                    handle.abort();
                }
                self.flush().await;
                debug!("Hybrid message service paused (background)");
            }
            AppLifecycle::Foreground => {
                self.inner.active.store(true, Ordering::SeqCst);
                if self.inner.initialized.load(Ordering::SeqCst) {
                    self.start_process_loop();
                }
                debug!("Hybrid message service resumed (foreground)");
            }
        }
    }

    fn start_process_loop(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.queue_process_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(service) = Self::from_weak(&weak) else {
                    break;
                };
                service.process_queue().await;
            }
        });
        if let Some(previous) = self.inner.process_loop.lock().replace(handle) {
            previous.abort();
        }
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Validate, queue and immediately attempt a message. A `recipient` of
    /// `None` (or the broadcast marker) addresses everyone in range.
    ///
    /// Returns the message as it stands after the first attempt: `Sent` if
    /// a channel accepted it, otherwise `Pending` with a retry scheduled.
    pub async fn send_message(
        &self,
        content: &str,
        recipient: Option<&str>,
        options: SendOptions,
    ) -> Result<HybridMessage, SendError> {
        let content = validate_message(content, self.inner.config.max_content_len)?;
        let mut message = self.new_outbound(content, recipient);
        message.priority = options.priority.unwrap_or_default();
        message.kind = options.kind.unwrap_or(MessageKind::Chat);
        message.reply_to = options.reply_to;
        message.reply_preview = options.reply_preview.map(|p| sanitize_message(&p));
        message.location = options.location;
        self.submit(message).await
    }

    /// Image, voice or location message. Media must already be uploaded;
    /// only references travel.
    pub async fn send_media_message(
        &self,
        kind: MediaKind,
        recipient: &str,
        options: MediaOptions,
    ) -> Result<HybridMessage, SendError> {
        let content = validate_message(&options.content(kind), self.inner.config.max_content_len)?;
        let mut message = self.new_outbound(content, Some(recipient));
        message.kind = kind.message_kind();
        message.media_type = Some(kind.as_str().to_string());
        message.media_url = options.media_url;
        message.media_duration = options.media_duration;
        message.media_thumbnail = options.media_thumbnail;
        message.location = options.location;
        let message = self.submit(message).await?;
        info!("Media message sent: {}", kind.as_str());
        Ok(message)
    }

    /// Broadcast an SOS at critical priority. With a location, a compact
    /// beacon readable by legacy receivers goes out as well.
    pub async fn send_sos(
        &self,
        reason: &str,
        location: Option<GeoPoint>,
    ) -> Result<HybridMessage, SendError> {
        if let Some(point) = location {
            if let Err(e) = self.inner.mesh.send_sos_beacon(
                point.lat as f32,
                point.lng as f32,
                BEACON_STATUS_NEEDS_HELP,
            ) {
                warn!("SOS beacon not queued: {}", e);
            }
        }
        let reason = if reason.trim().is_empty() { "SOS" } else { reason };
        self.send_message(
            reason,
            None,
            SendOptions {
                priority: Some(MessagePriority::Critical),
                kind: Some(MessageKind::Sos),
                location,
                ..Default::default()
            },
        )
        .await
    }

    /// Broadcast the current position to everyone in range.
    pub async fn share_location(&self, lat: f64, lng: f64) -> Result<HybridMessage, SendError> {
        let compact = LocationPayload {
            lat: lat as f32,
            lon: lng as f32,
            accuracy_m: 0,
            speed: 0,
            heading: 0,
        };
        if let Err(e) = self.inner.mesh.share_location(compact) {
            debug!("Compact location not queued: {}", e);
        }
        self.send_message(
            &MediaOptions::default().content(MediaKind::Location),
            None,
            SendOptions {
                kind: Some(MessageKind::Location),
                location: Some(GeoPoint::new(lat, lng)),
                ..Default::default()
            },
        )
        .await
    }

    fn new_outbound(&self, content: String, recipient: Option<&str>) -> HybridMessage {
        let identity = self.inner.identity.identity();
        let recipient_id = recipient
            .map(str::trim)
            .filter(|r| !r.is_empty() && *r != BROADCAST)
            .map(str::to_string);
        HybridMessage {
            id: Uuid::new_v4().to_string(),
            local_id: Some(Uuid::new_v4().to_string()),
            content,
            sender_id: identity.id,
            sender_name: identity.display_name,
            recipient_id,
            timestamp: now_ms(),
            source: MessageSource::Hybrid,
            status: MessageStatus::Pending,
            priority: MessagePriority::Normal,
            kind: MessageKind::Chat,
            reply_to: None,
            reply_preview: None,
            location: None,
            retry_count: 0,
            last_retry_at: None,
            next_retry_at: None,
            media_url: None,
            media_type: None,
            media_duration: None,
            media_thumbnail: None,
        }
    }

    async fn submit(&self, message: HybridMessage) -> Result<HybridMessage, SendError> {
        // Our own cloud copy must not come back as an inbound message.
        self.record_seen(&message.id);

        let mut queue = self.inner.queue.lock().await;
        if let Some(evicted) = queue.push(message.clone())? {
            warn!("Evicted message {} due to queue overflow", evicted.id);
            self.emit_update(&evicted.id, MessageStatus::Failed);
        }

        if let Some(recipient) = &message.recipient_id {
            if let Err(e) =
                self.inner
                    .delivery
                    .track_message(&message.id, recipient, message_id_for(&message.id))
            {
                warn!("Delivery tracking not started: {}", e);
            }
            self.inner
                .awaiting_ack
                .lock()
                .put(message.id.clone(), message.clone());
            let evicted = self
                .inner
                .mailbox
                .lock()
                .store(recipient, message.clone(), now_ms());
            if let Some(evicted) = evicted {
                debug!("Mailbox for {} full, dropped {}", recipient, evicted.message.id);
            }
        }
        self.schedule_persist();

        let now = now_ms();
        let result = self
            .attempt_queued(&mut queue, &message.id, now)
            .await
            .unwrap_or(message);
        Ok(result)
    }

    /// Send one queued message and record the outcome in the queue.
    async fn attempt_queued(
        &self,
        queue: &mut RetryQueue,
        id: &str,
        now: u64,
    ) -> Option<HybridMessage> {
        let mut message = queue.get(id)?.clone();
        if let Some(slot) = queue.get_mut(id) {
            slot.status = MessageStatus::Sending;
        }
        let outcome = self.attempt_send(&mut message).await;
        Some(self.apply_attempt(queue, message, outcome.accepted(), now))
    }

    fn apply_attempt(
        &self,
        queue: &mut RetryQueue,
        mut message: HybridMessage,
        accepted: bool,
        now: u64,
    ) -> HybridMessage {
        if accepted {
            queue.remove(&message.id);
            message.status = MessageStatus::Sent;
            message.next_retry_at = None;
            if message.recipient_id.is_some() {
                self.inner
                    .awaiting_ack
                    .lock()
                    .put(message.id.clone(), message.clone());
            }
            self.emit_update(&message.id, MessageStatus::Sent);
        } else {
            message.retry_count += 1;
            message.last_retry_at = Some(now);
            message.status = MessageStatus::Pending;
            let backoff = if message.priority == MessagePriority::Critical {
                &self.inner.critical_backoff
            } else {
                &self.inner.backoff
            };
            let delay = backoff.delay(message.retry_count);
            message.next_retry_at = Some(now + delay.as_millis() as u64);
            debug!(
                "Message {} not accepted, retry {} in {:?}",
                message.id, message.retry_count, delay
            );
            if let Some(slot) = queue.get_mut(&message.id) {
                *slot = message.clone();
            }
        }
        self.schedule_persist();
        message
    }

    /// One dual-channel attempt. Mesh is always tried; the cloud only when
    /// the internet is reachable. An SOS refused by both channels is
    /// escalated to critical priority.
    pub async fn attempt_send(&self, message: &mut HybridMessage) -> SendOutcome {
        let wire_id = message_id_for(&message.id);
        self.attempt_send_as(message, wire_id).await
    }

    /// Attempt under an explicit mesh wire id.
    async fn attempt_send_as(&self, message: &mut HybridMessage, wire_id: u32) -> SendOutcome {
        let mesh = match self.inner.mesh.send_envelope_as(
            &message.to_envelope(),
            packet_type_for(message.kind),
            wire_id,
        ) {
            Ok(_) => true,
            Err(e) => {
                warn!("Mesh send of {} failed: {}", message.id, e);
                false
            }
        };

        let cloud = if self.inner.reachability.is_internet_reachable().await {
            self.write_cloud(message).await
        } else {
            false
        };

        let outcome = SendOutcome { mesh, cloud };
        if outcome.accepted() {
            info!(
                "Message {} sent (mesh: {}, cloud: {})",
                message.id, mesh, cloud
            );
        } else if message.kind == MessageKind::Sos {
            error!("SOS {} failed on every channel, escalating", message.id);
            message.priority = MessagePriority::Critical;
        }
        outcome
    }

    /// Write to the sender's own inbox and to the recipient's (or the
    /// broadcast) inbox. Succeeds if any write was accepted.
    async fn write_cloud(&self, message: &HybridMessage) -> bool {
        let record = CloudRecord::from(message);
        let targets = [message.sender_id.clone(), record.to_device_id.clone()];
        let results = join_all(
            targets
                .iter()
                .map(|target| self.inner.cloud.save_message(target, &record)),
        )
        .await;

        let mut accepted = false;
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(true) => accepted = true,
                Ok(false) => warn!("Cloud refused {} for {}", record.id, target),
                Err(e) => warn!("Cloud write of {} for {} failed: {}", record.id, target, e),
            }
        }
        accepted
    }

    // ------------------------------------------------------------------
    // Retry queue
    // ------------------------------------------------------------------

    pub async fn process_queue(&self) -> usize {
        self.process_queue_at(now_ms()).await
    }

    /// Attempt every message whose retry time has come, in priority order.
    /// Messages past the attempt budget fail, except escalated SOS. Returns
    /// how many were sent. A pass already in progress makes this a no-op.
    pub async fn process_queue_at(&self, now: u64) -> usize {
        if !self.inner.active.load(Ordering::SeqCst) {
            return 0;
        }
        let Ok(mut queue) = self.inner.queue.try_lock() else {
            return 0;
        };
        let expired = self.inner.mailbox.lock().purge_expired(now);
        if expired > 0 {
            debug!("Dropped {} expired mailbox entries", expired);
        }

        let mut sent = 0;
        for id in queue.due(now) {
            let Some(message) = queue.get(&id) else {
                continue;
            };
            if message.retry_count >= self.inner.config.retry_max_attempts
                && !message.is_critical_sos()
            {
                if let Some(failed) = queue.mark_failed(&id) {
                    warn!(
                        "Message {} failed after {} attempts",
                        id, failed.retry_count
                    );
                    self.emit_update(&id, MessageStatus::Failed);
                }
                continue;
            }
            if let Some(result) = self.attempt_queued(&mut queue, &id, now).await {
                if result.status == MessageStatus::Sent {
                    sent += 1;
                }
            }
        }
        drop(queue);
        self.schedule_persist();
        sent
    }

    /// Give every failed message a fresh retry budget and run a queue pass.
    /// Returns how many were revived.
    pub async fn retry_all_failed(&self) -> usize {
        let revived = self.inner.queue.lock().await.revive_failed();
        for id in &revived {
            self.emit_update(id, MessageStatus::Pending);
        }
        if !revived.is_empty() {
            info!("Retrying {} failed message(s)", revived.len());
        }
        self.schedule_persist();
        self.process_queue().await;
        revived.len()
    }

    /// Tell the sender of `message_id` that it has been read.
    pub fn mark_read(&self, message_id: &str) -> Result<(), SendError> {
        self.inner
            .mesh
            .send_ack(message_id_for(message_id), AckKind::Read)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typing
    // ------------------------------------------------------------------

    /// Signal that the user is typing in `conversation_id`. Broadcasts are
    /// throttled; a stop signal follows once typing pauses.
    pub fn send_typing(&self, conversation_id: &str) {
        if self.inner.typing.should_broadcast() {
            self.send_typing_signal(conversation_id, true);
        }
        let weak = Arc::downgrade(&self.inner);
        let conversation = conversation_id.to_string();
        self.inner.typing.schedule_stop(conversation_id, async move {
            if let Some(service) = Self::from_weak(&weak) {
                service.send_typing_signal(&conversation, false);
            }
        });
    }

    fn send_typing_signal(&self, conversation_id: &str, typing: bool) {
        let identity = self.inner.identity.identity();
        let signal = TypingSignal {
            conversation_id: conversation_id.to_string(),
            typing,
        };
        let mut envelope = Envelope::new(
            Uuid::new_v4().to_string(),
            identity.id,
            BROADCAST,
            MessageKind::Typing,
            signal.to_content(),
            now_ms(),
        );
        envelope.sender_name = Some(identity.display_name);
        if let Err(e) = self.inner.mesh.send_envelope(&envelope, PacketType::Text) {
            debug!("Typing signal dropped: {}", e);
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    fn spawn_mesh_pump(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut events = self.inner.mesh.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        let Some(service) = Self::from_weak(&weak) else {
                            break;
                        };
                        service.handle_mesh_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Mesh event stream lagged, {} event(s) skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    fn spawn_cloud_pump(&self, mut source: mpsc::UnboundedReceiver<Vec<CloudRecord>>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(batch) = source.recv().await {
                let Some(service) = Self::from_weak(&weak) else {
                    break;
                };
                service.handle_cloud_records(batch).await;
            }
        })
    }

    fn spawn_delivery_pump(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let mut updates = self.inner.delivery.subscribe();
        tokio::spawn(async move {
            loop {
                match updates.recv().await {
                    Ok(update) => {
                        let Some(service) = Self::from_weak(&weak) else {
                            break;
                        };
                        service.handle_delivery_status(&update.message_id, update.status);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Delivery update stream lagged, {} skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn handle_mesh_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::Message(inbound) => self.handle_mesh_message(inbound),
            MeshEvent::Ack {
                message_id, kind, ..
            } => {
                let resolved = match kind {
                    AckKind::Read => self.inner.delivery.on_read_for_wire_id(message_id),
                    AckKind::Received | AckKind::Delivered => {
                        self.inner.delivery.on_ack_for_wire_id(message_id)
                    }
                };
                if !resolved {
                    debug!("ACK for untracked wire id {}", message_id);
                }
            }
            MeshEvent::Beacon { source, beacon, .. } => self.handle_beacon(source, beacon),
            MeshEvent::PeerDiscovered(peer_id) => self.forward_mailbox(&peer_id),
            MeshEvent::Location { .. } | MeshEvent::PeerLost(_) => {}
        }
    }

    /// Re-send everything held for a peer that just came into range. Each
    /// forward goes out under its own wire id, registered for ACK matching.
    fn forward_mailbox(&self, peer_id: &str) {
        let held = self.inner.mailbox.lock().take_for_forward(peer_id, now_ms());
        if held.is_empty() {
            return;
        }
        info!("Forwarding {} stored message(s) to {}", held.len(), peer_id);
        for (message, forward) in held {
            let wire_id = message_id_for(&format!("{}:forward:{}", message.id, forward));
            self.inner.delivery.register_wire_id(&message.id, wire_id);
            if let Err(e) = self.inner.mesh.send_envelope_as(
                &message.to_envelope(),
                packet_type_for(message.kind),
                wire_id,
            ) {
                warn!("Forward of {} to {} failed: {}", message.id, peer_id, e);
            }
        }
        self.schedule_persist();
    }

    fn handle_mesh_message(&self, inbound: InboundMessage) {
        match inbound.payload {
            ParsedPayload::Envelope(envelope) => {
                if envelope.kind == MessageKind::Typing {
                    if let Some(signal) = TypingSignal::from_content(&envelope.content) {
                        self.inner
                            .typing
                            .on_remote(&envelope.from, envelope.sender_name.clone(), signal);
                    }
                    return;
                }
                // Every copy of an addressed envelope is acknowledged; only
                // the first is surfaced.
                if !envelope.is_broadcast() {
                    if let Err(e) = self
                        .inner
                        .mesh
                        .send_ack(inbound.message_id, AckKind::Delivered)
                    {
                        debug!("Delivery ACK for {} not queued: {}", envelope.id, e);
                    }
                }
                if !self.record_seen(&envelope.id) {
                    debug!("Dropped duplicate message {}", envelope.id);
                    return;
                }
                let mut message = HybridMessage::from_envelope(envelope, MessageSource::Mesh);
                message.content = sanitize_message(&message.content);
                self.emit_inbound(message);
            }
            ParsedPayload::RawText(text) => {
                let id = dedup_key(inbound.source, inbound.message_id);
                if !self.record_seen(&id) {
                    return;
                }
                let kind = if inbound.packet_type.is_emergency() {
                    MessageKind::Sos
                } else {
                    MessageKind::Chat
                };
                let envelope = Envelope::new(
                    id,
                    inbound.source.to_string(),
                    BROADCAST,
                    kind,
                    sanitize_message(&text),
                    inbound.received_at,
                );
                self.emit_inbound(HybridMessage::from_envelope(envelope, MessageSource::Mesh));
            }
        }
    }

    fn handle_beacon(&self, source: SourceToken, beacon: SosPayload) {
        let mut envelope = Envelope::new(
            Uuid::new_v4().to_string(),
            source.to_string(),
            BROADCAST,
            MessageKind::Sos,
            "SOS beacon",
            now_ms(),
        );
        envelope.location = Some(GeoPoint::new(beacon.lat as f64, beacon.lon as f64));
        self.emit_inbound(HybridMessage::from_envelope(envelope, MessageSource::Mesh));
    }

    /// Merge a batch from the cloud inboxes. Receipts resolve our own
    /// deliveries; new addressed messages are answered with a receipt in the
    /// sender's inbox.
    pub async fn handle_cloud_records(&self, records: Vec<CloudRecord>) {
        let aliases = self.inner.mesh.aliases();
        let me = self.inner.identity.identity().id;
        let mut receipts = Vec::new();
        for record in records {
            if aliases.is_self(&record.from_device_id) {
                continue;
            }
            if record.is_receipt() {
                if self.inner.delivery.on_ack_received(&record.content) {
                    debug!("Cloud receipt for {} from {}", record.content, record.from_device_id);
                }
                continue;
            }
            if !self.record_seen(&record.id) {
                continue;
            }
            let recipient_id = (record.to_device_id != BROADCAST && !record.to_device_id.is_empty())
                .then(|| record.to_device_id.clone());
            if recipient_id.is_some() {
                receipts.push(CloudRecord::receipt(
                    &record.id,
                    &me,
                    &record.from_device_id,
                    now_ms(),
                ));
            }
            let message = HybridMessage {
                id: record.id,
                local_id: None,
                content: sanitize_message(&record.content),
                sender_id: record.from_device_id,
                sender_name: record
                    .sender_name
                    .unwrap_or_else(|| "Cloud User".to_string()),
                recipient_id,
                timestamp: record.timestamp,
                source: MessageSource::Cloud,
                status: MessageStatus::Delivered,
                priority: record.priority,
                kind: record.kind,
                reply_to: None,
                reply_preview: None,
                location: record.location,
                retry_count: 0,
                last_retry_at: None,
                next_retry_at: None,
                media_url: None,
                media_type: None,
                media_duration: None,
                media_thumbnail: None,
            };
            self.emit_inbound(message);
        }
        if receipts.is_empty() {
            return;
        }

        let results = join_all(
            receipts
                .iter()
                .map(|receipt| self.inner.cloud.save_message(&receipt.to_device_id, receipt)),
        )
        .await;
        for (receipt, result) in receipts.iter().zip(results) {
            match result {
                Ok(true) => {}
                Ok(false) => warn!("Cloud refused receipt for {}", receipt.content),
                Err(e) => warn!("Cloud receipt for {} failed: {}", receipt.content, e),
            }
        }
    }

    fn handle_delivery_status(&self, message_id: &str, status: DeliveryStatus) {
        let mapped = match status {
            DeliveryStatus::Delivered => MessageStatus::Delivered,
            DeliveryStatus::Read => MessageStatus::Read,
            DeliveryStatus::Failed => MessageStatus::Failed,
            _ => return,
        };
        if mapped != MessageStatus::Delivered {
            self.inner.awaiting_ack.lock().pop(message_id);
        }
        if mapped != MessageStatus::Failed && self.inner.mailbox.lock().remove(message_id) {
            self.schedule_persist();
        }
        self.emit_update(message_id, mapped);
    }

    fn install_retry_handler(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .delivery
            .set_retry_handler(Arc::new(move |record: DeliveryRecord| {
                let weak = weak.clone();
                async move {
                    match Self::from_weak(&weak) {
                        Some(service) => service.resend_for_delivery(&record).await,
                        None => false,
                    }
                }
                .boxed()
            }));
    }

    /// Re-send a message the delivery manager is still waiting on, under a
    /// wire id unique to this attempt.
    async fn resend_for_delivery(&self, record: &DeliveryRecord) -> bool {
        let message_id = record.message_id.as_str();
        let cached = self.inner.awaiting_ack.lock().get(message_id).cloned();
        let Some(mut message) = cached else {
            debug!("No cached copy of {} to resend", message_id);
            return false;
        };
        let wire_id = message_id_for(&format!("{}:{}", message_id, record.retry_count));
        self.inner.delivery.register_wire_id(message_id, wire_id);
        self.attempt_send_as(&mut message, wire_id).await.accepted()
    }

    /// Returns `false` if `id` was already seen.
    fn record_seen(&self, id: &str) -> bool {
        let fresh = self.inner.seen.lock().check_and_add(id.to_string());
        if fresh {
            self.schedule_seen_persist();
        }
        fresh
    }

    fn emit_inbound(&self, message: HybridMessage) {
        debug!(
            "Inbound {:?} message {} from {}",
            message.source, message.id, message.sender_id
        );
        let _ = self.inner.inbound.send(message);
    }

    fn emit_update(&self, message_id: &str, status: MessageStatus) {
        let _ = self.inner.updates.send(MessageUpdate {
            message_id: message_id.to_string(),
            status,
        });
    }

    // ------------------------------------------------------------------
    // Connectivity
    // ------------------------------------------------------------------

    fn spawn_connection_loop(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.connection_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(service) = Self::from_weak(&weak) else {
                    break;
                };
                if service.inner.active.load(Ordering::SeqCst) {
                    service.refresh_connection().await;
                }
            }
        })
    }

    /// Re-classify the connection and (re)establish or drop the cloud
    /// subscriptions to match.
    pub async fn refresh_connection(&self) -> ConnectionMode {
        let online = self.inner.reachability.is_internet_reachable().await;
        let mode = ConnectionMode::classify(online, self.inner.mesh.peer_count());
        let changed = self.inner.mode.send_if_modified(|current| {
            if *current == mode {
                return false;
            }
            *current = mode;
            true
        });
        if changed {
            info!("Connection mode changed to {}", mode);
        }

        if online {
            self.ensure_cloud_subscriptions().await;
        } else {
            self.clear_cloud_subscriptions().await;
        }
        mode
    }

    async fn ensure_cloud_subscriptions(&self) {
        let identity = self.inner.identity.identity();
        let mut targets: Vec<String> = Vec::new();
        for target in [identity.id, identity.device_id, BROADCAST.to_string()] {
            if !target.is_empty() && target != "unknown" && !targets.contains(&target) {
                targets.push(target);
            }
        }

        let mut subscriptions = self.inner.cloud_subscriptions.lock().await;
        subscriptions.retain(|target, _| targets.contains(target));
        for target in targets {
            if subscriptions.contains_key(&target) {
                continue;
            }
            match self
                .inner
                .cloud
                .subscribe_to_messages(&target, self.inner.cloud_sink.clone())
                .await
            {
                Ok(subscription) => {
                    debug!("Subscribed to cloud inbox {}", target);
                    subscriptions.insert(target, subscription);
                }
                Err(e) => warn!("Cloud subscription for {} failed: {}", target, e),
            }
        }
    }

    async fn clear_cloud_subscriptions(&self) {
        let mut subscriptions = self.inner.cloud_subscriptions.lock().await;
        if !subscriptions.is_empty() {
            debug!("Dropping {} cloud subscription(s)", subscriptions.len());
            subscriptions.clear();
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn schedule_persist(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.queue_persist.schedule(async move {
            if let Some(service) = Self::from_weak(&weak) {
                service.persist_queue().await;
                service.persist_mailbox().await;
            }
        });
    }

    fn schedule_seen_persist(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.seen_persist.schedule(async move {
            if let Some(service) = Self::from_weak(&weak) {
                service.persist_seen().await;
            }
        });
    }

    async fn persist_queue(&self) {
        let snapshot = self.inner.queue.lock().await.snapshot();
        if let Err(e) = save_json(self.inner.store.as_ref(), keys::MESSAGE_QUEUE, &snapshot).await {
            warn!("Failed to save message queue: {}", e);
        }
    }

    async fn persist_mailbox(&self) {
        let snapshot = self.inner.mailbox.lock().snapshot();
        if let Err(e) = save_json(self.inner.store.as_ref(), keys::MESH_MAILBOX, &snapshot).await {
            warn!("Failed to save mailbox: {}", e);
        }
    }

    async fn persist_seen(&self) {
        let ids = self.inner.seen.lock().to_vec();
        if let Err(e) = save_json(self.inner.store.as_ref(), keys::SEEN_MESSAGE_IDS, &ids).await {
            warn!("Failed to save seen message ids: {}", e);
        }
    }

    pub async fn flush(&self) {
        self.inner.queue_persist.cancel();
        self.inner.seen_persist.cancel();
        self.persist_queue().await;
        self.persist_mailbox().await;
        self.persist_seen().await;
    }

    async fn restore(&self) {
        let store = self.inner.store.as_ref();
        match load_json::<PersistedQueue>(store, keys::MESSAGE_QUEUE).await {
            Ok(Some(persisted)) => {
                let mut queue = self.inner.queue.lock().await;
                queue.restore(persisted);
                debug!(
                    "Restored {} queued and {} failed message(s)",
                    queue.len(),
                    queue.failed_count()
                );
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable message queue: {}", e),
        }
        match load_json::<PersistedMailbox>(store, keys::MESH_MAILBOX).await {
            Ok(Some(persisted)) => {
                let mut mailbox = self.inner.mailbox.lock();
                mailbox.restore(persisted);
                debug!("Restored {} mailbox entries", mailbox.len());
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable mailbox: {}", e),
        }
        match load_json::<Vec<String>>(store, keys::SEEN_MESSAGE_IDS).await {
            Ok(Some(ids)) => {
                *self.inner.seen.lock() = LruSet::from_vec(self.inner.config.max_seen_ids, ids);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable seen message ids: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn subscribe_messages(&self) -> broadcast::Receiver<HybridMessage> {
        self.inner.inbound.subscribe()
    }

    pub fn subscribe_updates(&self) -> broadcast::Receiver<MessageUpdate> {
        self.inner.updates.subscribe()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionMode> {
        self.inner.mode.subscribe()
    }

    pub fn subscribe_typing(&self) -> broadcast::Receiver<TypingEvent> {
        self.inner.typing.subscribe()
    }

    pub fn typing(&self) -> &TypingIndicators {
        &self.inner.typing
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        *self.inner.mode.borrow()
    }

    pub fn is_duplicate(&self, message_id: &str) -> bool {
        self.inner.seen.lock().contains(&message_id.to_string())
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.queue.lock().await.pending_count()
    }

    pub async fn failed_count(&self) -> usize {
        self.inner.queue.lock().await.failed_count()
    }

    pub async fn queued_message(&self, id: &str) -> Option<HybridMessage> {
        self.inner.queue.lock().await.get(id).cloned()
    }

    /// Store-and-forward entries held for `peer_id`.
    pub fn mailbox_len(&self, peer_id: &str) -> usize {
        self.inner.mailbox.lock().peer_len(peer_id)
    }
}

fn packet_type_for(kind: MessageKind) -> PacketType {
    match kind {
        MessageKind::Sos => PacketType::Sos,
        MessageKind::Status => PacketType::Status,
        _ => PacketType::Text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryConfig, MeshConfig};
    use crate::hybrid::cloud::MemoryCloud;
    use crate::hybrid::connectivity::StaticReachability;
    use crate::identity::StaticIdentity;
    use crate::store::{Lane, MemoryStore};
    use crate::transport::SimulatedAir;

    struct Fixture {
        service: HybridMessageService,
        mesh: MeshTransport,
        cloud: MemoryCloud,
        net: Arc<StaticReachability>,
    }

    fn fixture(air: &SimulatedAir, id: &str, online: bool) -> Fixture {
        fixture_on(air, id, online, MemoryCloud::new())
    }

    fn fixture_on(air: &SimulatedAir, id: &str, online: bool, cloud: MemoryCloud) -> Fixture {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let identity = Arc::new(StaticIdentity::new(id, format!("{}-dev", id), id));
        let mesh = MeshTransport::new(
            MeshConfig::default(),
            Arc::new(air.radio(id)),
            store.clone(),
            identity.clone(),
        );
        let delivery = DeliveryManager::new(DeliveryConfig::default(), store.clone());
        let net = Arc::new(StaticReachability::new(online));
        let service = HybridMessageService::new(
            HybridConfig::default(),
            identity,
            mesh.clone(),
            delivery,
            Arc::new(cloud.clone()),
            net.clone(),
            store,
        );
        Fixture {
            service,
            mesh,
            cloud,
            net,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_rejects_before_queueing() {
        let air = SimulatedAir::new();
        let f = fixture(&air, "alice", true);
        let err = f
            .service
            .send_message("   ", None, SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Validation(ValidationError::Empty));
        assert_eq!(f.service.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_mesh_only_send_succeeds() {
        let air = SimulatedAir::new();
        let f = fixture(&air, "alice", false);
        f.mesh.start().await.unwrap();

        let msg = f
            .service
            .send_message("hello", None, SendOptions::default())
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(f.cloud.write_count(), 0);
        assert_eq!(f.service.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_only_send_writes_both_inboxes() {
        let air = SimulatedAir::new();
        let f = fixture(&air, "alice", true);

        let msg = f
            .service
            .send_message("hi bob", Some("bob"), SendOptions::default())
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Sent);
        assert_eq!(f.cloud.inbox("alice").len(), 1);
        assert_eq!(f.cloud.inbox("bob").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_attempt_schedules_backoff() {
        let air = SimulatedAir::new();
        let f = fixture(&air, "alice", false);

        let msg = f
            .service
            .send_message("nobody hears", None, SendOptions::default())
            .await
            .unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_eq!(msg.retry_count, 1);
        let wait = msg.next_retry_at.unwrap() - msg.last_retry_at.unwrap();
        // 1s * 2^1 with jitter in [0.5, 1.5)
        assert!((1_000..3_000).contains(&wait), "wait {wait}");
        assert_eq!(f.service.pending_count().await, 1);

        f.net.set_online(true);
        let later = msg.next_retry_at.unwrap();
        assert_eq!(f.service.process_queue_at(later).await, 1);
        assert_eq!(f.service.pending_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sos_escalates_and_never_exhausts() {
        let air = SimulatedAir::new();
        let mut config = HybridConfig::default();
        config.retry_max_attempts = 2;
        let f = fixture(&air, "alice", false);
        let service = HybridMessageService::new(
            config,
            Arc::new(StaticIdentity::new("alice", "alice-dev", "alice")),
            f.mesh.clone(),
            DeliveryManager::new(DeliveryConfig::default(), Arc::new(MemoryStore::new())),
            Arc::new(f.cloud.clone()),
            f.net.clone(),
            Arc::new(MemoryStore::new()),
        );

        let sos = service
            .send_message(
                "trapped",
                None,
                SendOptions {
                    kind: Some(MessageKind::Sos),
                    priority: Some(MessagePriority::High),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(sos.priority, MessagePriority::Critical);
        let chat = service
            .send_message("hello?", None, SendOptions::default())
            .await
            .unwrap();

        let mut now = now_ms();
        for _ in 0..5 {
            now += 120_000;
            service.process_queue_at(now).await;
        }
        let queued = service.queued_message(&sos.id).await.unwrap();
        assert!(queued.retry_count >= 5);
        // critical backoff cap is 5s (x1.5 jitter)
        assert!(queued.next_retry_at.unwrap() - now < 7_500);
        assert!(service.queued_message(&chat.id).await.is_none());
        assert_eq!(service.failed_count().await, 1);

        assert_eq!(service.retry_all_failed().await, 1);
        assert_eq!(service.failed_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_full_of_critical_rejects_send() {
        let air = SimulatedAir::new();
        let mut config = HybridConfig::default();
        config.max_queue_size = 1;
        let f = fixture(&air, "alice", false);
        let service = HybridMessageService::new(
            config,
            Arc::new(StaticIdentity::new("alice", "alice-dev", "alice")),
            f.mesh.clone(),
            DeliveryManager::new(DeliveryConfig::default(), Arc::new(MemoryStore::new())),
            Arc::new(f.cloud.clone()),
            f.net.clone(),
            Arc::new(MemoryStore::new()),
        );

        service.send_sos("help", None).await.unwrap();
        let err = service
            .send_message("hi", None, SendOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err, SendError::Queue(QueueError::Full { capacity: 1 }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_inbound_dedup_and_self_filter() {
        let air = SimulatedAir::new();
        let f = fixture(&air, "alice", true);
        let mut inbound = f.service.subscribe_messages();

        let record = CloudRecord {
            id: "c1".into(),
            from_device_id: "bob".into(),
            to_device_id: "alice".into(),
            content: "hi\u{200B} alice".into(),
            timestamp: 5,
            kind: MessageKind::Chat,
            priority: MessagePriority::Normal,
            sender_name: None,
            location: None,
        };
        let mut own = record.clone();
        own.id = "c2".into();
        own.from_device_id = "alice".into();

        f.service
            .handle_cloud_records(vec![record.clone(), record, own])
            .await;

        let msg = inbound.try_recv().unwrap();
        assert_eq!(msg.content, "hi alice");
        assert_eq!(msg.source, MessageSource::Cloud);
        assert_eq!(msg.sender_name, "Cloud User");
        assert_eq!(msg.recipient_id.as_deref(), Some("alice"));
        assert!(inbound.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cloud_receipt_marks_delivered() {
        let air = SimulatedAir::new();
        let cloud = MemoryCloud::new();
        let alice = fixture_on(&air, "alice", true, cloud.clone());
        let bob = fixture_on(&air, "bob", true, cloud.clone());
        alice.service.initialize().await;
        bob.service.initialize().await;
        let mut updates = alice.service.subscribe_updates();
        let mut heard = bob.service.subscribe_messages();

        let msg = alice
            .service
            .send_message("over the cloud", Some("bob"), SendOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(heard.try_recv().unwrap().id, msg.id);
        let receipts: Vec<CloudRecord> = cloud
            .inbox("alice")
            .into_iter()
            .filter(CloudRecord::is_receipt)
            .collect();
        assert_eq!(receipts.len(), 1);
        assert_eq!(receipts[0].content, msg.id);

        let mut delivered = false;
        while let Ok(update) = updates.try_recv() {
            if update.message_id == msg.id && update.status == MessageStatus::Delivered {
                delivered = true;
            }
        }
        assert!(delivered);
        assert_eq!(alice.service.mailbox_len("bob"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_addressed_message_is_acked_again() {
        let air = SimulatedAir::new();
        let f = fixture(&air, "bob", false);
        f.mesh.start().await.unwrap();
        f.mesh.set_lifecycle(AppLifecycle::Background).await;
        let mut inbound = f.service.subscribe_messages();

        let envelope = Envelope::new("dm-1", "alice", "bob", MessageKind::Chat, "you there?", 1);
        for wire_id in [41, 42] {
            f.service.handle_mesh_event(MeshEvent::Message(InboundMessage {
                packet_type: PacketType::Text,
                source: SourceToken::from_identity("alice"),
                peer_id: "alice".into(),
                message_id: wire_id,
                ttl: 3,
                payload: ParsedPayload::Envelope(envelope.clone()),
                received_at: 2,
            }));
        }

        assert_eq!(inbound.try_recv().unwrap().id, "dm-1");
        assert!(inbound.try_recv().is_err());
        assert_eq!(f.mesh.lane_len(Lane::High), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_addressed_send_held_until_delivered() {
        let air = SimulatedAir::new();
        let f = fixture(&air, "alice", false);
        f.mesh.start().await.unwrap();
        f.service.initialize().await;

        let dm = f
            .service
            .send_message("meet at the school", Some("bob"), SendOptions::default())
            .await
            .unwrap();
        f.service
            .send_message("all clear", None, SendOptions::default())
            .await
            .unwrap();
        assert_eq!(f.service.mailbox_len("bob"), 1);
        assert_eq!(f.service.mailbox_len(BROADCAST), 0);

        f.service.handle_mesh_event(MeshEvent::Ack {
            message_id: message_id_for(&dm.id),
            kind: AckKind::Delivered,
            receiver: SourceToken::from_identity("bob"),
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.service.mailbox_len("bob"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_mode_tracks_reachability() {
        let air = SimulatedAir::new();
        let f = fixture(&air, "alice", false);
        let mut modes = f.service.subscribe_connection();

        assert_eq!(f.service.refresh_connection().await, ConnectionMode::Offline);
        f.net.set_online(true);
        assert_eq!(f.service.refresh_connection().await, ConnectionMode::Online);
        assert!(modes.has_changed().unwrap());
        assert_eq!(*modes.borrow_and_update(), ConnectionMode::Online);
        assert_eq!(f.cloud.subscriber_count("alice"), 1);
        assert_eq!(f.cloud.subscriber_count("alice-dev"), 1);
        assert_eq!(f.cloud.subscriber_count(BROADCAST), 1);

        f.net.set_online(false);
        f.service.refresh_connection().await;
        assert_eq!(f.cloud.subscriber_count("alice"), 0);
    }
}
