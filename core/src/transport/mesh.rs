//! Mesh transport service.
//!
//! Owns the scan/advertise/heartbeat cycle over a single-slot radio:
//!
//! - a fixed-period loop flushes critical and high lanes when they hold
//!   traffic and otherwise drains one capped batch onto the radio,
//! - an adaptive heartbeat keeps a PING advertised between bursts,
//! - inbound advertisements are decoded, deduplicated by `source:message_id`,
//!   surfaced to subscribers when meant for this device, and relayed with a
//!   decremented TTL while hops remain.
//!
//! Radio and codec failures are logged and absorbed; nothing that happens on
//! the air can stop the loop.

use super::heartbeat::HeartbeatPolicy;
use super::radio::{Advertisement, RadioError, RadioTransport};
use crate::config::MeshConfig;
use crate::crypto::{MeshCipher, SealError};
use crate::identity::{IdentityProvider, SelfAliases};
use crate::message::codec::{self, dedup_key, HEADER_SIZE, MAX_PACKET_SIZE};
use crate::message::{
    message_id_for, parse_payload, AckKind, AckPayload, CodecError, Envelope, GeoPoint,
    LocationPayload, MeshPacket, MessageKind, PacketType, ParsedPayload, SosPayload, SourceToken,
};
use crate::store::{
    keys, load_json, save_json, DrainCaps, KeyValueStore, Lane, PeerRecord, PeerStatus,
    PeerTable, PersistedLanes, PriorityLanes, QueueError, QueuedPacket,
};
use crate::sync::{AsyncMutex, Debouncer, LruSet};
use crate::{now_ms, AppLifecycle};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MeshError {
    #[error("Mesh transport is not running")]
    NotRunning,
    #[error("Mesh transport is already running")]
    AlreadyRunning,
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
    #[error("Seal error: {0}")]
    Seal(#[from] SealError),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshState {
    Stopped,
    Starting,
    Running,
    /// Host is backgrounded: loop and heartbeat are suspended, scanning and
    /// inbound handling continue.
    Paused,
    Stopping,
}

impl std::fmt::Display for MeshState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MeshState::Stopped => write!(f, "Stopped"),
            MeshState::Starting => write!(f, "Starting"),
            MeshState::Running => write!(f, "Running"),
            MeshState::Paused => write!(f, "Paused"),
            MeshState::Stopping => write!(f, "Stopping"),
        }
    }
}

/// A message-bearing packet meant for this device.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub packet_type: PacketType,
    pub source: SourceToken,
    /// Radio id of the neighbor we heard it from (may be a relay)
    pub peer_id: String,
    pub message_id: u32,
    /// TTL as received, before any relay decrement
    pub ttl: u8,
    pub payload: ParsedPayload,
    pub received_at: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Message(InboundMessage),
    Ack {
        message_id: u32,
        kind: AckKind,
        receiver: SourceToken,
    },
    Beacon {
        source: SourceToken,
        peer_id: String,
        beacon: SosPayload,
    },
    Location {
        source: SourceToken,
        peer_id: String,
        location: LocationPayload,
    },
    PeerDiscovered(String),
    PeerLost(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeshStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_relayed: u64,
    pub duplicates_dropped: u64,
    pub malformed_dropped: u64,
    pub advertise_failures: u64,
}

struct MeshInner {
    config: MeshConfig,
    caps: DrainCaps,
    heartbeat_policy: HeartbeatPolicy,
    radio: Arc<dyn RadioTransport>,
    store: Arc<dyn KeyValueStore>,
    identity: Arc<dyn IdentityProvider>,
    cipher: Option<MeshCipher>,
    state: RwLock<MeshState>,
    lanes: Mutex<PriorityLanes>,
    /// Serializes use of the single advertisement slot
    radio_lock: AsyncMutex<()>,
    seen: Mutex<LruSet<String>>,
    peers: RwLock<PeerTable>,
    aliases: RwLock<SelfAliases>,
    stats: RwLock<MeshStats>,
    events: broadcast::Sender<MeshEvent>,
    last_activity: RwLock<Instant>,
    battery: RwLock<Option<u8>>,
    main_loop: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<(Duration, JoinHandle<()>)>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    revert: Debouncer,
    persist: Debouncer,
    ping_counter: AtomicU32,
}

/// Cheap to clone; all clones drive the same service.
#[derive(Clone)]
pub struct MeshTransport {
    inner: Arc<MeshInner>,
}

impl MeshTransport {
    pub fn new(
        config: MeshConfig,
        radio: Arc<dyn RadioTransport>,
        store: Arc<dyn KeyValueStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let aliases = SelfAliases::new(&identity.identity());
        let cipher = config
            .network_passphrase
            .as_deref()
            .map(MeshCipher::from_passphrase);

        Self {
            inner: Arc::new(MeshInner {
                caps: DrainCaps {
                    high: config.high_drain_cap,
                    normal: config.normal_drain_cap,
                    relay: config.relay_drain_cap,
                },
                heartbeat_policy: HeartbeatPolicy::from_config(&config),
                lanes: Mutex::new(PriorityLanes::new(config.max_queue_size)),
                seen: Mutex::new(LruSet::new(config.max_seen_ids)),
                peers: RwLock::new(PeerTable::new(config.peer_stale_timeout_ms)),
                revert: Debouncer::new(config.advertise_busy()),
                persist: Debouncer::new(config.persist_debounce()),
                radio,
                store,
                identity,
                cipher,
                state: RwLock::new(MeshState::Stopped),
                radio_lock: AsyncMutex::new(()),
                aliases: RwLock::new(aliases),
                stats: RwLock::new(MeshStats::default()),
                events,
                last_activity: RwLock::new(Instant::now()),
                battery: RwLock::new(None),
                main_loop: Mutex::new(None),
                heartbeat: Mutex::new(None),
                background: Mutex::new(Vec::new()),
                ping_counter: AtomicU32::new(0),
                config,
            }),
        }
    }

    fn from_weak(weak: &Weak<MeshInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub async fn start(&self) -> Result<(), MeshError> {
        {
            let mut state = self.inner.state.write();
            if *state != MeshState::Stopped {
                return Err(MeshError::AlreadyRunning);
            }
            *state = MeshState::Starting;
        }

        let identity = self.inner.identity.identity();
        let aliases = SelfAliases::new(&identity);
        let token = aliases.token();
        *self.inner.aliases.write() = aliases;

        self.restore().await;

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.radio.on_peer_found(tx);
        if let Err(e) = self.inner.radio.start_scanning().await {
            warn!("Mesh start aborted, scanning failed: {}", e);
            *self.inner.state.write() = MeshState::Stopped;
            return Err(e.into());
        }

        *self.inner.last_activity.write() = Instant::now();
        *self.inner.state.write() = MeshState::Running;

        let pump = self.spawn_inbound_pump(rx);
        let sweeper = self.spawn_sweeper();
        self.inner.background.lock().extend([pump, sweeper]);
        self.start_loop();
        self.refresh_heartbeat();

        info!(
            "Mesh transport running as {} (token {}, {} packet(s) queued)",
            identity.id,
            token,
            self.queued_len()
        );
        if let Some(cipher) = &self.inner.cipher {
            info!("Mesh payload sealing on (key {})", cipher.fingerprint());
        }
        Ok(())
    }

    pub async fn stop(&self) {
        {
            let mut state = self.inner.state.write();
            if matches!(*state, MeshState::Stopped | MeshState::Stopping) {
                return;
            }
            *state = MeshState::Stopping;
        }

        self.halt_loop();
        for handle in self.inner.background.lock().drain(..) {
            handle.abort();
        }
        self.flush().await;
        if let Err(e) = self.inner.radio.stop_dual_mode().await {
            warn!("Failed to stop radio: {}", e);
        }

        *self.inner.state.write() = MeshState::Stopped;
        info!("Mesh transport stopped");
    }

    /// Suspend the loop and flush state when the host goes to the
    /// background; resume on return to the foreground.
    pub async fn set_lifecycle(&self, lifecycle: AppLifecycle) {
        match lifecycle {
            AppLifecycle::Background => {
                {
                    let mut state = self.inner.state.write();
                    if *state != MeshState::Running {
                        return;
                    }
                    *state = MeshState::Paused;
                }
                self.halt_loop();
                self.flush().await;
                info!("Mesh transport paused for background");
            }
            AppLifecycle::Foreground => {
                {
                    let mut state = self.inner.state.write();
                    if *state != MeshState::Paused {
                        return;
                    }
                    *state = MeshState::Running;
                }
                self.start_loop();
                self.refresh_heartbeat();
                info!("Mesh transport resumed");
            }
        }
    }

    fn halt_loop(&self) {
        if let Some(handle) = self.inner.main_loop.lock().take() {
            handle.abort();
        }
        if let Some((_, handle)) = self.inner.heartbeat.lock().take() {
            handle.abort();
        }
        self.inner.revert.cancel();
    }

    fn start_loop(&self) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.loop_interval();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(mesh) = Self::from_weak(&weak) else {
                    break;
                };
                mesh.tick().await;
            }
        });
        if let Some(previous) = self.inner.main_loop.lock().replace(handle) {
            previous.abort();
        }
    }

    fn spawn_inbound_pump(&self, mut rx: mpsc::UnboundedReceiver<Advertisement>) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while let Some(advertisement) = rx.recv().await {
                let Some(mesh) = Self::from_weak(&weak) else {
                    break;
                };
                mesh.handle_advertisement(advertisement).await;
            }
        })
    }

    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(mesh) = Self::from_weak(&weak) else {
                    break;
                };
                mesh.sweep_stale_peers();
            }
        })
    }

    /// One loop iteration: flush critical and high traffic if any is waiting,
    /// otherwise drain one capped batch; then re-evaluate the heartbeat
    /// interval.
    pub async fn tick(&self) {
        if self.state() != MeshState::Running {
            return;
        }
        let (urgent, has_work) = {
            let lanes = self.inner.lanes.lock();
            (lanes.has_urgent(), !lanes.is_empty())
        };
        if urgent {
            self.process_urgent().await;
        } else if has_work {
            self.process_queues().await;
        }
        self.refresh_heartbeat();
    }

    // ------------------------------------------------------------------
    // Heartbeat
    // ------------------------------------------------------------------

    /// Recompute the heartbeat interval and restart the heartbeat timer if
    /// it changed. Returns the interval in effect.
    pub fn refresh_heartbeat(&self) -> Duration {
        let since_activity = self.inner.last_activity.read().elapsed();
        let peer_count = self.inner.peers.read().len();
        let battery = *self.inner.battery.read();
        let interval = self
            .inner
            .heartbeat_policy
            .interval(peer_count, since_activity, battery);

        let mut slot = self.inner.heartbeat.lock();
        if let Some((current, handle)) = slot.as_ref() {
            if *current == interval && !handle.is_finished() {
                return interval;
            }
        }
        if let Some((previous, handle)) = slot.take() {
            handle.abort();
            debug!("Heartbeat interval {:?} -> {:?}", previous, interval);
        }

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(mesh) = Self::from_weak(&weak) else {
                    break;
                };
                mesh.send_heartbeat().await;
            }
        });
        *slot = Some((interval, handle));
        interval
    }

    /// Interval of the running heartbeat timer, if any.
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        self.inner.heartbeat.lock().as_ref().map(|(d, _)| *d)
    }

    fn heartbeat_frame(&self) -> Result<Vec<u8>, CodecError> {
        let id = self.inner.ping_counter.fetch_add(1, Ordering::Relaxed);
        codec::serialize(PacketType::Ping, self.token(), &[], 1, 0, id)
    }

    async fn send_heartbeat(&self) {
        if self.state() != MeshState::Running {
            return;
        }
        let _slot = self.inner.radio_lock.lock().await;
        let frame = match self.heartbeat_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to build heartbeat: {}", e);
                return;
            }
        };
        if let Err(e) = self.inner.radio.start_advertising(frame).await {
            self.inner.stats.write().advertise_failures += 1;
            warn!("Heartbeat advertise failed: {}", e);
        }
    }

    fn schedule_heartbeat_revert(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.revert.schedule(async move {
            if let Some(mesh) = Self::from_weak(&weak) {
                mesh.send_heartbeat().await;
            }
        });
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Drain one batch from the lanes onto the radio. Returns how many
    /// packets were advertised.
    ///
    /// Packets are spaced by the advertise busy period. On an advertise
    /// failure the failed packet and the rest of the batch go back to the
    /// head of their lanes for the next iteration.
    pub async fn process_queues(&self) -> usize {
        let _slot = self.inner.radio_lock.lock().await;
        let batch = self.inner.lanes.lock().drain(&self.inner.caps);
        self.advertise_batch(batch).await
    }

    /// Drain every critical and high packet onto the radio, leaving normal
    /// and relay traffic queued.
    pub async fn process_urgent(&self) -> usize {
        let _slot = self.inner.radio_lock.lock().await;
        let batch = self.inner.lanes.lock().drain_urgent();
        self.advertise_batch(batch).await
    }

    /// Caller holds the radio slot.
    async fn advertise_batch(&self, batch: Vec<QueuedPacket>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let own = self.token();
        let busy = self.inner.config.advertise_busy();
        let mut sent = 0usize;
        let mut failed = Vec::new();
        let mut pending = batch.into_iter();

        while let Some(packet) = pending.next() {
            let frame = match codec::serialize(
                packet.packet_type,
                packet.source.unwrap_or(own),
                &packet.payload,
                packet.ttl,
                packet.lane.score(),
                packet.message_id,
            ) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Dropping unencodable packet {}: {}", packet.message_id, e);
                    continue;
                }
            };

            if sent > 0 {
                tokio::time::sleep(busy).await;
            }
            match self.inner.radio.start_advertising(frame).await {
                Ok(()) => {
                    sent += 1;
                    debug!(
                        "Advertised {} packet {} (ttl {}, {:?} lane)",
                        packet.packet_type, packet.message_id, packet.ttl, packet.lane
                    );
                }
                Err(e) => {
                    failed.push(packet);
                    failed.extend(pending.by_ref());
                    self.inner.stats.write().advertise_failures += 1;
                    warn!("Advertise failed, requeueing {} packet(s): {}", failed.len(), e);
                    break;
                }
            }
        }

        if !failed.is_empty() {
            self.inner.lanes.lock().requeue_front(failed);
        }
        if sent > 0 {
            self.inner.stats.write().packets_sent += sent as u64;
            self.schedule_heartbeat_revert();
        }
        self.schedule_persist();
        sent
    }

    /// Queue an envelope for broadcast. Returns the numeric wire id.
    ///
    /// Accepted while paused (the packet waits in the persisted lanes); fails
    /// when the service is stopped.
    pub fn send_envelope(
        &self,
        envelope: &Envelope,
        packet_type: PacketType,
    ) -> Result<u32, MeshError> {
        self.send_envelope_as(envelope, packet_type, message_id_for(&envelope.id))
    }

    /// Queue an envelope under an explicit wire id. Resends use a fresh id
    /// per attempt so receivers that already saw an earlier copy still
    /// hear it and answer with another ACK.
    pub fn send_envelope_as(
        &self,
        envelope: &Envelope,
        packet_type: PacketType,
        message_id: u32,
    ) -> Result<u32, MeshError> {
        let json = envelope
            .to_bytes()
            .map_err(|e| MeshError::Serialization(e.to_string()))?;
        let payload = self.seal_payload(packet_type, json)?;
        self.enqueue_local(packet_type, payload, message_id)
    }

    /// Compact emergency beacon that fits a legacy advertisement.
    pub fn send_sos_beacon(&self, lat: f32, lon: f32, status: u8) -> Result<u32, MeshError> {
        let beacon = SosPayload { lat, lon, status };
        let message_id = message_id_for(&format!("beacon:{}:{}", self.token(), now_ms()));
        self.enqueue_local(PacketType::EmergencyBeacon, beacon.encode(), message_id)
    }

    pub fn share_location(&self, location: LocationPayload) -> Result<u32, MeshError> {
        let message_id = message_id_for(&format!("loc:{}:{}", self.token(), now_ms()));
        self.enqueue_local(PacketType::Location, location.encode(), message_id)
    }

    /// Acknowledge a received message back across the mesh.
    pub fn send_ack(&self, original_message_id: u32, kind: AckKind) -> Result<u32, MeshError> {
        let ack = AckPayload {
            message_id: original_message_id,
            kind,
            receiver: self.token(),
        };
        let message_id = message_id_for(&format!(
            "ack:{}:{}:{}",
            self.token(),
            original_message_id,
            kind as u8
        ));
        self.enqueue_local(PacketType::Ack, ack.encode(), message_id)
    }

    fn enqueue_local(
        &self,
        packet_type: PacketType,
        payload: Vec<u8>,
        message_id: u32,
    ) -> Result<u32, MeshError> {
        if !matches!(self.state(), MeshState::Running | MeshState::Paused) {
            return Err(MeshError::NotRunning);
        }
        let size = HEADER_SIZE + payload.len();
        if size > MAX_PACKET_SIZE {
            return Err(CodecError::TooLarge {
                size,
                max: MAX_PACKET_SIZE,
            }
            .into());
        }

        // Remember our own key so echoes relayed back to us are dropped.
        self.inner
            .seen
            .lock()
            .check_and_add(dedup_key(self.token(), message_id));

        self.enqueue(QueuedPacket {
            packet_type,
            payload,
            ttl: self.inner.config.default_ttl,
            lane: Lane::for_packet(packet_type),
            message_id,
            source: None,
            queued_at: now_ms(),
        })?;
        Ok(message_id)
    }

    fn enqueue(&self, packet: QueuedPacket) -> Result<(), QueueError> {
        let lane = packet.lane;
        let evicted = self.inner.lanes.lock().enqueue(packet)?;
        if let Some(evicted) = evicted {
            debug!(
                "Lanes full, evicted {:?} packet {}",
                evicted.lane, evicted.message_id
            );
        }
        self.schedule_persist();

        // Emergency traffic does not wait for the next loop iteration.
        if lane == Lane::Critical && self.state() == MeshState::Running {
            let mesh = self.clone();
            tokio::spawn(async move {
                mesh.process_urgent().await;
            });
        }
        Ok(())
    }

    fn seal_payload(&self, packet_type: PacketType, payload: Vec<u8>) -> Result<Vec<u8>, MeshError> {
        match &self.inner.cipher {
            Some(cipher) => Ok(cipher.seal(&[packet_type.as_u8()], &payload)?),
            None => Ok(payload),
        }
    }

    fn open_payload(&self, packet_type: PacketType, payload: &[u8]) -> Option<Vec<u8>> {
        match &self.inner.cipher {
            Some(cipher) => cipher.open(&[packet_type.as_u8()], payload).ok(),
            None => Some(payload.to_vec()),
        }
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Process one received advertisement.
    pub async fn handle_advertisement(&self, advertisement: Advertisement) {
        let Some(packet) = codec::deserialize(&advertisement.manufacturer_data) else {
            self.inner.stats.write().malformed_dropped += 1;
            debug!("Dropped malformed advertisement from {}", advertisement.id);
            return;
        };

        let now = now_ms();
        let discovered = self
            .inner
            .peers
            .write()
            .upsert(&advertisement.id, advertisement.rssi, now);
        *self.inner.last_activity.write() = Instant::now();
        if discovered {
            debug!("Discovered peer {}", advertisement.id);
            self.emit(MeshEvent::PeerDiscovered(advertisement.id.clone()));
        }

        if packet.packet_type == PacketType::Ping {
            return;
        }

        let fresh = self.inner.seen.lock().check_and_add(packet.dedup_key());
        if !fresh {
            self.inner.stats.write().duplicates_dropped += 1;
            debug!("Dropped duplicate {}", packet.dedup_key());
            return;
        }
        self.inner.stats.write().packets_received += 1;
        self.schedule_persist();

        let consumed = match self.dispatch(&packet, &advertisement, now) {
            Some(consumed) => consumed,
            None => {
                self.inner.stats.write().malformed_dropped += 1;
                debug!(
                    "Dropped unreadable {} payload from {}",
                    packet.packet_type, advertisement.id
                );
                return;
            }
        };

        if !consumed {
            self.relay(&packet);
        }
    }

    /// Surface a fresh packet locally. Returns `Some(true)` when the packet
    /// was addressed to this device alone (no relay needed), `None` when the
    /// payload could not be read.
    fn dispatch(&self, packet: &MeshPacket, advertisement: &Advertisement, now: u64) -> Option<bool> {
        match packet.packet_type {
            PacketType::Ack => {
                let ack = AckPayload::decode(&packet.payload)?;
                self.emit(MeshEvent::Ack {
                    message_id: ack.message_id,
                    kind: ack.kind,
                    receiver: ack.receiver,
                });
                Some(false)
            }
            PacketType::Location => {
                let location = LocationPayload::decode(&packet.payload)?;
                if packet.source == SourceToken::from_identity(&advertisement.id) {
                    let point = GeoPoint {
                        lat: location.lat as f64,
                        lng: location.lon as f64,
                        accuracy: Some(location.accuracy_m as f64),
                    };
                    self.inner
                        .peers
                        .write()
                        .update_location(&advertisement.id, point);
                }
                self.emit(MeshEvent::Location {
                    source: packet.source,
                    peer_id: advertisement.id.clone(),
                    location,
                });
                Some(false)
            }
            PacketType::EmergencyBeacon => {
                let beacon = SosPayload::decode(&packet.payload)?;
                self.note_peer_status(packet, advertisement, PeerStatus::NeedsHelp);
                warn!(
                    "Emergency beacon from {} at ({:.5}, {:.5})",
                    packet.source, beacon.lat, beacon.lon
                );
                self.emit(MeshEvent::Beacon {
                    source: packet.source,
                    peer_id: advertisement.id.clone(),
                    beacon,
                });
                Some(false)
            }
            PacketType::Ping => Some(true),
            _ => {
                let opened = self.open_payload(packet.packet_type, &packet.payload)?;
                let payload = parse_payload(&opened);
                let announced = match &payload {
                    ParsedPayload::Envelope(envelope) => match envelope.kind {
                        MessageKind::Sos => Some(PeerStatus::NeedsHelp),
                        MessageKind::Status => PeerStatus::from_announcement(&envelope.content),
                        _ => None,
                    },
                    ParsedPayload::RawText(_) => None,
                };
                let announced = announced.or(match packet.packet_type {
                    PacketType::Sos | PacketType::RescueSignal => Some(PeerStatus::NeedsHelp),
                    _ => None,
                });
                if let Some(status) = announced {
                    self.note_peer_status(packet, advertisement, status);
                }
                let (surface, only_for_me) = match &payload {
                    ParsedPayload::Envelope(envelope) => {
                        let aliases = self.inner.aliases.read();
                        let accepted = aliases.accepts(&envelope.to);
                        (accepted, accepted && !envelope.is_broadcast())
                    }
                    ParsedPayload::RawText(_) => (true, false),
                };
                if surface {
                    self.emit(MeshEvent::Message(InboundMessage {
                        packet_type: packet.packet_type,
                        source: packet.source,
                        peer_id: advertisement.id.clone(),
                        message_id: packet.message_id,
                        ttl: packet.ttl,
                        payload,
                        received_at: now,
                    }));
                } else {
                    debug!(
                        "Packet {} addressed elsewhere, relay only",
                        packet.dedup_key()
                    );
                }
                Some(only_for_me)
            }
        }
    }

    /// Record a status only when the neighbor is the originator; relayed
    /// copies say nothing about the relay itself.
    fn note_peer_status(&self, packet: &MeshPacket, advertisement: &Advertisement, status: PeerStatus) {
        if packet.source != SourceToken::from_identity(&advertisement.id) {
            return;
        }
        if self.inner.peers.write().update_status(&advertisement.id, status) {
            debug!("Peer {} status now {:?}", advertisement.id, status);
        }
    }

    fn relay(&self, packet: &MeshPacket) {
        let remaining = packet.ttl.saturating_sub(1);
        if remaining == 0 {
            debug!("Packet {} reached end of TTL", packet.dedup_key());
            return;
        }

        let relayed = QueuedPacket {
            packet_type: packet.packet_type,
            payload: packet.payload.clone(),
            ttl: remaining,
            lane: Lane::for_relay(packet.packet_type),
            message_id: packet.message_id,
            source: Some(packet.source),
            queued_at: now_ms(),
        };
        match self.enqueue(relayed) {
            Ok(()) => {
                self.inner.stats.write().packets_relayed += 1;
                debug!("Relaying {} with ttl {}", packet.dedup_key(), remaining);
            }
            Err(e) => warn!("Relay of {} dropped: {}", packet.dedup_key(), e),
        }
    }

    fn emit(&self, event: MeshEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    /// Remove peers past the staleness timeout. Returns their ids.
    pub fn sweep_stale_peers(&self) -> Vec<String> {
        let removed = self.inner.peers.write().sweep_stale(now_ms());
        for id in &removed {
            debug!("Peer {} went stale", id);
            self.emit(MeshEvent::PeerLost(id.clone()));
        }
        removed
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    fn schedule_persist(&self) {
        let weak = Arc::downgrade(&self.inner);
        self.inner.persist.schedule(async move {
            if let Some(mesh) = Self::from_weak(&weak) {
                mesh.persist_now().await;
            }
        });
    }

    async fn persist_now(&self) {
        let lanes = self.inner.lanes.lock().snapshot();
        let seen = self.inner.seen.lock().to_vec();
        let store = self.inner.store.as_ref();

        if let Err(e) = save_json(store, keys::MESH_QUEUE, &lanes).await {
            warn!("Failed to persist mesh queue: {}", e);
        }
        if let Err(e) = save_json(store, keys::MESH_SEEN_IDS, &seen).await {
            warn!("Failed to persist mesh dedup window: {}", e);
        }
    }

    /// Write pending state now instead of waiting for the debounce.
    pub async fn flush(&self) {
        self.inner.persist.cancel();
        self.persist_now().await;
    }

    async fn restore(&self) {
        let store = self.inner.store.as_ref();
        match load_json::<PersistedLanes>(store, keys::MESH_QUEUE).await {
            Ok(Some(persisted)) => {
                let count = {
                    let mut lanes = self.inner.lanes.lock();
                    lanes.restore(persisted);
                    lanes.len()
                };
                debug!("Restored {} queued mesh packet(s)", count);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable mesh queue: {}", e),
        }
        match load_json::<Vec<String>>(store, keys::MESH_SEEN_IDS).await {
            Ok(Some(ids)) => {
                *self.inner.seen.lock() = LruSet::from_vec(self.inner.config.max_seen_ids, ids);
            }
            Ok(None) => {}
            Err(e) => warn!("Ignoring unreadable mesh dedup window: {}", e),
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events.subscribe()
    }

    pub fn state(&self) -> MeshState {
        *self.inner.state.read()
    }

    pub fn token(&self) -> SourceToken {
        self.inner.aliases.read().token()
    }

    pub fn aliases(&self) -> SelfAliases {
        self.inner.aliases.read().clone()
    }

    pub fn stats(&self) -> MeshStats {
        self.inner.stats.read().clone()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.peers.read().list()
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.read().len()
    }

    pub fn queued_len(&self) -> usize {
        self.inner.lanes.lock().len()
    }

    pub fn lane_len(&self, lane: Lane) -> usize {
        self.inner.lanes.lock().lane_len(lane)
    }

    pub fn has_seen(&self, source: SourceToken, message_id: u32) -> bool {
        self.inner
            .seen
            .lock()
            .contains(&dedup_key(source, message_id))
    }

    /// Battery level in percent, or `None` when unknown / charging.
    pub fn set_battery_level(&self, level: Option<u8>) {
        *self.inner.battery.write() = level;
    }
}
