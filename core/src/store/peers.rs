// Peer table — neighbors currently reachable over the radio

use crate::message::GeoPoint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Unknown,
    Safe,
    NeedsHelp,
    Danger,
}

impl PeerStatus {
    /// Status named in the body of a STATUS message, if recognized.
    pub fn from_announcement(text: &str) -> Option<PeerStatus> {
        match text.trim().to_ascii_lowercase().as_str() {
            "safe" | "ok" | "i'm safe" => Some(PeerStatus::Safe),
            "help" | "needs_help" | "need help" => Some(PeerStatus::NeedsHelp),
            "danger" => Some(PeerStatus::Danger),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub display_name: String,
    /// Last observed RSSI in dBm
    pub signal_strength: i16,
    pub first_seen_at: u64,
    pub last_seen_at: u64,
    pub status: PeerStatus,
    pub location: Option<GeoPoint>,
}

impl PeerRecord {
    fn discovered(id: &str, signal_strength: i16, now: u64) -> Self {
        let short: String = id.chars().take(8).collect();
        Self {
            id: id.to_string(),
            display_name: format!("Peer {}", short),
            signal_strength,
            first_seen_at: now,
            last_seen_at: now,
            status: PeerStatus::Unknown,
            location: None,
        }
    }
}

/// Reachable neighbors keyed by radio id. Entries expire when not
/// re-discovered within `stale_timeout_ms`.
pub struct PeerTable {
    peers: HashMap<String, PeerRecord>,
    stale_timeout_ms: u64,
}

impl PeerTable {
    pub fn new(stale_timeout_ms: u64) -> Self {
        Self {
            peers: HashMap::new(),
            stale_timeout_ms,
        }
    }

    /// Create or refresh a peer. Returns `true` on first discovery.
    pub fn upsert(&mut self, peer_id: &str, signal_strength: i16, now: u64) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.signal_strength = signal_strength;
                peer.last_seen_at = peer.last_seen_at.max(now);
                false
            }
            None => {
                self.peers.insert(
                    peer_id.to_string(),
                    PeerRecord::discovered(peer_id, signal_strength, now),
                );
                true
            }
        }
    }

    pub fn update_location(&mut self, peer_id: &str, location: GeoPoint) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.location = Some(location);
                true
            }
            None => false,
        }
    }

    pub fn update_status(&mut self, peer_id: &str, status: PeerStatus) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.status = status;
                true
            }
            None => false,
        }
    }

    /// Remove peers not seen within the staleness timeout. Returns their ids.
    pub fn sweep_stale(&mut self, now: u64) -> Vec<String> {
        let timeout = self.stale_timeout_ms;
        let stale: Vec<String> = self
            .peers
            .values()
            .filter(|p| now.saturating_sub(p.last_seen_at) > timeout)
            .map(|p| p.id.clone())
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    pub fn get(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    /// Peers sorted by signal strength, strongest first.
    pub fn list(&self) -> Vec<PeerRecord> {
        let mut peers: Vec<PeerRecord> = self.peers.values().cloned().collect();
        peers.sort_by(|a, b| b.signal_strength.cmp(&a.signal_strength));
        peers
    }

    /// Peers seen within `window_ms` of `now`.
    pub fn active_count(&self, now: u64, window_ms: u64) -> usize {
        self.peers
            .values()
            .filter(|p| now.saturating_sub(p.last_seen_at) <= window_ms)
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
