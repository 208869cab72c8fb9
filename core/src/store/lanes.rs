// Priority lanes — four ordered queues of outbound packets
//
// Drain order is critical, high, normal, relay. Critical drains without a
// cap; the others are capped per pass so one lane cannot monopolize the
// single advertisement slot. On overflow the oldest entry of the lowest
// non-empty lane is evicted (relay, then normal, then high). Critical
// entries are never evicted.

use crate::message::{PacketType, SourceToken};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue full ({capacity} entries, nothing evictable)")]
    Full { capacity: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Critical,
    High,
    Normal,
    Relay,
}

impl Lane {
    /// Drain order
    pub const ALL: [Lane; 4] = [Lane::Critical, Lane::High, Lane::Normal, Lane::Relay];

    /// Eviction order, lowest priority first
    const EVICTABLE: [Lane; 3] = [Lane::Relay, Lane::Normal, Lane::High];

    /// Lane for a locally originated packet.
    pub fn for_packet(packet_type: PacketType) -> Lane {
        match packet_type {
            PacketType::Sos | PacketType::EmergencyBeacon | PacketType::RescueSignal => {
                Lane::Critical
            }
            PacketType::Status | PacketType::FamilySearch | PacketType::Ack => Lane::High,
            _ => Lane::Normal,
        }
    }

    /// Lane for a packet being forwarded on behalf of another device.
    pub fn for_relay(packet_type: PacketType) -> Lane {
        if packet_type.is_emergency() {
            Lane::Critical
        } else {
            Lane::Relay
        }
    }

    /// Header priority score advertised with the packet.
    pub fn score(self) -> u8 {
        match self {
            Lane::Critical => 3,
            Lane::High => 2,
            Lane::Normal => 1,
            Lane::Relay => 0,
        }
    }

    fn index(self) -> usize {
        match self {
            Lane::Critical => 0,
            Lane::High => 1,
            Lane::Normal => 2,
            Lane::Relay => 3,
        }
    }
}

/// Persisted, pre-radio form of a packet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedPacket {
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    pub ttl: u8,
    pub lane: Lane,
    pub message_id: u32,
    /// Originator token for relayed packets; `None` means this device.
    pub source: Option<SourceToken>,
    pub queued_at: u64,
}

/// Per-pass caps. Critical is always unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainCaps {
    pub high: usize,
    pub normal: usize,
    pub relay: usize,
}

impl Default for DrainCaps {
    fn default() -> Self {
        Self {
            high: 5,
            normal: 2,
            relay: 2,
        }
    }
}

impl DrainCaps {
    fn cap(&self, lane: Lane) -> usize {
        match lane {
            Lane::Critical => usize::MAX,
            Lane::High => self.high,
            Lane::Normal => self.normal,
            Lane::Relay => self.relay,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedLanes {
    pub critical: Vec<QueuedPacket>,
    pub high: Vec<QueuedPacket>,
    pub normal: Vec<QueuedPacket>,
    pub relay: Vec<QueuedPacket>,
}

pub struct PriorityLanes {
    lanes: [VecDeque<QueuedPacket>; 4],
    max_size: usize,
}

impl PriorityLanes {
    pub fn new(max_size: usize) -> Self {
        Self {
            lanes: Default::default(),
            max_size: max_size.max(1),
        }
    }

    /// Append a packet to its lane. Returns the entry evicted to make room,
    /// if any.
    pub fn enqueue(&mut self, packet: QueuedPacket) -> Result<Option<QueuedPacket>, QueueError> {
        let mut evicted = None;
        if self.len() >= self.max_size {
            evicted = self.evict_one();
            if evicted.is_none() {
                return Err(QueueError::Full {
                    capacity: self.max_size,
                });
            }
        }
        self.lanes[packet.lane.index()].push_back(packet);
        Ok(evicted)
    }

    fn evict_one(&mut self) -> Option<QueuedPacket> {
        Lane::EVICTABLE
            .iter()
            .find_map(|lane| self.lanes[lane.index()].pop_front())
    }

    /// Take the next batch in lane order. Packets whose TTL is already
    /// exhausted are discarded here and never returned.
    pub fn drain(&mut self, caps: &DrainCaps) -> Vec<QueuedPacket> {
        let mut batch = Vec::new();
        for lane in Lane::ALL {
            let queue = &mut self.lanes[lane.index()];
            let mut taken = 0;
            while taken < caps.cap(lane) {
                let Some(packet) = queue.pop_front() else {
                    break;
                };
                if packet.ttl == 0 {
                    continue;
                }
                batch.push(packet);
                taken += 1;
            }
        }
        batch
    }

    /// Take every live critical and high packet, uncapped. Normal and relay
    /// lanes are left for the next regular pass.
    pub fn drain_urgent(&mut self) -> Vec<QueuedPacket> {
        let mut batch = Vec::new();
        for lane in [Lane::Critical, Lane::High] {
            batch.extend(self.lanes[lane.index()].drain(..).filter(|p| p.ttl > 0));
        }
        batch
    }

    /// Put packets back at the head of their lanes, preserving their order.
    pub fn requeue_front(&mut self, packets: Vec<QueuedPacket>) {
        for packet in packets.into_iter().rev() {
            self.lanes[packet.lane.index()].push_front(packet);
        }
    }

    /// Critical or high traffic is waiting.
    pub fn has_urgent(&self) -> bool {
        !self.lanes[Lane::Critical.index()].is_empty() || !self.lanes[Lane::High.index()].is_empty()
    }

    pub fn lane_len(&self, lane: Lane) -> usize {
        self.lanes[lane.index()].len()
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }

    pub fn capacity(&self) -> usize {
        self.max_size
    }

    pub fn snapshot(&self) -> PersistedLanes {
        let lane = |l: Lane| -> Vec<QueuedPacket> { self.lanes[l.index()].iter().cloned().collect() };
        PersistedLanes {
            critical: lane(Lane::Critical),
            high: lane(Lane::High),
            normal: lane(Lane::Normal),
            relay: lane(Lane::Relay),
        }
    }

    /// Replace contents with a persisted snapshot. Entries are re-laned by
    /// the lane they were saved under.
    pub fn restore(&mut self, persisted: PersistedLanes) {
        let PersistedLanes {
            critical,
            high,
            normal,
            relay,
        } = persisted;
        for (lane, entries) in [
            (Lane::Critical, critical),
            (Lane::High, high),
            (Lane::Normal, normal),
            (Lane::Relay, relay),
        ] {
            self.lanes[lane.index()] = entries
                .into_iter()
                .map(|mut p| {
                    p.lane = lane;
                    p
                })
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(lane: Lane, id: u32) -> QueuedPacket {
        QueuedPacket {
            packet_type: PacketType::Text,
            payload: vec![],
            ttl: 5,
            lane,
            message_id: id,
            source: None,
            queued_at: id as u64,
        }
    }

    fn ids(batch: &[QueuedPacket]) -> Vec<u32> {
        batch.iter().map(|p| p.message_id).collect()
    }

    #[test]
    fn test_lane_mapping() {
        assert_eq!(Lane::for_packet(PacketType::Sos), Lane::Critical);
        assert_eq!(Lane::for_packet(PacketType::Ack), Lane::High);
        assert_eq!(Lane::for_packet(PacketType::Text), Lane::Normal);
        assert_eq!(Lane::for_relay(PacketType::Text), Lane::Relay);
        assert_eq!(Lane::for_relay(PacketType::RescueSignal), Lane::Critical);
    }

    #[test]
    fn test_drain_respects_caps_and_order() {
        let mut lanes = PriorityLanes::new(100);
        for i in 0..3 {
            lanes.enqueue(packet(Lane::Relay, 300 + i)).unwrap();
            lanes.enqueue(packet(Lane::Normal, 200 + i)).unwrap();
        }
        for i in 0..7 {
            lanes.enqueue(packet(Lane::High, 100 + i)).unwrap();
        }
        for i in 0..10 {
            lanes.enqueue(packet(Lane::Critical, i)).unwrap();
        }

        let batch = lanes.drain(&DrainCaps::default());
        let expected: Vec<u32> = (0..10)
            .chain(100..105)
            .chain(200..202)
            .chain(300..302)
            .collect();
        assert_eq!(ids(&batch), expected);
        assert_eq!(lanes.len(), 2 + 1 + 1);
    }

    #[test]
    fn test_zero_ttl_never_drained() {
        let mut lanes = PriorityLanes::new(10);
        let mut dead = packet(Lane::Normal, 1);
        dead.ttl = 0;
        lanes.enqueue(dead).unwrap();
        lanes.enqueue(packet(Lane::Normal, 2)).unwrap();

        assert_eq!(ids(&lanes.drain(&DrainCaps::default())), vec![2]);
        assert!(lanes.is_empty());
    }

    #[test]
    fn test_eviction_prefers_lowest_lane_oldest_first() {
        let mut lanes = PriorityLanes::new(3);
        lanes.enqueue(packet(Lane::High, 1)).unwrap();
        lanes.enqueue(packet(Lane::Normal, 2)).unwrap();
        lanes.enqueue(packet(Lane::Normal, 3)).unwrap();

        let evicted = lanes.enqueue(packet(Lane::Critical, 4)).unwrap();
        assert_eq!(evicted.map(|p| p.message_id), Some(2));

        let evicted = lanes.enqueue(packet(Lane::Critical, 5)).unwrap();
        assert_eq!(evicted.map(|p| p.message_id), Some(3));

        let evicted = lanes.enqueue(packet(Lane::Critical, 6)).unwrap();
        assert_eq!(evicted.map(|p| p.message_id), Some(1));
    }

    #[test]
    fn test_critical_displaces_oldest_normal_when_full() {
        let mut lanes = PriorityLanes::new(3);
        for i in 1..=3 {
            lanes.enqueue(packet(Lane::Normal, i)).unwrap();
        }

        let evicted = lanes.enqueue(packet(Lane::Critical, 9)).unwrap();
        assert_eq!(evicted.map(|p| p.message_id), Some(1));
        assert_eq!(lanes.len(), 3);
        assert_eq!(lanes.lane_len(Lane::Critical), 1);

        let batch = lanes.drain(&DrainCaps::default());
        assert_eq!(ids(&batch), vec![9, 2, 3]);
    }

    #[test]
    fn test_mixed_full_queue_evicts_relay_before_normal() {
        let mut lanes = PriorityLanes::new(4);
        lanes.enqueue(packet(Lane::Normal, 1)).unwrap();
        lanes.enqueue(packet(Lane::Relay, 2)).unwrap();
        lanes.enqueue(packet(Lane::High, 3)).unwrap();
        lanes.enqueue(packet(Lane::Normal, 4)).unwrap();

        let evicted = lanes.enqueue(packet(Lane::Critical, 5)).unwrap();
        assert_eq!(evicted.map(|p| p.message_id), Some(2));
        let evicted = lanes.enqueue(packet(Lane::Critical, 6)).unwrap();
        assert_eq!(evicted.map(|p| p.message_id), Some(1));
        assert_eq!(lanes.lane_len(Lane::High), 1);
        assert_eq!(lanes.lane_len(Lane::Normal), 1);
    }

    #[test]
    fn test_drain_urgent_skips_lower_lanes() {
        let mut lanes = PriorityLanes::new(20);
        lanes.enqueue(packet(Lane::Normal, 1)).unwrap();
        lanes.enqueue(packet(Lane::Relay, 2)).unwrap();
        for i in 0..7 {
            lanes.enqueue(packet(Lane::High, 100 + i)).unwrap();
        }
        let mut dead = packet(Lane::Critical, 10);
        dead.ttl = 0;
        lanes.enqueue(dead).unwrap();
        lanes.enqueue(packet(Lane::Critical, 11)).unwrap();

        let batch = lanes.drain_urgent();
        let expected: Vec<u32> = std::iter::once(11).chain(100..107).collect();
        assert_eq!(ids(&batch), expected);
        assert!(!lanes.has_urgent());
        assert_eq!(lanes.lane_len(Lane::Normal), 1);
        assert_eq!(lanes.lane_len(Lane::Relay), 1);
    }

    #[test]
    fn test_all_critical_is_full() {
        let mut lanes = PriorityLanes::new(2);
        lanes.enqueue(packet(Lane::Critical, 1)).unwrap();
        lanes.enqueue(packet(Lane::Critical, 2)).unwrap();
        assert_eq!(
            lanes.enqueue(packet(Lane::Normal, 3)),
            Err(QueueError::Full { capacity: 2 })
        );
        assert_eq!(lanes.lane_len(Lane::Critical), 2);
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let mut lanes = PriorityLanes::new(10);
        for i in 0..4 {
            lanes.enqueue(packet(Lane::Normal, i)).unwrap();
        }
        let batch = lanes.drain(&DrainCaps::default());
        assert_eq!(ids(&batch), vec![0, 1]);

        lanes.requeue_front(batch);
        assert_eq!(ids(&lanes.drain(&DrainCaps::default())), vec![0, 1]);
        assert_eq!(ids(&lanes.drain(&DrainCaps::default())), vec![2, 3]);
    }

    #[test]
    fn test_snapshot_restore() {
        let mut lanes = PriorityLanes::new(10);
        lanes.enqueue(packet(Lane::Critical, 1)).unwrap();
        lanes.enqueue(packet(Lane::Relay, 2)).unwrap();

        let json = serde_json::to_string(&lanes.snapshot()).unwrap();
        let mut restored = PriorityLanes::new(10);
        restored.restore(serde_json::from_str(&json).unwrap());

        assert_eq!(restored.lane_len(Lane::Critical), 1);
        assert_eq!(restored.lane_len(Lane::Relay), 1);
        assert!(restored.has_urgent());
    }
}
