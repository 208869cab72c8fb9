// Mesh packet codec — compact binary header carried inside a radio advertisement
//
// Layout (big endian, 13-byte header):
//
//   [magic:1][version:1][type:1][ttl:1][priority:1][source:4][message_id:4][payload..]
//
// Decoding never fails loudly: anything that is not a well-formed packet of a
// known type comes back as `None` and is dropped by the caller.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const MAGIC: u8 = 0xAF;
pub const VERSION: u8 = 0x02;
pub const HEADER_SIZE: usize = 13;

/// Largest packet the codec will produce or accept.
pub const MAX_PACKET_SIZE: usize = 512;

/// Raw payload budget of a legacy (non-extended) advertisement. Callers that
/// target legacy radios must chunk payloads to fit under this.
pub const LEGACY_ADVERTISEMENT_LIMIT: usize = 31;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Packet too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum PacketType {
    Sos = 0x01,
    Status = 0x02,
    Text = 0x03,
    Ping = 0x04,
    Ack = 0x05,
    Location = 0x06,
    EmergencyBeacon = 0x30,
    FamilySearch = 0x31,
    RescueSignal = 0x32,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(PacketType::Sos),
            0x02 => Some(PacketType::Status),
            0x03 => Some(PacketType::Text),
            0x04 => Some(PacketType::Ping),
            0x05 => Some(PacketType::Ack),
            0x06 => Some(PacketType::Location),
            0x30 => Some(PacketType::EmergencyBeacon),
            0x31 => Some(PacketType::FamilySearch),
            0x32 => Some(PacketType::RescueSignal),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Life-safety traffic that always rides the critical lane.
    pub fn is_emergency(self) -> bool {
        matches!(
            self,
            PacketType::Sos | PacketType::EmergencyBeacon | PacketType::RescueSignal
        )
    }

    /// Packet types whose payload is a JSON envelope (or raw text fallback).
    /// The rest carry compact binary payloads.
    pub fn carries_envelope(self) -> bool {
        matches!(
            self,
            PacketType::Sos
                | PacketType::Status
                | PacketType::Text
                | PacketType::FamilySearch
                | PacketType::RescueSignal
        )
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Sos => "SOS",
            PacketType::Status => "STATUS",
            PacketType::Text => "TEXT",
            PacketType::Ping => "PING",
            PacketType::Ack => "ACK",
            PacketType::Location => "LOCATION",
            PacketType::EmergencyBeacon => "EMERGENCY_BEACON",
            PacketType::FamilySearch => "FAMILY_SEARCH",
            PacketType::RescueSignal => "RESCUE_SIGNAL",
        };
        f.write_str(name)
    }
}

/// Opaque 32-bit routing token naming the originator of a packet.
///
/// It carries no meaning beyond equality; it only keeps the dedup key
/// `source:message_id` stable as a packet crosses hops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceToken(pub u32);

impl SourceToken {
    pub fn from_identity(identity_id: &str) -> Self {
        SourceToken(stable_hash(identity_id))
    }
}

impl fmt::Display for SourceToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Stable 32-bit string hash (djb2, xor variant) over UTF-16 code units.
fn stable_hash(input: &str) -> u32 {
    input
        .encode_utf16()
        .fold(5381u32, |hash, unit| hash.wrapping_mul(33) ^ u32::from(unit))
}

/// Numeric wire id for an application-level string id.
///
/// Deterministic, so a device can map an inbound ACK back to the string id
/// it is tracking.
pub fn message_id_for(id: &str) -> u32 {
    stable_hash(id)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeshPacket {
    pub packet_type: PacketType,
    pub source: SourceToken,
    pub ttl: u8,
    pub priority_score: u8,
    pub message_id: u32,
    pub payload: Vec<u8>,
}

impl MeshPacket {
    /// Transport-level deduplication key.
    pub fn dedup_key(&self) -> String {
        dedup_key(self.source, self.message_id)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        serialize(
            self.packet_type,
            self.source,
            &self.payload,
            self.ttl,
            self.priority_score,
            self.message_id,
        )
    }
}

pub fn dedup_key(source: SourceToken, message_id: u32) -> String {
    format!("{}:{}", source, message_id)
}

pub fn serialize(
    packet_type: PacketType,
    source: SourceToken,
    payload: &[u8],
    ttl: u8,
    priority_score: u8,
    message_id: u32,
) -> Result<Vec<u8>, CodecError> {
    let size = HEADER_SIZE + payload.len();
    if size > MAX_PACKET_SIZE {
        return Err(CodecError::TooLarge {
            size,
            max: MAX_PACKET_SIZE,
        });
    }

    let mut out = Vec::with_capacity(size);
    out.push(MAGIC);
    out.push(VERSION);
    out.push(packet_type.as_u8());
    out.push(ttl);
    out.push(priority_score);
    out.extend_from_slice(&source.0.to_be_bytes());
    out.extend_from_slice(&message_id.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

pub fn deserialize(bytes: &[u8]) -> Option<MeshPacket> {
    if bytes.len() < HEADER_SIZE || bytes.len() > MAX_PACKET_SIZE {
        return None;
    }
    if bytes[0] != MAGIC || bytes[1] != VERSION {
        return None;
    }
    let packet_type = PacketType::from_u8(bytes[2])?;
    let source = u32::from_be_bytes(bytes[5..9].try_into().ok()?);
    let message_id = u32::from_be_bytes(bytes[9..13].try_into().ok()?);

    Some(MeshPacket {
        packet_type,
        source: SourceToken(source),
        ttl: bytes[3],
        priority_score: bytes[4],
        message_id,
        payload: bytes[HEADER_SIZE..].to_vec(),
    })
}

// ============================================================================
// COMPACT PAYLOADS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AckKind {
    Received = 1,
    Delivered = 2,
    Read = 3,
}

impl AckKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(AckKind::Received),
            2 => Some(AckKind::Delivered),
            3 => Some(AckKind::Read),
            _ => None,
        }
    }
}

/// `[original message id:4][ack kind:1][receiver token:4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckPayload {
    pub message_id: u32,
    pub kind: AckKind,
    pub receiver: SourceToken,
}

impl AckPayload {
    pub const SIZE: usize = 9;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.message_id.to_be_bytes());
        out.push(self.kind as u8);
        out.extend_from_slice(&self.receiver.0.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            message_id: u32::from_be_bytes(bytes[0..4].try_into().ok()?),
            kind: AckKind::from_u8(bytes[4])?,
            receiver: SourceToken(u32::from_be_bytes(bytes[5..9].try_into().ok()?)),
        })
    }
}

/// `[lat:f32][lon:f32][status:1]`, small enough for a legacy advertisement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SosPayload {
    pub lat: f32,
    pub lon: f32,
    pub status: u8,
}

impl SosPayload {
    pub const SIZE: usize = 9;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.lat.to_be_bytes());
        out.extend_from_slice(&self.lon.to_be_bytes());
        out.push(self.status);
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            lat: f32::from_be_bytes(bytes[0..4].try_into().ok()?),
            lon: f32::from_be_bytes(bytes[4..8].try_into().ok()?),
            status: bytes[8],
        })
    }
}

/// `[lat:f32][lon:f32][accuracy_m:u16][speed:u8][heading:u16]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationPayload {
    pub lat: f32,
    pub lon: f32,
    pub accuracy_m: u16,
    pub speed: u8,
    pub heading: u16,
}

impl LocationPayload {
    pub const SIZE: usize = 13;

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::SIZE);
        out.extend_from_slice(&self.lat.to_be_bytes());
        out.extend_from_slice(&self.lon.to_be_bytes());
        out.extend_from_slice(&self.accuracy_m.to_be_bytes());
        out.push(self.speed);
        out.extend_from_slice(&self.heading.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Some(Self {
            lat: f32::from_be_bytes(bytes[0..4].try_into().ok()?),
            lon: f32::from_be_bytes(bytes[4..8].try_into().ok()?),
            accuracy_m: u16::from_be_bytes(bytes[8..10].try_into().ok()?),
            speed: bytes[10],
            heading: u16::from_be_bytes(bytes[11..13].try_into().ok()?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MeshPacket {
        MeshPacket {
            packet_type: PacketType::Text,
            source: SourceToken(0xDEADBEEF),
            ttl: 5,
            priority_score: 1,
            message_id: message_id_for("msg-1"),
            payload: b"hi".to_vec(),
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = sample().encode().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + 2);
        assert_eq!(&bytes[..5], &[MAGIC, VERSION, 0x03, 5, 1]);
        assert_eq!(&bytes[5..9], &[0xDE, 0xAD, 0xBE, 0xEF]);
        assert_eq!(deserialize(&bytes), Some(sample()));
    }

    #[test]
    fn test_reject_bad_magic_and_version() {
        let mut bytes = sample().encode().unwrap();
        bytes[0] = 0x00;
        assert!(deserialize(&bytes).is_none());

        let mut bytes = sample().encode().unwrap();
        bytes[1] = 0x01;
        assert!(deserialize(&bytes).is_none());
    }

    #[test]
    fn test_reject_unknown_type() {
        let mut bytes = sample().encode().unwrap();
        bytes[2] = 0x7F;
        assert!(deserialize(&bytes).is_none());
    }

    #[test]
    fn test_reject_truncated() {
        let bytes = sample().encode().unwrap();
        assert!(deserialize(&bytes[..HEADER_SIZE - 1]).is_none());
        assert!(deserialize(&[]).is_none());
    }

    #[test]
    fn test_reject_oversized_payload() {
        let payload = vec![0u8; MAX_PACKET_SIZE];
        let result = serialize(
            PacketType::Text,
            SourceToken(1),
            &payload,
            5,
            1,
            1,
        );
        assert!(matches!(result, Err(CodecError::TooLarge { .. })));
    }

    #[test]
    fn test_message_id_is_stable() {
        assert_eq!(message_id_for("abc"), message_id_for("abc"));
        assert_ne!(message_id_for("abc"), message_id_for("abd"));
        // djb2-xor of the empty string is the seed
        assert_eq!(message_id_for(""), 5381);
    }

    #[test]
    fn test_dedup_key_format() {
        let packet = sample();
        assert_eq!(
            packet.dedup_key(),
            format!("deadbeef:{}", packet.message_id)
        );
    }

    #[test]
    fn test_ack_payload() {
        let ack = AckPayload {
            message_id: 42,
            kind: AckKind::Read,
            receiver: SourceToken(7),
        };
        assert_eq!(AckPayload::decode(&ack.encode()), Some(ack));
        assert!(AckPayload::decode(&[0, 0, 0, 42, 9, 0, 0, 0, 7]).is_none());
    }

    #[test]
    fn test_sos_payload_fits_legacy_advertisement() {
        let sos = SosPayload {
            lat: 41.0082,
            lon: 28.9784,
            status: 2,
        };
        assert!(HEADER_SIZE + sos.encode().len() <= LEGACY_ADVERTISEMENT_LIMIT);
        assert_eq!(SosPayload::decode(&sos.encode()), Some(sos));
    }

    #[test]
    fn test_location_payload() {
        let loc = LocationPayload {
            lat: -33.86,
            lon: 151.2,
            accuracy_m: 12,
            speed: 3,
            heading: 270,
        };
        assert_eq!(LocationPayload::decode(&loc.encode()), Some(loc));
        assert!(LocationPayload::decode(&loc.encode()[..12]).is_none());
    }
}
