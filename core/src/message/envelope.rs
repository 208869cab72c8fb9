// Application envelope carried inside mesh packets and cloud records

use serde::{Deserialize, Serialize};

/// Recipient marker for messages meant for every device in range.
pub const BROADCAST: &str = "broadcast";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Chat,
    Sos,
    Status,
    Location,
    Typing,
    Reaction,
    Image,
    Voice,
    /// Delivery confirmation written back through the cloud; content is the
    /// confirmed message id
    Receipt,
}

impl MessageKind {
    pub fn is_media(self) -> bool {
        matches!(self, MessageKind::Image | MessageKind::Voice)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy: Option<f64>,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            accuracy: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub from: String,
    /// Recipient id, or [`BROADCAST`]
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_thumbnail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
}

impl Envelope {
    pub fn new(
        id: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageKind,
        content: impl Into<String>,
        timestamp: u64,
    ) -> Self {
        Self {
            id: id.into(),
            from: from.into(),
            to: to.into(),
            kind,
            content: content.into(),
            timestamp,
            sender_name: None,
            media_type: None,
            media_url: None,
            media_duration: None,
            media_thumbnail: None,
            location: None,
        }
    }

    pub fn is_broadcast(&self) -> bool {
        self.to.is_empty() || self.to == BROADCAST
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Result of interpreting an inbound packet payload.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedPayload {
    Envelope(Envelope),
    /// Payload was not an envelope; treated as plain broadcast text.
    RawText(String),
}

pub fn parse_payload(bytes: &[u8]) -> ParsedPayload {
    match serde_json::from_slice::<Envelope>(bytes) {
        Ok(envelope) => ParsedPayload::Envelope(envelope),
        Err(_) => ParsedPayload::RawText(String::from_utf8_lossy(bytes).into_owned()),
    }
}
