// Hybrid message model — what the application sees regardless of channel

use crate::message::{Envelope, GeoPoint, MessageKind, BROADCAST};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Critical,
    High,
    Normal,
    Low,
}

impl MessagePriority {
    /// Processing order, lower first
    pub fn rank(self) -> u8 {
        match self {
            MessagePriority::Critical => 0,
            MessagePriority::High => 1,
            MessagePriority::Normal => 2,
            MessagePriority::Low => 3,
        }
    }
}

impl Default for MessagePriority {
    fn default() -> Self {
        MessagePriority::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageSource {
    Cloud,
    Mesh,
    Hybrid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HybridMessage {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub content: String,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_id: Option<String>,
    pub timestamp: u64,
    pub source: MessageSource,
    pub status: MessageStatus,
    pub priority: MessagePriority,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_preview: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_retry_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_duration: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_thumbnail: Option<String>,
}

impl HybridMessage {
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// SOS that has been escalated; never given up on.
    pub fn is_critical_sos(&self) -> bool {
        self.kind == MessageKind::Sos && self.priority == MessagePriority::Critical
    }

    /// Application envelope carried over the mesh.
    pub fn to_envelope(&self) -> Envelope {
        Envelope {
            id: self.id.clone(),
            from: self.sender_id.clone(),
            to: self
                .recipient_id
                .clone()
                .unwrap_or_else(|| BROADCAST.to_string()),
            kind: self.kind,
            content: self.content.clone(),
            timestamp: self.timestamp,
            sender_name: Some(self.sender_name.clone()),
            media_type: self.media_type.clone(),
            media_url: self.media_url.clone(),
            media_duration: self.media_duration,
            media_thumbnail: self.media_thumbnail.clone(),
            location: self.location,
        }
    }

    /// Inbound message built from a received envelope.
    pub fn from_envelope(envelope: Envelope, source: MessageSource) -> Self {
        let recipient_id = (!envelope.is_broadcast()).then(|| envelope.to.clone());
        let priority = if envelope.kind == MessageKind::Sos {
            MessagePriority::Critical
        } else {
            MessagePriority::Normal
        };
        Self {
            id: envelope.id,
            local_id: None,
            content: envelope.content,
            sender_name: envelope
                .sender_name
                .unwrap_or_else(|| "Mesh User".to_string()),
            sender_id: envelope.from,
            recipient_id,
            timestamp: envelope.timestamp,
            source,
            status: MessageStatus::Delivered,
            priority,
            kind: envelope.kind,
            reply_to: None,
            reply_preview: None,
            location: envelope.location,
            retry_count: 0,
            last_retry_at: None,
            next_retry_at: None,
            media_url: envelope.media_url,
            media_type: envelope.media_type,
            media_duration: envelope.media_duration,
            media_thumbnail: envelope.media_thumbnail,
        }
    }
}

/// Optional fields for [`super::HybridMessageService::send_message`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub priority: Option<MessagePriority>,
    pub kind: Option<MessageKind>,
    pub reply_to: Option<String>,
    pub reply_preview: Option<String>,
    pub location: Option<GeoPoint>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Voice,
    Location,
}

impl MediaKind {
    pub fn message_kind(self) -> MessageKind {
        match self {
            MediaKind::Image => MessageKind::Image,
            MediaKind::Voice => MessageKind::Voice,
            MediaKind::Location => MessageKind::Location,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Voice => "voice",
            MediaKind::Location => "location",
        }
    }

    fn default_caption(self) -> &'static str {
        match self {
            MediaKind::Image => "📷 Photo",
            MediaKind::Voice => "🎤 Voice message",
            MediaKind::Location => "📍 Location",
        }
    }
}

/// Media already uploaded by the host; the core only carries references.
#[derive(Debug, Clone, Default)]
pub struct MediaOptions {
    pub media_url: Option<String>,
    pub media_duration: Option<u32>,
    pub media_thumbnail: Option<String>,
    pub location: Option<GeoPoint>,
    pub caption: Option<String>,
}

impl MediaOptions {
    pub fn content(&self, kind: MediaKind) -> String {
        self.caption
            .clone()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| kind.default_caption().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// Internet reachable
    Online,
    /// No internet, local peers present
    Mesh,
    Offline,
}

impl ConnectionMode {
    pub fn classify(internet_reachable: bool, mesh_peers: usize) -> Self {
        if internet_reachable {
            ConnectionMode::Online
        } else if mesh_peers > 0 {
            ConnectionMode::Mesh
        } else {
            ConnectionMode::Offline
        }
    }
}

impl std::fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionMode::Online => write!(f, "online"),
            ConnectionMode::Mesh => write!(f, "mesh"),
            ConnectionMode::Offline => write!(f, "offline"),
        }
    }
}

/// Status change of an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageUpdate {
    pub message_id: String,
    pub status: MessageStatus,
}
