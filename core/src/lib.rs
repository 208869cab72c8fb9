// Lifeline Core — disaster messaging over radio mesh and cloud
//
// "Does this help a message reach someone when the network is gone?"
//
// Two channels, one stream: every outbound message is tried on the local
// radio mesh and, when reachable, the cloud. Inbound traffic from both is
// deduplicated into a single feed for the application.

pub mod config;
pub mod crypto;
pub mod delivery;
pub mod hybrid;
pub mod identity;
pub mod message;
pub mod node;
pub mod retry;
pub mod store;
pub mod sync;
pub mod transport;

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use config::{ConfigError, CoreConfig, DeliveryConfig, HybridConfig, MeshConfig};
pub use delivery::{DeliveryError, DeliveryManager, DeliveryRecord, DeliveryStatus};
pub use hybrid::{
    CloudChannel, CloudError, ConnectionMode, HybridMessage, HybridMessageService,
    MessagePriority, MessageStatus, Reachability, SendError, SendOptions,
};
pub use identity::{Identity, IdentityProvider, StaticIdentity};
pub use message::{CodecError, Envelope, GeoPoint, MessageKind, PacketType, ValidationError};
pub use node::{LifelineNode, NodeCapabilities};
pub use store::{KeyValueStore, MemoryStore, QueueError, SledStore, StoreError};
pub use transport::{MeshError, MeshEvent, MeshTransport, RadioError, RadioTransport};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LifelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Radio(#[from] RadioError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Send(#[from] SendError),
    #[error(transparent)]
    Seal(#[from] crypto::SealError),
}

// ============================================================================
// HOST SIGNALS
// ============================================================================

/// Foreground/background state reported by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppLifecycle {
    Foreground,
    Background,
}

/// Wall-clock milliseconds since the Unix epoch, used for every persisted
/// timestamp.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
