// Store module — persistence, outbound priority lanes and peer topology

pub mod backend;
pub mod lanes;
pub mod peers;

pub use backend::{load_json, save_json, KeyValueStore, MemoryStore, SledStore, StoreError};
pub use lanes::{DrainCaps, Lane, PersistedLanes, PriorityLanes, QueueError, QueuedPacket};
pub use peers::{PeerRecord, PeerStatus, PeerTable};

/// Well-known keys in the host key-value store.
pub mod keys {
    pub const MESH_QUEUE: &str = "lifeline:mesh_queue";
    pub const MESH_SEEN_IDS: &str = "lifeline:mesh_seen_ids";
    pub const MESSAGE_QUEUE: &str = "lifeline:message_queue";
    pub const SEEN_MESSAGE_IDS: &str = "lifeline:seen_message_ids";
    pub const DELIVERY_TRACKING: &str = "lifeline:delivery_tracking";
    pub const MESH_MAILBOX: &str = "lifeline:mesh_mailbox";
}
