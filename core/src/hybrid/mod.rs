// Hybrid module — dual-channel (mesh + cloud) messaging for the application

pub mod cloud;
pub mod connectivity;
pub mod mailbox;
pub mod message;
pub mod queue;
pub mod service;
pub mod typing;

pub use cloud::{CloudChannel, CloudError, CloudRecord, CloudSubscription, MemoryCloud};
pub use connectivity::{Reachability, StaticReachability};
pub use mailbox::{Mailbox, PersistedMailbox, StoredMessage};
pub use message::{
    ConnectionMode, HybridMessage, MediaKind, MediaOptions, MessagePriority, MessageSource,
    MessageStatus, MessageUpdate, SendOptions,
};
pub use queue::{PersistedQueue, RetryQueue};
pub use service::{HybridMessageService, SendError, SendOutcome};
pub use typing::{TypingEvent, TypingIndicators, TypingSignal};
