// Delivery module — ACK tracking, timeout-driven retry and final outcome

pub mod manager;
pub mod record;

pub use manager::{
    CallbackHandle, DeliveryCallback, DeliveryError, DeliveryManager, RetryHandler,
    EXHAUSTED_REASON,
};
pub use record::{DeliveryMetrics, DeliveryRecord, DeliveryStatus, DeliveryUpdate};
