//! Small concurrency building blocks shared by every service.
//!
//! Queues that are touched across suspension points are guarded by the async
//! [`AsyncMutex`]; short critical sections use `parking_lot` locks directly.

pub mod debounce;
pub mod lru;
pub mod throttle;
pub mod timers;

pub use self::lru::LruSet;
pub use debounce::Debouncer;
pub use throttle::Throttle;
pub use timers::KeyedTimers;
pub use tokio::sync::Mutex as AsyncMutex;
