// Network reachability capability

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

/// Answers "can we reach the internet right now?". Implementations should
/// answer quickly; the hybrid service polls this on a fixed interval and
/// before every cloud write.
#[async_trait]
pub trait Reachability: Send + Sync {
    async fn is_internet_reachable(&self) -> bool;
}

/// Reachability flipped by hand (tests, simulator, hosts that already track
/// connectivity elsewhere).
#[derive(Debug, Default)]
pub struct StaticReachability {
    online: AtomicBool,
}

impl StaticReachability {
    pub fn new(online: bool) -> Self {
        Self {
            online: AtomicBool::new(online),
        }
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl Reachability for StaticReachability {
    async fn is_internet_reachable(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}
