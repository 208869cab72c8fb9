// Keyed one-shot timers with explicit cancellation

use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A set of one-shot timers addressed by key.
///
/// Scheduling a key that already has a timer replaces (and aborts) the old
/// one. Once a timer fires its task is detached from the key, so a callback
/// may safely reschedule its own key.
pub struct KeyedTimers<K> {
    handles: Mutex<HashMap<K, JoinHandle<()>>>,
}

impl<K: Hash + Eq + Clone + Send + 'static> KeyedTimers<K> {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn schedule<F>(&self, key: K, delay: Duration, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tokio::spawn(task);
        });
        let mut handles = self.handles.lock();
        handles.retain(|_, h| !h.is_finished());
        if let Some(previous) = handles.insert(key, handle) {
            previous.abort();
        }
    }

    /// Returns whether an armed timer was cancelled.
    pub fn cancel(&self, key: &K) -> bool {
        match self.handles.lock().remove(key) {
            Some(handle) => {
                let armed = !handle.is_finished();
                handle.abort();
                armed
            }
            None => false,
        }
    }

    pub fn is_active(&self, key: &K) -> bool {
        self.handles
            .lock()
            .get(key)
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }

    pub fn cancel_all(&self) {
        for (_, handle) in self.handles.lock().drain() {
            handle.abort();
        }
    }

    /// Number of timers still armed.
    pub fn active_count(&self) -> usize {
        self.handles
            .lock()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }
}

impl<K: Hash + Eq + Clone + Send + 'static> Default for KeyedTimers<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Drop for KeyedTimers<K> {
    fn drop(&mut self) {
        for (_, handle) in self.handles.get_mut().drain() {
            handle.abort();
        }
    }
}
