// Bounded recency set used for deduplication windows

use lru::LruCache;
use std::hash::Hash;
use std::num::NonZeroUsize;

/// Fixed-capacity set that forgets its least recently seen entries first.
///
/// Once full, inserting a new entry silently evicts the oldest one, so an
/// identifier older than the window can be accepted again.
pub struct LruSet<T: Hash + Eq> {
    inner: LruCache<T, ()>,
}

impl<T: Hash + Eq> LruSet<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: LruCache::new(capacity),
        }
    }

    /// Record `item`. Returns `true` if it was not already present.
    ///
    /// A repeat sighting refreshes the entry's recency.
    pub fn check_and_add(&mut self, item: T) -> bool {
        if self.inner.get(&item).is_some() {
            return false;
        }
        self.inner.put(item, ());
        true
    }

    /// Membership test that does not touch recency.
    pub fn contains(&self, item: &T) -> bool {
        self.inner.contains(item)
    }

    pub fn remove(&mut self, item: &T) -> bool {
        self.inner.pop(item).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.cap().get()
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}

impl<T: Hash + Eq + Clone> LruSet<T> {
    /// Entries ordered oldest to newest, suitable for persistence.
    pub fn to_vec(&self) -> Vec<T> {
        self.inner.iter().rev().map(|(k, _)| k.clone()).collect()
    }

    /// Rebuild from an oldest-to-newest list. Only the newest `capacity`
    /// entries survive.
    pub fn from_vec(capacity: usize, items: Vec<T>) -> Self {
        let mut set = Self::new(capacity);
        for item in items {
            set.inner.put(item, ());
        }
        set
    }
}
