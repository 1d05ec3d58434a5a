//! Dedup cache over message identifiers.
//!
//! Bounded two ways: an LRU size cap and an age cap, whichever triggers
//! first. Entries are never touched after insertion, so LRU order equals
//! insertion order and expired entries can be popped from the cold end.

use crate::network_protocol::MessageId;
use lru::LruCache;
use sdn_time::{Duration, Instant};
use std::num::NonZeroUsize;

pub(crate) struct SeenCache {
    entries: LruCache<MessageId, Instant>,
    retention: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self { entries: LruCache::new(capacity), retention }
    }

    /// Records the id. Returns false if it was already present (within the
    /// retention window); a present id must never be re-delivered or
    /// re-forwarded.
    pub fn insert_if_new(&mut self, id: MessageId, now: Instant) -> bool {
        while let Some((_, first_seen)) = self.entries.peek_lru() {
            if now - *first_seen >= self.retention {
                self.entries.pop_lru();
            } else {
                break;
            }
        }
        if self.entries.contains(&id) {
            return false;
        }
        self.entries.put(id, now);
        true
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdn_time::FakeClock;

    #[test]
    fn suppresses_duplicates() {
        let clock = FakeClock::default().clock();
        let mut cache = SeenCache::new(16, Duration::minutes(10));
        let id = MessageId::random();
        assert!(cache.insert_if_new(id, clock.now()));
        assert!(!cache.insert_if_new(id, clock.now()));
    }

    #[test]
    fn size_cap_evicts_oldest() {
        let clock = FakeClock::default().clock();
        let mut cache = SeenCache::new(2, Duration::minutes(10));
        let ids = [MessageId::random(), MessageId::random(), MessageId::random()];
        for id in ids {
            assert!(cache.insert_if_new(id, clock.now()));
        }
        // The first id fell off the cold end and is accepted again.
        assert!(cache.insert_if_new(ids[0], clock.now()));
        assert!(!cache.insert_if_new(ids[2], clock.now()));
    }

    #[test]
    fn age_cap_expires_entries() {
        let fake = FakeClock::default();
        let clock = fake.clock();
        let mut cache = SeenCache::new(1024, Duration::seconds(30));
        let id = MessageId::random();
        assert!(cache.insert_if_new(id, clock.now()));
        fake.advance(Duration::seconds(29));
        assert!(!cache.insert_if_new(id, clock.now()));
        fake.advance(Duration::seconds(1));
        assert!(cache.insert_if_new(id, clock.now()));
        assert_eq!(cache.len(), 1);
    }
}
