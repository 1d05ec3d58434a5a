//! Per-peer inbound message rate limiting.
//!
//! Two token tiers refill continuously: a per-second tier whose capacity is
//! the configured burst, and a per-minute tier. One message costs one token
//! from each tier regardless of size. Buckets live in a map keyed by peer
//! identity; entries idle long enough are evicted.

use parking_lot::Mutex;
use sdn_primitives::network::PeerId;
use sdn_time::{Clock, Duration, Instant};
use std::collections::HashMap;

/// Buckets untouched for this long are dropped on the next sweep.
const IDLE_EVICTION: Duration = Duration::minutes(10);

/// Limited-trust peers get this fraction of the configured burst capacity,
/// with a floor of one message.
const LIMITED_TIER_DIVISOR: u32 = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimiterConfig {
    pub max_messages_per_second: u32,
    pub max_messages_per_minute: u32,
    pub burst: u32,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("rate limited")]
pub struct RateLimited;

struct Bucket {
    sec_tokens: f64,
    min_tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

pub struct RateLimiter {
    clock: Clock,
    config: RateLimiterConfig,
    buckets: Mutex<HashMap<PeerId, Bucket>>,
}

impl RateLimiter {
    pub fn new(clock: Clock, config: RateLimiterConfig) -> Self {
        Self { clock, config, buckets: Mutex::new(HashMap::new()) }
    }

    /// Takes one token for a message from `peer`. `strictest` applies the
    /// clamped tier used for Limited-trust peers.
    pub fn acquire(&self, peer: &PeerId, strictest: bool) -> Result<(), RateLimited> {
        let now = self.clock.now();
        let config = &self.config;
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(peer.clone()).or_insert_with(|| Bucket {
            sec_tokens: config.burst as f64,
            min_tokens: config.max_messages_per_minute as f64,
            last_refill: now,
            last_seen: now,
        });

        // The strictest tier shrinks both the refill rate and the capacity;
        // accumulated credit from a friendlier tier is clamped away.
        let (sec_rate, sec_cap) = if strictest {
            (
                (config.max_messages_per_second / LIMITED_TIER_DIVISOR).max(1),
                (config.burst / LIMITED_TIER_DIVISOR).max(1),
            )
        } else {
            (config.max_messages_per_second, config.burst)
        };

        let elapsed = (now - bucket.last_refill).as_seconds_f64().max(0.0);
        bucket.sec_tokens =
            (bucket.sec_tokens + elapsed * sec_rate as f64).min(sec_cap as f64);
        bucket.min_tokens = (bucket.min_tokens
            + elapsed * config.max_messages_per_minute as f64 / 60.0)
            .min(config.max_messages_per_minute as f64);
        bucket.last_refill = now;
        bucket.last_seen = now;

        if bucket.sec_tokens < 1.0 || bucket.min_tokens < 1.0 {
            return Err(RateLimited);
        }
        bucket.sec_tokens -= 1.0;
        bucket.min_tokens -= 1.0;
        Ok(())
    }

    /// Drops buckets idle past the eviction window.
    pub fn evict_idle(&self) {
        let now = self.clock.now();
        self.buckets.lock().retain(|_, bucket| now - bucket.last_seen < IDLE_EVICTION);
    }

    pub fn tracked_peers(&self) -> usize {
        self.buckets.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::peer_id_from_seed;
    use sdn_time::FakeClock;

    fn limiter(clock: Clock, per_second: u32, per_minute: u32, burst: u32) -> RateLimiter {
        RateLimiter::new(
            clock,
            RateLimiterConfig {
                max_messages_per_second: per_second,
                max_messages_per_minute: per_minute,
                burst,
            },
        )
    }

    #[test]
    fn burst_then_refusal() {
        let fake = FakeClock::default();
        let limiter = limiter(fake.clock(), 2, 1000, 2);
        let peer = peer_id_from_seed("chatty");
        assert!(limiter.acquire(&peer, false).is_ok());
        assert!(limiter.acquire(&peer, false).is_ok());
        for _ in 0..3 {
            assert_eq!(limiter.acquire(&peer, false), Err(RateLimited));
        }
        // Refill restores the per-second tier.
        fake.advance(Duration::seconds(1));
        assert!(limiter.acquire(&peer, false).is_ok());
        assert!(limiter.acquire(&peer, false).is_ok());
        assert_eq!(limiter.acquire(&peer, false), Err(RateLimited));
    }

    #[test]
    fn minute_tier_caps_sustained_rate() {
        let fake = FakeClock::default();
        let limiter = limiter(fake.clock(), 100, 5, 100);
        let peer = peer_id_from_seed("sustained");
        for _ in 0..5 {
            assert!(limiter.acquire(&peer, false).is_ok());
        }
        assert_eq!(limiter.acquire(&peer, false), Err(RateLimited));
        // A second only trickles back 5/60 of a token on the minute tier.
        fake.advance(Duration::seconds(1));
        assert_eq!(limiter.acquire(&peer, false), Err(RateLimited));
        fake.advance(Duration::seconds(12));
        assert!(limiter.acquire(&peer, false).is_ok());
    }

    #[test]
    fn buckets_are_per_peer() {
        let fake = FakeClock::default();
        let limiter = limiter(fake.clock(), 1, 1000, 1);
        assert!(limiter.acquire(&peer_id_from_seed("a"), false).is_ok());
        assert!(limiter.acquire(&peer_id_from_seed("b"), false).is_ok());
        assert_eq!(limiter.acquire(&peer_id_from_seed("a"), false), Err(RateLimited));
    }

    #[test]
    fn strictest_tier_clamps_burst() {
        let fake = FakeClock::default();
        let limiter = limiter(fake.clock(), 50, 10_000, 100);
        let peer = peer_id_from_seed("limited");
        // Capacity is clamped to 100/10 = 10 messages.
        for _ in 0..10 {
            assert!(limiter.acquire(&peer, true).is_ok());
        }
        assert_eq!(limiter.acquire(&peer, true), Err(RateLimited));
        // Refill is clamped to 50/10 = 5 per second.
        fake.advance(Duration::seconds(1));
        for _ in 0..5 {
            assert!(limiter.acquire(&peer, true).is_ok());
        }
        assert_eq!(limiter.acquire(&peer, true), Err(RateLimited));
    }

    #[test]
    fn idle_buckets_are_evicted() {
        let fake = FakeClock::default();
        let limiter = limiter(fake.clock(), 1, 60, 1);
        limiter.acquire(&peer_id_from_seed("a"), false).unwrap();
        limiter.acquire(&peer_id_from_seed("b"), false).unwrap();
        assert_eq!(limiter.tracked_peers(), 2);
        fake.advance(Duration::minutes(11));
        limiter.evict_idle();
        assert_eq!(limiter.tracked_peers(), 0);
    }
}
