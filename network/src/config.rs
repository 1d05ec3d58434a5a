//! Node configuration for the routing core.
//!
//! Construct a [`Config`] (by hand or via serde) and call
//! [`Config::verify`]; everything downstream consumes the [`VerifiedConfig`]
//! and can rely on the invariants checked there.

use crate::edge_relay::EdgeRelayConfig;
use crate::network_protocol::{FrameLimits, MAX_SCHEMA_NAME};
use crate::rate_limiter::RateLimiterConfig;
use crate::streaming::StreamingConfig;
use anyhow::Context as _;
use sdn_time::Duration;

/// Hops a locally published message may travel unless the publisher asks for
/// something else.
pub const DEFAULT_MESSAGE_TTL: u8 = 16;

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct Config {
    /// First segment of every topic name.
    pub topic_prefix: String,
    /// Refuse peers that are not in the trust registry. The persisted
    /// registry setting, if any, wins over this default.
    pub strict_mode: bool,
    /// Forward framed messages for other destinations.
    pub relay_mode: bool,
    pub max_message_size: usize,
    pub max_schema_name: usize,
    pub max_destinations: usize,
    pub max_messages_per_second: u32,
    pub max_messages_per_minute: u32,
    pub rate_limit_burst: u32,
    pub seen_cache_size: usize,
    pub seen_cache_ttl: Duration,
    pub default_ttl: u8,
    /// Period of the topic reconciliation ticker.
    pub sync_interval: Duration,
    /// Period of the statistics flush and housekeeping ticker.
    pub stats_flush_interval: Duration,
    pub streaming: StreamingConfig,
    pub edge_filter: EdgeRelayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            topic_prefix: "sdn".to_string(),
            strict_mode: false,
            relay_mode: false,
            max_message_size: 2 << 20,
            max_schema_name: MAX_SCHEMA_NAME,
            max_destinations: 64,
            max_messages_per_second: 50,
            max_messages_per_minute: 1000,
            rate_limit_burst: 100,
            seen_cache_size: 65536,
            seen_cache_ttl: Duration::minutes(10),
            default_ttl: DEFAULT_MESSAGE_TTL,
            sync_interval: Duration::seconds(30),
            stats_flush_interval: Duration::minutes(1),
            streaming: StreamingConfig::default(),
            edge_filter: EdgeRelayConfig::default(),
        }
    }
}

impl Config {
    pub fn verify(self) -> anyhow::Result<VerifiedConfig> {
        anyhow::ensure!(!self.topic_prefix.is_empty(), "topic_prefix must not be empty");
        anyhow::ensure!(
            !self.topic_prefix.contains('/'),
            "topic_prefix must not contain '/'"
        );
        anyhow::ensure!(self.max_message_size > 0, "max_message_size must be positive");
        anyhow::ensure!(
            (1..=MAX_SCHEMA_NAME).contains(&self.max_schema_name),
            "max_schema_name must be in 1..={MAX_SCHEMA_NAME}"
        );
        anyhow::ensure!(self.max_destinations > 0, "max_destinations must be positive");
        anyhow::ensure!(
            self.max_messages_per_second > 0 && self.max_messages_per_minute > 0,
            "rate limits must be positive"
        );
        anyhow::ensure!(
            self.rate_limit_burst >= self.max_messages_per_second,
            "rate_limit_burst must be at least max_messages_per_second"
        );
        anyhow::ensure!(self.seen_cache_size > 0, "seen_cache_size must be positive");
        anyhow::ensure!(
            self.seen_cache_ttl > Duration::ZERO,
            "seen_cache_ttl must be positive"
        );
        anyhow::ensure!(self.default_ttl > 0, "default_ttl must be positive");
        anyhow::ensure!(
            self.streaming.outbound_queue_size > 0,
            "streaming.outbound_queue_size must be positive"
        );
        anyhow::ensure!(
            self.streaming.max_sessions_per_peer > 0,
            "streaming.max_sessions_per_peer must be positive"
        );
        anyhow::ensure!(
            self.streaming.batch_size > 0 && self.streaming.batch_interval > Duration::ZERO,
            "streaming batch parameters must be positive"
        );
        Ok(VerifiedConfig(self))
    }

    /// Deserializes and verifies in one step, the way deployments load it.
    pub fn from_json(json: &str) -> anyhow::Result<VerifiedConfig> {
        let config: Config = serde_json::from_str(json).context("parsing configuration")?;
        config.verify()
    }

    pub(crate) fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_schema_name: self.max_schema_name,
            max_destinations: self.max_destinations,
            ..FrameLimits::default()
        }
    }

    pub(crate) fn rate_limiter(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            max_messages_per_second: self.max_messages_per_second,
            max_messages_per_minute: self.max_messages_per_minute,
            burst: self.rate_limit_burst,
        }
    }
}

/// Proof that [`Config::verify`] ran.
#[derive(Clone, Debug)]
pub struct VerifiedConfig(Config);

impl std::ops::Deref for VerifiedConfig {
    type Target = Config;
    fn deref(&self) -> &Config {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_verify() {
        Config::default().verify().unwrap();
    }

    #[test]
    fn rejects_bad_knobs() {
        for mutate in [
            |c: &mut Config| c.topic_prefix = String::new(),
            |c: &mut Config| c.topic_prefix = "a/b".to_string(),
            |c: &mut Config| c.max_messages_per_second = 0,
            |c: &mut Config| c.rate_limit_burst = 1,
            |c: &mut Config| c.seen_cache_size = 0,
            |c: &mut Config| c.max_schema_name = 4096,
            |c: &mut Config| c.default_ttl = 0,
            |c: &mut Config| c.streaming.outbound_queue_size = 0,
        ] {
            let mut config = Config::default();
            mutate(&mut config);
            assert!(config.verify().is_err());
        }
    }

    #[test]
    fn json_round_trip() {
        let config = Config { relay_mode: true, ..Config::default() };
        let json = serde_json::to_string(&config).unwrap();
        let restored = Config::from_json(&json).unwrap();
        assert_eq!(*restored, config);
    }

    #[test]
    fn partial_json_uses_defaults() {
        let restored = Config::from_json(r#"{"strict_mode": true}"#).unwrap();
        assert!(restored.strict_mode);
        assert_eq!(restored.topic_prefix, "sdn");
        assert_eq!(restored.rate_limit_burst, 100);
    }
}
