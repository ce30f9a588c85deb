//! Live query configuration.
//!
//! `LiveQueryConfig` is plain data. Hosts load it from whatever format they
//! use (every field has a default, durations are milliseconds) and hand it to
//! the registry builder.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs for the live query engine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveQueryConfig {
    /// Fallback re-poll interval for polled result sets.
    #[serde(with = "duration_ms")]
    pub poll_interval: Duration,
    /// Invalidations closer together than this coalesce into one poll.
    #[serde(with = "duration_ms")]
    pub throttle_window: Duration,
    /// How long the change-log tailer sleeps when the log has nothing new.
    #[serde(with = "duration_ms")]
    pub tailer_idle_interval: Duration,
    /// Delay before the tailer reconnects after a read failure.
    #[serde(with = "duration_ms")]
    pub tailer_reconnect_delay: Duration,
    /// Maximum entries read from the change log per request.
    pub tailer_batch_size: usize,
    /// Attempts an optimistic upsert makes before giving up.
    pub upsert_attempts: u32,
    /// Serve eligible queries from the change log instead of polling.
    pub use_change_log: bool,
}

impl Default for LiveQueryConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            throttle_window: Duration::from_millis(50),
            tailer_idle_interval: Duration::from_millis(10),
            tailer_reconnect_delay: Duration::from_millis(100),
            tailer_batch_size: 256,
            upsert_attempts: 3,
            use_change_log: true,
        }
    }
}

impl LiveQueryConfig {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_throttle_window(mut self, window: Duration) -> Self {
        self.throttle_window = window;
        self
    }

    pub fn with_tailer_idle_interval(mut self, interval: Duration) -> Self {
        self.tailer_idle_interval = interval;
        self
    }

    pub fn with_tailer_reconnect_delay(mut self, delay: Duration) -> Self {
        self.tailer_reconnect_delay = delay;
        self
    }

    pub fn with_tailer_batch_size(mut self, size: usize) -> Self {
        self.tailer_batch_size = size.max(1);
        self
    }

    pub fn with_upsert_attempts(mut self, attempts: u32) -> Self {
        self.upsert_attempts = attempts.max(1);
        self
    }

    pub fn with_change_log(mut self, enabled: bool) -> Self {
        self.use_change_log = enabled;
        self
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = LiveQueryConfig::default();
        assert_eq!(c.poll_interval, Duration::from_secs(10));
        assert_eq!(c.throttle_window, Duration::from_millis(50));
        assert_eq!(c.upsert_attempts, 3);
        assert!(c.use_change_log);
    }

    #[test]
    fn test_deserialize_partial_with_millis() {
        let c: LiveQueryConfig =
            serde_json::from_str(r#"{"poll_interval": 250, "use_change_log": false}"#).unwrap();
        assert_eq!(c.poll_interval, Duration::from_millis(250));
        assert!(!c.use_change_log);
        assert_eq!(c.tailer_batch_size, 256);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let c = LiveQueryConfig::default().with_throttle_window(Duration::from_millis(5));
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"throttle_window\":5"));
        let back: LiveQueryConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_builders_clamp() {
        let c = LiveQueryConfig::default()
            .with_upsert_attempts(0)
            .with_tailer_batch_size(0);
        assert_eq!(c.upsert_attempts, 1);
        assert_eq!(c.tailer_batch_size, 1);
    }
}
