//! Bridge configuration
//!
//! Timeouts and protocol limits used by the host side of the bridge. All
//! fields have defaults; `SNAPWIRE_*` environment variables override them.

use crate::bridge::frame::{Limits, DEFAULT_MAX_CHUNK, DEFAULT_MAX_FRAME, DEFAULT_WINDOW};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Host-side bridge settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Largest encoded frame accepted or produced, in bytes
    pub max_frame: usize,
    /// Largest chunk payload, in bytes
    pub max_chunk: usize,
    /// Unacknowledged chunks a stream sender may have in flight
    pub window: usize,
    /// Calls allowed in flight on one connection; further callers wait
    pub max_in_flight: usize,
    pub handshake_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// An unanswered heartbeat older than this is peer loss
    pub heartbeat_timeout_ms: u64,
    /// How long `close` waits for the plugin to exit after GOODBYE
    pub grace_period_ms: u64,
    /// Deadline applied to calls that do not set one. Zero means none.
    pub default_deadline_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_frame: DEFAULT_MAX_FRAME,
            max_chunk: DEFAULT_MAX_CHUNK,
            window: DEFAULT_WINDOW,
            max_in_flight: 64,
            handshake_timeout_ms: 10_000,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            grace_period_ms: 5_000,
            default_deadline_ms: 0,
        }
    }
}

impl BridgeConfig {
    /// Defaults with `SNAPWIRE_*` environment overrides applied.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_env() -> Self {
        Self::default().with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn apply<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            if let Some(raw) = lookup(key) {
                match raw.trim().parse() {
                    Ok(v) => *slot = v,
                    Err(_) => tracing::warn!(key, value = %raw, "ignoring unparseable override"),
                }
            }
        }

        apply(&lookup, "SNAPWIRE_MAX_FRAME", &mut self.max_frame);
        apply(&lookup, "SNAPWIRE_MAX_CHUNK", &mut self.max_chunk);
        apply(&lookup, "SNAPWIRE_WINDOW", &mut self.window);
        apply(&lookup, "SNAPWIRE_MAX_IN_FLIGHT", &mut self.max_in_flight);
        apply(&lookup, "SNAPWIRE_HANDSHAKE_TIMEOUT_MS", &mut self.handshake_timeout_ms);
        apply(&lookup, "SNAPWIRE_HEARTBEAT_INTERVAL_MS", &mut self.heartbeat_interval_ms);
        apply(&lookup, "SNAPWIRE_HEARTBEAT_TIMEOUT_MS", &mut self.heartbeat_timeout_ms);
        apply(&lookup, "SNAPWIRE_GRACE_PERIOD_MS", &mut self.grace_period_ms);
        apply(&lookup, "SNAPWIRE_DEFAULT_DEADLINE_MS", &mut self.default_deadline_ms);
        self
    }

    /// Limits offered in the host HELLO. `max_chunk` leaves room for the
    /// CHUNK envelope inside `max_frame`.
    pub fn limits(&self) -> Limits {
        Limits {
            max_frame: self.max_frame,
            max_chunk: self.max_chunk,
            window: self.window,
        }
        .clamped()
    }

    /// Refuse settings under which no chunk fits in a frame.
    pub fn validate(&self) -> Result<(), String> {
        self.limits().validate()
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn default_deadline(&self) -> Option<Duration> {
        (self.default_deadline_ms > 0).then(|| Duration::from_millis(self.default_deadline_ms))
    }
}
