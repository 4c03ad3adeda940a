use std::time::Duration;

use chanmux_frame::{MAX_FRAME_LENGTH, RECOMMENDED_PAYLOAD};
use serde::{Deserialize, Serialize};

use crate::error::{ConnError, Result};

/// Lowest accepted failure threshold. Below one interval the detector would
/// suspect a healthy peer between two of its own heartbeats.
pub const MIN_FAILURE_THRESHOLD: f64 = 1.0;

/// Per-connection tuning.
///
/// Missing fields fall back to their defaults when deserializing, so a partial
/// JSON object such as `{"failure_threshold": 5.0}` is a valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Period between outgoing heartbeat pings. Default: 1 s.
    pub heartbeat_interval: Duration,
    /// Silence, in heartbeat intervals, after which the peer is suspected.
    /// Lower detects faster and suspects more often. At least 1.0.
    /// Default: 3.0.
    pub failure_threshold: f64,
    /// Largest data payload put into one frame. Default: 1460.
    pub max_frame_payload: usize,
    /// Inbound frames buffered per channel before the demux task waits for
    /// the consumer. Default: 64.
    pub channel_buffer_frames: usize,
    /// Frames queued for the writer task before senders wait. Default: 256.
    pub outbound_queue_frames: usize,
    /// Peer-opened channels queued for `accept()`. Default: 64.
    pub accept_backlog: usize,
    /// How long a graceful shutdown waits for open channels. Default: 5 s.
    pub shutdown_grace: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            failure_threshold: 3.0,
            max_frame_payload: RECOMMENDED_PAYLOAD,
            channel_buffer_frames: 64,
            outbound_queue_frames: 256,
            accept_backlog: 64,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ConnectionConfig {
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_failure_threshold(mut self, threshold: f64) -> Self {
        self.failure_threshold = threshold;
        self
    }

    pub fn with_max_frame_payload(mut self, max: usize) -> Self {
        self.max_frame_payload = max;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Reject values the connection machinery cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConnError::InvalidConfig(
                "heartbeat_interval must be non-zero".into(),
            ));
        }
        if !self.failure_threshold.is_finite() || self.failure_threshold < MIN_FAILURE_THRESHOLD {
            return Err(ConnError::InvalidConfig(format!(
                "failure_threshold must be a finite number of at least {MIN_FAILURE_THRESHOLD}, got {}",
                self.failure_threshold
            )));
        }
        if self.max_frame_payload == 0 || self.max_frame_payload > MAX_FRAME_LENGTH {
            return Err(ConnError::InvalidConfig(format!(
                "max_frame_payload must be within 1..={MAX_FRAME_LENGTH}, got {}",
                self.max_frame_payload
            )));
        }
        for (name, value) in [
            ("channel_buffer_frames", self.channel_buffer_frames),
            ("outbound_queue_frames", self.outbound_queue_frames),
            ("accept_backlog", self.accept_backlog),
        ] {
            if value == 0 {
                return Err(ConnError::InvalidConfig(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// Silence tolerated before the peer is suspected.
    pub fn suspicion_timeout(&self) -> Duration {
        self.heartbeat_interval.mul_f64(self.failure_threshold)
    }

    /// Period between failure detector checks: half a heartbeat, at least 1 ms.
    pub fn detector_check_interval(&self) -> Duration {
        (self.heartbeat_interval / 2).max(Duration::from_millis(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ConnectionConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_frame_payload, 1460);
        assert_eq!(config.suspicion_timeout(), Duration::from_secs(3));
        assert_eq!(config.detector_check_interval(), Duration::from_millis(500));
    }

    #[test]
    fn threshold_below_one_interval_is_rejected() {
        for threshold in [0.25, 0.999] {
            let err = ConnectionConfig::default()
                .with_failure_threshold(threshold)
                .validate()
                .unwrap_err();
            assert!(matches!(err, ConnError::InvalidConfig(msg) if msg.contains("failure_threshold")));
        }

        let config = ConnectionConfig::default().with_failure_threshold(MIN_FAILURE_THRESHOLD);
        config.validate().unwrap();
        assert_eq!(config.suspicion_timeout(), config.heartbeat_interval);
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            ConnectionConfig::default().with_heartbeat_interval(Duration::ZERO),
            ConnectionConfig::default().with_failure_threshold(0.0),
            ConnectionConfig::default().with_failure_threshold(f64::NAN),
            ConnectionConfig::default().with_max_frame_payload(0),
            ConnectionConfig::default().with_max_frame_payload(MAX_FRAME_LENGTH + 1),
            ConnectionConfig {
                outbound_queue_frames: 0,
                ..ConnectionConfig::default()
            },
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(ConnError::InvalidConfig(_))),
                "expected rejection for {config:?}"
            );
        }
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: ConnectionConfig =
            serde_json::from_str(r#"{"failure_threshold": 5.0, "accept_backlog": 4}"#).unwrap();
        assert_eq!(config.failure_threshold, 5.0);
        assert_eq!(config.accept_backlog, 4);
        assert_eq!(config.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(config.max_frame_payload, 1460);
    }

    #[test]
    fn json_round_trip() {
        let config = ConnectionConfig::default()
            .with_heartbeat_interval(Duration::from_millis(250))
            .with_shutdown_grace(Duration::from_millis(100));
        let json = serde_json::to_string(&config).unwrap();
        let back: ConnectionConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }
}
