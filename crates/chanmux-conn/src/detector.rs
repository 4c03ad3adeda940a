//! Heartbeat-driven failure detection.
//!
//! The suspicion level is the time since the peer was last heard from,
//! measured in heartbeat intervals. Any frame counts, including the peer's own
//! pings, so a peer whose reader is backed up behind a slow consumer still
//! proves it is alive. Pings and their ACKs only measure round trips.
//!
//! A check that finds the level at or above the threshold marks the peer
//! suspected. If the next check still finds it there, the failure is
//! confirmed. Hearing from the peer in between clears the suspicion.

use std::time::{Duration, Instant};

use crate::config::MIN_FAILURE_THRESHOLD;

/// Raw liveness observations published by the demux task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// When the last frame of any kind arrived. Also refreshed while the
    /// demux is parked on a full channel buffer with a frame in hand.
    pub last_heard: Instant,
    /// Sequence number and arrival time of the most recent ping ACK.
    pub last_ack: Option<(u64, Instant)>,
}

impl Pulse {
    pub fn new(now: Instant) -> Self {
        Self {
            last_heard: now,
            last_ack: None,
        }
    }
}

/// Outcome of one detector check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Liveness {
    Alive,
    /// First check at or above the threshold.
    Suspect { level: f64 },
    /// Suspicion held across two consecutive checks.
    Failed { level: f64 },
}

/// Detector snapshot exposed through connection stats.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Health {
    pub suspicion_level: f64,
    pub suspected: bool,
    pub last_rtt: Option<Duration>,
}

#[derive(Debug)]
pub struct FailureDetector {
    interval: Duration,
    threshold: f64,
    last_heard: Instant,
    /// Oldest unanswered ping.
    outstanding: Option<(u64, Instant)>,
    suspected: bool,
    last_rtt: Option<Duration>,
}

impl FailureDetector {
    /// `threshold` below [`MIN_FAILURE_THRESHOLD`] is raised to it;
    /// [`ConnectionConfig::validate`](crate::ConnectionConfig::validate)
    /// rejects such values before a connection starts.
    pub fn new(interval: Duration, threshold: f64, now: Instant) -> Self {
        Self {
            interval,
            threshold: threshold.max(MIN_FAILURE_THRESHOLD),
            last_heard: now,
            outstanding: None,
            suspected: false,
            last_rtt: None,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Record that a frame arrived at `at`. Older timestamps are ignored.
    pub fn heard(&mut self, at: Instant) {
        if at > self.last_heard {
            self.last_heard = at;
        }
    }

    /// Record an outgoing ping. Only the oldest unanswered ping is tracked.
    pub fn ping_sent(&mut self, seq: u64, at: Instant) {
        if self.outstanding.is_none() {
            self.outstanding = Some((seq, at));
        }
    }

    /// Record a ping ACK. Returns the round-trip time when it answers the
    /// tracked ping. An ACK for a later ping also clears the tracked one, since
    /// acks arrive in order.
    pub fn ack_received(&mut self, seq: u64, at: Instant) -> Option<Duration> {
        self.heard(at);
        match self.outstanding {
            Some((pending, sent)) if seq >= pending => {
                self.outstanding = None;
                if seq == pending {
                    let rtt = at.saturating_duration_since(sent);
                    self.last_rtt = Some(rtt);
                    Some(rtt)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Fold in whatever the demux task has published since the last check.
    pub fn observe(&mut self, pulse: &Pulse) -> Option<Duration> {
        self.heard(pulse.last_heard);
        pulse
            .last_ack
            .and_then(|(seq, at)| self.ack_received(seq, at))
    }

    pub fn suspicion_level(&self, now: Instant) -> f64 {
        let silence = now.saturating_duration_since(self.last_heard);
        silence.as_secs_f64() / self.interval.as_secs_f64()
    }

    pub fn check(&mut self, now: Instant) -> Liveness {
        let level = self.suspicion_level(now);
        if level < self.threshold {
            self.suspected = false;
            return Liveness::Alive;
        }
        if self.suspected {
            Liveness::Failed { level }
        } else {
            self.suspected = true;
            Liveness::Suspect { level }
        }
    }

    pub fn is_suspected(&self) -> bool {
        self.suspected
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.last_rtt
    }

    pub fn health(&self, now: Instant) -> Health {
        Health {
            suspicion_level: self.suspicion_level(now),
            suspected: self.suspected,
            last_rtt: self.last_rtt,
        }
    }
}
