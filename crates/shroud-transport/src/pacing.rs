//! Send pacing
//!
//! Three modes: unthrottled, a fixed delay between consecutive sends, or a
//! target chunks-per-second rate. The rate mode spaces sends at least
//! `1s / rate` apart, so no one-second window ever holds more than `rate`
//! sends.

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Pacing policy for a send path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Pacing {
    /// Full throttle
    #[default]
    Unthrottled,
    /// Sleep a fixed delay between consecutive sends
    FixedDelay { delay_ms: u64 },
    /// Cap the send rate
    ChunksPerSecond { rate: u32 },
}

impl Pacing {
    /// Minimum spacing between two sends, if any
    pub fn interval(&self) -> Option<Duration> {
        match *self {
            Pacing::Unthrottled => None,
            Pacing::FixedDelay { delay_ms: 0 } => None,
            Pacing::FixedDelay { delay_ms } => Some(Duration::from_millis(delay_ms)),
            Pacing::ChunksPerSecond { rate: 0 } => None,
            Pacing::ChunksPerSecond { rate } => {
                Some(Duration::from_nanos(1_000_000_000u64.div_ceil(rate as u64)))
            }
        }
    }
}

/// Tracks when the next send may happen
#[derive(Debug, Clone)]
pub struct Pacer {
    pacing: Pacing,
    last_send: Option<Instant>,
}

impl Pacer {
    pub fn new(pacing: Pacing) -> Self {
        Self {
            pacing,
            last_send: None,
        }
    }

    pub fn pacing(&self) -> Pacing {
        self.pacing
    }

    /// Change policy; takes effect from the next send
    pub fn set_pacing(&mut self, pacing: Pacing) {
        self.pacing = pacing;
    }

    /// Reserve the next send slot at or after `now`
    ///
    /// Returns the instant the caller must wait for, or `None` to send
    /// immediately. The slot is recorded as used.
    pub fn reserve(&mut self, now: Instant) -> Option<Instant> {
        let slot = match (self.pacing.interval(), self.last_send) {
            (Some(interval), Some(last)) => (last + interval).max(now),
            _ => now,
        };
        self.last_send = Some(slot);
        (slot > now).then_some(slot)
    }

    /// Wait for the next send slot
    pub async fn wait(&mut self) {
        if let Some(deadline) = self.reserve(Instant::now()) {
            tokio::time::sleep_until(deadline.into()).await;
        }
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(Pacing::Unthrottled)
    }
}
