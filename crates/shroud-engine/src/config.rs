//! Engine configuration
//!
//! Every section deserializes with defaults for missing fields, so a TOML
//! file only needs the values it changes.

use serde::Deserialize;
use shroud_transport::{DeliveryConfig, Pacing};
use std::time::Duration;

/// Endpoint configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub negotiation: NegotiationConfig,
    pub receiver: ReceiverConfig,
    pub streamer: StreamerConfig,
    #[cfg(feature = "udp")]
    pub udp: shroud_transport::UdpConfig,
}

/// Negotiation configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// How long an initiator waits for the acceptor's reply (milliseconds)
    pub ack_timeout_ms: u64,
    /// Reply with an explicit rejection to unknown requested types instead
    /// of staying silent
    pub reject_unknown_types: bool,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 30_000,
            reject_unknown_types: false,
        }
    }
}

impl NegotiationConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Receiver configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Delay between a message footer and finalization, to let the last
    /// in-flight chunks land. `None` finalizes on the footer itself.
    pub finalize_delay_ms: Option<u64>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            finalize_delay_ms: Some(50),
        }
    }
}

impl ReceiverConfig {
    /// Finalize as soon as the footer arrives
    pub fn immediate() -> Self {
        Self {
            finalize_delay_ms: None,
        }
    }

    pub fn finalize_delay(&self) -> Option<Duration> {
        self.finalize_delay_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Streamer configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// Largest payload slice carried by one chunk
    pub max_chunk_payload: usize,
    /// Capacity of the outbound payload queue
    pub queue_capacity: usize,
    /// Send path settings
    #[serde(flatten)]
    pub delivery: DeliveryConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            max_chunk_payload: 1024,
            queue_capacity: 64,
            delivery: DeliveryConfig::default(),
        }
    }
}

impl StreamerConfig {
    pub fn with_pacing(mut self, pacing: Pacing) -> Self {
        self.delivery.pacing = pacing;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.negotiation.ack_timeout(), Duration::from_secs(30));
        assert!(!config.negotiation.reject_unknown_types);
        assert_eq!(
            config.receiver.finalize_delay(),
            Some(Duration::from_millis(50))
        );
        assert_eq!(config.streamer.max_chunk_payload, 1024);
        assert_eq!(config.streamer.delivery.pacing, Pacing::Unthrottled);
        assert!(config.streamer.delivery.footer);
    }

    #[test]
    fn test_zero_delay_is_immediate() {
        let config = ReceiverConfig {
            finalize_delay_ms: Some(0),
        };
        assert_eq!(config.finalize_delay(), None);
        assert_eq!(ReceiverConfig::immediate().finalize_delay(), None);
    }
}
