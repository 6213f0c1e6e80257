//! Shroud Transport Layer
//!
//! This crate provides the datagram plumbing underneath the Shroud engine:
//! - The channel boundary ([`Channel`], [`ChannelReceiver`])
//! - UDP channels (for LAN and internet peers)
//! - In-memory channels (for tests and in-process peers)
//! - Send pacing ([`Pacing`], [`Pacer`])
//! - Chunked delivery with footer injection and optional
//!   application-level acknowledgement ([`DeliveryPipe`])

pub mod delivery;
pub mod error;
pub mod memory;
pub mod pacing;
pub mod traits;

#[cfg(feature = "udp")]
pub mod udp;

pub use delivery::{AckTracker, DeliveryConfig, DeliveryPipe, DeliveryStats, OutboundChunk};
pub use error::{Result, TransportError};
pub use memory::{MemoryChannel, MemoryNetwork, MemoryReceiver};
pub use pacing::{Pacer, Pacing};
pub use traits::{Channel, ChannelReceiver, TransportEvent};

#[cfg(feature = "udp")]
pub use udp::{UdpChannel, UdpConfig, UdpReceiver};
