//! Channel trait definitions
//!
//! The core only needs "send bytes / receive bytes / know local and remote
//! address" from the datagram layer. Anything implementing [`Channel`] and
//! [`ChannelReceiver`] can carry Shroud traffic.

use async_trait::async_trait;
use bytes::Bytes;
use std::net::SocketAddr;

use crate::error::Result;

/// Events that can occur on a channel
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Datagram received
    Data(Bytes),
    /// Receive error; the channel keeps running
    Error(String),
}

/// Sending half of an unreliable datagram channel
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send one datagram to `destination`
    async fn send_to(&self, data: Bytes, destination: SocketAddr) -> Result<()>;

    /// Local address the channel is bound to
    fn local_addr(&self) -> Result<SocketAddr>;

    /// Port identity of the channel
    fn port(&self) -> u16 {
        self.local_addr().map(|addr| addr.port()).unwrap_or(0)
    }

    /// Check if the channel still accepts sends
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self) -> Result<()>;
}

/// Receiving half of a datagram channel
#[async_trait]
pub trait ChannelReceiver: Send {
    /// Receive the next event with its source address
    async fn recv_from(&mut self) -> Option<(TransportEvent, SocketAddr)>;
}
