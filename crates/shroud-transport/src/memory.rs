//! In-memory datagram channels
//!
//! A [`MemoryNetwork`] connects any number of in-process channels by
//! address. It can drop every n-th datagram to imitate an unreliable link.

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{Channel, ChannelReceiver, TransportEvent};

type Inbox = mpsc::UnboundedSender<(TransportEvent, SocketAddr)>;

struct NetworkInner {
    inboxes: DashMap<SocketAddr, Inbox>,
    /// 0 disables loss
    drop_every: AtomicU64,
    sent: AtomicU64,
    dropped: AtomicU64,
}

/// A set of in-process channels that can reach each other
#[derive(Clone)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                inboxes: DashMap::new(),
                drop_every: AtomicU64::new(0),
                sent: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a channel at `addr`
    pub fn bind(&self, addr: SocketAddr) -> Result<(MemoryChannel, MemoryReceiver)> {
        if self.inner.inboxes.contains_key(&addr) {
            return Err(TransportError::ConnectionFailed(format!(
                "address in use: {}",
                addr
            )));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.inboxes.insert(addr, tx);

        Ok((
            MemoryChannel {
                network: self.clone(),
                addr,
                open: AtomicBool::new(true),
            },
            MemoryReceiver { rx },
        ))
    }

    /// Drop every n-th datagram sent on this network (0 disables)
    pub fn set_drop_every(&self, n: u64) {
        self.inner.drop_every.store(n, Ordering::SeqCst);
    }

    /// Datagrams handed to the network so far, including dropped ones
    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::SeqCst)
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::SeqCst)
    }

    fn deliver(&self, data: Bytes, from: SocketAddr, to: SocketAddr) {
        let count = self.inner.sent.fetch_add(1, Ordering::SeqCst) + 1;
        let drop_every = self.inner.drop_every.load(Ordering::SeqCst);
        if drop_every > 0 && count % drop_every == 0 {
            self.inner.dropped.fetch_add(1, Ordering::SeqCst);
            debug!("memory network dropped datagram {} to {}", count, to);
            return;
        }

        // Unknown destinations behave like UDP: the datagram vanishes
        if let Some(inbox) = self.inner.inboxes.get(&to) {
            let _ = inbox.send((TransportEvent::Data(data), from));
        }
    }

    fn detach(&self, addr: &SocketAddr) {
        self.inner.inboxes.remove(addr);
    }
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// Sending half of an in-memory channel
pub struct MemoryChannel {
    network: MemoryNetwork,
    addr: SocketAddr,
    open: AtomicBool,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn send_to(&self, data: Bytes, destination: SocketAddr) -> Result<()> {
        if !self.is_open() {
            return Err(TransportError::ChannelClosed);
        }
        self.network.deliver(data, self.addr, destination);
        Ok(())
    }

    fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.addr)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::AcqRel) {
            self.network.detach(&self.addr);
        }
        Ok(())
    }
}

/// Receiving half of an in-memory channel
pub struct MemoryReceiver {
    rx: mpsc::UnboundedReceiver<(TransportEvent, SocketAddr)>,
}

#[async_trait]
impl ChannelReceiver for MemoryReceiver {
    async fn recv_from(&mut self) -> Option<(TransportEvent, SocketAddr)> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[tokio::test]
    async fn test_memory_send_recv() {
        let network = MemoryNetwork::new();
        let (a, _a_rx) = network.bind(addr(1)).unwrap();
        let (_b, mut b_rx) = network.bind(addr(2)).unwrap();

        a.send_to(Bytes::from_static(b"ping"), addr(2)).await.unwrap();

        match b_rx.recv_from().await {
            Some((TransportEvent::Data(data), from)) => {
                assert_eq!(data.as_ref(), b"ping");
                assert_eq!(from, addr(1));
            }
            other => panic!("Expected data, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_memory_address_in_use() {
        let network = MemoryNetwork::new();
        let (_a, _rx) = network.bind(addr(1)).unwrap();
        assert!(network.bind(addr(1)).is_err());
    }

    #[tokio::test]
    async fn test_memory_drop_every() {
        let network = MemoryNetwork::new();
        network.set_drop_every(2);
        let (a, _a_rx) = network.bind(addr(1)).unwrap();
        let (_b, mut b_rx) = network.bind(addr(2)).unwrap();

        for i in 0..4u8 {
            a.send_to(Bytes::from(vec![i]), addr(2)).await.unwrap();
        }

        let mut received = Vec::new();
        while let Ok(Some((TransportEvent::Data(data), _))) =
            tokio::time::timeout(std::time::Duration::from_millis(50), b_rx.recv_from()).await
        {
            received.push(data[0]);
        }
        assert_eq!(received, vec![0, 2]);
        assert_eq!(network.dropped_count(), 2);
    }
}
