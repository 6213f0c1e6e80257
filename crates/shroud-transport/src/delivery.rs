//! Chunked, paced delivery
//!
//! A [`DeliveryPipe`] is the send path of one outbound stream. It sends
//! framed chunks to a single destination in call order, honours the
//! configured pacing, injects the end-of-message footer, and optionally
//! waits for an application-level [`Ack`] per chunk, resending on timeout.
//!
//! Acks are matched through an [`AckTracker`] shared with whatever reads
//! the channel; the reader calls [`AckTracker::complete`] for every ack
//! datagram it decodes.

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::Deserialize;
use shroud_core::{Ack, Footer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Semaphore};
use tracing::{debug, warn};

use crate::error::{Result, TransportError};
use crate::pacing::{Pacer, Pacing};
use crate::traits::Channel;

/// Send-path configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub pacing: Pacing,
    /// Send the end-of-message footer after each message
    pub footer: bool,
    /// Request an application-level ack for every chunk
    pub ack_required: bool,
    /// Maximum chunks awaiting an ack at once
    pub concurrency: usize,
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            pacing: Pacing::Unthrottled,
            footer: true,
            ack_required: false,
            concurrency: 1,
            ack_timeout_ms: 500,
            max_retries: 3,
        }
    }
}

impl DeliveryConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }
}

/// Pending acknowledgements keyed by (media hash, sequence)
#[derive(Default)]
pub struct AckTracker {
    pending: DashMap<(i32, i64), oneshot::Sender<()>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the ack for one chunk
    pub fn register(&self, media_hash: i32, sequence: i64) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert((media_hash, sequence), tx);
        rx
    }

    /// Resolve a pending ack; returns false for unknown or duplicate acks
    pub fn complete(&self, ack: Ack) -> bool {
        match self.pending.remove(&(ack.media_hash, ack.sequence)) {
            Some((_, tx)) => tx.send(()).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, media_hash: i32, sequence: i64) {
        self.pending.remove(&(media_hash, sequence));
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// One framed chunk ready for the wire
#[derive(Debug, Clone)]
pub struct OutboundChunk {
    pub bytes: Bytes,
    pub media_hash: i32,
    pub sequence: i64,
    pub ack_required: bool,
}

/// Delivery counters
#[derive(Debug, Default)]
pub struct DeliveryStats {
    pub chunks_sent: AtomicU64,
    pub footers_sent: AtomicU64,
    pub retransmits: AtomicU64,
    pub acked: AtomicU64,
    pub unacked: AtomicU64,
}

impl DeliveryStats {
    pub fn chunks_sent(&self) -> u64 {
        self.chunks_sent.load(Ordering::Relaxed)
    }

    pub fn footers_sent(&self) -> u64 {
        self.footers_sent.load(Ordering::Relaxed)
    }

    pub fn retransmits(&self) -> u64 {
        self.retransmits.load(Ordering::Relaxed)
    }

    pub fn acked(&self) -> u64 {
        self.acked.load(Ordering::Relaxed)
    }

    pub fn unacked(&self) -> u64 {
        self.unacked.load(Ordering::Relaxed)
    }
}

/// Paced send path to one destination
pub struct DeliveryPipe {
    channel: Arc<dyn Channel>,
    destination: SocketAddr,
    config: RwLock<DeliveryConfig>,
    pacer: Mutex<Pacer>,
    in_flight: RwLock<Arc<Semaphore>>,
    acks: Arc<AckTracker>,
    stats: Arc<DeliveryStats>,
}

impl DeliveryPipe {
    pub fn new(
        channel: Arc<dyn Channel>,
        destination: SocketAddr,
        config: DeliveryConfig,
        acks: Arc<AckTracker>,
    ) -> Self {
        let concurrency = config.concurrency.max(1);
        Self {
            channel,
            destination,
            pacer: Mutex::new(Pacer::new(config.pacing)),
            in_flight: RwLock::new(Arc::new(Semaphore::new(concurrency))),
            config: RwLock::new(config),
            acks,
            stats: Arc::new(DeliveryStats::default()),
        }
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn config(&self) -> DeliveryConfig {
        self.config.read().clone()
    }

    pub fn stats(&self) -> &DeliveryStats {
        &self.stats
    }

    pub async fn set_pacing(&self, pacing: Pacing) {
        self.config.write().pacing = pacing;
        self.pacer.lock().await.set_pacing(pacing);
    }

    pub fn set_footer(&self, footer: bool) {
        self.config.write().footer = footer;
    }

    pub fn set_ack_required(&self, ack_required: bool) {
        self.config.write().ack_required = ack_required;
    }

    /// Resize the ack window; chunks already waiting keep their old permits
    pub fn set_concurrency(&self, concurrency: usize) {
        let concurrency = concurrency.max(1);
        self.config.write().concurrency = concurrency;
        *self.in_flight.write() = Arc::new(Semaphore::new(concurrency));
    }

    /// Send a whole message: every chunk in order, then the footer if enabled
    pub async fn send_message(&self, chunks: Vec<OutboundChunk>, footer: Footer) -> Result<()> {
        for chunk in chunks {
            self.send_chunk(chunk).await?;
        }
        if self.config.read().footer {
            self.send_footer(footer).await?;
        }
        Ok(())
    }

    /// Send one chunk, honouring pacing and the ack window
    pub async fn send_chunk(&self, chunk: OutboundChunk) -> Result<()> {
        if !chunk.ack_required {
            self.pacer.lock().await.wait().await;
            self.channel.send_to(chunk.bytes, self.destination).await?;
            self.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        let semaphore = self.in_flight.read().clone();
        let permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| TransportError::ChannelClosed)?;

        // Register before sending so a fast ack cannot be missed
        let mut ack_rx = self.acks.register(chunk.media_hash, chunk.sequence);

        self.pacer.lock().await.wait().await;
        if let Err(e) = self.channel.send_to(chunk.bytes.clone(), self.destination).await {
            self.acks.cancel(chunk.media_hash, chunk.sequence);
            return Err(e);
        }
        self.stats.chunks_sent.fetch_add(1, Ordering::Relaxed);

        let (timeout, max_retries) = {
            let config = self.config.read();
            (config.ack_timeout(), config.max_retries)
        };
        let channel = self.channel.clone();
        let destination = self.destination;
        let acks = self.acks.clone();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let mut attempt = 0u32;
            loop {
                match tokio::time::timeout(timeout, &mut ack_rx).await {
                    Ok(Ok(())) => {
                        stats.acked.fetch_add(1, Ordering::Relaxed);
                        return;
                    }
                    Ok(Err(_)) => return,
                    Err(_) if attempt < max_retries => {
                        attempt += 1;
                        debug!(
                            "resending media hash {} sequence {} (attempt {})",
                            chunk.media_hash, chunk.sequence, attempt
                        );
                        stats.retransmits.fetch_add(1, Ordering::Relaxed);
                        if let Err(e) = channel.send_to(chunk.bytes.clone(), destination).await {
                            warn!("resend failed: {}", e);
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }

            acks.cancel(chunk.media_hash, chunk.sequence);
            stats.unacked.fetch_add(1, Ordering::Relaxed);
            warn!(
                "{}",
                TransportError::AckTimeout {
                    media_hash: chunk.media_hash,
                    sequence: chunk.sequence,
                }
            );
        });

        Ok(())
    }

    /// Send a footer, paced like any other datagram
    pub async fn send_footer(&self, footer: Footer) -> Result<()> {
        self.pacer.lock().await.wait().await;
        self.channel.send_to(footer.encode(), self.destination).await?;
        self.stats.footers_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Wait until no chunk is awaiting an ack
    pub async fn flush(&self) {
        let (semaphore, permits) = {
            let semaphore = self.in_flight.read().clone();
            let permits = self.config.read().concurrency.max(1) as u32;
            (semaphore, permits)
        };
        let _ = semaphore.acquire_many(permits).await;
    }
}
