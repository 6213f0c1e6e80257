//! Endpoint
//!
//! An [`Endpoint`] binds one datagram channel to one [`MediaContext`]. Its
//! inbound task decodes every datagram and routes it:
//!
//! - NEGOTIATION / NEGOTIATION_ACK chunks → negotiation bus
//! - ack datagrams → the shared [`AckTracker`]
//! - data chunks and footers → chunk-arrival bus
//!
//! Data chunks that ask for an ack are answered right away when a receiver
//! exists for their media hash.
//!
//! # Example
//!
//! ```no_run
//! use shroud_core::MediaStreamType;
//! use shroud_engine::{EngineConfig, Endpoint};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let endpoint = Endpoint::bind("0.0.0.0:0", EngineConfig::default()).await?;
//!     let remote = "127.0.0.1:7400".parse()?;
//!
//!     let streamer = endpoint.open_stream(MediaStreamType::Text, 42, remote).await?;
//!     streamer.start()?;
//!     streamer.send("hello").await?;
//!     streamer.drain().await?;
//!     streamer.destroy().await;
//!     Ok(())
//! }
//! ```

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use shroud_core::{negotiation, Ack, Chunk, MediaStreamType, Packet};
use shroud_transport::{AckTracker, Channel, ChannelReceiver, TransportEvent};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::context::MediaContext;
use crate::error::{EngineError, Result};
use crate::events::{ArrivalEvent, NegotiationEvent, NegotiationState};
use crate::negotiation::{NegotiationHandle, Negotiator};
use crate::processor::ProcessorFactory;
use crate::receiver::{Receiver, ReceiverBuilder};
use crate::streamer::{Streamer, StreamerBuilder};

/// One peer: a channel, its context and the inbound routing task
pub struct Endpoint {
    context: Arc<MediaContext>,
    channel: Arc<dyn Channel>,
    local_addr: SocketAddr,
    acks: Arc<AckTracker>,
    negotiator: Arc<Negotiator>,
    config: EngineConfig,
    streamers: DashMap<u64, Arc<Streamer>>,
    inbound: Mutex<Option<JoinHandle<()>>>,
}

impl Endpoint {
    /// Bind a UDP endpoint
    #[cfg(feature = "udp")]
    pub async fn bind(addr: &str, config: EngineConfig) -> Result<Self> {
        let channel =
            shroud_transport::UdpChannel::bind_with_config(addr, config.udp.clone()).await?;
        let receiver = channel.start_receiver();
        Self::with_channel(Arc::new(channel), receiver, config)
    }

    /// Build an endpoint on an existing channel
    ///
    /// Must be called inside a Tokio runtime.
    pub fn with_channel<R>(
        channel: Arc<dyn Channel>,
        receiver: R,
        config: EngineConfig,
    ) -> Result<Self>
    where
        R: ChannelReceiver + 'static,
    {
        let local_addr = channel.local_addr()?;
        let context = MediaContext::new();
        let acks = Arc::new(AckTracker::new());
        let negotiator = Negotiator::new(
            context.clone(),
            channel.clone(),
            config.negotiation.clone(),
            config.receiver.clone(),
        );

        let inbound = Inbound {
            context: context.clone(),
            channel: channel.clone(),
            acks: acks.clone(),
            local_addr,
        };
        let handle = tokio::spawn(inbound.run(receiver));

        info!("endpoint listening on {}", local_addr);
        Ok(Self {
            context,
            channel,
            local_addr,
            acks,
            negotiator,
            config,
            streamers: DashMap::new(),
            inbound: Mutex::new(Some(handle)),
        })
    }

    pub fn context(&self) -> &Arc<MediaContext> {
        &self.context
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Processor factory used for streams accepted from remote peers
    pub fn set_processor_factory(&self, factory: Arc<dyn ProcessorFactory>) {
        self.negotiator.set_processor_factory(factory);
    }

    /// Start a negotiation and return a handle on its progress
    pub async fn start_negotiation(
        &self,
        requested: MediaStreamType,
        media_hash: i32,
        remote: SocketAddr,
    ) -> Result<NegotiationHandle> {
        self.negotiator
            .negotiate(requested, media_hash, remote)
            .await
    }

    /// Negotiate a stream and wait for the outcome
    pub async fn negotiate(
        &self,
        requested: MediaStreamType,
        media_hash: i32,
        remote: SocketAddr,
    ) -> Result<NegotiationState> {
        let handle = self.start_negotiation(requested, media_hash, remote).await?;
        Ok(handle.outcome().await)
    }

    /// Negotiate a stream and, once accepted, create its streamer
    pub async fn open_stream(
        &self,
        media_type: MediaStreamType,
        media_hash: i32,
        remote: SocketAddr,
    ) -> Result<Arc<Streamer>> {
        match self.negotiate(media_type, media_hash, remote).await? {
            NegotiationState::Accepted => self.create_streamer(media_type, media_hash, remote),
            _ => Err(EngineError::Rejected(media_hash)),
        }
    }

    /// Create a queue-fed streamer with the endpoint's streamer settings
    pub fn create_streamer(
        &self,
        media_type: MediaStreamType,
        media_hash: i32,
        remote: SocketAddr,
    ) -> Result<Arc<Streamer>> {
        self.create_streamer_from(
            Streamer::builder(media_type, media_hash, remote).config(self.config.streamer.clone()),
        )
    }

    /// Create a streamer from a fully configured builder
    pub fn create_streamer_from(&self, builder: StreamerBuilder) -> Result<Arc<Streamer>> {
        self.streamers.retain(|_, s| !s.is_destroyed());

        let streamer = builder.build(&self.context, self.channel.clone(), self.acks.clone())?;
        self.streamers.insert(streamer.id(), streamer.clone());
        Ok(streamer)
    }

    /// Create a receiver without negotiation
    pub fn create_receiver(
        &self,
        media_type: MediaStreamType,
        media_hash: i32,
        remote: Option<SocketAddr>,
    ) -> Result<Arc<Receiver>> {
        self.create_receiver_from(
            Receiver::builder(media_type, media_hash)
                .config(self.config.receiver.clone())
                .remote_address(remote),
        )
    }

    pub fn create_receiver_from(&self, builder: ReceiverBuilder) -> Result<Arc<Receiver>> {
        builder
            .local_address(Some(self.local_addr))
            .build(&self.context)
    }

    pub fn receiver(&self, media_hash: i32) -> Option<Arc<Receiver>> {
        self.context.receiver(media_hash)
    }

    pub fn streamers(&self) -> Vec<Arc<Streamer>> {
        self.streamers.iter().map(|s| s.value().clone()).collect()
    }

    /// Destroy every streamer and receiver, then close the channel
    pub async fn shutdown(&self) {
        let streamers = self.streamers();
        self.streamers.clear();
        join_all(streamers.iter().map(|s| s.destroy())).await;

        for receiver in self.context.receivers() {
            receiver.destroy();
        }
        self.negotiator.shutdown();

        if let Some(handle) = self.inbound.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.channel.close().await {
            debug!("closing channel failed: {}", e);
        }
        info!("endpoint {} shut down", self.local_addr);
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if let Some(handle) = self.inbound.lock().take() {
            handle.abort();
        }
        self.negotiator.shutdown();
    }
}

/// Inbound decode and routing task
struct Inbound {
    context: Arc<MediaContext>,
    channel: Arc<dyn Channel>,
    acks: Arc<AckTracker>,
    local_addr: SocketAddr,
}

impl Inbound {
    async fn run<R: ChannelReceiver>(self, mut receiver: R) {
        while let Some((event, from)) = receiver.recv_from().await {
            match event {
                TransportEvent::Data(data) => self.route(data, from).await,
                TransportEvent::Error(e) => error!("channel error: {}", e),
            }
        }
        debug!("inbound loop on {} ended", self.local_addr);
    }

    async fn route(&self, data: bytes::Bytes, from: SocketAddr) {
        let packet = match Packet::decode(data) {
            Ok(packet) => packet,
            Err(e) => {
                debug!("dropping datagram from {}: {}", from, e);
                return;
            }
        };

        match packet {
            Packet::Ack(ack) => {
                if !self.acks.complete(ack) {
                    debug!(
                        "stale ack for media hash {} sequence {} from {}",
                        ack.media_hash, ack.sequence, from
                    );
                }
            }
            Packet::Footer(footer) => {
                self.context.arrivals().publish(ArrivalEvent::Footer {
                    footer,
                    remote_address: from,
                });
            }
            Packet::Chunk(chunk) => {
                let chunk =
                    chunk.with_route(self.local_addr.port(), Some(self.local_addr), Some(from));
                match chunk.media_type {
                    MediaStreamType::Negotiation => self.route_request(&chunk, from),
                    MediaStreamType::NegotiationAck => self.route_reply(&chunk, from),
                    _ => self.route_data(chunk, from).await,
                }
            }
        }
    }

    fn route_request(&self, chunk: &Chunk, from: SocketAddr) {
        match negotiation::requested_marker(chunk) {
            Ok(marker) => self.context.negotiations().publish(NegotiationEvent::Request {
                requested: MediaStreamType::from_header_marker(marker),
                marker,
                media_hash: chunk.media_hash,
                sequence: chunk.sequence,
                local_address: chunk.local_address,
                remote_address: from,
            }),
            Err(e) => debug!("dropping negotiation request from {}: {}", from, e),
        }
    }

    fn route_reply(&self, chunk: &Chunk, from: SocketAddr) {
        match negotiation::is_accepted(chunk) {
            Ok(accepted) => self.context.negotiations().publish(NegotiationEvent::Reply {
                media_hash: chunk.media_hash,
                accepted,
                remote_address: from,
            }),
            Err(e) => debug!("dropping negotiation reply from {}: {}", from, e),
        }
    }

    async fn route_data(&self, chunk: Chunk, from: SocketAddr) {
        if chunk.ack_required && self.context.has_receiver(chunk.media_hash) {
            let ack = Ack::new(chunk.media_hash, chunk.sequence).encode();
            if let Err(e) = self.channel.send_to(ack, from).await {
                debug!("failed to ack sequence {} to {}: {}", chunk.sequence, from, e);
            }
        }
        self.context
            .arrivals()
            .publish(ArrivalEvent::Chunk(Arc::new(chunk)));
    }
}
