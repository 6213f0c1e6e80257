//! Stream negotiation
//!
//! The [`Negotiator`] plays both sides of the handshake.
//!
//! As initiator it sends a NEGOTIATION chunk naming the wanted type under a
//! candidate media hash and waits for the NEGOTIATION_ACK. A timer task
//! resolves the attempt as rejected when no reply arrives in time, so a
//! timeout and an explicit rejection look the same to the caller.
//!
//! As acceptor it handles requests published on the negotiation bus: it
//! opens a receiver (plus a processor, when a factory is installed) for the
//! requested type and media hash and replies with the outcome.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use shroud_core::{negotiation, MediaStreamType};
use shroud_transport::Channel;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::bus::{Handler, SubscriberId};
use crate::config::{NegotiationConfig, ReceiverConfig};
use crate::context::MediaContext;
use crate::error::{EngineError, Result};
use crate::events::{NegotiationEvent, NegotiationState};
use crate::processor::{ProcessorBinding, ProcessorFactory};
use crate::receiver::Receiver;

struct PendingNegotiation {
    sequence: i64,
    /// Only a reply from this peer resolves the attempt
    remote: SocketAddr,
    state: watch::Sender<NegotiationState>,
}

/// Handle on one locally initiated negotiation
#[derive(Debug, Clone)]
pub struct NegotiationHandle {
    media_type: MediaStreamType,
    media_hash: i32,
    state: watch::Receiver<NegotiationState>,
}

impl NegotiationHandle {
    pub fn media_type(&self) -> MediaStreamType {
        self.media_type
    }

    pub fn media_hash(&self) -> i32 {
        self.media_hash
    }

    pub fn state(&self) -> NegotiationState {
        *self.state.borrow()
    }

    /// Wait for the terminal state
    pub async fn outcome(mut self) -> NegotiationState {
        loop {
            let state = *self.state.borrow_and_update();
            if state.is_terminal() {
                return state;
            }
            if self.state.changed().await.is_err() {
                // Negotiator went away without an answer
                return NegotiationState::Rejected;
            }
        }
    }
}

/// Initiator and acceptor of stream negotiations
pub struct Negotiator {
    id: SubscriberId,
    context: Arc<MediaContext>,
    channel: Arc<dyn Channel>,
    config: NegotiationConfig,
    receiver_config: ReceiverConfig,
    factory: RwLock<Option<Arc<dyn ProcessorFactory>>>,
    pending: Arc<DashMap<i32, PendingNegotiation>>,
    sequence: AtomicI64,
}

impl Negotiator {
    /// Create a negotiator and subscribe it to the negotiation bus
    pub fn new(
        context: Arc<MediaContext>,
        channel: Arc<dyn Channel>,
        config: NegotiationConfig,
        receiver_config: ReceiverConfig,
    ) -> Arc<Self> {
        let negotiator = Arc::new(Self {
            id: context.next_subscriber_id(),
            context,
            channel,
            config,
            receiver_config,
            factory: RwLock::new(None),
            pending: Arc::new(DashMap::new()),
            sequence: AtomicI64::new(0),
        });
        negotiator
            .context
            .negotiations()
            .register(negotiator.id, negotiator.clone());
        negotiator
    }

    pub fn config(&self) -> &NegotiationConfig {
        &self.config
    }

    pub fn set_processor_factory(&self, factory: Arc<dyn ProcessorFactory>) {
        *self.factory.write() = Some(factory);
    }

    /// Negotiations still awaiting a reply
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Ask `remote` to accept a `requested` stream under `media_hash`
    pub async fn negotiate(
        &self,
        requested: MediaStreamType,
        media_hash: i32,
        remote: SocketAddr,
    ) -> Result<NegotiationHandle> {
        if !requested.is_media() {
            return Err(EngineError::InvalidState(format!(
                "cannot negotiate a {} stream",
                requested
            )));
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let (tx, rx) = watch::channel(NegotiationState::Idle);

        match self.pending.entry(media_hash) {
            Entry::Occupied(_) => return Err(EngineError::NegotiationPending(media_hash)),
            Entry::Vacant(slot) => {
                slot.insert(PendingNegotiation {
                    sequence,
                    remote,
                    state: tx,
                });
            }
        }

        let request = match negotiation::encode_request(requested, media_hash, sequence) {
            Ok(request) => request,
            Err(e) => {
                self.pending.remove(&media_hash);
                return Err(e.into());
            }
        };
        if let Err(e) = self.channel.send_to(request, remote).await {
            self.pending.remove(&media_hash);
            return Err(e.into());
        }

        if let Some(pending) = self.pending.get(&media_hash) {
            pending.state.send_replace(NegotiationState::Requested);
        }
        debug!(
            "requested {} stream {} from {}",
            requested, media_hash, remote
        );

        let pending = self.pending.clone();
        let context = self.context.clone();
        let timeout = self.config.ack_timeout();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            // Only the attempt this timer was started for
            if let Some((_, attempt)) =
                pending.remove_if(&media_hash, |_, p| p.sequence == sequence)
            {
                info!("negotiation for media hash {} timed out", media_hash);
                attempt.state.send_replace(NegotiationState::Rejected);
                context.negotiations().publish(NegotiationEvent::Resolved {
                    media_hash,
                    state: NegotiationState::Rejected,
                });
            }
        });

        Ok(NegotiationHandle {
            media_type: requested,
            media_hash,
            state: rx,
        })
    }

    fn on_reply(&self, media_hash: i32, accepted: bool, remote: SocketAddr) {
        let Some((_, attempt)) = self
            .pending
            .remove_if(&media_hash, |_, p| p.remote == remote)
        else {
            debug!(
                "unsolicited negotiation reply for media hash {} from {}",
                media_hash, remote
            );
            return;
        };

        let state = if accepted {
            NegotiationState::Accepted
        } else {
            NegotiationState::Rejected
        };
        debug!("negotiation for media hash {} resolved: {:?}", media_hash, state);
        attempt.state.send_replace(state);
        self.context
            .negotiations()
            .publish(NegotiationEvent::Resolved { media_hash, state });
    }

    fn on_request(
        &self,
        requested: Option<MediaStreamType>,
        marker: [u8; 4],
        media_hash: i32,
        sequence: i64,
        local_address: Option<SocketAddr>,
        remote: SocketAddr,
    ) {
        let accepted = match requested.filter(|t| t.is_media()) {
            None if self.config.reject_unknown_types => {
                debug!(
                    "rejecting negotiation with unknown type marker {:02x?} from {}",
                    marker, remote
                );
                false
            }
            None => {
                debug!(
                    "ignoring negotiation with unknown type marker {:02x?} from {}",
                    marker, remote
                );
                return;
            }
            Some(media_type) => {
                match self.open_stream(media_type, media_hash, local_address, remote) {
                    Ok(()) => {
                        info!(
                            "accepted {} stream {} from {}",
                            media_type, media_hash, remote
                        );
                        true
                    }
                    Err(e) => {
                        debug!("rejecting {} stream {}: {}", media_type, media_hash, e);
                        false
                    }
                }
            }
        };

        self.reply(media_hash, sequence, accepted, remote);
    }

    fn open_stream(
        &self,
        media_type: MediaStreamType,
        media_hash: i32,
        local_address: Option<SocketAddr>,
        remote: SocketAddr,
    ) -> Result<()> {
        let factory = self.factory.read().clone();

        let mut builder = Receiver::builder(media_type, media_hash)
            .config(self.receiver_config.clone())
            .local_address(local_address)
            .remote_address(Some(remote));
        if let Some(factory) = &factory {
            builder = builder.transformer(factory.transformer(media_type, media_hash));
        }
        builder.build(&self.context)?;

        if let Some(processor) = factory.and_then(|f| {
            f.create_processor(media_type, media_hash, local_address, remote)
        }) {
            // The binding detaches itself when the receiver is destroyed
            ProcessorBinding::attach(&self.context, processor);
        }
        Ok(())
    }

    fn reply(&self, media_hash: i32, sequence: i64, accepted: bool, remote: SocketAddr) {
        let reply = match negotiation::encode_reply(media_hash, sequence, accepted) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("failed to encode negotiation reply: {}", e);
                return;
            }
        };

        let channel = self.channel.clone();
        tokio::spawn(async move {
            if let Err(e) = channel.send_to(reply, remote).await {
                warn!("failed to send negotiation reply to {}: {}", remote, e);
            }
        });
    }

    /// Fail every pending negotiation and leave the negotiation bus
    pub fn shutdown(&self) {
        self.context.negotiations().unregister(self.id);
        let hashes: Vec<i32> = self.pending.iter().map(|p| *p.key()).collect();
        for media_hash in hashes {
            if let Some((_, attempt)) = self.pending.remove(&media_hash) {
                attempt.state.send_replace(NegotiationState::Rejected);
            }
        }
    }
}

impl Handler<NegotiationEvent> for Negotiator {
    fn handle(&self, event: &NegotiationEvent) -> Result<()> {
        match *event {
            NegotiationEvent::Request {
                requested,
                marker,
                media_hash,
                sequence,
                local_address,
                remote_address,
            } => self.on_request(
                requested,
                marker,
                media_hash,
                sequence,
                local_address,
                remote_address,
            ),
            NegotiationEvent::Reply {
                media_hash,
                accepted,
                remote_address,
            } => self.on_reply(media_hash, accepted, remote_address),
            NegotiationEvent::Resolved { .. } => {}
        }
        Ok(())
    }
}
