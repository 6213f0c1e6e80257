//! Chunk reassembly
//!
//! A [`Receiver`] collects the chunks of one inbound stream, keyed by
//! message hash and ordered by sequence number, and publishes each message
//! on the media-result bus once its footer has been seen.
//!
//! ```text
//!   CLOSED ──first chunk──► OPEN ──termination footer / destroy()──► DESTROYED
//!     ▲                      │
//!     └──transform failure───┘
//! ```
//!
//! Footers carry no message hash. Sequence numbers rise across the whole
//! stream, so each footer finalizes the buffered message with the lowest
//! sequence. Chunks at or below the last finalized sequence are dropped.
//! A footer that overtakes every chunk of its message is held until the
//! next message starts.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use shroud_core::{Chunk, Footer, IdentityTransformer, MediaStreamType, Transformer};
use std::collections::{hash_map, BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

use crate::bus::{panic_message, Handler, SubscriberId};
use crate::config::ReceiverConfig;
use crate::context::MediaContext;
use crate::error::{EngineError, Result};
use crate::events::{ArrivalEvent, MediaResult, ReceiverState, ReceiverStateEvent};

/// Outcome of buffering one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Buffered {
    /// First chunk of a message not seen before
    NewMessage,
    /// Another chunk of a message already buffered
    Added,
    /// Sequence already buffered
    Duplicate,
    /// Sequence at or below a message that was already finalized
    Stale,
}

/// Per-message chunk buffers
#[derive(Default)]
struct MessageBuffers {
    messages: HashMap<i32, BTreeMap<i64, Arc<Chunk>>>,
    /// (lowest buffered sequence, message hash), in finalize order
    order: BTreeSet<(i64, i32)>,
    /// Highest sequence of any finalized message
    finalized_through: Option<i64>,
    /// Footers waiting to finalize a buffered message
    footers: usize,
    /// A footer that found nothing buffered and waits for the next message
    held_footer: bool,
}

impl MessageBuffers {
    fn insert(&mut self, chunk: &Arc<Chunk>) -> Buffered {
        if self.finalized_through.is_some_and(|seq| chunk.sequence <= seq) {
            return Buffered::Stale;
        }

        let (set, fresh) = match self.messages.entry(chunk.message_hash) {
            hash_map::Entry::Occupied(slot) => (slot.into_mut(), false),
            hash_map::Entry::Vacant(slot) => (slot.insert(BTreeMap::new()), true),
        };
        if set.contains_key(&chunk.sequence) {
            return Buffered::Duplicate;
        }

        let previous_low = set.keys().next().copied();
        set.insert(chunk.sequence, chunk.clone());
        match previous_low {
            Some(low) if low < chunk.sequence => {}
            Some(low) => {
                self.order.remove(&(low, chunk.message_hash));
                self.order.insert((chunk.sequence, chunk.message_hash));
            }
            None => {
                self.order.insert((chunk.sequence, chunk.message_hash));
            }
        }

        if fresh {
            Buffered::NewMessage
        } else {
            Buffered::Added
        }
    }

    /// Turn a held footer into a waiting one; true if there was one
    fn release_held_footer(&mut self) -> bool {
        if !self.held_footer {
            return false;
        }
        self.held_footer = false;
        self.footers += 1;
        true
    }

    /// Remove the message with the lowest sequence if a footer is waiting
    ///
    /// A footer that finds nothing buffered is held for the next message
    /// instead of being spent. At most one footer is held.
    fn take_completed(&mut self) -> Option<(i32, BTreeMap<i64, Arc<Chunk>>)> {
        if self.footers == 0 {
            return None;
        }
        self.footers -= 1;

        let Some((_, message_hash)) = self.order.pop_first() else {
            self.held_footer = true;
            return None;
        };
        let set = self.messages.remove(&message_hash)?;
        if let Some(&last) = set.keys().next_back() {
            self.finalized_through = Some(self.finalized_through.map_or(last, |s| s.max(last)));
        }
        Some((message_hash, set))
    }

    fn clear(&mut self) {
        self.messages.clear();
        self.order.clear();
        self.footers = 0;
        self.held_footer = false;
    }
}

/// Reassembly engine for one inbound stream
pub struct Receiver {
    id: SubscriberId,
    media_type: MediaStreamType,
    media_hash: i32,
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
    state: Mutex<ReceiverState>,
    buffers: Mutex<MessageBuffers>,
    transformer: Arc<dyn Transformer>,
    finalize_delay: Option<Duration>,
    context: Arc<MediaContext>,
    this: Weak<Receiver>,
}

impl Receiver {
    pub fn builder(media_type: MediaStreamType, media_hash: i32) -> ReceiverBuilder {
        ReceiverBuilder::new(media_type, media_hash)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn media_type(&self) -> MediaStreamType {
        self.media_type
    }

    pub fn media_hash(&self) -> i32 {
        self.media_hash
    }

    pub fn local_address(&self) -> Option<SocketAddr> {
        self.local_address
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ReceiverState::Open
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == ReceiverState::Destroyed
    }

    /// Messages with at least one buffered chunk
    pub fn pending_messages(&self) -> usize {
        self.buffers.lock().messages.len()
    }

    /// Close the receiver; the next chunk reopens it
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state != ReceiverState::Open {
                return;
            }
            *state = ReceiverState::Closed;
        }
        debug!("receiver {} closed", self.media_hash);
        self.publish_state(ReceiverState::Closed);
    }

    /// Tear the receiver down
    ///
    /// Unregisters from the arrival bus and the context and drops buffered
    /// chunks. DESTROY is published once every result finalized before
    /// this call has been delivered. Later calls do nothing.
    pub fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state == ReceiverState::Destroyed {
                return;
            }
            *state = ReceiverState::Destroyed;
        }

        self.context.arrivals().unregister(self.id);
        self.context.remove_receiver(self.media_hash, self.id);
        self.buffers.lock().clear();
        debug!("receiver {} destroyed", self.media_hash);

        // Results already queued must reach processors before they detach
        let event = self.state_event(ReceiverState::Destroyed);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let context = self.context.clone();
                runtime.spawn(async move {
                    context.media_results().flush().await;
                    context.receiver_states().publish(event);
                });
            }
            Err(_) => self.context.receiver_states().publish(event),
        }
    }

    fn accept_chunk(&self, chunk: &Arc<Chunk>) {
        let opened = {
            let mut state = self.state.lock();
            match *state {
                ReceiverState::Destroyed => return,
                ReceiverState::Closed => {
                    *state = ReceiverState::Open;
                    true
                }
                ReceiverState::Open => false,
            }
        };
        if opened {
            debug!("receiver {} opened", self.media_hash);
            self.publish_state(ReceiverState::Open);
        }

        let (buffered, released) = {
            let mut buffers = self.buffers.lock();
            let buffered = buffers.insert(chunk);
            let released =
                buffered == Buffered::NewMessage && buffers.release_held_footer();
            (buffered, released)
        };
        match buffered {
            Buffered::Duplicate => debug!(
                "receiver {} ignoring duplicate sequence {}",
                self.media_hash, chunk.sequence
            ),
            Buffered::Stale => debug!(
                "receiver {} dropping sequence {} of finalized message {}",
                self.media_hash, chunk.sequence, chunk.message_hash
            ),
            Buffered::NewMessage | Buffered::Added => {}
        }
        if released {
            self.schedule_finalize();
        }
    }

    fn accept_footer(&self, footer: &Footer) {
        if footer.is_termination() {
            // Anything already closed by a footer is still delivered
            while self.buffers.lock().footers > 0 {
                self.finalize_next();
            }
            self.destroy();
            return;
        }
        if footer.media_type != self.media_type {
            return;
        }

        self.buffers.lock().footers += 1;
        self.schedule_finalize();
    }

    fn schedule_finalize(&self) {
        match self.finalize_delay {
            None => self.finalize_next(),
            Some(delay) => {
                let this = self.this.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(receiver) = this.upgrade() {
                        if !receiver.is_destroyed() {
                            receiver.finalize_next();
                        }
                    }
                });
            }
        }
    }

    /// Reassemble the lowest-sequence completed message and publish it
    fn finalize_next(&self) {
        let Some((message_hash, set)) = self.buffers.lock().take_completed() else {
            debug!(
                "receiver {} holding a footer until its message arrives",
                self.media_hash
            );
            return;
        };

        let remote_address = set
            .values()
            .find_map(|chunk| chunk.remote_address)
            .or(self.remote_address);

        let mut payload = BytesMut::with_capacity(set.values().map(|c| c.data.len()).sum());
        for chunk in set.values() {
            payload.extend_from_slice(&chunk.data);
        }

        match self.apply_transform(payload.freeze()) {
            Ok(payload) if payload.is_empty() => {
                debug!(
                    "receiver {} message {} transformed to nothing",
                    self.media_hash, message_hash
                );
            }
            Ok(payload) => {
                self.context.media_results().publish(MediaResult {
                    media_type: self.media_type,
                    media_hash: self.media_hash,
                    message_hash,
                    payload,
                    remote_address,
                });
            }
            Err(e) => {
                warn!(
                    "receiver {} transform failed, closing: {}",
                    self.media_hash, e
                );
                self.close();
            }
        }
    }

    fn apply_transform(&self, payload: Bytes) -> Result<Bytes> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.transformer.transform(payload, self.media_hash)
        }));
        match outcome {
            Ok(result) => Ok(result?),
            Err(panic) => Err(shroud_core::Error::Transform(format!(
                "transformer panicked: {}",
                panic_message(panic.as_ref())
            ))
            .into()),
        }
    }

    fn state_event(&self, state: ReceiverState) -> ReceiverStateEvent {
        ReceiverStateEvent {
            media_type: self.media_type,
            media_hash: self.media_hash,
            state,
        }
    }

    fn publish_state(&self, state: ReceiverState) {
        self.context
            .receiver_states()
            .publish(self.state_event(state));
    }
}

impl Handler<ArrivalEvent> for Receiver {
    fn handle(&self, event: &ArrivalEvent) -> Result<()> {
        // Events queued before unregistration can still land here
        if self.is_destroyed() {
            return Ok(());
        }

        match event {
            ArrivalEvent::Chunk(chunk) => {
                if chunk.is_applicable(self.media_type, self.media_hash) {
                    self.accept_chunk(chunk);
                }
            }
            ArrivalEvent::Footer { footer, .. } => {
                if footer.media_hash == self.media_hash {
                    self.accept_footer(footer);
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("id", &self.id)
            .field("media_type", &self.media_type)
            .field("media_hash", &self.media_hash)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Receiver`]
pub struct ReceiverBuilder {
    media_type: MediaStreamType,
    media_hash: i32,
    config: ReceiverConfig,
    transformer: Arc<dyn Transformer>,
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
}

impl ReceiverBuilder {
    pub fn new(media_type: MediaStreamType, media_hash: i32) -> Self {
        Self {
            media_type,
            media_hash,
            config: ReceiverConfig::default(),
            transformer: Arc::new(IdentityTransformer),
            local_address: None,
            remote_address: None,
        }
    }

    pub fn config(mut self, config: ReceiverConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the payload transform applied at finalization
    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn local_address(mut self, addr: Option<SocketAddr>) -> Self {
        self.local_address = addr;
        self
    }

    pub fn remote_address(mut self, addr: Option<SocketAddr>) -> Self {
        self.remote_address = addr;
        self
    }

    /// Create the receiver and subscribe it to the context's arrival bus
    ///
    /// Fails when the type is not a media type or another receiver already
    /// owns the media hash.
    pub fn build(self, context: &Arc<MediaContext>) -> Result<Arc<Receiver>> {
        if !self.media_type.is_media() {
            return Err(EngineError::InvalidState(format!(
                "cannot receive a {} stream",
                self.media_type
            )));
        }

        let id = context.next_subscriber_id();
        let receiver = Arc::new_cyclic(|this| Receiver {
            id,
            media_type: self.media_type,
            media_hash: self.media_hash,
            local_address: self.local_address,
            remote_address: self.remote_address,
            state: Mutex::new(ReceiverState::Closed),
            buffers: Mutex::new(MessageBuffers::default()),
            transformer: self.transformer,
            finalize_delay: self.config.finalize_delay(),
            context: context.clone(),
            this: this.clone(),
        });

        context.insert_receiver(receiver.clone())?;
        context.arrivals().register(id, receiver.clone());

        debug!(
            "receiver {} created for {} stream",
            receiver.media_hash, receiver.media_type
        );
        Ok(receiver)
    }
}
