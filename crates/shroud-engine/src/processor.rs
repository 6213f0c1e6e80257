//! Media processors
//!
//! A [`MediaProcessor`] is the application end of an inbound stream. It is
//! attached to a context through a [`ProcessorBinding`], which forwards
//! media results and receiver state changes for its (type, media hash) and
//! follows the receiver's lifecycle: OPEN opens the processor, CLOSE closes
//! it, DESTROY destroys it and detaches the binding.

use parking_lot::Mutex;
use shroud_core::{IdentityTransformer, MediaStreamType, Transformer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::bus::SubscriberId;
use crate::context::MediaContext;
use crate::error::{EngineError, Result};
use crate::events::{MediaResult, ReceiverState, ReceiverStateEvent};

/// Application-side consumer of one inbound stream
pub trait MediaProcessor: Send + Sync {
    fn media_type(&self) -> MediaStreamType;

    fn media_hash(&self) -> i32;

    fn local_address(&self) -> Option<SocketAddr> {
        None
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        None
    }

    /// Called for every reassembled message while the processor is open
    fn on_media_result(&self, result: &MediaResult) -> Result<()>;

    fn on_receiver_state_change(&self, _event: &ReceiverStateEvent) -> Result<()> {
        Ok(())
    }

    fn open(&self);

    fn close(&self);

    fn destroy(&self);

    fn is_open(&self) -> bool;
}

/// Creates processors and transforms for streams accepted during
/// negotiation
pub trait ProcessorFactory: Send + Sync {
    /// Processor for a newly accepted stream, or `None` to accept without
    /// one
    fn create_processor(
        &self,
        media_type: MediaStreamType,
        media_hash: i32,
        local_address: Option<SocketAddr>,
        remote_address: SocketAddr,
    ) -> Option<Arc<dyn MediaProcessor>>;

    /// Transform applied by the stream's receiver
    fn transformer(
        &self,
        _media_type: MediaStreamType,
        _media_hash: i32,
    ) -> Arc<dyn Transformer> {
        Arc::new(IdentityTransformer)
    }
}

/// Subscription of one processor to a context's buses
pub struct ProcessorBinding {
    context: Weak<MediaContext>,
    result_id: SubscriberId,
    state_id: SubscriberId,
    attached: Arc<AtomicBool>,
}

impl ProcessorBinding {
    /// Subscribe `processor` to results and state changes of its stream
    ///
    /// The processor is opened right away if its receiver already is.
    pub fn attach(context: &Arc<MediaContext>, processor: Arc<dyn MediaProcessor>) -> Self {
        let media_type = processor.media_type();
        let media_hash = processor.media_hash();
        let result_id = context.next_subscriber_id();
        let state_id = context.next_subscriber_id();
        let attached = Arc::new(AtomicBool::new(true));

        let results = processor.clone();
        context.media_results().register(
            result_id,
            Arc::new(move |result: &MediaResult| -> Result<()> {
                if result.is_applicable(media_type, media_hash) && results.is_open() {
                    results.on_media_result(result)?;
                }
                Ok(())
            }),
        );

        let weak_context = Arc::downgrade(context);
        let states = processor.clone();
        let flag = attached.clone();
        context.receiver_states().register(
            state_id,
            Arc::new(move |event: &ReceiverStateEvent| -> Result<()> {
                if !event.is_applicable(media_type, media_hash) {
                    return Ok(());
                }
                states.on_receiver_state_change(event)?;
                match event.state {
                    ReceiverState::Open => states.open(),
                    ReceiverState::Closed => states.close(),
                    ReceiverState::Destroyed => {
                        states.destroy();
                        if let Some(context) = weak_context.upgrade() {
                            detach(&context, &flag, result_id, state_id);
                        }
                    }
                }
                Ok(())
            }),
        );

        if context
            .receiver(media_hash)
            .is_some_and(|r| r.media_type() == media_type && r.is_open())
        {
            processor.open();
        }

        debug!("processor attached to {} stream {}", media_type, media_hash);
        Self {
            context: Arc::downgrade(context),
            result_id,
            state_id,
            attached,
        }
    }

    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Stop forwarding events; later calls do nothing
    pub fn detach(&self) {
        if let Some(context) = self.context.upgrade() {
            detach(&context, &self.attached, self.result_id, self.state_id);
        }
    }
}

fn detach(
    context: &MediaContext,
    attached: &AtomicBool,
    result_id: SubscriberId,
    state_id: SubscriberId,
) {
    if attached.swap(false, Ordering::AcqRel) {
        context.media_results().unregister(result_id);
        context.receiver_states().unregister(state_id);
    }
}

/// Open/closed/destroyed flags shared by the stock processors
struct ProcessorCore {
    media_type: MediaStreamType,
    media_hash: i32,
    local_address: Option<SocketAddr>,
    remote_address: Option<SocketAddr>,
    open: AtomicBool,
    destroyed: AtomicBool,
}

impl ProcessorCore {
    fn new(media_type: MediaStreamType, media_hash: i32) -> Self {
        Self {
            media_type,
            media_hash,
            local_address: None,
            remote_address: None,
            open: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        }
    }

    fn open(&self) {
        if !self.destroyed.load(Ordering::Acquire) {
            self.open.store(true, Ordering::Release);
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    fn destroy(&self) -> bool {
        self.open.store(false, Ordering::Release);
        !self.destroyed.swap(true, Ordering::AcqRel)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// Forwards every result into an mpsc channel
pub struct ChannelProcessor {
    core: ProcessorCore,
    tx: mpsc::UnboundedSender<MediaResult>,
}

impl ChannelProcessor {
    pub fn new(
        media_type: MediaStreamType,
        media_hash: i32,
        tx: mpsc::UnboundedSender<MediaResult>,
    ) -> Self {
        Self {
            core: ProcessorCore::new(media_type, media_hash),
            tx,
        }
    }

    /// A processor together with the receiving end of its channel
    pub fn channel(
        media_type: MediaStreamType,
        media_hash: i32,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<MediaResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self::new(media_type, media_hash, tx)), rx)
    }

    pub fn with_addresses(
        mut self,
        local: Option<SocketAddr>,
        remote: Option<SocketAddr>,
    ) -> Self {
        self.core.local_address = local;
        self.core.remote_address = remote;
        self
    }
}

impl MediaProcessor for ChannelProcessor {
    fn media_type(&self) -> MediaStreamType {
        self.core.media_type
    }

    fn media_hash(&self) -> i32 {
        self.core.media_hash
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.core.local_address
    }

    fn remote_address(&self) -> Option<SocketAddr> {
        self.core.remote_address
    }

    fn on_media_result(&self, result: &MediaResult) -> Result<()> {
        self.tx
            .send(result.clone())
            .map_err(|_| EngineError::Handler("result channel closed".into()))
    }

    fn open(&self) {
        self.core.open();
    }

    fn close(&self) {
        self.core.close();
    }

    fn destroy(&self) {
        if self.core.destroy() {
            debug!("channel processor {} destroyed", self.core.media_hash);
        }
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }
}

type ResultCallback = Box<dyn Fn(&MediaResult) + Send + Sync>;

/// Calls a closure for every result
pub struct CallbackProcessor {
    core: ProcessorCore,
    callback: ResultCallback,
    on_destroy: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CallbackProcessor {
    pub fn new<F>(media_type: MediaStreamType, media_hash: i32, callback: F) -> Self
    where
        F: Fn(&MediaResult) + Send + Sync + 'static,
    {
        Self {
            core: ProcessorCore::new(media_type, media_hash),
            callback: Box::new(callback),
            on_destroy: Mutex::new(None),
        }
    }

    /// Run `f` once when the processor is destroyed
    pub fn on_destroy<F>(self, f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        *self.on_destroy.lock() = Some(Box::new(f));
        self
    }
}

impl MediaProcessor for CallbackProcessor {
    fn media_type(&self) -> MediaStreamType {
        self.core.media_type
    }

    fn media_hash(&self) -> i32 {
        self.core.media_hash
    }

    fn on_media_result(&self, result: &MediaResult) -> Result<()> {
        (self.callback)(result);
        Ok(())
    }

    fn open(&self) {
        self.core.open();
    }

    fn close(&self) {
        self.core.close();
    }

    fn destroy(&self) {
        if self.core.destroy() {
            if let Some(f) = self.on_destroy.lock().take() {
                f();
            }
        }
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }
}

/// Factory that funnels every accepted stream of the given types into one
/// channel
pub struct ForwardingFactory {
    types: Vec<MediaStreamType>,
    tx: mpsc::UnboundedSender<MediaResult>,
}

impl ForwardingFactory {
    pub fn new(types: Vec<MediaStreamType>) -> (Self, mpsc::UnboundedReceiver<MediaResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { types, tx }, rx)
    }
}

impl ProcessorFactory for ForwardingFactory {
    fn create_processor(
        &self,
        media_type: MediaStreamType,
        media_hash: i32,
        local_address: Option<SocketAddr>,
        remote_address: SocketAddr,
    ) -> Option<Arc<dyn MediaProcessor>> {
        if !self.types.contains(&media_type) {
            return None;
        }
        Some(Arc::new(
            ChannelProcessor::new(media_type, media_hash, self.tx.clone())
                .with_addresses(local_address, Some(remote_address)),
        ))
    }
}
