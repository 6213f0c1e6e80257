//! Outbound streams
//!
//! A [`Streamer`] owns one outbound media hash. A single worker task pulls
//! payloads from a [`PayloadSource`], frames them into chunks and hands
//! them to a [`DeliveryPipe`], which applies pacing, footers and acks.
//!
//! ```text
//!   CREATED ──start()──► STREAMING ◄──start()── STOPPED
//!                           │ stop()               ▲
//!                           └──────────────────────┘
//!   any ──destroy()──► DESTROYED
//! ```

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use shroud_core::{ChunkBuilder, Footer, IdentityTransformer, MediaStreamType, Transformer};
use shroud_transport::{
    AckTracker, Channel, DeliveryConfig, DeliveryPipe, OutboundChunk, Pacing, TransportError,
};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::StreamerConfig;
use crate::context::MediaContext;
use crate::error::{EngineError, Result};
use crate::events::{StreamerNotice, StreamerState, StreamerStateEvent};

/// Where a streamer gets its payloads
#[async_trait]
pub trait PayloadSource: Send + Sync {
    /// Next payload to send; `None` ends the stream
    async fn next_payload(&self) -> Option<Bytes>;

    /// Whether the underlying resource can currently produce payloads
    fn is_streamable(&self) -> bool {
        true
    }
}

/// Bounded queue fed by the application
pub struct QueueSource {
    tx: mpsc::Sender<Bytes>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
}

impl QueueSource {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
        }
    }

    /// Enqueue a payload, waiting while the queue is full
    pub async fn push(&self, payload: Bytes) -> Result<()> {
        self.tx
            .send(payload)
            .await
            .map_err(|_| EngineError::from(TransportError::ChannelClosed))
    }
}

#[async_trait]
impl PayloadSource for QueueSource {
    async fn next_payload(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }
}

/// Payloads produced by a closure, e.g. a capture device read
pub struct GeneratorSource<F> {
    generate: Mutex<F>,
}

impl<F> GeneratorSource<F>
where
    F: FnMut() -> Option<Bytes> + Send,
{
    pub fn new(generate: F) -> Self {
        Self {
            generate: Mutex::new(generate),
        }
    }
}

#[async_trait]
impl<F> PayloadSource for GeneratorSource<F>
where
    F: FnMut() -> Option<Bytes> + Send,
{
    async fn next_payload(&self) -> Option<Bytes> {
        let payload = (self.generate.lock())();
        // Keep a tight generator from starving the runtime
        tokio::task::yield_now().await;
        payload
    }
}

struct Worker {
    stop: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

/// Producer and pacing engine for one outbound stream
pub struct Streamer {
    id: u64,
    media_type: MediaStreamType,
    media_hash: i32,
    remote: SocketAddr,
    max_chunk_payload: usize,
    context: Arc<MediaContext>,
    source: Arc<dyn PayloadSource>,
    queue: Option<Arc<QueueSource>>,
    transformer: Arc<dyn Transformer>,
    pipe: RwLock<Option<Arc<DeliveryPipe>>>,
    state: Mutex<StreamerState>,
    worker: Mutex<Option<Worker>>,
    sequence: AtomicI64,
    message: AtomicI32,
    queued: AtomicUsize,
    idle: Notify,
}

impl Streamer {
    pub fn builder(
        media_type: MediaStreamType,
        media_hash: i32,
        remote: SocketAddr,
    ) -> StreamerBuilder {
        StreamerBuilder::new(media_type, media_hash, remote)
    }

    /// Unique within the owning context
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn media_type(&self) -> MediaStreamType {
        self.media_type
    }

    pub fn media_hash(&self) -> i32 {
        self.media_hash
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote
    }

    pub fn state(&self) -> StreamerState {
        *self.state.lock()
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == StreamerState::Destroyed
    }

    fn pipe(&self) -> Result<Arc<DeliveryPipe>> {
        self.pipe
            .read()
            .clone()
            .ok_or_else(|| EngineError::Destroyed(format!("streamer {}", self.id)))
    }

    /// Current send path settings
    pub fn delivery_config(&self) -> Result<DeliveryConfig> {
        Ok(self.pipe()?.config())
    }

    /// The active send path, for its counters and settings
    pub fn delivery(&self) -> Result<Arc<DeliveryPipe>> {
        self.pipe()
    }

    pub async fn set_pacing(&self, pacing: Pacing) -> Result<()> {
        self.pipe()?.set_pacing(pacing).await;
        Ok(())
    }

    pub fn set_footer(&self, footer: bool) -> Result<()> {
        self.pipe()?.set_footer(footer);
        Ok(())
    }

    pub fn set_ack_required(&self, ack_required: bool) -> Result<()> {
        self.pipe()?.set_ack_required(ack_required);
        Ok(())
    }

    pub fn set_concurrency(&self, concurrency: usize) -> Result<()> {
        self.pipe()?.set_concurrency(concurrency);
        Ok(())
    }

    /// Queue a payload for sending
    ///
    /// Only streamers built on the internal queue accept payloads this way.
    pub async fn send(&self, payload: impl Into<Bytes>) -> Result<()> {
        if self.is_destroyed() {
            return Err(EngineError::Destroyed(format!("streamer {}", self.id)));
        }
        let queue = self.queue.as_ref().ok_or_else(|| {
            EngineError::InvalidState(format!("streamer {} has an external source", self.id))
        })?;

        self.queued.fetch_add(1, Ordering::AcqRel);
        if let Err(e) = queue.push(payload.into()).await {
            self.payload_done();
            return Err(e);
        }
        Ok(())
    }

    /// Wait until every queued payload has been sent and acknowledged
    ///
    /// Only returns once the streamer has been started.
    pub async fn drain(&self) -> Result<()> {
        loop {
            let idle = self.idle.notified();
            if self.queued.load(Ordering::Acquire) == 0 {
                break;
            }
            if self.is_destroyed() {
                return Err(EngineError::Destroyed(format!("streamer {}", self.id)));
            }
            idle.await;
        }
        self.pipe()?.flush().await;
        Ok(())
    }

    /// Start (or resume) the producer loop
    pub fn start(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.lock();
            match *state {
                StreamerState::Destroyed => {
                    return Err(EngineError::Destroyed(format!("streamer {}", self.id)));
                }
                StreamerState::Streaming => return Ok(()),
                StreamerState::Created | StreamerState::Stopped => {}
            }

            let previous = self.worker.lock().take().map(|w| w.handle);
            let (stop_tx, stop_rx) = oneshot::channel();
            let handle = tokio::spawn(self.clone().run(previous, stop_rx));
            *self.worker.lock() = Some(Worker {
                stop: Some(stop_tx),
                handle,
            });
            *state = StreamerState::Streaming;
        }

        debug!("streamer {} started", self.id);
        self.notify(StreamerNotice::Start);
        Ok(())
    }

    /// Pause the producer loop
    ///
    /// A payload already being sent is finished; nothing else is pulled
    /// from the source until the next `start`.
    pub fn stop(&self) {
        {
            let mut state = self.state.lock();
            if *state != StreamerState::Streaming {
                return;
            }
            if let Some(worker) = self.worker.lock().as_mut() {
                if let Some(stop) = worker.stop.take() {
                    let _ = stop.send(());
                }
            }
            *state = StreamerState::Stopped;
        }

        debug!("streamer {} stopped", self.id);
        self.notify(StreamerNotice::Stop);
    }

    /// Tear the streamer down
    ///
    /// Aborts the producer loop, tells the remote receiver the stream is
    /// over and releases the send path. Later calls do nothing.
    pub async fn destroy(&self) {
        {
            let mut state = self.state.lock();
            if *state == StreamerState::Destroyed {
                return;
            }
            *state = StreamerState::Destroyed;
        }

        if let Some(worker) = self.worker.lock().take() {
            worker.handle.abort();
        }

        let pipe = self.pipe.write().take();
        if let Some(pipe) = pipe {
            if let Err(e) = pipe.send_footer(Footer::termination(self.media_hash)).await {
                debug!(
                    "streamer {} could not send termination footer: {}",
                    self.id, e
                );
            }
        }

        self.queued.store(0, Ordering::Release);
        self.idle.notify_waiters();

        debug!("streamer {} destroyed", self.id);
        self.notify(StreamerNotice::Destroy);
    }

    async fn run(
        self: Arc<Self>,
        previous: Option<JoinHandle<()>>,
        mut stop: oneshot::Receiver<()>,
    ) {
        // Let a stopped worker finish its last send first
        if let Some(previous) = previous {
            let _ = previous.await;
        }

        loop {
            if !self.source.is_streamable() {
                debug!("streamer {} source is not streamable", self.id);
                break;
            }

            let payload = tokio::select! {
                biased;
                _ = &mut stop => return,
                payload = self.source.next_payload() => payload,
            };
            let Some(payload) = payload else {
                debug!("streamer {} source exhausted", self.id);
                break;
            };

            let result = self.send_payload(payload).await;
            if self.queue.is_some() {
                self.payload_done();
            }

            match result {
                Ok(()) => {}
                Err(EngineError::Transport(TransportError::ChannelClosed))
                | Err(EngineError::Destroyed(_)) => break,
                Err(e) => warn!("streamer {} failed to send payload: {}", self.id, e),
            }
        }

        self.finish();
    }

    /// The loop ended on its own
    fn finish(&self) {
        {
            let mut state = self.state.lock();
            if *state != StreamerState::Streaming {
                return;
            }
            *state = StreamerState::Stopped;
        }
        self.notify(StreamerNotice::Stop);
    }

    async fn send_payload(&self, payload: Bytes) -> Result<()> {
        let pipe = self.pipe()?;
        let payload = self.transformer.transform(payload, self.media_hash)?;
        let message_hash = self.message.fetch_add(1, Ordering::Relaxed);
        let ack_required = pipe.config().ack_required;

        let chunks = self.frame(&payload, message_hash, ack_required)?;
        pipe.send_message(chunks, Footer::new(self.media_type, self.media_hash))
            .await?;
        Ok(())
    }

    /// Split a payload into framed chunks of at most `max_chunk_payload`
    /// bytes each; an empty payload still yields one chunk
    fn frame(
        &self,
        payload: &Bytes,
        message_hash: i32,
        ack_required: bool,
    ) -> Result<Vec<OutboundChunk>> {
        let size = self.max_chunk_payload.max(1);
        let count = payload.len().div_ceil(size).max(1);

        (0..count)
            .map(|i| -> Result<OutboundChunk> {
                let start = (i * size).min(payload.len());
                let end = (start + size).min(payload.len());
                let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);

                let bytes = ChunkBuilder::new(self.media_type, self.media_hash, sequence)
                    .message(message_hash, ack_required)
                    .data(payload.slice(start..end))
                    .encode()?;
                Ok(OutboundChunk {
                    bytes,
                    media_hash: self.media_hash,
                    sequence,
                    ack_required,
                })
            })
            .collect()
    }

    fn payload_done(&self) {
        let previous = self
            .queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .unwrap_or(0);
        if previous <= 1 {
            self.idle.notify_waiters();
        }
    }

    fn notify(&self, notice: StreamerNotice) {
        self.context
            .streamer_states()
            .publish(StreamerStateEvent {
                streamer_id: self.id,
                media_type: self.media_type,
                media_hash: self.media_hash,
                notice,
            });
    }
}

impl std::fmt::Debug for Streamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Streamer")
            .field("id", &self.id)
            .field("media_type", &self.media_type)
            .field("media_hash", &self.media_hash)
            .field("remote", &self.remote)
            .field("state", &self.state())
            .finish()
    }
}

/// Builder for [`Streamer`]
pub struct StreamerBuilder {
    media_type: MediaStreamType,
    media_hash: i32,
    remote: SocketAddr,
    config: StreamerConfig,
    transformer: Arc<dyn Transformer>,
    source: Option<Arc<dyn PayloadSource>>,
}

impl StreamerBuilder {
    pub fn new(media_type: MediaStreamType, media_hash: i32, remote: SocketAddr) -> Self {
        Self {
            media_type,
            media_hash,
            remote,
            config: StreamerConfig::default(),
            transformer: Arc::new(IdentityTransformer),
            source: None,
        }
    }

    pub fn config(mut self, config: StreamerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn pacing(mut self, pacing: Pacing) -> Self {
        self.config.delivery.pacing = pacing;
        self
    }

    /// Set the payload transform applied before framing
    pub fn transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    /// Pull payloads from `source` instead of the internal queue
    pub fn source(mut self, source: Arc<dyn PayloadSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Create the streamer and announce it on the streamer-state bus
    pub fn build(
        self,
        context: &Arc<MediaContext>,
        channel: Arc<dyn Channel>,
        acks: Arc<AckTracker>,
    ) -> Result<Arc<Streamer>> {
        if !self.media_type.is_media() {
            return Err(EngineError::InvalidState(format!(
                "cannot stream a {} stream",
                self.media_type
            )));
        }
        if !channel.is_open() {
            return Err(TransportError::ChannelClosed.into());
        }

        let (source, queue) = match self.source {
            Some(source) => (source, None),
            None => {
                let queue = Arc::new(QueueSource::new(self.config.queue_capacity));
                (queue.clone() as Arc<dyn PayloadSource>, Some(queue))
            }
        };

        let pipe = DeliveryPipe::new(channel, self.remote, self.config.delivery.clone(), acks);

        let streamer = Arc::new(Streamer {
            id: context.next_streamer_id(),
            media_type: self.media_type,
            media_hash: self.media_hash,
            remote: self.remote,
            max_chunk_payload: self.config.max_chunk_payload,
            context: context.clone(),
            source,
            queue,
            transformer: self.transformer,
            pipe: RwLock::new(Some(Arc::new(pipe))),
            state: Mutex::new(StreamerState::Created),
            worker: Mutex::new(None),
            sequence: AtomicI64::new(1),
            message: AtomicI32::new(1),
            queued: AtomicUsize::new(0),
            idle: Notify::new(),
        });

        debug!(
            "streamer {} created for {} stream {} to {}",
            streamer.id, streamer.media_type, streamer.media_hash, streamer.remote
        );
        streamer.notify(StreamerNotice::Add);
        Ok(streamer)
    }
}
