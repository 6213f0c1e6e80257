//! Media context
//!
//! A [`MediaContext`] owns the five buses, the id counters and the registry
//! of active receivers. Everything that used to be process-global lives
//! here, so independent contexts never see each other's events.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::bus::{Bus, SubscriberId};
use crate::error::{EngineError, Result};
use crate::events::{
    ArrivalEvent, MediaResult, NegotiationEvent, ReceiverStateEvent, StreamerStateEvent,
};
use crate::receiver::Receiver;

/// Buses, counters and receiver registry for one endpoint
pub struct MediaContext {
    arrivals: Bus<ArrivalEvent>,
    receiver_states: Bus<ReceiverStateEvent>,
    media_results: Bus<MediaResult>,
    negotiations: Bus<NegotiationEvent>,
    streamer_states: Bus<StreamerStateEvent>,
    subscriber_ids: Arc<AtomicU64>,
    streamer_ids: AtomicU64,
    receivers: DashMap<i32, Arc<Receiver>>,
}

impl MediaContext {
    /// Create a context
    ///
    /// Chunk-arrival and media-result delivery run on their own worker
    /// tasks, so this must be called inside a Tokio runtime.
    pub fn new() -> Arc<Self> {
        let ids = Arc::new(AtomicU64::new(0));
        Arc::new(Self {
            arrivals: Bus::queued("chunk-arrival", ids.clone()),
            receiver_states: Bus::inline("receiver-state", ids.clone()),
            media_results: Bus::queued("media-result", ids.clone()),
            negotiations: Bus::inline("negotiation", ids.clone()),
            streamer_states: Bus::inline("streamer-state", ids.clone()),
            subscriber_ids: ids,
            streamer_ids: AtomicU64::new(0),
            receivers: DashMap::new(),
        })
    }

    pub fn arrivals(&self) -> &Bus<ArrivalEvent> {
        &self.arrivals
    }

    pub fn receiver_states(&self) -> &Bus<ReceiverStateEvent> {
        &self.receiver_states
    }

    pub fn media_results(&self) -> &Bus<MediaResult> {
        &self.media_results
    }

    pub fn negotiations(&self) -> &Bus<NegotiationEvent> {
        &self.negotiations
    }

    pub fn streamer_states(&self) -> &Bus<StreamerStateEvent> {
        &self.streamer_states
    }

    /// Allocate an id usable on any bus of this context
    pub fn next_subscriber_id(&self) -> SubscriberId {
        self.subscriber_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn next_streamer_id(&self) -> u64 {
        self.streamer_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Wait until both queued buses have drained what was published so far
    pub async fn flush(&self) {
        self.arrivals.flush().await;
        self.media_results.flush().await;
    }

    /// Active receiver for a media hash
    pub fn receiver(&self, media_hash: i32) -> Option<Arc<Receiver>> {
        self.receivers.get(&media_hash).map(|r| r.clone())
    }

    pub fn has_receiver(&self, media_hash: i32) -> bool {
        self.receivers.contains_key(&media_hash)
    }

    pub fn receivers(&self) -> Vec<Arc<Receiver>> {
        self.receivers.iter().map(|r| r.value().clone()).collect()
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    pub(crate) fn insert_receiver(&self, receiver: Arc<Receiver>) -> Result<()> {
        match self.receivers.entry(receiver.media_hash()) {
            Entry::Occupied(_) => Err(EngineError::DuplicateMediaHash(receiver.media_hash())),
            Entry::Vacant(slot) => {
                slot.insert(receiver);
                Ok(())
            }
        }
    }

    pub(crate) fn remove_receiver(&self, media_hash: i32, id: SubscriberId) {
        self.receivers.remove_if(&media_hash, |_, r| r.id() == id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::DeliveryMode;

    #[tokio::test]
    async fn test_bus_modes() {
        let context = MediaContext::new();
        assert_eq!(context.arrivals().mode(), DeliveryMode::Queued);
        assert_eq!(context.media_results().mode(), DeliveryMode::Queued);
        assert_eq!(context.receiver_states().mode(), DeliveryMode::Inline);
        assert_eq!(context.negotiations().mode(), DeliveryMode::Inline);
        assert_eq!(context.streamer_states().mode(), DeliveryMode::Inline);
    }

    #[tokio::test]
    async fn test_ids_are_unique_across_buses() {
        let context = MediaContext::new();
        let a = context.arrivals().next_id();
        let b = context.negotiations().next_id();
        let c = context.next_subscriber_id();
        assert!(a != b && b != c && a != c);
    }

    #[tokio::test]
    async fn test_contexts_are_isolated() {
        let first = MediaContext::new();
        let second = MediaContext::new();
        assert_eq!(first.next_streamer_id(), 1);
        assert_eq!(second.next_streamer_id(), 1);
        assert_eq!(first.next_streamer_id(), 2);
    }
}
