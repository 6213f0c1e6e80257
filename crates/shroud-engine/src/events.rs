//! Event kinds carried by the dispatch fabric
//!
//! Each bus carries exactly one of these types. Handlers match on the
//! variants they care about and filter by (type, media hash) themselves.

use bytes::Bytes;
use shroud_core::{Chunk, Footer, MediaStreamType};
use std::net::SocketAddr;
use std::sync::Arc;

/// Chunk-arrival bus event
#[derive(Debug, Clone)]
pub enum ArrivalEvent {
    /// A decoded data chunk
    Chunk(Arc<Chunk>),
    /// An end-of-message or stream-termination footer
    Footer {
        footer: Footer,
        remote_address: SocketAddr,
    },
}

impl ArrivalEvent {
    pub fn media_hash(&self) -> i32 {
        match self {
            ArrivalEvent::Chunk(chunk) => chunk.media_hash,
            ArrivalEvent::Footer { footer, .. } => footer.media_hash,
        }
    }
}

/// Lifecycle state of a receiver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReceiverState {
    Closed,
    Open,
    Destroyed,
}

/// Receiver-state bus event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverStateEvent {
    pub media_type: MediaStreamType,
    pub media_hash: i32,
    pub state: ReceiverState,
}

impl ReceiverStateEvent {
    pub fn is_applicable(&self, media_type: MediaStreamType, media_hash: i32) -> bool {
        self.media_type == media_type && self.media_hash == media_hash
    }
}

/// Media-result bus event: one reassembled message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaResult {
    pub media_type: MediaStreamType,
    pub media_hash: i32,
    pub message_hash: i32,
    pub payload: Bytes,
    pub remote_address: Option<SocketAddr>,
}

impl MediaResult {
    pub fn is_applicable(&self, media_type: MediaStreamType, media_hash: i32) -> bool {
        self.media_type == media_type && self.media_hash == media_hash
    }
}

/// Outcome of a negotiation as seen by the initiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    Idle,
    Requested,
    Accepted,
    /// Explicit rejection or no reply within the timeout
    Rejected,
}

impl NegotiationState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NegotiationState::Accepted | NegotiationState::Rejected)
    }
}

/// Negotiation bus event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiationEvent {
    /// A remote peer asks to open a stream towards us
    Request {
        /// `None` when the requested marker names no known type
        requested: Option<MediaStreamType>,
        marker: [u8; 4],
        media_hash: i32,
        sequence: i64,
        local_address: Option<SocketAddr>,
        remote_address: SocketAddr,
    },
    /// A remote peer answered one of our requests
    Reply {
        media_hash: i32,
        accepted: bool,
        remote_address: SocketAddr,
    },
    /// A locally initiated negotiation reached a terminal state
    Resolved {
        media_hash: i32,
        state: NegotiationState,
    },
}

/// Lifecycle state of a streamer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamerState {
    Created,
    Streaming,
    Stopped,
    Destroyed,
}

/// Streamer-state notification kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamerNotice {
    Add,
    Start,
    Stop,
    Destroy,
}

/// Streamer-state bus event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamerStateEvent {
    pub streamer_id: u64,
    pub media_type: MediaStreamType,
    pub media_hash: i32,
    pub notice: StreamerNotice,
}
