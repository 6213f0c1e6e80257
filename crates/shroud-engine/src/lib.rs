//! Shroud Engine
//!
//! The engine turns a datagram channel into media streams:
//! - Routes decoded datagrams onto typed event buses
//! - Reassembles inbound chunks into messages (receivers)
//! - Negotiates new streams with remote peers
//! - Frames and paces outbound payloads (streamers)
//!
//! All shared state lives in a [`MediaContext`]; an [`Endpoint`] owns one
//! context together with its channel.
//!
//! # Buses
//!
//! | Bus | Event | Delivery |
//! |---|---|---|
//! | chunk-arrival | [`ArrivalEvent`] | queued |
//! | receiver-state | [`ReceiverStateEvent`] | inline |
//! | media-result | [`MediaResult`] | queued |
//! | negotiation | [`NegotiationEvent`] | inline |
//! | streamer-state | [`StreamerStateEvent`] | inline |

pub mod bus;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod negotiation;
pub mod processor;
pub mod receiver;
pub mod streamer;

pub use bus::{Bus, DeliveryMode, Handler, SubscriberId};
pub use config::{EngineConfig, NegotiationConfig, ReceiverConfig, StreamerConfig};
pub use context::MediaContext;
pub use endpoint::Endpoint;
pub use error::{EngineError, Result};
pub use events::{
    ArrivalEvent, MediaResult, NegotiationEvent, NegotiationState, ReceiverState,
    ReceiverStateEvent, StreamerNotice, StreamerState, StreamerStateEvent,
};
pub use negotiation::{NegotiationHandle, Negotiator};
pub use processor::{
    CallbackProcessor, ChannelProcessor, ForwardingFactory, MediaProcessor, ProcessorBinding,
    ProcessorFactory,
};
pub use receiver::{Receiver, ReceiverBuilder};
pub use streamer::{GeneratorSource, PayloadSource, QueueSource, Streamer, StreamerBuilder};
