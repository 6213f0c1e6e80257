//! Shroud Core
//!
//! Wire format and data model for the Shroud peer-to-peer media protocol.
//!
//! This crate provides:
//! - Media stream types and their wire markers ([`MediaStreamType`])
//! - Header, footer and ack encoding ([`wire`])
//! - The decoded chunk model and datagram classification ([`Chunk`], [`Packet`])
//! - Negotiation payload helpers ([`negotiation`])
//! - The payload transform hook ([`Transformer`])

pub mod chunk;
pub mod error;
pub mod media_hash;
pub mod media_type;
pub mod negotiation;
pub mod transform;
pub mod wire;

pub use chunk::{Chunk, ChunkBuilder, Packet};
pub use error::{Error, Result};
pub use media_type::MediaStreamType;
pub use transform::{IdentityTransformer, Transformer, XorTransformer};
pub use wire::{Ack, ChunkHeader, Footer, MessageExtension};
