//! Chunk model and datagram classification
//!
//! A [`Chunk`] is the decoded form of one wire-framed fragment of a
//! message. Chunks are immutable once parsed; reassembly orders them by
//! sequence number.

use crate::wire::{
    Ack, ChunkHeader, Footer, MessageExtension, BASE_HEADER_SIZE, EXTENDED_HEADER_SIZE,
};
use crate::{Error, MediaStreamType, Result};
use bytes::{Bytes, BytesMut};
use std::cmp::Ordering;
use std::net::SocketAddr;

/// One decoded wire chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub media_type: MediaStreamType,
    pub header_length: usize,
    pub media_hash: i32,
    pub message_hash: i32,
    pub sequence: i64,
    pub ack_required: bool,
    pub data: Bytes,
    pub custom_header: Bytes,
    pub channel_port: u16,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
}

impl Chunk {
    /// Parse raw bytes into a chunk
    ///
    /// When `expected` is given, a chunk of any other type fails with
    /// [`Error::InvalidFormat`].
    pub fn parse(raw: Bytes, expected: Option<MediaStreamType>) -> Result<Self> {
        let header = ChunkHeader::decode(&raw)?;

        if let Some(expected) = expected {
            if header.media_type != expected {
                return Err(Error::InvalidFormat(format!(
                    "expected {} chunk, got {}",
                    expected, header.media_type
                )));
            }
        }

        let (extension, custom_header) = match header.header_length {
            BASE_HEADER_SIZE => (MessageExtension::default(), Bytes::new()),
            len if len < EXTENDED_HEADER_SIZE => {
                return Err(Error::InvalidFormat(format!(
                    "header length {} cuts the message extension short",
                    len
                )));
            }
            len => (
                MessageExtension::decode(&raw[BASE_HEADER_SIZE..EXTENDED_HEADER_SIZE])?,
                raw.slice(EXTENDED_HEADER_SIZE..len),
            ),
        };

        Ok(Self {
            media_type: header.media_type,
            header_length: header.header_length,
            media_hash: header.media_hash,
            message_hash: extension.message_hash,
            sequence: header.sequence,
            ack_required: extension.ack_required,
            data: raw.slice(header.header_length..),
            custom_header,
            channel_port: 0,
            local_address: None,
            remote_address: None,
        })
    }

    /// Attach the channel the chunk arrived on
    pub fn with_route(
        mut self,
        channel_port: u16,
        local_address: Option<SocketAddr>,
        remote_address: Option<SocketAddr>,
    ) -> Self {
        self.channel_port = channel_port;
        self.local_address = local_address;
        self.remote_address = remote_address;
        self
    }

    /// Three-way comparison by sequence number
    pub fn cmp_sequence(&self, other: &Chunk) -> Ordering {
        self.sequence.cmp(&other.sequence)
    }

    /// The universal delivery filter
    pub fn is_applicable(&self, media_type: MediaStreamType, media_hash: i32) -> bool {
        self.media_type == media_type && self.media_hash == media_hash
    }
}

/// Builder that frames a payload into chunk bytes
#[derive(Debug, Clone)]
pub struct ChunkBuilder {
    media_type: MediaStreamType,
    media_hash: i32,
    sequence: i64,
    extension: Option<MessageExtension>,
    custom_header: Bytes,
    data: Bytes,
}

impl ChunkBuilder {
    pub fn new(media_type: MediaStreamType, media_hash: i32, sequence: i64) -> Self {
        Self {
            media_type,
            media_hash,
            sequence,
            extension: None,
            custom_header: Bytes::new(),
            data: Bytes::new(),
        }
    }

    /// Attach the message extension
    pub fn message(mut self, message_hash: i32, ack_required: bool) -> Self {
        self.extension = Some(MessageExtension {
            message_hash,
            ack_required,
        });
        self
    }

    /// Attach an application custom header; implies the message extension
    pub fn custom_header(mut self, custom_header: impl Into<Bytes>) -> Self {
        self.custom_header = custom_header.into();
        self
    }

    pub fn data(mut self, data: impl Into<Bytes>) -> Self {
        self.data = data.into();
        self
    }

    pub fn header_length(&self) -> usize {
        if self.extension.is_some() || !self.custom_header.is_empty() {
            EXTENDED_HEADER_SIZE + self.custom_header.len()
        } else {
            BASE_HEADER_SIZE
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        let header_length = self.header_length();
        let mut buf = BytesMut::with_capacity(header_length + self.data.len());

        ChunkHeader::new(self.media_type, self.media_hash, self.sequence)
            .with_header_length(header_length)
            .encode(&mut buf)?;

        if header_length > BASE_HEADER_SIZE {
            self.extension.unwrap_or_default().encode(&mut buf);
            buf.extend_from_slice(&self.custom_header);
        }

        buf.extend_from_slice(&self.data);
        Ok(buf.freeze())
    }
}

/// A classified inbound datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Chunk(Chunk),
    Footer(Footer),
    Ack(Ack),
}

impl Packet {
    /// Classify and decode a datagram
    ///
    /// Footers (8 bytes) and acks (16 bytes) are recognised by exact
    /// length; both are shorter than the minimum header.
    pub fn decode(raw: Bytes) -> Result<Self> {
        if Ack::looks_like_ack(&raw) {
            return Ack::decode(&raw).map(Packet::Ack);
        }
        if raw.len() == crate::wire::FOOTER_SIZE {
            return Footer::decode(&raw).map(Packet::Footer);
        }
        Chunk::parse(raw, None).map(Packet::Chunk)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_chunk_roundtrip() {
        let encoded = ChunkBuilder::new(MediaStreamType::Negotiation, 42, 1)
            .data(vec![0, 0, 0, 3])
            .encode()
            .unwrap();
        assert_eq!(encoded.len(), BASE_HEADER_SIZE + 4);

        let chunk = Chunk::parse(encoded, Some(MediaStreamType::Negotiation)).unwrap();
        assert_eq!(chunk.header_length, BASE_HEADER_SIZE);
        assert_eq!(chunk.message_hash, 0);
        assert!(!chunk.ack_required);
        assert!(chunk.custom_header.is_empty());
        assert_eq!(chunk.data.as_ref(), &[0, 0, 0, 3]);
    }

    #[test]
    fn test_extended_chunk_with_custom_header() {
        let encoded = ChunkBuilder::new(MediaStreamType::Video, 9, 77)
            .message(5, true)
            .custom_header(b"hdr".as_slice())
            .data(b"frame".as_slice())
            .encode()
            .unwrap();

        let chunk = Chunk::parse(encoded, None).unwrap();
        assert_eq!(chunk.header_length, EXTENDED_HEADER_SIZE + 3);
        assert_eq!(chunk.message_hash, 5);
        assert!(chunk.ack_required);
        assert_eq!(chunk.custom_header.as_ref(), b"hdr");
        assert_eq!(chunk.data.as_ref(), b"frame");
    }

    #[test]
    fn test_type_mismatch_is_invalid() {
        let encoded = ChunkBuilder::new(MediaStreamType::Audio, 1, 1)
            .data(b"x".as_slice())
            .encode()
            .unwrap();
        assert!(matches!(
            Chunk::parse(encoded, Some(MediaStreamType::Video)),
            Err(Error::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_cmp_sequence_across_large_gap() {
        let low = Chunk::parse(
            ChunkBuilder::new(MediaStreamType::Binary, 1, i64::MIN + 1).encode().unwrap(),
            None,
        )
        .unwrap();
        let high = Chunk::parse(
            ChunkBuilder::new(MediaStreamType::Binary, 1, i64::MAX).encode().unwrap(),
            None,
        )
        .unwrap();
        assert_eq!(low.cmp_sequence(&high), Ordering::Less);
        assert_eq!(high.cmp_sequence(&low), Ordering::Greater);
    }

    #[test]
    fn test_packet_classification() {
        let footer = Footer::new(MediaStreamType::Text, 3).encode();
        assert!(matches!(Packet::decode(footer), Ok(Packet::Footer(_))));

        let ack = Ack::new(3, 4).encode();
        assert!(matches!(Packet::decode(ack), Ok(Packet::Ack(_))));

        let chunk = ChunkBuilder::new(MediaStreamType::Text, 3, 4).encode().unwrap();
        assert!(matches!(Packet::decode(chunk), Ok(Packet::Chunk(_))));
    }
}
