//! Negotiation payloads
//!
//! A NEGOTIATION chunk carries the requested type's 4-byte header marker,
//! tagged with the candidate media hash. A NEGOTIATION_ACK chunk carries a
//! single boolean byte (non-zero = accepted).

use crate::{Chunk, ChunkBuilder, Error, MediaStreamType, Result};
use bytes::Bytes;

/// Frame a negotiation request for `requested` on `media_hash`
pub fn encode_request(requested: MediaStreamType, media_hash: i32, sequence: i64) -> Result<Bytes> {
    ChunkBuilder::new(MediaStreamType::Negotiation, media_hash, sequence)
        .data(requested.header_marker_bytes().to_vec())
        .encode()
}

/// Frame a negotiation reply
pub fn encode_reply(media_hash: i32, sequence: i64, accepted: bool) -> Result<Bytes> {
    ChunkBuilder::new(MediaStreamType::NegotiationAck, media_hash, sequence)
        .data(vec![accepted as u8])
        .encode()
}

/// Raw 4-byte marker of the requested type
pub fn requested_marker(chunk: &Chunk) -> Result<[u8; 4]> {
    if chunk.media_type != MediaStreamType::Negotiation {
        return Err(Error::InvalidFormat(format!(
            "expected negotiation chunk, got {}",
            chunk.media_type
        )));
    }
    if chunk.data.len() != 4 {
        return Err(Error::InvalidFormat(format!(
            "negotiation payload must be 4 bytes, got {}",
            chunk.data.len()
        )));
    }
    Ok([chunk.data[0], chunk.data[1], chunk.data[2], chunk.data[3]])
}

/// Requested type of a negotiation chunk
///
/// An unrecognized marker fails with [`Error::UnknownType`].
pub fn requested_type(chunk: &Chunk) -> Result<MediaStreamType> {
    let marker = requested_marker(chunk)?;
    MediaStreamType::from_header_marker(marker)
        .ok_or_else(|| Error::UnknownType(u32::from_be_bytes(marker)))
}

/// Accept flag of a negotiation reply
pub fn is_accepted(chunk: &Chunk) -> Result<bool> {
    if chunk.media_type != MediaStreamType::NegotiationAck {
        return Err(Error::InvalidFormat(format!(
            "expected negotiation ack chunk, got {}",
            chunk.media_type
        )));
    }
    match chunk.data.first() {
        Some(flag) if chunk.data.len() == 1 => Ok(*flag != 0),
        _ => Err(Error::InvalidFormat(format!(
            "negotiation ack payload must be 1 byte, got {}",
            chunk.data.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_roundtrip() {
        let raw = encode_request(MediaStreamType::Text, 42, 1).unwrap();
        let chunk = Chunk::parse(raw, Some(MediaStreamType::Negotiation)).unwrap();
        assert_eq!(chunk.media_hash, 42);
        assert_eq!(requested_type(&chunk).unwrap(), MediaStreamType::Text);
    }

    #[test]
    fn test_unknown_requested_type() {
        let raw = ChunkBuilder::new(MediaStreamType::Negotiation, 1, 1)
            .data(vec![0, 0, 0, 99])
            .encode()
            .unwrap();
        let chunk = Chunk::parse(raw, None).unwrap();
        assert_eq!(requested_type(&chunk), Err(Error::UnknownType(99)));
    }

    #[test]
    fn test_reply_flag() {
        for accepted in [true, false] {
            let raw = encode_reply(7, 2, accepted).unwrap();
            let chunk = Chunk::parse(raw, None).unwrap();
            assert_eq!(is_accepted(&chunk).unwrap(), accepted);
        }
    }
}
