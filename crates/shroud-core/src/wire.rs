//! Binary header/footer encoding and decoding
//!
//! Shroud chunk format (all integers big-endian):
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ Bytes 0-3:    Type marker (MediaStreamType ordinal, int32)      │
//! │ Bytes 4-5:    Header length (int16, >= 18)                      │
//! │ Bytes 6-9:    Media hash (int32)                                │
//! │ Bytes 10-17:  Sequence (int64)                                  │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ [If header length >= 23] Message extension                      │
//! │ Bytes 18-21:  Message hash (int32)                              │
//! │ Byte 22:      Flags  [0] ack required  [7:1] reserved           │
//! │ Bytes 23..:   Application custom header                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │ Bytes [header length..]: Payload                                │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Footer format (exactly 8 bytes):
//! ```text
//! ┌──────────────────────────────────────────┬──────────────────────┐
//! │ Bytes 0-3: i32::MAX - type ordinal       │ Bytes 4-7: media hash│
//! └──────────────────────────────────────────┴──────────────────────┘
//! ```
//!
//! Acknowledgement format (exactly 16 bytes):
//! ```text
//! ┌──────────────────────┬──────────────────────┬─────────────────────┐
//! │ Bytes 0-3: -1        │ Bytes 4-7: media hash│ Bytes 8-15: sequence│
//! └──────────────────────┴──────────────────────┴─────────────────────┘
//! ```

use crate::{Error, MediaStreamType, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Size of the fixed base header
pub const BASE_HEADER_SIZE: usize = 18;

/// Size of the standard message extension
pub const EXTENSION_SIZE: usize = 5;

/// Header size with the message extension and no custom header
pub const EXTENDED_HEADER_SIZE: usize = BASE_HEADER_SIZE + EXTENSION_SIZE;

/// Largest header length the signed 16-bit field can carry
pub const MAX_HEADER_SIZE: usize = i16::MAX as usize;

/// Exact size of a footer
pub const FOOTER_SIZE: usize = 8;

/// Exact size of an acknowledgement
pub const ACK_SIZE: usize = 16;

/// Marker opening an acknowledgement datagram
pub const ACK_MARKER: i32 = -1;

/// Extension flag: receiver must acknowledge this chunk
pub const FLAG_ACK_REQUIRED: u8 = 0x01;

/// The fixed 18-byte base header of every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub media_type: MediaStreamType,
    pub header_length: usize,
    pub media_hash: i32,
    pub sequence: i64,
}

impl ChunkHeader {
    pub fn new(media_type: MediaStreamType, media_hash: i32, sequence: i64) -> Self {
        Self {
            media_type,
            header_length: BASE_HEADER_SIZE,
            media_hash,
            sequence,
        }
    }

    /// Set the total header length (base header plus any extension)
    pub fn with_header_length(mut self, header_length: usize) -> Self {
        self.header_length = header_length;
        self
    }

    /// Encode the base header into `buf`
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        if self.header_length < BASE_HEADER_SIZE {
            return Err(Error::InvalidFormat(format!(
                "header length {} below minimum {}",
                self.header_length, BASE_HEADER_SIZE
            )));
        }
        if self.header_length > MAX_HEADER_SIZE {
            return Err(Error::HeaderTooLarge(self.header_length));
        }

        buf.reserve(BASE_HEADER_SIZE);
        buf.put_i32(self.media_type.header_marker());
        buf.put_i16(self.header_length as i16);
        buf.put_i32(self.media_hash);
        buf.put_i64(self.sequence);
        Ok(())
    }

    /// Decode the base header from the start of `buf`
    ///
    /// Fails with [`Error::UnknownType`] when the discriminator matches no
    /// header marker, which callers treat as "not applicable".
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < BASE_HEADER_SIZE {
            return Err(Error::BufferTooSmall {
                needed: BASE_HEADER_SIZE,
                have: buf.len(),
            });
        }

        let mut cursor = buf;
        let marker = [cursor[0], cursor[1], cursor[2], cursor[3]];
        let media_type = MediaStreamType::from_header_marker(marker)
            .ok_or_else(|| Error::UnknownType(u32::from_be_bytes(marker)))?;
        cursor.advance(4);

        let header_length = cursor.get_i16();
        if header_length < BASE_HEADER_SIZE as i16 {
            return Err(Error::InvalidFormat(format!(
                "header length {} below minimum {}",
                header_length, BASE_HEADER_SIZE
            )));
        }
        let header_length = header_length as usize;
        if header_length > buf.len() {
            return Err(Error::InvalidFormat(format!(
                "header length {} exceeds buffer of {} bytes",
                header_length,
                buf.len()
            )));
        }

        let media_hash = cursor.get_i32();
        let sequence = cursor.get_i64();

        Ok(Self {
            media_type,
            header_length,
            media_hash,
            sequence,
        })
    }
}

/// Standard custom-header segment carried by data chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageExtension {
    pub message_hash: i32,
    pub ack_required: bool,
}

impl MessageExtension {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32(self.message_hash);
        buf.put_u8(if self.ack_required { FLAG_ACK_REQUIRED } else { 0 });
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < EXTENSION_SIZE {
            return Err(Error::BufferTooSmall {
                needed: EXTENSION_SIZE,
                have: buf.len(),
            });
        }
        let message_hash = buf.get_i32();
        let flags = buf.get_u8();
        Ok(Self {
            message_hash,
            ack_required: flags & FLAG_ACK_REQUIRED != 0,
        })
    }
}

/// End-of-message / stream-termination marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Footer {
    pub media_type: MediaStreamType,
    pub media_hash: i32,
}

impl Footer {
    pub fn new(media_type: MediaStreamType, media_hash: i32) -> Self {
        Self {
            media_type,
            media_hash,
        }
    }

    /// The generic "terminate stream" footer for `media_hash`
    pub fn termination(media_hash: i32) -> Self {
        Self::new(MediaStreamType::Negotiation, media_hash)
    }

    /// Whether this footer terminates the whole stream rather than
    /// ending one message
    pub fn is_termination(&self) -> bool {
        self.media_type == MediaStreamType::Negotiation
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(FOOTER_SIZE);
        buf.put_i32(self.media_type.footer_marker());
        buf.put_i32(self.media_hash);
        buf.freeze()
    }

    /// Decode a footer; anything not exactly 8 bytes is not a footer
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(Error::InvalidFormat(format!(
                "not a footer: {} bytes (expected {})",
                buf.len(),
                FOOTER_SIZE
            )));
        }

        let marker = [buf[0], buf[1], buf[2], buf[3]];
        let media_type = MediaStreamType::from_footer_marker(marker)
            .ok_or_else(|| Error::UnknownType(u32::from_be_bytes(marker)))?;
        let media_hash = i32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);

        Ok(Self {
            media_type,
            media_hash,
        })
    }

    /// Cheap check used before attempting a full decode
    pub fn looks_like_footer(buf: &[u8]) -> bool {
        buf.len() == FOOTER_SIZE
            && MediaStreamType::from_footer_marker([buf[0], buf[1], buf[2], buf[3]]).is_some()
    }
}

/// Application-level acknowledgement of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ack {
    pub media_hash: i32,
    pub sequence: i64,
}

impl Ack {
    pub fn new(media_hash: i32, sequence: i64) -> Self {
        Self {
            media_hash,
            sequence,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(ACK_SIZE);
        buf.put_i32(ACK_MARKER);
        buf.put_i32(self.media_hash);
        buf.put_i64(self.sequence);
        buf.freeze()
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() != ACK_SIZE {
            return Err(Error::InvalidFormat(format!(
                "not an ack: {} bytes (expected {})",
                buf.len(),
                ACK_SIZE
            )));
        }
        let marker = buf.get_i32();
        if marker != ACK_MARKER {
            return Err(Error::UnknownType(marker as u32));
        }
        Ok(Self {
            media_hash: buf.get_i32(),
            sequence: buf.get_i64(),
        })
    }

    pub fn looks_like_ack(buf: &[u8]) -> bool {
        buf.len() == ACK_SIZE && buf[..4] == ACK_MARKER.to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut buf = BytesMut::new();
        ChunkHeader::new(MediaStreamType::Text, 0x0102_0304, 5)
            .encode(&mut buf)
            .unwrap();

        assert_eq!(buf.len(), BASE_HEADER_SIZE);
        assert_eq!(&buf[0..4], &[0, 0, 0, 3]);
        assert_eq!(&buf[4..6], &[0, 18]);
        assert_eq!(&buf[6..10], &[1, 2, 3, 4]);
        assert_eq!(&buf[10..18], &[0, 0, 0, 0, 0, 0, 0, 5]);
    }

    #[test]
    fn test_header_too_large_rejected() {
        let mut buf = BytesMut::new();
        let header = ChunkHeader::new(MediaStreamType::Binary, 1, 1).with_header_length(40_000);
        assert_eq!(header.encode(&mut buf), Err(Error::HeaderTooLarge(40_000)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_footer_layout() {
        let footer = Footer::new(MediaStreamType::Audio, 42).encode();
        assert_eq!(&footer[..], &[0x7f, 0xff, 0xff, 0xff, 0, 0, 0, 42]);
    }

    #[test]
    fn test_footer_requires_exact_length() {
        let mut bytes = Footer::new(MediaStreamType::Video, 7).encode().to_vec();
        bytes.push(0);
        assert!(matches!(Footer::decode(&bytes), Err(Error::InvalidFormat(_))));
        assert!(!Footer::looks_like_footer(&bytes));
    }

    #[test]
    fn test_extension_flags() {
        let mut buf = BytesMut::new();
        MessageExtension {
            message_hash: -9,
            ack_required: true,
        }
        .encode(&mut buf);
        assert_eq!(buf[4], FLAG_ACK_REQUIRED);

        let decoded = MessageExtension::decode(&buf).unwrap();
        assert_eq!(decoded.message_hash, -9);
        assert!(decoded.ack_required);
    }

    #[test]
    fn test_ack_is_distinguishable() {
        let ack = Ack::new(11, 99).encode();
        assert!(Ack::looks_like_ack(&ack));
        assert!(!Footer::looks_like_footer(&ack));
        assert_eq!(Ack::decode(&ack).unwrap(), Ack::new(11, 99));
    }
}
