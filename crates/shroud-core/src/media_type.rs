//! Media stream types and their wire markers
//!
//! The ordinal order of [`MediaStreamType`] is part of the wire contract:
//! every header starts with the ordinal, every footer with
//! `i32::MAX - ordinal`. Reordering the variants breaks interoperability.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of media carried by a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(i32)]
pub enum MediaStreamType {
    Audio = 0,
    Binary = 1,
    File = 2,
    Text = 3,
    Video = 4,
    /// Stream negotiation requests. Its footer doubles as the
    /// stream-termination signal for any media hash.
    Negotiation = 5,
    /// Negotiation replies (1-byte accept/reject payload)
    NegotiationAck = 6,
}

impl MediaStreamType {
    /// All variants in ordinal order
    pub const ALL: [MediaStreamType; 7] = [
        MediaStreamType::Audio,
        MediaStreamType::Binary,
        MediaStreamType::File,
        MediaStreamType::Text,
        MediaStreamType::Video,
        MediaStreamType::Negotiation,
        MediaStreamType::NegotiationAck,
    ];

    pub fn ordinal(self) -> i32 {
        self as i32
    }

    /// Marker written at the start of every chunk header
    pub fn header_marker(self) -> i32 {
        self.ordinal()
    }

    /// Marker written at the start of every footer
    pub fn footer_marker(self) -> i32 {
        i32::MAX - self.ordinal()
    }

    pub fn header_marker_bytes(self) -> [u8; 4] {
        self.header_marker().to_be_bytes()
    }

    pub fn footer_marker_bytes(self) -> [u8; 4] {
        self.footer_marker().to_be_bytes()
    }

    pub fn from_ordinal(val: i32) -> Option<Self> {
        match val {
            0 => Some(MediaStreamType::Audio),
            1 => Some(MediaStreamType::Binary),
            2 => Some(MediaStreamType::File),
            3 => Some(MediaStreamType::Text),
            4 => Some(MediaStreamType::Video),
            5 => Some(MediaStreamType::Negotiation),
            6 => Some(MediaStreamType::NegotiationAck),
            _ => None,
        }
    }

    /// Exact comparison of a 4-byte discriminator against every header marker
    pub fn from_header_marker(marker: [u8; 4]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.header_marker_bytes() == marker)
    }

    /// Exact comparison of a 4-byte discriminator against every footer marker
    pub fn from_footer_marker(marker: [u8; 4]) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|t| t.footer_marker_bytes() == marker)
    }

    /// Whether this type carries application media (as opposed to
    /// negotiation control traffic)
    pub fn is_media(self) -> bool {
        !matches!(
            self,
            MediaStreamType::Negotiation | MediaStreamType::NegotiationAck
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MediaStreamType::Audio => "audio",
            MediaStreamType::Binary => "binary",
            MediaStreamType::File => "file",
            MediaStreamType::Text => "text",
            MediaStreamType::Video => "video",
            MediaStreamType::Negotiation => "negotiation",
            MediaStreamType::NegotiationAck => "negotiation_ack",
        }
    }
}

impl fmt::Display for MediaStreamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MediaStreamType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::Error::InvalidFormat(format!("unknown media type: {}", s)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ordinals_are_contractual() {
        assert_eq!(MediaStreamType::Audio.ordinal(), 0);
        assert_eq!(MediaStreamType::Binary.ordinal(), 1);
        assert_eq!(MediaStreamType::File.ordinal(), 2);
        assert_eq!(MediaStreamType::Text.ordinal(), 3);
        assert_eq!(MediaStreamType::Video.ordinal(), 4);
        assert_eq!(MediaStreamType::Negotiation.ordinal(), 5);
        assert_eq!(MediaStreamType::NegotiationAck.ordinal(), 6);
    }

    #[test]
    fn test_header_and_footer_markers_never_collide() {
        for a in MediaStreamType::ALL {
            for b in MediaStreamType::ALL {
                assert_ne!(a.header_marker(), b.footer_marker(), "{} vs {}", a, b);
            }
        }
    }

    #[test]
    fn test_marker_lookup() {
        for t in MediaStreamType::ALL {
            assert_eq!(MediaStreamType::from_header_marker(t.header_marker_bytes()), Some(t));
            assert_eq!(MediaStreamType::from_footer_marker(t.footer_marker_bytes()), Some(t));
        }
        assert_eq!(MediaStreamType::from_header_marker([0, 0, 0, 7]), None);
        assert_eq!(MediaStreamType::from_footer_marker([0, 0, 0, 0]), None);
    }

    #[test]
    fn test_parse_name() {
        assert_eq!("TEXT".parse::<MediaStreamType>().unwrap(), MediaStreamType::Text);
        assert_eq!(
            "negotiation_ack".parse::<MediaStreamType>().unwrap(),
            MediaStreamType::NegotiationAck
        );
        assert!("subtitle".parse::<MediaStreamType>().is_err());
    }
}
