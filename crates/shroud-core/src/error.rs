//! Error types for Shroud core

use thiserror::Error;

/// Result type alias for Shroud core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Shroud core error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The 4-byte discriminator matched no known type marker
    #[error("unknown media type marker: 0x{0:08x}")]
    UnknownType(u32),

    /// Structurally invalid chunk or footer
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// Buffer shorter than a declared region
    #[error("buffer too small: need {needed} bytes, have {have}")]
    BufferTooSmall { needed: usize, have: usize },

    /// Header length does not fit the signed 16-bit wire field
    #[error("header too large: {0} bytes (max 32767)")]
    HeaderTooLarge(usize),

    /// A payload transform failed
    #[error("transform error: {0}")]
    Transform(String),
}

impl Error {
    /// Whether the error means "this datagram is not for us" rather than
    /// a corrupted one
    pub fn is_not_applicable(&self) -> bool {
        matches!(self, Error::UnknownType(_))
    }
}
