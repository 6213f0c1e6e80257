//! Engine error types

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("core protocol error: {0}")]
    Core(#[from] shroud_core::Error),

    #[error("transport error: {0}")]
    Transport(#[from] shroud_transport::TransportError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("media hash {0} already has an active receiver")]
    DuplicateMediaHash(i32),

    #[error("media hash {0} is already being negotiated")]
    NegotiationPending(i32),

    #[error("negotiation for media hash {0} was rejected")]
    Rejected(i32),

    #[error("{0} has been destroyed")]
    Destroyed(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("engine error: {0}")]
    Other(String),
}
