//! Protocol error types

use thiserror::Error;

/// Report-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Output payload does not fit the fixed report buffer
    #[error("Payload too large: {len} bytes (max: {max})")]
    PayloadTooLarge { len: usize, max: usize },

    /// Output report given as malformed hex
    #[error("Invalid hex payload: {0:?}")]
    InvalidHex(String),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
