//! Protocol error types

use thiserror::Error;

/// Wire-level decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Descriptor record with a zero or overrunning bLength
    #[error("Malformed descriptor at offset {offset}")]
    MalformedDescriptor { offset: usize },

    /// Endpoint address with reserved bits set
    #[error("Invalid endpoint address: {0:#04x}")]
    InvalidEndpoint(u8),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
