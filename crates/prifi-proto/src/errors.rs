//! Wire-level error types.

use thiserror::Error;

/// Result alias for encoding and decoding.
pub type Result<T> = std::result::Result<T, WireError>;

/// Errors from encoding or decoding messages.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// Body exceeds [`crate::message::MAX_MESSAGE_SIZE`].
    #[error("message of {size} bytes exceeds maximum {max}")]
    MessageTooLarge {
        /// Body length.
        size: usize,
        /// Allowed maximum.
        max: usize,
    },

    /// Tag byte does not name a message kind.
    #[error("unknown message kind 0x{0:02x}")]
    UnknownKind(u8),

    /// CBOR serialization failed.
    #[error("CBOR encode error: {0}")]
    CborEncode(String),

    /// CBOR parsing failed or the body does not match the kind.
    #[error("CBOR decode error: {0}")]
    CborDecode(String),
}
