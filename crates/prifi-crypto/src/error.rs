//! Cryptographic error types.

use thiserror::Error;

/// Errors from PriFi cryptographic operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Bytes do not encode a valid Ristretto255 point.
    #[error("invalid group element encoding")]
    InvalidPoint,

    /// Signature has the wrong length or does not verify.
    #[error("signature verification failed")]
    InvalidSignature,

    /// Payload does not fit into the cell.
    #[error("payload of {size} bytes exceeds cell size {max}")]
    PayloadTooLarge {
        /// Payload length.
        size: usize,
        /// Cell size.
        max: usize,
    },

    /// A cipher does not match the size of the round being decoded.
    #[error("cipher of {actual} bytes for a {expected}-byte cell")]
    CipherLength {
        /// Cell size of the round.
        expected: usize,
        /// Cipher length.
        actual: usize,
    },

    /// A decode accumulation was attempted before `decode_start`.
    #[error("cell decoding has not been started")]
    DecodeNotStarted,

    /// Shuffle input is unusable (empty key list, length mismatch).
    #[error("invalid shuffle input: {0}")]
    InvalidShuffleInput(String),

    /// Shuffle proof bytes cannot be parsed.
    #[error("malformed shuffle proof: {0}")]
    MalformedProof(String),

    /// A shuffle proof parsed but one of its checks failed.
    #[error("shuffle proof rejected at step {step}, round {round}")]
    ProofRejected {
        /// Step index in the transcript (0 for standalone proofs).
        step: usize,
        /// Cut-and-choose round that failed.
        round: usize,
    },
}
