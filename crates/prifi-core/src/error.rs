//! Error types for the PriFi protocol core.
//!
//! One taxonomy for all three roles. Handlers return these to their
//! dispatcher, which decides between logging and dropping the message
//! (non-fatal) and halting the protocol instance (fatal, see
//! [`ProtocolError::is_fatal`]).

use prifi_crypto::CryptoError;
use prifi_proto::{MessageKind, Round};
use thiserror::Error;

use crate::peer::Peer;

/// Errors raised by the relay, client and trustee state machines.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Message is valid but not expected in the current state.
    #[error("{role} in state {state} cannot handle {}", .kind.name())]
    StateViolation {
        /// Role that received the message.
        role: &'static str,
        /// State at the time of receipt.
        state: &'static str,
        /// Kind of the offending message.
        kind: MessageKind,
    },

    /// A trustee signature over the final shuffle does not verify, or a
    /// signature set is incomplete.
    #[error("invalid shuffle signature from trustee {trustee_id}")]
    SignatureInvalid {
        /// Trustee whose signature failed.
        trustee_id: u32,
    },

    /// A chained shuffle proof failed, or a trustee could not find its own
    /// contribution in the transcript.
    #[error("shuffle verification failed: {0}")]
    ShuffleVerificationFailure(String),

    /// Decoded cell has the wrong length.
    #[error("decoded cell is {actual} bytes, expected {expected}")]
    SizeMismatch {
        /// Negotiated upstream cell size.
        expected: usize,
        /// Length of the decoded cell.
        actual: usize,
    },

    /// Client's ephemeral key is absent from the final shuffle output.
    #[error("client {client_id} not found in shuffle output")]
    SlotNotFound {
        /// Client that could not locate itself.
        client_id: u32,
    },

    /// Client cipher tagged with a round other than the current one.
    #[error("cipher for round {received}, current round is {expected}")]
    RoundMismatch {
        /// Current round.
        expected: Round,
        /// Round carried by the message.
        received: Round,
    },

    /// Trustee cipher for a round that is already finalized.
    #[error("cipher for finalized round {received}, current round is {current}")]
    StaleRound {
        /// Current round.
        current: Round,
        /// Round carried by the message.
        received: Round,
    },

    /// Second contribution of the same kind from the same peer.
    #[error("duplicate {} from {from}", .kind.name())]
    Duplicate {
        /// Sender of the duplicate.
        from: Peer,
        /// Kind of the duplicated message.
        kind: MessageKind,
    },

    /// Payload does not fit into a cell.
    #[error("payload of {size} bytes exceeds cell size {max}")]
    PayloadTooLarge {
        /// Payload length.
        size: usize,
        /// Cell size.
        max: usize,
    },

    /// Message failed a sanity check (ids, list lengths, parameters).
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Round counter cannot advance any further.
    #[error("round counter exhausted")]
    RoundOverflow,

    /// Cryptographic primitive rejected peer data.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl ProtocolError {
    /// Whether the protocol instance must halt.
    ///
    /// Fatal errors leave the run without a way to continue: signatures or
    /// shuffles that fail to verify, cells that decode to the wrong size, or
    /// invalid key material. Recovery requires a fresh setup (key
    /// re-collection and re-shuffle). Every other class is logged and the
    /// offending message dropped.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SignatureInvalid { .. }
                | Self::ShuffleVerificationFailure(_)
                | Self::SizeMismatch { .. }
                | Self::RoundOverflow
                | Self::Crypto(_)
        )
    }
}
