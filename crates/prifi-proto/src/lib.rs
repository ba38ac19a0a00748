//! PriFi protocol messages.
//!
//! Defines every message exchanged between the relay, clients and trustees,
//! plus the run parameters broadcast at setup. Bodies are CBOR-encoded; the
//! variant is identified by a one-byte [`MessageKind`] carried next to the
//! body by whatever framing the transport uses.
//!
//! Group elements travel as 32-byte compressed encodings and are only
//! validated by the receiving state machine, so this crate stays free of
//! cryptographic dependencies.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod errors;
pub mod message;
pub mod params;

pub use errors::{Result, WireError};
pub use message::{
    ClientKeys, DownstreamData, FinalShuffle, KeyBytes, Message, MessageKind, ShuffleRequest,
    ShuffleResult, ShuffleSignature, Transcript, TrusteeCipher, TrusteeKeys, TrusteePublicKey,
    UpstreamData,
};
pub use params::{ProtocolParams, ShuffleBase};

/// Round number. Authoritative at the relay, advisory everywhere else.
pub type Round = i32;
