//! PriFi Cryptographic Primitives
//!
//! Cryptographic building blocks for the PriFi anonymity protocol. Pure
//! functions and small stateful objects with deterministic outputs. Callers
//! provide random bytes (or seeds) so protocol logic stays testable.
//!
//! # Key Lifecycle
//!
//! Every participant owns a long-term Ristretto255 keypair. Clients and
//! trustees pair up through Diffie-Hellman, and each pairwise secret seeds one
//! keystream. A client's DC-net cipher XORs one keystream per trustee; a
//! trustee's cipher XORs one keystream per client. Since both ends of a pair
//! draw the same bytes, every keystream appears exactly twice in the relay's
//! accumulated cell and cancels.
//!
//! ```text
//! client sk × trustee pk ─┐          ┌─ trustee sk × client pk
//!                         ▼          ▼
//!                     shared point (equal)
//!                           │
//!                           ▼
//!                 HKDF → keystream seed
//!                           │
//!                           ▼
//!            HMAC-SHA256 counter blocks (per round)
//!                           │
//!                           ▼
//!             XOR into client / trustee ciphers
//! ```
//!
//! Ephemeral keys never enter the DC-net. They are anonymized by the chained
//! [`shuffle`] so that slot ownership cannot be linked to long-term keys.
//!
//! # Security
//!
//! Replay protection:
//! - The slot owner masks its payload with a pad derived from the
//!   [`MessageHistory`], a hash chain over every downstream cell
//! - A cipher replayed into a later round decodes against a different mask
//!
//! Shuffle soundness:
//! - Each proof carries 64 shadow shuffles with Fiat-Shamir challenge bits
//! - A cheating prover survives verification with probability 2^-64
//! - Any modification of the encoded proof fails verification
//!
//! Secret handling:
//! - Secret scalars, shared secrets and keystream keys are zeroized on drop

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod dcnet;
pub mod error;
pub mod group;
pub mod history;
pub mod keystream;
pub mod schnorr;
pub mod shuffle;

pub use dcnet::CellCoder;
pub use error::CryptoError;
pub use group::{Keypair, PublicKey, SecretKey, SharedSecret};
pub use history::MessageHistory;
pub use keystream::Keystream;
pub use schnorr::Signature;
pub use shuffle::{SHUFFLE_PROOF_ROUNDS, ShuffleOutput, ShuffleProof, ShuffleStep};
