//! PriFi protocol core.
//!
//! Sans-IO state machines for the three roles of a PriFi run:
//!
//! - [`Relay`]: collects keys, drives the shuffle chain, decodes DC-net
//!   rounds and broadcasts downstream data.
//! - [`Client`]: submits an anonymized ephemeral key and contributes one
//!   cipher per round, carrying data in its own slot.
//! - [`Trustee`]: shuffles, signs the final permutation and streams one
//!   cipher per round.
//!
//! Every role consumes one event through `handle` and returns the actions
//! its driver must perform (send a message, deliver data, change a cipher
//! stream's pace). Time and randomness come from an [`Environment`], so the
//! same code runs under tokio in production and under a seeded simulation in
//! tests.
//!
//! # Message Flow
//!
//! ```text
//! Relay ── PARAMETERS ──────────────> Trustees, Clients
//! Trustee ── TELL_PK ───────────────> Relay
//! Relay ── TELL_TRUSTEES_PK ────────> Clients
//! Client ── TELL_PK_AND_EPH_PK ─────> Relay
//! Relay ── SHUFFLE_REQUEST ─────────> Trustee 0 .. Trustee n-1 (chained)
//! Relay ── TRANSCRIPT ──────────────> Trustees
//! Trustee ── SHUFFLE_SIG ───────────> Relay
//! Relay ── EPH_PKS_AND_SIGS ────────> Clients
//! Clients, Trustees ── ciphers ─────> Relay ── DOWNSTREAM ──> Clients
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod client;
pub mod env;
pub mod error;
mod keys;
pub mod latency;
mod peer;
pub mod relay;
mod trustee;

pub use client::{Client, ClientAction, ClientEvent, ClientState};
pub use env::Environment;
pub use error::ProtocolError;
pub use keys::shuffle_signing_bytes;
pub use peer::Peer;
pub use relay::{Relay, RelayAction, RelayEvent, RelayState};
pub use trustee::{CipherRate, Trustee, TrusteeAction, TrusteeEvent, TrusteeState};
