//! Deterministic simulation harness for PriFi protocol testing.
//!
//! Two ways to run the protocol reproducibly:
//!
//! - [`SimNetwork`]: every role's sans-IO state machine in one process,
//!   moved one message at a time, with fault injection and a full delivery
//!   log. Used for scenario and property tests.
//! - [`SimEnv`] with Turmoil: the tokio node runtime under virtual time and
//!   a seeded RNG.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks behavioral properties against a
//! [`RunSnapshot`] after any step. Use [`InvariantRegistry::standard()`] for
//! the round and slot invariants every run must satisfy.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod sim_env;
pub mod sim_network;

pub use invariants::{
    ClientSnapshot, Invariant, InvariantRegistry, InvariantResult, RoundAgreement,
    RoundMonotonicity, RunSnapshot, SlotPermutation, Violation,
};
pub use sim_env::{SIM_EPOCH_MILLIS, SimEnv};
pub use sim_network::{Delivery, Fault, Observations, SimNetwork};
