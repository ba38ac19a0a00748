//! PriFi node runtime.
//!
//! Tokio glue around [`prifi_core`]'s action-based roles: each relay, client
//! and trustee runs as an actor task that feeds events into its state machine
//! and executes the returned actions.
//!
//! # Components
//!
//! - [`RunArena`]: hosts independent runs, each with its own roles
//! - [`RunHandle`]: owner's end of a run (queue data, resync, read outputs)
//! - [`LocalTransport`]: in-process [`Transport`] carrying CBOR [`Envelope`]s
//! - [`SystemEnv`]: production environment (real time, OS randomness)
//! - [`NodeConfig`]: run parameters plus cipher stream pacing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod arena;
mod config;
mod error;
mod roles;
mod system_env;
mod transport;

pub use arena::{RunArena, RunHandle, RunOutput};
pub use config::NodeConfig;
pub use error::NodeError;
pub use system_env::SystemEnv;
pub use transport::{Envelope, LocalTransport, RunId, Transport, TransportError};
