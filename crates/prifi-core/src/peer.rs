//! Logical protocol endpoints.

use std::fmt;

/// A logical participant of a run, as addressed by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Peer {
    /// The relay.
    Relay,
    /// Client with the given id.
    Client(u32),
    /// Trustee with the given id.
    Trustee(u32),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Relay => f.write_str("relay"),
            Self::Client(id) => write!(f, "client-{id}"),
            Self::Trustee(id) => write!(f, "trustee-{id}"),
        }
    }
}
