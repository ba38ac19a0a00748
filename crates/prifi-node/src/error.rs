//! Node error types.

use std::fmt;

use prifi_core::{Peer, ProtocolError};
use prifi_proto::WireError;

use crate::transport::{RunId, TransportError};

/// Errors that can occur in the node runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Configuration error (invalid parameters, bad intervals).
    ///
    /// Prevents a run from starting. Fix the configuration and retry.
    Config(String),

    /// No run with this id is hosted by the arena.
    UnknownRun(RunId),

    /// A role of the run stopped and no longer accepts commands.
    RoleStopped(Peer),

    /// Delivery failure between roles.
    Transport(TransportError),

    /// Message could not be encoded or decoded.
    Wire(WireError),

    /// A role rejected a local command.
    Protocol(ProtocolError),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::UnknownRun(run) => write!(f, "unknown run {run:#018x}"),
            Self::RoleStopped(peer) => write!(f, "{peer} stopped"),
            Self::Transport(err) => write!(f, "transport error: {err}"),
            Self::Wire(err) => write!(f, "wire error: {err}"),
            Self::Protocol(err) => write!(f, "protocol error: {err}"),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transport(err) => Some(err),
            Self::Wire(err) => Some(err),
            Self::Protocol(err) => Some(err),
            Self::Config(_) | Self::UnknownRun(_) | Self::RoleStopped(_) => None,
        }
    }
}

impl From<TransportError> for NodeError {
    fn from(err: TransportError) -> Self {
        Self::Transport(err)
    }
}

impl From<WireError> for NodeError {
    fn from(err: WireError) -> Self {
        Self::Wire(err)
    }
}

impl From<ProtocolError> for NodeError {
    fn from(err: ProtocolError) -> Self {
        Self::Protocol(err)
    }
}
