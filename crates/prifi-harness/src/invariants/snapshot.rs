//! Observable state snapshots for invariant checking.

use prifi_core::{ClientState, RelayState};
use prifi_proto::Round;

/// Snapshot of a run at one point in time.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    /// Relay state.
    pub relay_state: RelayState,
    /// Round the relay is decoding, if any.
    pub relay_round: Option<Round>,
    /// Clients in the run.
    pub n_clients: u32,
    /// Per-client state.
    pub clients: Vec<ClientSnapshot>,
}

impl RunSnapshot {
    /// Snapshot of a run that never started.
    pub fn empty() -> Self {
        Self {
            relay_state: RelayState::BeforeInit,
            relay_round: None,
            n_clients: 0,
            clients: Vec::new(),
        }
    }
}

/// Snapshot of one client.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    /// Client id.
    pub id: u32,
    /// Client state.
    pub state: ClientState,
    /// Slot owned in the current run.
    pub slot: Option<u32>,
    /// Round of the next cipher the client will send.
    pub next_round: Round,
    /// Rounds of received downstream data; `None` marks a resync.
    pub round_history: Vec<Option<Round>>,
}

impl ClientSnapshot {
    /// Ready client with the given slot and next round.
    pub fn ready(id: u32, slot: u32, next_round: Round) -> Self {
        Self {
            id,
            state: ClientState::Ready,
            slot: Some(slot),
            next_round,
            round_history: Vec::new(),
        }
    }
}
