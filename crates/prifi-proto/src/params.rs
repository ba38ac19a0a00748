//! Run parameters (`ALL_ALL_PARAMETERS`).

use serde::{Deserialize, Serialize};

/// Length of a latency probe: marker (2) + client id (2) + timestamp (8).
pub const LATENCY_PROBE_LEN: usize = 12;

/// How the relay picks the base for the first shuffle step.
///
/// The default is the generator rather than the first client's long-term
/// key: ephemeral keys are generator multiples, so only a generator base
/// lets each client recompute its shuffled key and find its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShuffleBase {
    /// The group generator. Ephemeral keys are generator multiples, so
    /// clients can locate their slot after the shuffle.
    #[default]
    Generator,
    /// The first client's long-term key. Clients cannot locate their slot
    /// under this base and fall back to self-assigned slots.
    FirstClientKey,
}

/// Parameters shared by every role of one run.
///
/// The relay receives them first and forwards a copy to each trustee and
/// client with the recipient's id filled in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolParams {
    /// Number of clients in the run.
    pub n_clients: u32,
    /// Number of trustees in the run.
    pub n_trustees: u32,
    /// Upstream (client to relay) cell size in bytes.
    pub up_cell_size: u32,
    /// Downstream (relay to clients) cell size in bytes.
    pub down_cell_size: u32,
    /// Begin setup immediately on receipt.
    pub start_now: bool,
    /// Accept these parameters even outside the initial state, resetting
    /// the receiver.
    pub force_params: bool,
    /// Id assigned to the receiving client.
    pub next_free_client_id: u32,
    /// Id assigned to the receiving trustee.
    pub next_free_trustee_id: u32,
    /// Clients embed latency probes in idle owned slots.
    pub do_latency_tests: bool,
    /// Pad every downstream cell to `down_cell_size`.
    pub use_dummy_data_down: bool,
    /// Buffered rounds per trustee before the relay throttles it.
    pub relay_window_size: u32,
    /// Stop after this many rounds (0 runs forever).
    pub relay_reporting_limit: u32,
    /// Clients hand downstream payloads to the application.
    pub client_data_output_enabled: bool,
    /// Relay hands decoded upstream cells to its output sink.
    pub relay_data_output_enabled: bool,
    /// Base selection for the first shuffle step.
    pub shuffle_base: ShuffleBase,
}

impl Default for ProtocolParams {
    fn default() -> Self {
        Self {
            n_clients: 2,
            n_trustees: 1,
            up_cell_size: 1000,
            down_cell_size: 1000,
            start_now: false,
            force_params: false,
            next_free_client_id: 0,
            next_free_trustee_id: 0,
            do_latency_tests: false,
            use_dummy_data_down: false,
            relay_window_size: 10,
            relay_reporting_limit: 0,
            client_data_output_enabled: true,
            relay_data_output_enabled: true,
            shuffle_base: ShuffleBase::Generator,
        }
    }
}

impl ProtocolParams {
    /// Parameters for a run of the given size, everything else default.
    pub fn new(n_clients: u32, n_trustees: u32) -> Self {
        Self { n_clients, n_trustees, ..Self::default() }
    }

    /// Copy addressed to client `id`.
    pub fn for_client(&self, id: u32) -> Self {
        Self { next_free_client_id: id, ..self.clone() }
    }

    /// Copy addressed to trustee `id`.
    pub fn for_trustee(&self, id: u32) -> Self {
        Self { next_free_trustee_id: id, ..self.clone() }
    }

    /// Check internal consistency.
    ///
    /// # Errors
    ///
    /// A static description of the first violated constraint.
    pub fn validate(&self) -> Result<(), &'static str> {
        // a shuffle of one key anonymizes nothing and trustees refuse it
        if self.n_clients < 2 {
            return Err("n_clients must be at least 2");
        }
        if self.n_trustees == 0 {
            return Err("n_trustees must be at least 1");
        }
        if self.up_cell_size == 0 || self.down_cell_size == 0 {
            return Err("cell sizes must be non-zero");
        }
        if self.do_latency_tests && (self.up_cell_size as usize) < LATENCY_PROBE_LEN {
            return Err("latency tests need an upstream cell of at least 12 bytes");
        }
        Ok(())
    }
}
