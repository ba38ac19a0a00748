//! Shared fixtures for simulation tests.

#![allow(dead_code)]

use prifi_harness::{InvariantRegistry, SimNetwork};
use prifi_proto::ProtocolParams;

/// Small cells keep shuffles and rounds cheap.
pub fn params(n_clients: u32, n_trustees: u32) -> ProtocolParams {
    ProtocolParams {
        up_cell_size: 32,
        down_cell_size: 32,
        ..ProtocolParams::new(n_clients, n_trustees)
    }
}

/// Started network that finished its setup.
pub fn communicating(seed: u64, params: ProtocolParams) -> SimNetwork {
    let mut net = SimNetwork::new(seed, params);
    net.start();
    assert!(net.run_setup(2_000), "setup did not complete");
    net
}

/// Step the network, checking the standard invariants after every step.
/// Stops when `done` holds or nothing is left to do.
pub fn run_checked(net: &mut SimNetwork, max_steps: usize, done: impl Fn(&SimNetwork) -> bool) {
    let registry = InvariantRegistry::standard();
    for step in 0..max_steps {
        if done(net) {
            return;
        }
        if !net.deliver_one() && !net.tick() {
            return;
        }
        registry.assert_all(&net.snapshot(), &format!("after step {step}"));
    }
}

/// Upstream cells with trailing zero padding removed, empty ones skipped.
pub fn upstream_payloads(net: &SimNetwork) -> Vec<Vec<u8>> {
    net.observations()
        .upstream
        .iter()
        .map(|(_, cell)| {
            let end = cell.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
            cell[..end].to_vec()
        })
        .filter(|payload| !payload.is_empty())
        .collect()
}
