//! Standard invariant checks.

use std::collections::BTreeSet;

use prifi_core::{ClientState, RelayState};

use super::{Invariant, InvariantResult, RunSnapshot, Violation};

/// Downstream rounds advance by exactly one.
///
/// Between resyncs, the rounds a client sees in downstream data must form a
/// gapless increasing sequence. A repeat or a gap means the relay skipped a
/// round or a message was reordered.
pub struct RoundMonotonicity;

impl Invariant for RoundMonotonicity {
    fn name(&self) -> &'static str {
        "round_monotonicity"
    }

    fn check(&self, state: &RunSnapshot) -> InvariantResult {
        for client in &state.clients {
            for segment in client.round_history.split(Option::is_none) {
                for window in segment.windows(2) {
                    let (Some(prev), Some(next)) = (window[0], window[1]) else { continue };
                    if prev.checked_add(1) != Some(next) {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "client {}: downstream round {prev} followed by {next}",
                                client.id
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Ready clients own distinct slots in `0..n_clients`.
///
/// Two clients in one slot would XOR their payloads into garbage.
pub struct SlotPermutation;

impl Invariant for SlotPermutation {
    fn name(&self) -> &'static str {
        "slot_permutation"
    }

    fn check(&self, state: &RunSnapshot) -> InvariantResult {
        let mut taken = BTreeSet::new();
        for client in state.clients.iter().filter(|c| c.state == ClientState::Ready) {
            let Some(slot) = client.slot else {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("client {} is ready without a slot", client.id),
                });
            };
            if slot >= state.n_clients {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "client {} holds slot {slot} of {}",
                        client.id, state.n_clients
                    ),
                });
            }
            if !taken.insert(slot) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("slot {slot} held by more than one client"),
                });
            }
        }
        Ok(())
    }
}

/// Ready clients are at most one round ahead of the relay.
///
/// While the relay decodes round `r`, a ready client has either sent its
/// round `r` cipher (next round `r + 1`) or is still waiting for the
/// downstream data that opened `r` (next round `r`).
pub struct RoundAgreement;

impl Invariant for RoundAgreement {
    fn name(&self) -> &'static str {
        "round_agreement"
    }

    fn check(&self, state: &RunSnapshot) -> InvariantResult {
        if state.relay_state != RelayState::Communicating {
            return Ok(());
        }
        let Some(relay_round) = state.relay_round else {
            return Ok(());
        };
        for client in state.clients.iter().filter(|c| c.state == ClientState::Ready) {
            let ahead = i64::from(client.next_round) - i64::from(relay_round);
            if !(0..=1).contains(&ahead) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "client {} next round {} while relay decodes {relay_round}",
                        client.id, client.next_round
                    ),
                });
            }
        }
        Ok(())
    }
}
