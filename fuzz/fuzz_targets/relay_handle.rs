//! Fuzz target for the relay state machine
//!
//! # Strategy
//!
//! - Senders: the relay itself, in-range and out-of-range clients/trustees
//! - Messages: arbitrary tags and bodies, decoded through the wire codec
//! - Control: parameters (forced or not), resync, downstream data
//!
//! # Invariants
//!
//! - The relay never panics, whatever it is fed
//! - Completed rounds only reset through parameters or resync
//! - A decoding round only exists while communicating

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use prifi_core::{Peer, Relay, RelayEvent, RelayState};
use prifi_proto::{Message, ProtocolParams};

#[derive(Debug, Clone, Arbitrary)]
enum RelayOp {
    Params { n_clients: u8, n_trustees: u8, cell: u8, force: bool, start_now: bool },
    Message { from: PeerChoice, tag: u8, body: Vec<u8> },
    Downstream(Vec<u8>),
    Resync,
}

#[derive(Debug, Clone, Copy, Arbitrary)]
enum PeerChoice {
    Relay,
    Client(u8),
    Trustee(u8),
}

impl From<PeerChoice> for Peer {
    fn from(choice: PeerChoice) -> Self {
        match choice {
            PeerChoice::Relay => Peer::Relay,
            PeerChoice::Client(id) => Peer::Client(u32::from(id % 8)),
            PeerChoice::Trustee(id) => Peer::Trustee(u32::from(id % 8)),
        }
    }
}

fuzz_target!(|ops: Vec<RelayOp>| {
    let mut relay = Relay::new();
    let mut completed = 0;

    for op in ops {
        let resets = matches!(op, RelayOp::Params { .. } | RelayOp::Resync);
        let event = match op {
            RelayOp::Params { n_clients, n_trustees, cell, force, start_now } => {
                let params = ProtocolParams {
                    up_cell_size: u32::from(cell),
                    down_cell_size: u32::from(cell),
                    force_params: force,
                    start_now,
                    ..ProtocolParams::new(u32::from(n_clients % 6), u32::from(n_trustees % 4))
                };
                RelayEvent::Message { from: Peer::Relay, message: Message::Parameters(params) }
            },
            RelayOp::Message { from, tag, body } => match Message::decode_tagged(tag, &body) {
                Ok(message) => RelayEvent::Message { from: from.into(), message },
                Err(_) => continue,
            },
            RelayOp::Downstream(data) => RelayEvent::QueueDownstream { data },
            RelayOp::Resync => RelayEvent::Resync,
        };

        let _ = relay.handle(event);

        if !resets {
            assert!(relay.completed_rounds() >= completed, "completed rounds went backwards");
        }
        completed = relay.completed_rounds();
        if relay.current_round().is_some() {
            assert_eq!(relay.state(), RelayState::Communicating);
        }
    }
});
