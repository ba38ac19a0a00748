//! Setup scenarios: key collection, the shuffle chain and slot assignment.

mod common;

use std::collections::BTreeSet;

use common::{communicating, params, upstream_payloads};
use prifi_core::{CipherRate, ClientState, Peer, RelayState, TrusteeState};
use prifi_harness::{InvariantRegistry, SimNetwork};
use prifi_proto::{MessageKind, ProtocolParams, ShuffleBase};

fn setup_log(net: &SimNetwork) -> Vec<(Peer, Peer, MessageKind)> {
    net.observations()
        .log
        .iter()
        .take_while(|d| !matches!(d.kind, MessageKind::UpstreamData | MessageKind::TrusteeCipher))
        .map(|d| (d.from, d.to, d.kind))
        .collect()
}

fn assert_minimal_handshake(n_clients: u32, n_trustees: u32) {
    let net = communicating(11, params(n_clients, n_trustees));
    let log = setup_log(&net);
    let (c, t) = (n_clients as usize, n_trustees as usize);

    let count = |kind: MessageKind| log.iter().filter(|(_, _, k)| *k == kind).count();
    let expected = [
        (MessageKind::Parameters, c + t),
        (MessageKind::TrusteePublicKey, t),
        (MessageKind::TrusteeKeys, c),
        (MessageKind::ClientKeys, c),
        (MessageKind::ShuffleRequest, t),
        (MessageKind::ShuffleResult, t),
        (MessageKind::Transcript, t),
        (MessageKind::ShuffleSignature, t),
        (MessageKind::FinalShuffle, c),
    ];
    for (kind, n) in expected {
        assert_eq!(count(kind), n, "{}", kind.name());
    }
    assert_eq!(log.len(), expected.iter().map(|(_, n)| n).sum::<usize>());
    assert!(net.observations().errors.is_empty());
}

#[test]
fn handshake_sends_nothing_extra() {
    assert_minimal_handshake(2, 1);
    assert_minimal_handshake(2, 2);
    assert_minimal_handshake(3, 2);
}

#[test]
fn phases_happen_in_order() {
    let net = communicating(12, params(3, 2));
    let log = setup_log(&net);

    let first = |kind: MessageKind| log.iter().position(|(_, _, k)| *k == kind).unwrap();
    let order = [
        MessageKind::Parameters,
        MessageKind::TrusteePublicKey,
        MessageKind::TrusteeKeys,
        MessageKind::ClientKeys,
        MessageKind::ShuffleRequest,
        MessageKind::ShuffleResult,
        MessageKind::Transcript,
        MessageKind::ShuffleSignature,
        MessageKind::FinalShuffle,
    ];
    for pair in order.windows(2) {
        assert!(first(pair[0]) < first(pair[1]), "{} before {}", pair[0].name(), pair[1].name());
    }
}

#[test]
fn shuffle_chain_visits_trustees_in_order() {
    let net = communicating(13, params(2, 3));

    let chain: Vec<_> = setup_log(&net)
        .into_iter()
        .filter(|(_, _, k)| matches!(k, MessageKind::ShuffleRequest | MessageKind::ShuffleResult))
        .map(|(from, to, _)| (from, to))
        .collect();

    let expected: Vec<_> = (0..3)
        .flat_map(|j| [(Peer::Relay, Peer::Trustee(j)), (Peer::Trustee(j), Peer::Relay)])
        .collect();
    assert_eq!(chain, expected);
}

#[test]
fn every_role_ends_ready() {
    let net = communicating(14, params(3, 2));

    assert_eq!(net.relay().state(), RelayState::Communicating);
    for id in 0..3 {
        assert_eq!(net.client(id).state(), ClientState::Ready);
    }
    for id in 0..2 {
        assert_eq!(net.trustee(id).state(), TrusteeState::Ready);
        assert_eq!(net.stream_rate(id), CipherRate::Full);
    }
    InvariantRegistry::standard().assert_all(&net.snapshot(), "after setup");
}

#[test]
fn generator_base_gives_a_permutation() {
    let net = communicating(15, params(4, 1));

    let slots: BTreeSet<u32> = (0..4).filter_map(|id| net.client(id).slot()).collect();
    assert_eq!(slots, (0..4).collect());
    assert!(net.observations().slot_fallbacks.is_empty());
}

#[test]
fn first_client_key_base_falls_back_to_client_ids() {
    let params = ProtocolParams { shuffle_base: ShuffleBase::FirstClientKey, ..params(3, 1) };
    let mut net = communicating(16, params);

    assert_eq!(net.observations().slot_fallbacks, vec![(0, 0), (1, 1), (2, 2)]);
    for id in 0..3 {
        assert_eq!(net.client(id).slot(), Some(id));
    }

    // fallback slots are still disjoint, so data gets through
    net.queue_upstream(2, b"still works".to_vec());
    net.run_until(500, |net| !upstream_payloads(net).is_empty());
    assert_eq!(upstream_payloads(&net), vec![b"still works".to_vec()]);
}

#[test]
fn same_seed_same_run() {
    let run = |seed: u64| {
        let mut net = communicating(seed, params(3, 2));
        net.queue_upstream(1, b"determinism".to_vec());
        net.run(400);
        let slots: Vec<_> = (0..3).map(|id| net.client(id).slot()).collect();
        let keys: Vec<_> = (0..3).map(|id| net.client(id).public_key().to_bytes()).collect();
        (net.observations().log.clone(), net.observations().upstream.clone(), slots, keys)
    };

    assert_eq!(run(42), run(42));
    assert_ne!(run(42).3, run(43).3);
}
