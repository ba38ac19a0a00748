//! Client behavior tests.
//!
//! A single client is driven with hand-built relay messages. The final
//! shuffle is faked by placing the client's own ephemeral key under the
//! generator base, which is exactly what an honest shuffle chain preserves.

mod common;

use common::{TestEnv, keypair, sign_shuffle, started};
use prifi_core::{
    Client, ClientAction, ClientEvent, ClientState, Environment, ProtocolError,
    latency::encode_probe,
};
use prifi_crypto::{CellCoder, Keypair, MessageHistory, PublicKey};
use prifi_proto::{
    DownstreamData, FinalShuffle, KeyBytes, Message, ProtocolParams, TrusteeKeys, UpstreamData,
};

struct Fixture {
    client: Client<TestEnv>,
    env: TestEnv,
    trustee: Keypair,
}

fn sent(actions: &[ClientAction]) -> Vec<Message> {
    actions
        .iter()
        .filter_map(|a| match a {
            ClientAction::Send { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

fn upstream(actions: &[ClientAction]) -> UpstreamData {
    sent(actions)
        .into_iter()
        .find_map(|m| match m {
            Message::UpstreamData(data) => Some(data),
            _ => None,
        })
        .expect("cipher sent")
}

fn message(client: &mut Client<TestEnv>, message: Message) -> Result<Vec<ClientAction>, ProtocolError> {
    client.handle(ClientEvent::Message(message))
}

/// Client 0 of a two-client, one-trustee run, past `EPH_KEYS_SENT`.
fn keys_sent(params: &ProtocolParams) -> Fixture {
    let env = TestEnv::seeded(7);
    let mut client = Client::new(env.clone());
    let trustee = keypair(0x80);

    message(&mut client, Message::Parameters(params.for_client(0))).expect("parameters");
    let actions = message(&mut client, Message::TrusteeKeys(TrusteeKeys { pks: vec![trustee.public().to_bytes()] }))
        .expect("trustee keys");

    match sent(&actions).as_slice() {
        [Message::ClientKeys(keys)] => {
            assert_eq!(keys.pk, client.public_key().to_bytes());
            assert_eq!(Some(keys.eph_pk), client.ephemeral_key().map(|k| k.to_bytes()));
        },
        other => panic!("expected client keys, got {other:?}"),
    }
    assert_eq!(client.state(), ClientState::EphKeysSent);
    Fixture { client, env, trustee }
}

/// Final shuffle placing this client in slot 1.
fn final_shuffle(fixture: &Fixture) -> FinalShuffle {
    let base = PublicKey::generator().to_bytes();
    let mine = fixture.client.ephemeral_key().expect("ephemeral key").to_bytes();
    let eph_pks: Vec<KeyBytes> = vec![keypair(0x41).public().to_bytes(), mine];
    let sig = sign_shuffle(&fixture.trustee, &base, &eph_pks);
    FinalShuffle { base, eph_pks, trustee_sigs: vec![sig] }
}

fn ready(params: &ProtocolParams) -> Fixture {
    let mut fixture = keys_sent(params);
    let msg = final_shuffle(&fixture);
    let actions = message(&mut fixture.client, Message::FinalShuffle(msg)).expect("final shuffle");
    assert_eq!(upstream(&actions).round_id, 0);
    fixture
}

fn downstream(round_id: i32, payload: &[u8]) -> Message {
    Message::DownstreamData(DownstreamData { round_id, payload: payload.to_vec(), flag_resync: false })
}

#[test]
fn final_shuffle_locates_slot_and_sends_round_zero() {
    let mut fixture = keys_sent(&started(2, 1));
    let msg = final_shuffle(&fixture);

    let actions = message(&mut fixture.client, Message::FinalShuffle(msg)).unwrap();
    assert_eq!(fixture.client.state(), ClientState::Ready);
    assert_eq!(fixture.client.slot(), Some(1));
    assert_eq!(fixture.client.round(), 1);

    let cipher = upstream(&actions);
    assert_eq!(cipher.round_id, 0);
    assert_eq!(cipher.cipher.len(), 32);
}

#[test]
fn forged_signature_fails_whole_message() {
    let mut fixture = keys_sent(&started(2, 1));
    let mut msg = final_shuffle(&fixture);
    msg.trustee_sigs = vec![sign_shuffle(&keypair(0x99), &msg.base, &msg.eph_pks)];

    let err = message(&mut fixture.client, Message::FinalShuffle(msg)).unwrap_err();
    assert_eq!(err, ProtocolError::SignatureInvalid { trustee_id: 0 });
    assert!(err.is_fatal());
    assert_eq!(fixture.client.state(), ClientState::EphKeysSent);
}

#[test]
fn missing_signature_is_invalid() {
    let mut fixture = keys_sent(&started(2, 1));
    let mut msg = final_shuffle(&fixture);
    msg.trustee_sigs.clear();

    let err = message(&mut fixture.client, Message::FinalShuffle(msg)).unwrap_err();
    assert!(matches!(err, ProtocolError::SignatureInvalid { .. }));
}

#[test]
fn absent_key_falls_back_to_client_id() {
    let mut fixture = keys_sent(&started(2, 1));
    let base = PublicKey::generator().to_bytes();
    let eph_pks = vec![keypair(0x41).public().to_bytes(), keypair(0x42).public().to_bytes()];
    let sig = sign_shuffle(&fixture.trustee, &base, &eph_pks);

    let actions = message(
        &mut fixture.client,
        Message::FinalShuffle(FinalShuffle { base, eph_pks, trustee_sigs: vec![sig] }),
    )
    .unwrap();

    assert!(actions.contains(&ClientAction::SlotFallback { slot: 0 }));
    assert_eq!(fixture.client.slot(), Some(0));
    assert_eq!(fixture.client.state(), ClientState::Ready);
}

#[test]
fn empty_trustee_list_rejected() {
    let env = TestEnv::seeded(1);
    let mut client = Client::new(env);
    message(&mut client, Message::Parameters(started(2, 1))).unwrap();

    let err = message(&mut client, Message::TrusteeKeys(TrusteeKeys { pks: vec![] })).unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidMessage(_)));
    assert_eq!(client.state(), ClientState::Initializing);
}

#[test]
fn trustee_keys_before_parameters_dropped() {
    let mut client = Client::new(TestEnv::seeded(1));
    let err = message(&mut client, Message::TrusteeKeys(TrusteeKeys { pks: vec![[0u8; 32]] })).unwrap_err();
    assert!(matches!(err, ProtocolError::StateViolation { role: "client", .. }));
}

#[test]
fn downstream_delivers_and_answers() {
    let mut fixture = ready(&started(2, 1));

    let actions = message(&mut fixture.client, downstream(1, b"news")).unwrap();
    assert_eq!(actions[0], ClientAction::Deliver { round: 1, data: b"news".to_vec() });
    assert_eq!(upstream(&actions).round_id, 1);
    assert_eq!(fixture.client.round(), 2);
}

#[test]
fn downstream_for_wrong_round_rejected() {
    let mut fixture = ready(&started(2, 1));

    let err = message(&mut fixture.client, downstream(3, b"x")).unwrap_err();
    assert_eq!(err, ProtocolError::RoundMismatch { expected: 1, received: 3 });
    assert_eq!(fixture.client.round(), 1);
}

#[test]
fn output_disabled_still_answers() {
    let params = ProtocolParams { client_data_output_enabled: false, ..started(2, 1) };
    let mut fixture = ready(&params);

    let actions = message(&mut fixture.client, downstream(1, b"news")).unwrap();
    assert_eq!(actions.len(), 1);
    assert_eq!(upstream(&actions).round_id, 1);
}

#[test]
fn resync_flag_returns_to_initializing() {
    let mut fixture = ready(&started(2, 1));
    let resync = DownstreamData { round_id: 7, payload: vec![], flag_resync: true };

    let actions = message(&mut fixture.client, Message::DownstreamData(resync)).unwrap();
    assert!(actions.is_empty());
    assert_eq!(fixture.client.state(), ClientState::Initializing);
    assert_eq!(fixture.client.slot(), None);

    // ORACLE: the client can run setup again with the same long-term key
    let pk = fixture.client.public_key();
    let actions = message(
        &mut fixture.client,
        Message::TrusteeKeys(TrusteeKeys { pks: vec![fixture.trustee.public().to_bytes()] }),
    )
    .unwrap();
    assert!(matches!(sent(&actions).as_slice(), [Message::ClientKeys(k)] if k.pk == pk.to_bytes()));
}

#[test]
fn own_probe_yields_latency() {
    let params = ProtocolParams { do_latency_tests: true, ..started(2, 1) };
    let mut fixture = ready(&params);
    let probe = encode_probe(0, fixture.env.wall_clock_millis());
    fixture.env.advance_wall_clock(25);

    let actions = message(&mut fixture.client, downstream(1, &probe)).unwrap();
    assert!(actions.contains(&ClientAction::LatencyMeasured { millis: 25 }));
    assert!(!actions.iter().any(|a| matches!(a, ClientAction::Deliver { .. })));
}

#[test]
fn foreign_probe_is_not_delivered() {
    let mut fixture = ready(&started(2, 1));

    let actions = message(&mut fixture.client, downstream(1, &encode_probe(1, 5))).unwrap();
    assert_eq!(actions.len(), 1);
}

#[test]
fn data_starting_with_probe_marker_is_delivered() {
    let mut fixture = ready(&started(2, 1));
    let mut data = encode_probe(1, 5).to_vec();
    data.extend_from_slice(b" and then some");

    let actions = message(&mut fixture.client, downstream(1, &data)).unwrap();
    assert_eq!(actions[0], ClientAction::Deliver { round: 1, data });
    assert_eq!(upstream(&actions).round_id, 1);
}

#[test]
fn oversized_upstream_rejected_at_enqueue() {
    let mut fixture = ready(&started(2, 1));
    let err = fixture.client.handle(ClientEvent::QueueUpstream { data: vec![0u8; 33] }).unwrap_err();
    assert_eq!(err, ProtocolError::PayloadTooLarge { size: 33, max: 32 });
    assert_eq!(fixture.client.queued_upstream(), 0);
}

#[test]
fn owned_slot_carries_queued_payload() {
    let mut fixture = ready(&started(2, 1));
    fixture.client.handle(ClientEvent::QueueUpstream { data: b"ping".to_vec() }).unwrap();

    // Round 1 belongs to slot 1.
    let actions = message(&mut fixture.client, downstream(1, &[0u8])).unwrap();
    let cipher = upstream(&actions).cipher;
    assert_eq!(fixture.client.queued_upstream(), 0);

    // ORACLE: the trustee's pad for this client cancels the client's pad
    let secret = fixture.trustee.secret().diffie_hellman(&fixture.client.public_key());
    let mut trustee = CellCoder::new(&[secret]);
    let _round_zero = trustee.trustee_encode(32);

    let mut history = MessageHistory::new();
    history.update(&[0u8]);
    let mut relay = CellCoder::relay();
    relay.decode_start(32, &history);
    relay.decode_client(&cipher).unwrap();
    relay.decode_trustee(&trustee.trustee_encode(32)).unwrap();

    let mut expected = b"ping".to_vec();
    expected.resize(32, 0);
    assert_eq!(relay.decode_cell().unwrap(), expected);
}

#[test]
fn forced_parameters_reset_ready_client() {
    let mut fixture = ready(&started(2, 1));

    let err = message(&mut fixture.client, Message::Parameters(started(2, 1))).unwrap_err();
    assert!(matches!(err, ProtocolError::StateViolation { .. }));

    let forced = ProtocolParams { force_params: true, ..started(3, 1) }.for_client(2);
    message(&mut fixture.client, Message::Parameters(forced)).unwrap();
    assert_eq!(fixture.client.state(), ClientState::Initializing);
    assert_eq!(fixture.client.id(), 2);
}
