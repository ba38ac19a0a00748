//! Property tests for message encoding.
//!
//! Decoding must never panic on hostile input, and every well-formed message
//! must survive an encode/decode cycle unchanged.

use prifi_proto::{
    DownstreamData, Message, MessageKind, ProtocolParams, ShuffleResult, TrusteeCipher,
    UpstreamData,
};
use proptest::prelude::*;

fn arbitrary_message() -> impl Strategy<Value = Message> {
    prop_oneof![
        (any::<i32>(), prop::collection::vec(any::<u8>(), 0..256)).prop_map(
            |(round_id, cipher)| Message::UpstreamData(UpstreamData { round_id, cipher })
        ),
        (any::<i32>(), any::<u32>(), prop::collection::vec(any::<u8>(), 0..256)).prop_map(
            |(round_id, trustee_id, cipher)| {
                Message::TrusteeCipher(TrusteeCipher { round_id, trustee_id, cipher })
            }
        ),
        (any::<i32>(), prop::collection::vec(any::<u8>(), 0..256), any::<bool>()).prop_map(
            |(round_id, payload, flag_resync)| {
                Message::DownstreamData(DownstreamData { round_id, payload, flag_resync })
            }
        ),
        (any::<[u8; 32]>(), prop::collection::vec(any::<[u8; 32]>(), 0..8)).prop_map(
            |(new_base, new_eph_pks)| Message::ShuffleResult(ShuffleResult {
                new_base,
                new_eph_pks,
                proof: vec![0x5A; 40],
            })
        ),
        (1u32..64, 1u32..8, any::<bool>()).prop_map(|(n_clients, n_trustees, start_now)| {
            Message::Parameters(ProtocolParams { start_now, ..ProtocolParams::new(n_clients, n_trustees) })
        }),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Arbitrary bytes under any tag decode to an error or a message, never a panic.
    #[test]
    fn decode_never_panics(tag in any::<u8>(), body in prop::collection::vec(any::<u8>(), 0..512)) {
        let _ = Message::decode_tagged(tag, &body);
    }

    /// Encoded messages decode back to themselves under their own kind.
    #[test]
    fn encode_decode_identity(message in arbitrary_message()) {
        let bytes = message.to_vec().unwrap();
        let decoded = Message::decode(message.kind(), &bytes).unwrap();
        prop_assert_eq!(decoded, message);
    }
}

#[test]
fn upstream_body_is_a_cbor_map() {
    let message = Message::UpstreamData(UpstreamData { round_id: 1, cipher: vec![0xAA, 0xBB] });
    let bytes = message.to_vec().unwrap();
    insta::assert_snapshot!(hex::encode(bytes), @"a268726f756e645f696401666369706865728218aa18bb");
}

#[test]
fn truncated_body_rejected() {
    let message = Message::DownstreamData(DownstreamData {
        round_id: 3,
        payload: vec![9; 16],
        flag_resync: false,
    });
    let bytes = message.to_vec().unwrap();
    assert!(Message::decode(MessageKind::DownstreamData, &bytes[..bytes.len() - 1]).is_err());
}
