//! Fuzz target for Message::decode_tagged
//!
//! Arbitrary tag bytes and CBOR bodies must either decode or return an
//! error. Anything that decodes must survive a re-encode unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use prifi_proto::Message;

fuzz_target!(|data: &[u8]| {
    let Some((&tag, body)) = data.split_first() else {
        return;
    };
    let Ok(message) = Message::decode_tagged(tag, body) else {
        return;
    };

    let encoded = message.to_vec().expect("decoded message re-encodes");
    let again = Message::decode(message.kind(), &encoded).expect("re-encoded message decodes");
    assert_eq!(again, message);
});
