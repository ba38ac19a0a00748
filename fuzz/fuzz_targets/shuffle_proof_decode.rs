//! Fuzz target for ShuffleProof::from_bytes
//!
//! Proofs arrive from trustees inside transcripts, so the parser sees
//! attacker-controlled lengths and point encodings. It must never panic or
//! over-read, and anything it accepts must serialize back to the same bytes.

#![no_main]

use libfuzzer_sys::fuzz_target;
use prifi_crypto::ShuffleProof;

fuzz_target!(|data: &[u8]| {
    if let Ok(proof) = ShuffleProof::from_bytes(data) {
        assert_eq!(proof.to_bytes(), data);
    }
});
