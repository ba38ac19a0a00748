//! Counter-mode keystream for DC-net pads.
//!
//! # Security Properties
//!
//! - Determinism: both ends of a DH pair derive the same byte sequence
//! - Statefulness: consumed bytes are never produced again, so every round
//!   uses a fresh pad as long as both ends consume the same amounts
//! - Key material is zeroized on drop

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::group::SharedSecret;

type HmacSha256 = Hmac<Sha256>;

/// Label for deriving a pairwise DC-net keystream key
const PAIRWISE_LABEL: &[u8] = b"prifi-dcnet-keystream";

const BLOCK_LEN: usize = 32;

/// Infinite pseudorandom byte stream, HMAC-SHA256(key, counter) blocks.
pub struct Keystream {
    key: [u8; 32],
    counter: u64,
    block: [u8; BLOCK_LEN],
    /// Next unread byte of `block`; `BLOCK_LEN` means empty.
    offset: usize,
}

impl Keystream {
    /// Stream for one client/trustee pair.
    pub fn from_shared_secret(secret: &SharedSecret) -> Self {
        Self::derive(secret.as_bytes(), PAIRWISE_LABEL)
    }

    /// Stream keyed by HKDF-SHA256 of `ikm` under the given label.
    pub fn derive(ikm: &[u8], label: &[u8]) -> Self {
        let hkdf = Hkdf::<Sha256>::new(None, ikm);
        let mut key = [0u8; 32];
        let Ok(()) = hkdf.expand(label, &mut key) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };
        Self { key, counter: 0, block: [0u8; BLOCK_LEN], offset: BLOCK_LEN }
    }

    /// XOR the next `buf.len()` stream bytes into `buf`.
    pub fn xor_into(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            if self.offset == BLOCK_LEN {
                self.refill();
            }
            *byte ^= self.block[self.offset];
            self.offset += 1;
        }
    }

    /// Take the next `len` stream bytes.
    pub fn take(&mut self, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.xor_into(&mut out);
        out
    }

    /// Next 8 stream bytes as a big-endian integer.
    pub fn next_u64(&mut self) -> u64 {
        let mut bytes = [0u8; 8];
        self.xor_into(&mut bytes);
        u64::from_be_bytes(bytes)
    }

    fn refill(&mut self) {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.key) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(&self.counter.to_be_bytes());
        self.block.copy_from_slice(&mac.finalize().into_bytes());
        self.counter = self.counter.wrapping_add(1);
        self.offset = 0;
    }
}

impl Drop for Keystream {
    fn drop(&mut self) {
        self.key.zeroize();
        self.block.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_same_stream() {
        let mut a = Keystream::derive(b"ikm", b"label");
        let mut b = Keystream::derive(b"ikm", b"label");
        assert_eq!(a.take(100), b.take(100));
    }

    #[test]
    fn label_separates_streams() {
        let mut a = Keystream::derive(b"ikm", b"one");
        let mut b = Keystream::derive(b"ikm", b"two");
        assert_ne!(a.take(32), b.take(32));
    }

    #[test]
    fn chunking_does_not_change_stream() {
        let mut whole = Keystream::derive(b"ikm", b"label");
        let mut pieces = Keystream::derive(b"ikm", b"label");

        let expected = whole.take(77);
        let mut actual = pieces.take(5);
        actual.extend(pieces.take(40));
        actual.extend(pieces.take(32));

        assert_eq!(expected, actual);
    }

    #[test]
    fn consumed_bytes_are_not_repeated() {
        let mut stream = Keystream::derive(b"ikm", b"label");
        let first = stream.take(32);
        let second = stream.take(32);
        assert_ne!(first, second);
    }

    #[test]
    fn xor_twice_restores_input() {
        let mut a = Keystream::derive(b"ikm", b"label");
        let mut b = Keystream::derive(b"ikm", b"label");

        let mut data = b"attack at dawn".to_vec();
        a.xor_into(&mut data);
        assert_ne!(data, b"attack at dawn");
        b.xor_into(&mut data);
        assert_eq!(data, b"attack at dawn");
    }
}
