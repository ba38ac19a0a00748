//! DC-net cell coder.
//!
//! One coder instance lives in every participant for the whole run. Clients
//! and trustees hold one [`Keystream`] per counterpart; the relay holds none
//! and only accumulates.
//!
//! ```text
//! client i cipher  = ⊕_j pad(i,j)            [⊕ payload ⊕ mask(history) if slot owner]
//! trustee j cipher = ⊕_i pad(i,j)
//! relay cell       = ⊕ client ciphers ⊕ trustee ciphers ⊕ mask(history)
//!                  = payload                 (every pad(i,j) appears twice)
//! ```
//!
//! # Invariants
//!
//! - Every participant consumes exactly `size` bytes from each of its
//!   keystreams per encoded round, so pads stay aligned as long as each
//!   cipher is produced for consecutive rounds starting at round 0.
//! - XOR accumulation is commutative: ciphers may be fed to the decoder in
//!   any order within a round.
//! - A round without an owner decodes to the history mask (noise), and two
//!   owners in one round decode to the XOR of their payloads.

use crate::{
    error::CryptoError, group::SharedSecret, history::MessageHistory, keystream::Keystream,
};

/// Per-participant DC-net coder.
pub struct CellCoder {
    streams: Vec<Keystream>,
    decoding: Option<Decoding>,
}

struct Decoding {
    size: usize,
    history: MessageHistory,
    buffer: Vec<u8>,
}

impl CellCoder {
    /// Coder for a client (one secret per trustee) or a trustee (one secret
    /// per client).
    pub fn new(shared_secrets: &[SharedSecret]) -> Self {
        let streams = shared_secrets.iter().map(Keystream::from_shared_secret).collect();
        Self { streams, decoding: None }
    }

    /// Coder for the relay, which never encodes.
    pub fn relay() -> Self {
        Self { streams: Vec::new(), decoding: None }
    }

    /// Produce a client cipher of `size` bytes.
    ///
    /// `payload` is `Some` only when this client owns the round's slot. The
    /// payload is zero-padded to `size` and masked with the history pad; an
    /// empty payload still carries the mask so the owner's cell decodes to
    /// zeros.
    ///
    /// # Errors
    ///
    /// [`CryptoError::PayloadTooLarge`] if the payload exceeds `size`. No
    /// keystream bytes are consumed in that case.
    pub fn client_encode(
        &mut self,
        payload: Option<&[u8]>,
        size: usize,
        history: &MessageHistory,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut cell = vec![0u8; size];

        if let Some(payload) = payload {
            if payload.len() > size {
                return Err(CryptoError::PayloadTooLarge { size: payload.len(), max: size });
            }
            cell[..payload.len()].copy_from_slice(payload);
            xor(&mut cell, &history.mask(size));
        }

        for stream in &mut self.streams {
            stream.xor_into(&mut cell);
        }
        Ok(cell)
    }

    /// Produce a trustee cipher of `size` bytes.
    pub fn trustee_encode(&mut self, size: usize) -> Vec<u8> {
        let mut cell = vec![0u8; size];
        for stream in &mut self.streams {
            stream.xor_into(&mut cell);
        }
        cell
    }

    /// Begin accumulating a new round. Discards any unfinished round.
    pub fn decode_start(&mut self, size: usize, history: &MessageHistory) {
        self.decoding =
            Some(Decoding { size, history: history.clone(), buffer: vec![0u8; size] });
    }

    /// Accumulate one client cipher.
    ///
    /// # Errors
    ///
    /// [`CryptoError::DecodeNotStarted`] outside a round, and
    /// [`CryptoError::CipherLength`] if the cipher is not exactly as long as
    /// the round's cell. A rejected cipher leaves the accumulator untouched.
    pub fn decode_client(&mut self, cipher: &[u8]) -> Result<(), CryptoError> {
        self.accumulate(cipher)
    }

    /// Accumulate one trustee cipher. Fails like [`CellCoder::decode_client`].
    pub fn decode_trustee(&mut self, cipher: &[u8]) -> Result<(), CryptoError> {
        self.accumulate(cipher)
    }

    /// Finish the round and return the decoded cell of the started size.
    pub fn decode_cell(&mut self) -> Result<Vec<u8>, CryptoError> {
        let Decoding { size, history, mut buffer } =
            self.decoding.take().ok_or(CryptoError::DecodeNotStarted)?;
        let mask = history.mask(size);
        xor(&mut buffer, &mask);
        Ok(buffer)
    }

    fn accumulate(&mut self, cipher: &[u8]) -> Result<(), CryptoError> {
        let decoding = self.decoding.as_mut().ok_or(CryptoError::DecodeNotStarted)?;
        if cipher.len() != decoding.size {
            return Err(CryptoError::CipherLength {
                expected: decoding.size,
                actual: cipher.len(),
            });
        }
        xor(&mut decoding.buffer, cipher);
        Ok(())
    }
}

fn xor(dst: &mut [u8], src: &[u8]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d ^= s;
    }
}
