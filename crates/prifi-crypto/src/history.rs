//! Downstream message history hash chain.

use sha2::{Digest, Sha256};

use crate::keystream::Keystream;

const HISTORY_LABEL: &[u8] = b"prifi-history";
const MASK_LABEL: &[u8] = b"prifi-dcnet-mask";

/// Hash chain over every downstream payload seen in a run.
///
/// Relay and clients fold each downstream cell into the chain in the same
/// order, so at any round they hold equal digests. The slot owner's payload
/// mask is derived from the digest, binding an upstream cipher to the
/// history it was produced under.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MessageHistory {
    digest: [u8; 32],
}

impl MessageHistory {
    /// Empty history (all-zero digest).
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one downstream payload into the chain.
    pub fn update(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(HISTORY_LABEL);
        hasher.update(self.digest);
        hasher.update((data.len() as u64).to_be_bytes());
        hasher.update(data);
        self.digest.copy_from_slice(&hasher.finalize());
    }

    /// Current chain value.
    pub fn digest(&self) -> &[u8; 32] {
        &self.digest
    }

    /// Payload mask of `len` bytes bound to the current digest.
    pub fn mask(&self, len: usize) -> Vec<u8> {
        Keystream::derive(&self.digest, MASK_LABEL).take(len)
    }
}
