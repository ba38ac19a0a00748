//! Ristretto255 keys and Diffie-Hellman.
//!
//! [`PublicKey`] is any group element: long-term keys, ephemeral keys and
//! shuffle bases all share the type, since the shuffle treats them alike.

use std::fmt;

use curve25519_dalek::{
    constants::RISTRETTO_BASEPOINT_POINT,
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use zeroize::Zeroize;

use crate::error::CryptoError;

/// Encoded length of a group element.
pub const POINT_LEN: usize = 32;

/// Number of random bytes consumed to derive one secret scalar.
pub const SCALAR_SEED_LEN: usize = 64;

/// A Ristretto255 group element.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(RistrettoPoint);

impl PublicKey {
    /// The standard generator of the group.
    pub fn generator() -> Self {
        Self(RISTRETTO_BASEPOINT_POINT)
    }

    /// Decode a compressed element.
    ///
    /// # Errors
    ///
    /// [`CryptoError::InvalidPoint`] if the bytes are not a canonical
    /// encoding.
    pub fn from_bytes(bytes: &[u8; POINT_LEN]) -> Result<Self, CryptoError> {
        CompressedRistretto(*bytes).decompress().map(Self).ok_or(CryptoError::InvalidPoint)
    }

    /// Compressed 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; POINT_LEN] {
        self.0.compress().to_bytes()
    }

    pub(crate) fn from_point(point: RistrettoPoint) -> Self {
        Self(point)
    }

    pub(crate) fn point(&self) -> &RistrettoPoint {
        &self.0
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.to_bytes();
        write!(f, "PublicKey(")?;
        for byte in &bytes[..6] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "..)")
    }
}

/// A secret scalar. Zeroized on drop.
pub struct SecretKey(Scalar);

impl SecretKey {
    /// Derive a secret from 64 uniformly random bytes.
    ///
    /// Reducing 512 bits modulo the group order gives a scalar with
    /// negligible bias.
    pub fn from_random_bytes(bytes: &[u8; SCALAR_SEED_LEN]) -> Self {
        Self(Scalar::from_bytes_mod_order_wide(bytes))
    }

    /// The matching public key `sk · G`.
    pub fn public_key(&self) -> PublicKey {
        PublicKey(RistrettoPoint::mul_base(&self.0))
    }

    /// Multiply an arbitrary group element by this secret.
    ///
    /// Used by clients to recompute `ephemeral_sk · base` when locating
    /// their slot in the shuffled key list.
    pub fn scale(&self, element: &PublicKey) -> PublicKey {
        PublicKey(self.0 * element.0)
    }

    /// Diffie-Hellman with a peer's public key.
    ///
    /// `a.diffie_hellman(B) == b.diffie_hellman(A)` for keypairs (a, A) and
    /// (b, B).
    pub fn diffie_hellman(&self, peer: &PublicKey) -> SharedSecret {
        SharedSecret(self.scale(peer).to_bytes())
    }

    pub(crate) fn scalar(&self) -> &Scalar {
        &self.0
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(..)")
    }
}

/// A long-term or ephemeral keypair.
#[derive(Debug)]
pub struct Keypair {
    secret: SecretKey,
    public: PublicKey,
}

impl Keypair {
    /// Derive a keypair from 64 uniformly random bytes.
    pub fn from_random_bytes(bytes: &[u8; SCALAR_SEED_LEN]) -> Self {
        let secret = SecretKey::from_random_bytes(bytes);
        let public = secret.public_key();
        Self { secret, public }
    }

    /// Secret half.
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    /// Public half.
    pub fn public(&self) -> PublicKey {
        self.public
    }
}

/// Diffie-Hellman output: the encoded shared group element.
pub struct SharedSecret([u8; POINT_LEN]);

impl SharedSecret {
    /// Raw shared element bytes.
    pub fn as_bytes(&self) -> &[u8; POINT_LEN] {
        &self.0
    }
}

impl Drop for SharedSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed(tag: u8) -> [u8; SCALAR_SEED_LEN] {
        let mut bytes = [0u8; SCALAR_SEED_LEN];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = tag.wrapping_mul(31).wrapping_add(i as u8);
        }
        bytes
    }

    #[test]
    fn diffie_hellman_agrees() {
        let alice = Keypair::from_random_bytes(&seed(1));
        let bob = Keypair::from_random_bytes(&seed(2));

        let ab = alice.secret().diffie_hellman(&bob.public());
        let ba = bob.secret().diffie_hellman(&alice.public());

        assert_eq!(ab.as_bytes(), ba.as_bytes());
    }

    #[test]
    fn different_peers_give_different_secrets() {
        let alice = Keypair::from_random_bytes(&seed(1));
        let bob = Keypair::from_random_bytes(&seed(2));
        let carol = Keypair::from_random_bytes(&seed(3));

        let ab = alice.secret().diffie_hellman(&bob.public());
        let ac = alice.secret().diffie_hellman(&carol.public());

        assert_ne!(ab.as_bytes(), ac.as_bytes());
    }

    #[test]
    fn public_key_encoding_roundtrips() {
        let pair = Keypair::from_random_bytes(&seed(7));
        let decoded = PublicKey::from_bytes(&pair.public().to_bytes()).unwrap();
        assert_eq!(decoded, pair.public());
    }

    #[test]
    fn non_canonical_point_rejected() {
        // All-ones is not a canonical field element encoding
        let result = PublicKey::from_bytes(&[0xff; POINT_LEN]);
        assert_eq!(result, Err(CryptoError::InvalidPoint));
    }

    #[test]
    fn scale_by_secret_matches_public_key_on_generator() {
        let pair = Keypair::from_random_bytes(&seed(9));
        assert_eq!(pair.secret().scale(&PublicKey::generator()), pair.public());
    }
}
