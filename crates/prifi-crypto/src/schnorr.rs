//! Schnorr signatures over Ristretto255.
//!
//! Trustees sign the final shuffle output with their long-term keys; clients
//! and the relay verify. Signature layout is `R (32 bytes) || s (32 bytes)`
//! with `R = k·G`, `c = H(R || P || m)`, `s = k + c·x`.
//!
//! The nonce is derived from caller-provided randomness hashed together with
//! the secret and the message, so a weak random source alone does not leak
//! the key.

use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar};
use sha2::{Digest, Sha512};

use crate::{
    error::CryptoError,
    group::{PublicKey, SCALAR_SEED_LEN, SecretKey},
};

const NONCE_LABEL: &[u8] = b"prifi-schnorr-nonce";
const CHALLENGE_LABEL: &[u8] = b"prifi-schnorr-challenge";

/// Encoded signature length.
pub const SIGNATURE_LEN: usize = 64;

/// A Schnorr signature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signature([u8; SIGNATURE_LEN]);

impl Signature {
    /// Parse a signature from wire bytes.
    ///
    /// Only the length is checked here; the encoded values are validated by
    /// [`verify`].
    pub fn from_slice(bytes: &[u8]) -> Result<Self, CryptoError> {
        let array: [u8; SIGNATURE_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self(array))
    }

    /// Encoded bytes.
    pub fn to_bytes(&self) -> [u8; SIGNATURE_LEN] {
        self.0
    }
}

/// Sign `message` with `secret`.
pub fn sign(secret: &SecretKey, message: &[u8], random: &[u8; SCALAR_SEED_LEN]) -> Signature {
    let mut hasher = Sha512::new();
    hasher.update(NONCE_LABEL);
    hasher.update(random);
    hasher.update(secret.scalar().as_bytes());
    hasher.update(message);
    let nonce = wide_scalar(&hasher.finalize());

    let commitment = RistrettoPoint::mul_base(&nonce);
    let public = secret.public_key();
    let challenge = challenge(&commitment, &public, message);
    let response = nonce + challenge * secret.scalar();

    let mut bytes = [0u8; SIGNATURE_LEN];
    bytes[..32].copy_from_slice(&commitment.compress().to_bytes());
    bytes[32..].copy_from_slice(response.as_bytes());
    Signature(bytes)
}

/// Verify `signature` on `message` under `public`.
///
/// # Errors
///
/// [`CryptoError::InvalidSignature`] if the encoding is invalid or the
/// verification equation does not hold.
pub fn verify(
    public: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> Result<(), CryptoError> {
    let mut r_bytes = [0u8; 32];
    r_bytes.copy_from_slice(&signature.0[..32]);
    let commitment =
        PublicKey::from_bytes(&r_bytes).map_err(|_| CryptoError::InvalidSignature)?;

    let mut s_bytes = [0u8; 32];
    s_bytes.copy_from_slice(&signature.0[32..]);
    let response: Option<Scalar> = Scalar::from_canonical_bytes(s_bytes).into();
    let response = response.ok_or(CryptoError::InvalidSignature)?;

    let challenge = challenge(commitment.point(), public, message);
    let lhs = RistrettoPoint::mul_base(&response);
    let rhs = commitment.point() + challenge * public.point();

    if lhs == rhs { Ok(()) } else { Err(CryptoError::InvalidSignature) }
}

fn challenge(commitment: &RistrettoPoint, public: &PublicKey, message: &[u8]) -> Scalar {
    let mut hasher = Sha512::new();
    hasher.update(CHALLENGE_LABEL);
    hasher.update(commitment.compress().as_bytes());
    hasher.update(public.to_bytes());
    hasher.update(message);
    wide_scalar(&hasher.finalize())
}

pub(crate) fn wide_scalar(digest: &[u8]) -> Scalar {
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest[..64]);
    Scalar::from_bytes_mod_order_wide(&wide)
}
