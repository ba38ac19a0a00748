//! Verifiable shuffle of ephemeral public keys.
//!
//! Each trustee takes `(base, keys)`, picks a secret exponent `s` and a
//! permutation `π`, and outputs
//!
//! ```text
//! new_base    = s · base
//! new_keys[i] = s · keys[π(i)]
//! ```
//!
//! A client holding `x` with `keys[j] = x · base` finds its entry after the
//! shuffle as `x · new_base`, while nobody without `s` and `π` can link input
//! positions to output positions. Chaining the step across all trustees means
//! a single honest trustee suffices for unlinkability.
//!
//! # Proof
//!
//! The proof is a non-interactive cut-and-choose argument. The prover builds
//! [`SHUFFLE_PROOF_ROUNDS`] shadow shuffles `(t_k · base, t_k · keys[σ_k(i)])`
//! and derives one challenge bit per shadow by hashing the statement and all
//! shadows. For bit 0 it opens the shadow (`t_k`, `σ_k`); for bit 1 it shows
//! how the shadow maps onto the real output (`s / t_k`, `σ_k⁻¹ ∘ π`). Either
//! opening alone reveals nothing about `π`; answering both for one shadow
//! would require knowing a valid `(s, π)`.
//!
//! # Invariants
//!
//! - Soundness: a prover without a valid witness passes with probability at
//!   most 2^-[`SHUFFLE_PROOF_ROUNDS`].
//! - Encoding is canonical and fully checked: changing any byte of an
//!   encoded proof makes [`verify`] fail, either at parse time (bad point,
//!   non-canonical scalar, non-permutation, wrong length) or in an equation.
//! - The input base must not be the identity element.

use curve25519_dalek::{ristretto::RistrettoPoint, scalar::Scalar, traits::Identity};
use sha2::{Digest, Sha512};

use crate::{
    error::CryptoError,
    group::{POINT_LEN, PublicKey},
    keystream::Keystream,
    schnorr::wide_scalar,
};

/// Number of shadow shuffles per proof.
pub const SHUFFLE_PROOF_ROUNDS: usize = 64;

/// Upper bound on shuffled list length accepted from the wire.
pub const MAX_SHUFFLE_KEYS: usize = 4096;

const PROVER_LABEL: &[u8] = b"prifi-shuffle-prover";
const CHALLENGE_LABEL: &[u8] = b"prifi-shuffle-challenge";
const HEADER_LEN: usize = 6;
const SCALAR_LEN: usize = 32;
const INDEX_LEN: usize = 4;

/// Output of one shuffle step.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleOutput {
    /// Re-blinded base.
    pub base: PublicKey,
    /// Permuted, re-blinded keys.
    pub keys: Vec<PublicKey>,
    /// Proof that `(base, keys)` is a shuffle of the input.
    pub proof: ShuffleProof,
}

/// One entry of a shuffle transcript: a step's output and its proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleStep {
    /// Output base of this step.
    pub base: PublicKey,
    /// Output keys of this step.
    pub keys: Vec<PublicKey>,
    /// Proof relating this step to its input.
    pub proof: ShuffleProof,
}

/// Cut-and-choose shuffle proof.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShuffleProof {
    shadows: Vec<Shadow>,
    responses: Vec<Response>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Shadow {
    base: PublicKey,
    keys: Vec<PublicKey>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Response {
    factor: Scalar,
    permutation: Vec<u32>,
}

/// Shuffle `keys` under `base`.
///
/// All randomness (the secret exponent, the permutation and every shadow) is
/// expanded from `seed`; the same seed yields the same output.
///
/// # Errors
///
/// [`CryptoError::InvalidShuffleInput`] for an empty or oversized key list
/// or an identity base.
pub fn shuffle(
    base: &PublicKey,
    keys: &[PublicKey],
    seed: &[u8; 32],
) -> Result<ShuffleOutput, CryptoError> {
    check_input(base, keys)?;
    let n = keys.len();
    let mut rng = Keystream::derive(seed, PROVER_LABEL);

    let secret = nonzero_scalar(&mut rng);
    let permutation = random_permutation(n, &mut rng);
    let new_base = PublicKey::from_point(secret * base.point());
    let new_keys: Vec<_> = permutation
        .iter()
        .map(|&from| PublicKey::from_point(secret * keys[from as usize].point()))
        .collect();

    let mut openings = Vec::with_capacity(SHUFFLE_PROOF_ROUNDS);
    let mut shadows = Vec::with_capacity(SHUFFLE_PROOF_ROUNDS);
    for _ in 0..SHUFFLE_PROOF_ROUNDS {
        let blind = nonzero_scalar(&mut rng);
        let sigma = random_permutation(n, &mut rng);
        shadows.push(Shadow {
            base: PublicKey::from_point(blind * base.point()),
            keys: sigma
                .iter()
                .map(|&from| PublicKey::from_point(blind * keys[from as usize].point()))
                .collect(),
        });
        openings.push((blind, sigma));
    }

    let bits = challenge_bits(base, keys, &new_base, &new_keys, &shadows);
    let responses = openings
        .into_iter()
        .enumerate()
        .map(|(k, (blind, sigma))| {
            if bit(&bits, k) {
                let inverse = invert_permutation(&sigma);
                Response {
                    factor: secret * blind.invert(),
                    permutation: permutation.iter().map(|&p| inverse[p as usize]).collect(),
                }
            } else {
                Response { factor: blind, permutation: sigma }
            }
        })
        .collect();

    Ok(ShuffleOutput { base: new_base, keys: new_keys, proof: ShuffleProof { shadows, responses } })
}

/// Verify that `(new_base, new_keys)` is a shuffle of `(base, keys)`.
pub fn verify(
    base: &PublicKey,
    keys: &[PublicKey],
    new_base: &PublicKey,
    new_keys: &[PublicKey],
    proof: &ShuffleProof,
) -> Result<(), CryptoError> {
    verify_step(0, base, keys, new_base, new_keys, proof)
}

/// Verify a whole transcript starting from its initial input.
///
/// Step 0 is checked against `(initial_base, initial_keys)`, every later
/// step against the output of the step before it.
pub fn verify_chain(
    initial_base: &PublicKey,
    initial_keys: &[PublicKey],
    steps: &[ShuffleStep],
) -> Result<(), CryptoError> {
    let mut base = initial_base;
    let mut keys = initial_keys;
    for (index, step) in steps.iter().enumerate() {
        verify_step(index, base, keys, &step.base, &step.keys, &step.proof)?;
        base = &step.base;
        keys = &step.keys;
    }
    Ok(())
}

fn verify_step(
    step: usize,
    base: &PublicKey,
    keys: &[PublicKey],
    new_base: &PublicKey,
    new_keys: &[PublicKey],
    proof: &ShuffleProof,
) -> Result<(), CryptoError> {
    check_input(base, keys)?;
    let n = keys.len();
    if new_keys.len() != n {
        return Err(CryptoError::InvalidShuffleInput(format!(
            "step {step}: {} output keys for {n} inputs",
            new_keys.len()
        )));
    }
    if proof.key_count() != Some(n) || proof.shadows.len() != SHUFFLE_PROOF_ROUNDS {
        return Err(CryptoError::MalformedProof(format!("step {step}: dimensions do not match")));
    }

    let bits = challenge_bits(base, keys, new_base, new_keys, &proof.shadows);
    for (round, (shadow, response)) in proof.shadows.iter().zip(&proof.responses).enumerate() {
        let factor = &response.factor;
        let holds = if bit(&bits, round) {
            new_base.point() == &(factor * shadow.base.point())
                && new_keys.iter().zip(&response.permutation).all(|(key, &from)| {
                    key.point() == &(factor * shadow.keys[from as usize].point())
                })
        } else {
            shadow.base.point() == &(factor * base.point())
                && shadow.keys.iter().zip(&response.permutation).all(|(key, &from)| {
                    key.point() == &(factor * keys[from as usize].point())
                })
        };
        if !holds {
            return Err(CryptoError::ProofRejected { step, round });
        }
    }
    Ok(())
}

impl ShuffleProof {
    /// Number of keys this proof is about, if it has any shadows.
    fn key_count(&self) -> Option<usize> {
        let n = self.shadows.first()?.keys.len();
        let consistent = self.shadows.iter().all(|s| s.keys.len() == n)
            && self.responses.len() == self.shadows.len()
            && self.responses.iter().all(|r| r.permutation.len() == n);
        consistent.then_some(n)
    }

    /// Canonical encoding.
    ///
    /// ```text
    /// [n: u32][rounds: u16]
    /// rounds × ( shadow base (32) || n × shadow key (32) )
    /// rounds × ( factor (32) || n × index (u32) )
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let n = self.shadows.first().map_or(0, |s| s.keys.len());
        let rounds = self.shadows.len();
        let mut out = Vec::with_capacity(encoded_len(n, rounds).unwrap_or(0));

        out.extend_from_slice(&(n as u32).to_be_bytes());
        out.extend_from_slice(&(rounds as u16).to_be_bytes());
        for shadow in &self.shadows {
            out.extend_from_slice(&shadow.base.to_bytes());
            for key in &shadow.keys {
                out.extend_from_slice(&key.to_bytes());
            }
        }
        for response in &self.responses {
            out.extend_from_slice(response.factor.as_bytes());
            for index in &response.permutation {
                out.extend_from_slice(&index.to_be_bytes());
            }
        }
        out
    }

    /// Parse and structurally validate an encoded proof.
    ///
    /// # Errors
    ///
    /// [`CryptoError::MalformedProof`] if the header, length, points,
    /// scalars or permutations are invalid.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let malformed = |reason: &str| CryptoError::MalformedProof(reason.to_string());

        let header = bytes.get(..HEADER_LEN).ok_or_else(|| malformed("truncated header"))?;
        let n = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let rounds = u16::from_be_bytes([header[4], header[5]]) as usize;
        if n == 0 || n > MAX_SHUFFLE_KEYS {
            return Err(malformed("key count out of range"));
        }
        if rounds != SHUFFLE_PROOF_ROUNDS {
            return Err(malformed("unexpected round count"));
        }
        if encoded_len(n, rounds) != Some(bytes.len()) {
            return Err(malformed("length does not match header"));
        }

        let mut cursor = &bytes[HEADER_LEN..];
        let mut shadows = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let base = read_point(&mut cursor)?;
            let keys = (0..n).map(|_| read_point(&mut cursor)).collect::<Result<_, _>>()?;
            shadows.push(Shadow { base, keys });
        }

        let mut responses = Vec::with_capacity(rounds);
        for _ in 0..rounds {
            let (scalar_bytes, rest) = cursor.split_at(SCALAR_LEN);
            cursor = rest;
            let mut raw = [0u8; SCALAR_LEN];
            raw.copy_from_slice(scalar_bytes);
            let factor: Option<Scalar> = Scalar::from_canonical_bytes(raw).into();
            let factor = factor.ok_or_else(|| malformed("non-canonical scalar"))?;
            if factor == Scalar::ZERO {
                return Err(malformed("zero scalar"));
            }

            let mut permutation = Vec::with_capacity(n);
            let mut seen = vec![false; n];
            for _ in 0..n {
                let (index_bytes, rest) = cursor.split_at(INDEX_LEN);
                cursor = rest;
                let index = u32::from_be_bytes([
                    index_bytes[0],
                    index_bytes[1],
                    index_bytes[2],
                    index_bytes[3],
                ]);
                let slot = seen.get_mut(index as usize).ok_or_else(|| malformed("index range"))?;
                if *slot {
                    return Err(malformed("repeated index"));
                }
                *slot = true;
                permutation.push(index);
            }
            responses.push(Response { factor, permutation });
        }

        Ok(Self { shadows, responses })
    }
}

fn check_input(base: &PublicKey, keys: &[PublicKey]) -> Result<(), CryptoError> {
    if keys.is_empty() || keys.len() > MAX_SHUFFLE_KEYS {
        return Err(CryptoError::InvalidShuffleInput(format!("{} keys", keys.len())));
    }
    if base.point() == &RistrettoPoint::identity() {
        return Err(CryptoError::InvalidShuffleInput("identity base".to_string()));
    }
    Ok(())
}

fn encoded_len(n: usize, rounds: usize) -> Option<usize> {
    let shadow = n.checked_add(1)?.checked_mul(POINT_LEN)?;
    let response = n.checked_mul(INDEX_LEN)?.checked_add(SCALAR_LEN)?;
    shadow.checked_add(response)?.checked_mul(rounds)?.checked_add(HEADER_LEN)
}

fn read_point(cursor: &mut &[u8]) -> Result<PublicKey, CryptoError> {
    let (head, rest) = cursor.split_at(POINT_LEN);
    *cursor = rest;
    let mut raw = [0u8; POINT_LEN];
    raw.copy_from_slice(head);
    PublicKey::from_bytes(&raw).map_err(|_| CryptoError::MalformedProof("invalid point".into()))
}

fn challenge_bits(
    base: &PublicKey,
    keys: &[PublicKey],
    new_base: &PublicKey,
    new_keys: &[PublicKey],
    shadows: &[Shadow],
) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(CHALLENGE_LABEL);
    hasher.update((keys.len() as u32).to_be_bytes());
    hasher.update(base.to_bytes());
    for key in keys {
        hasher.update(key.to_bytes());
    }
    hasher.update(new_base.to_bytes());
    for key in new_keys {
        hasher.update(key.to_bytes());
    }
    for shadow in shadows {
        hasher.update(shadow.base.to_bytes());
        for key in &shadow.keys {
            hasher.update(key.to_bytes());
        }
    }
    let mut bits = [0u8; 64];
    bits.copy_from_slice(&hasher.finalize());
    bits
}

fn bit(bits: &[u8; 64], index: usize) -> bool {
    (bits[index / 8] >> (index % 8)) & 1 == 1
}

fn nonzero_scalar(rng: &mut Keystream) -> Scalar {
    loop {
        let scalar = wide_scalar(&rng.take(64));
        if scalar != Scalar::ZERO {
            return scalar;
        }
    }
}

fn random_permutation(n: usize, rng: &mut Keystream) -> Vec<u32> {
    let mut permutation: Vec<u32> = (0..n as u32).collect();
    for i in (1..n).rev() {
        let j = (rng.next_u64() % (i as u64 + 1)) as usize;
        permutation.swap(i, j);
    }
    permutation
}

fn invert_permutation(permutation: &[u32]) -> Vec<u32> {
    let mut inverse = vec![0u32; permutation.len()];
    for (i, &p) in permutation.iter().enumerate() {
        inverse[p as usize] = i as u32;
    }
    inverse
}
