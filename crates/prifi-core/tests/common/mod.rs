//! Shared fixtures for role tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use prifi_core::Environment;
use prifi_crypto::{Keypair, PublicKey, schnorr};
use prifi_proto::{KeyBytes, Message, ProtocolParams};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Seeded environment with a wall clock the test moves by hand.
#[derive(Clone)]
pub struct TestEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    wall_ms: Arc<AtomicU64>,
}

impl TestEnv {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            wall_ms: Arc::new(AtomicU64::new(1_700_000_000_000)),
        }
    }

    pub fn advance_wall_clock(&self, millis: u64) {
        self.wall_ms.fetch_add(millis, Ordering::SeqCst);
    }
}

impl Environment for TestEnv {
    type Instant = std::time::Instant;

    fn now(&self) -> Self::Instant {
        std::time::Instant::now()
    }

    fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        std::future::ready(())
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().expect("rng lock").fill_bytes(buffer);
    }

    fn wall_clock_millis(&self) -> u64 {
        self.wall_ms.load(Ordering::SeqCst)
    }
}

/// Deterministic keypair for a fake peer.
pub fn keypair(tag: u8) -> Keypair {
    Keypair::from_random_bytes(&[tag; 64])
}

/// Parameters as the relay forwards them on start.
pub fn started(n_clients: u32, n_trustees: u32) -> ProtocolParams {
    ProtocolParams { start_now: true, up_cell_size: 32, down_cell_size: 32, ..ProtocolParams::new(n_clients, n_trustees) }
}

pub fn key_bytes(keys: &[PublicKey]) -> Vec<KeyBytes> {
    keys.iter().map(PublicKey::to_bytes).collect()
}

/// Schnorr signature over a final shuffle, as a trustee would produce it.
pub fn sign_shuffle(signer: &Keypair, base: &KeyBytes, keys: &[KeyBytes]) -> Vec<u8> {
    let bytes = prifi_core::shuffle_signing_bytes(base, keys);
    schnorr::sign(signer.secret(), &bytes, &[7u8; 64]).to_bytes().to_vec()
}

pub fn kind_names(messages: &[Message]) -> Vec<&'static str> {
    messages.iter().map(|m| m.kind().name()).collect()
}
