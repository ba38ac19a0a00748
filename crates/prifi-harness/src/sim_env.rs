//! Seeded Environment implementation for deterministic testing.

use std::{
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use prifi_core::Environment;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha20Rng;

/// Wall-clock reading of a fresh environment: 2023-11-14T22:13:20Z.
pub const SIM_EPOCH_MILLIS: u64 = 1_700_000_000_000;

#[derive(Clone, Copy)]
enum WallClock {
    /// Moves only through [`SimEnv::advance_wall_clock`].
    Manual,
    /// Follows tokio's (turmoil's) virtual clock from `start`.
    Virtual { start: tokio::time::Instant },
}

/// Simulation environment: seeded RNG and controllable clocks.
///
/// - **Seeded RNG**: `random_bytes()` draws from a ChaCha20 stream, so every
///   key, shuffle secret and nonce of a run is reproducible from the seed.
/// - **Monotonic time**: `now()` and `sleep()` use tokio's clock, which
///   Turmoil virtualizes.
/// - **Wall clock**: either manual (sans-IO simulations advance it per
///   delivered message) or tied to the virtual clock (Turmoil runs).
///
/// Clones share the RNG and the wall clock, so handing clones to several
/// roles still yields one deterministic stream.
#[derive(Clone)]
pub struct SimEnv {
    rng: Arc<Mutex<ChaCha20Rng>>,
    wall_offset: Arc<AtomicU64>,
    clock: WallClock,
}

impl SimEnv {
    /// Environment with seed 0 and a manual wall clock.
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// Environment with a manual wall clock.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Arc::new(Mutex::new(ChaCha20Rng::seed_from_u64(seed))),
            wall_offset: Arc::new(AtomicU64::new(0)),
            clock: WallClock::Manual,
        }
    }

    /// Environment whose wall clock follows virtual time.
    ///
    /// Create it inside the simulation so the clock starts with the run.
    pub fn virtual_time(seed: u64) -> Self {
        let clock = WallClock::Virtual { start: tokio::time::Instant::now() };
        Self { clock, ..Self::with_seed(seed) }
    }

    /// Move the wall clock forward.
    pub fn advance_wall_clock(&self, by: Duration) {
        self.wall_offset.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Default for SimEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl Environment for SimEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        self.rng.lock().unwrap_or_else(PoisonError::into_inner).fill_bytes(buffer);
    }

    fn wall_clock_millis(&self) -> u64 {
        let elapsed = match self.clock {
            WallClock::Manual => 0,
            WallClock::Virtual { start } => start.elapsed().as_millis() as u64,
        };
        SIM_EPOCH_MILLIS + self.wall_offset.load(Ordering::SeqCst) + elapsed
    }
}
