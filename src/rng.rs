//! Injectable randomness source for the backoff jitter policies (spec
//! §4.1 "testable by injection"). [`backoff::delay_seconds`] takes any
//! `impl Rng`; this module supplies a `Send + Sync`, clonable handle onto
//! a single shared generator so the repository layer can hold one
//! instance behind an `Arc` and swap a seeded generator in for tests
//! without touching the pure backoff function itself.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub struct SharedRng(Mutex<StdRng>);

impl SharedRng {
    pub fn seeded(seed: u64) -> Self {
        Self(Mutex::new(StdRng::seed_from_u64(seed)))
    }

    pub fn from_entropy() -> Self {
        Self(Mutex::new(StdRng::from_entropy()))
    }
}

impl Default for SharedRng {
    fn default() -> Self {
        Self::from_entropy()
    }
}

/// A cheap `RngCore` handle over a shared, mutex-guarded generator. Clone
/// freely; every clone draws from the same underlying stream.
#[derive(Clone)]
pub struct ArcRng(pub std::sync::Arc<SharedRng>);

impl RngCore for ArcRng {
    fn next_u32(&mut self) -> u32 {
        self.0 .0.lock().expect("rng lock poisoned").next_u32()
    }

    fn next_u64(&mut self) -> u64 {
        self.0 .0.lock().expect("rng lock poisoned").next_u64()
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        self.0 .0.lock().expect("rng lock poisoned").fill_bytes(dest)
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand::Error> {
        self.0 .0.lock().expect("rng lock poisoned").try_fill_bytes(dest)
    }
}
