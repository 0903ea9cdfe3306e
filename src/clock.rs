//! Injectable wall-clock source. Mirrors the spec's own "testable by
//! injection" treatment of the backoff jitter PRNG (§4.1): the engine
//! never reads `SystemTime::now()`/`Utc::now()` directly so that the §8
//! scenarios ("advance 2s", "advance 1s") can be driven deterministically
//! without real sleeps.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Deterministic clock for tests: starts at a fixed instant and only
/// moves when explicitly advanced.
#[derive(Debug)]
pub struct TestClock {
    now: AtomicI64,
}

impl TestClock {
    pub fn new(start_unix: i64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicI64::new(start_unix),
        })
    }

    pub fn advance(&self, seconds: i64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }

    pub fn set(&self, unix: i64) {
        self.now.store(unix, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_unix(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}
