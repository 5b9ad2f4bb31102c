//! Injectable time source.
//!
//! Every TTL, backoff, and hop-cap timer in this crate reads time through
//! a [`Clock`] instead of calling `Instant::now()`/`SystemTime::now()`
//! directly, so tests can advance time deterministically instead of
//! sleeping real seconds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// A source of monotonic and wall-clock time.
pub trait Clock: Send + Sync {
    /// Monotonic instant, used for TTLs, backoff, and timeouts.
    fn now(&self) -> Instant;

    /// Wall-clock milliseconds since the Unix epoch, used for
    /// [`crate::wire::MeshMessage::timestamp`] and similar wire fields.
    fn now_millis(&self) -> u64;
}

/// The real system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

/// A clock that only advances when told to — for deterministic TTL,
/// backoff, and hop-cap tests.
pub struct TestClock {
    base: Instant,
    offset_ms: AtomicU64,
    wall_base_ms: u64,
}

impl TestClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
            wall_base_ms: 0,
        })
    }

    /// Advance the clock by `dur`.
    pub fn advance(&self, dur: Duration) {
        self.offset_ms
            .fetch_add(dur.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }

    fn now_millis(&self) -> u64 {
        self.wall_base_ms + self.offset_ms.load(Ordering::SeqCst)
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
