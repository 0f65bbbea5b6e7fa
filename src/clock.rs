//! The `Clock` collaborator interface (§6): monotonic now, wall-clock now,
//! and sleep-until. All timeouts and intervals in the control plane go
//! through this trait so that tests can drive time deterministically.

use async_trait::async_trait;
use std::time::Duration;

/// Monotonic instant, measured in milliseconds since an arbitrary per-process
/// epoch. Never meaningful across processes; used only for local ordering and
/// interval math.
pub type MonotonicMillis = u64;

/// Wall-clock milliseconds since the Unix epoch. Used only for tie-breaking
/// (`origin_wall_clock`) and TTL expiration, never for ordering (§5).
pub type WallClockMillis = u64;

#[async_trait]
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn monotonic_now(&self) -> MonotonicMillis;
    fn wall_clock_now(&self) -> WallClockMillis;
    async fn sleep(&self, duration: Duration);
}

/// Production clock backed by `std::time::Instant` and the system wall clock.
#[derive(Debug, Clone)]
pub struct SystemClock {
    start: std::time::Instant,
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            start: std::time::Instant::now(),
        }
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn monotonic_now(&self) -> MonotonicMillis {
        self.start.elapsed().as_millis() as u64
    }

    fn wall_clock_now(&self) -> WallClockMillis {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests: monotonic and wall-clock time only advance
/// when `advance` is called; `sleep` resolves immediately so scenario tests
/// run fast.
#[derive(Debug)]
pub struct TestClock {
    monotonic: std::sync::atomic::AtomicU64,
    wall: std::sync::atomic::AtomicU64,
}

impl TestClock {
    pub fn new(wall_start: WallClockMillis) -> Self {
        Self {
            monotonic: std::sync::atomic::AtomicU64::new(0),
            wall: std::sync::atomic::AtomicU64::new(wall_start),
        }
    }

    pub fn advance(&self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        self.monotonic
            .fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
        self.wall.fetch_add(ms, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl Clock for TestClock {
    fn monotonic_now(&self) -> MonotonicMillis {
        self.monotonic.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn wall_clock_now(&self) -> WallClockMillis {
        self.wall.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}
