use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic nanosecond clock.
///
/// Implementations must be callable from any execution context (submission, interrupt, timer), so
/// `now_ns` must not block.
pub trait HostClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Compute `now_ns + timeout`, saturating instead of wrapping.
pub fn deadline_after(now_ns: u64, timeout: Duration) -> u64 {
    let timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
    now_ns.saturating_add(timeout_ns)
}

/// [`HostClock`] backed by [`Instant`], counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct StdHostClock {
    origin: Instant,
}

impl StdHostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for StdHostClock {
    fn default() -> Self {
        Self::new()
    }
}

impl HostClock for StdHostClock {
    fn now_ns(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct FakeHostClock {
    now_ns: AtomicU64,
}

impl FakeHostClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now_ns: AtomicU64::new(start_ns),
        }
    }

    pub fn set_ns(&self, now_ns: u64) {
        self.now_ns.store(now_ns, Ordering::SeqCst);
    }

    /// Advance the clock and return the new time.
    pub fn advance(&self, delta: Duration) -> u64 {
        let delta_ns = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        let prev = self
            .now_ns
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |now| {
                Some(now.saturating_add(delta_ns))
            })
            .unwrap_or_else(|now| now);
        prev.saturating_add(delta_ns)
    }
}

impl HostClock for FakeHostClock {
    fn now_ns(&self) -> u64 {
        self.now_ns.load(Ordering::SeqCst)
    }
}
