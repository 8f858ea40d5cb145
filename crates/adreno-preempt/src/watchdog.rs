//! Preemption watchdog.
//!
//! The watchdog is a deadline on the host clock rather than an OS timer: whoever drives the device
//! polls it through [`crate::PreemptController::tick`], the same way device models here are
//! advanced with an externally supplied `now_ns`. Disarming is advisory. The state machine's
//! `TRIGGERED -> FAULTED` compare-and-swap decides whether an expiry actually faults.

use std::sync::atomic::Ordering;
use std::time::Duration;

use adreno_time::deadline_after;

use crate::sync::AtomicU64;

const DISARMED: u64 = 0;

#[derive(Debug)]
pub struct Watchdog {
    timeout: Duration,
    deadline_ns: AtomicU64,
}

impl Watchdog {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline_ns: AtomicU64::new(DISARMED),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// (Re)arm to expire `timeout` after `now_ns`; returns the deadline.
    pub fn arm(&self, now_ns: u64) -> u64 {
        // 0 is reserved for "disarmed".
        let deadline = deadline_after(now_ns, self.timeout).max(1);
        self.deadline_ns.store(deadline, Ordering::SeqCst);
        deadline
    }

    pub fn cancel(&self) {
        self.deadline_ns.store(DISARMED, Ordering::SeqCst);
    }

    pub fn deadline_ns(&self) -> Option<u64> {
        match self.deadline_ns.load(Ordering::SeqCst) {
            DISARMED => None,
            deadline => Some(deadline),
        }
    }

    pub fn is_expired(&self, now_ns: u64) -> bool {
        self.deadline_ns().is_some_and(|deadline| now_ns >= deadline)
    }

    /// Disarm if `deadline` is still the armed deadline. Returns whether this caller took it; a
    /// re-arm or cancel since `deadline` was read makes the claim fail.
    pub fn claim(&self, deadline: u64) -> bool {
        deadline != DISARMED
            && self
                .deadline_ns
                .compare_exchange(deadline, DISARMED, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn starts_disarmed() {
        let wd = Watchdog::new(Duration::from_secs(10));
        assert_eq!(wd.deadline_ns(), None);
        assert!(!wd.is_expired(u64::MAX));
    }

    #[test]
    fn expires_at_deadline() {
        let wd = Watchdog::new(Duration::from_millis(5));
        assert_eq!(wd.arm(1_000), 5_001_000);
        assert!(!wd.is_expired(5_000_999));
        assert!(wd.is_expired(5_001_000));

        wd.cancel();
        assert!(!wd.is_expired(u64::MAX));
    }

    #[test]
    fn rearming_replaces_deadline() {
        let wd = Watchdog::new(Duration::from_nanos(100));
        wd.arm(0);
        wd.arm(1_000);
        assert_eq!(wd.deadline_ns(), Some(1_100));
    }

    #[test]
    fn zero_timeout_at_time_zero_is_still_armed() {
        let wd = Watchdog::new(Duration::ZERO);
        assert_eq!(wd.arm(0), 1);
        assert!(wd.is_expired(1));
    }

    #[test]
    fn claim_takes_only_the_observed_deadline() {
        let wd = Watchdog::new(Duration::from_nanos(100));
        let first = wd.arm(0);
        let second = wd.arm(50);
        assert!(!wd.claim(first));
        assert_eq!(wd.deadline_ns(), Some(second));

        assert!(wd.claim(second));
        assert_eq!(wd.deadline_ns(), None);
        assert!(!wd.claim(second));
        assert!(!wd.claim(DISARMED));
    }

    #[test]
    fn deadline_saturates() {
        let wd = Watchdog::new(Duration::from_secs(10));
        assert_eq!(wd.arm(u64::MAX - 5), u64::MAX);
    }
}
