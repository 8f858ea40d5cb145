//! Host time sources for driver-side timers.
//!
//! The preemption controller never sleeps and never owns a timer thread. Deadlines (such as the
//! preemption watchdog) are expressed as monotonic nanoseconds on a [`HostClock`] and polled by
//! whoever drives the device (`tick()`). In production the clock is backed by [`Instant`]; unit
//! tests drive it deterministically via [`FakeHostClock`].
//!
//! [`Instant`]: std::time::Instant

mod clock;

pub use clock::{deadline_after, FakeHostClock, HostClock, StdHostClock};
