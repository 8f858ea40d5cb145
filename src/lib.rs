//! Adreno GPU driver components.
//!
//! Facade over the workspace crates:
//! - [`preempt`]: ring preemption controller (state machine, ring selection, context-switch
//!   records, watchdog) together with host-side simulation doubles.
//! - [`time`]: host clocks used to drive deadlines.

pub use adreno_preempt as preempt;
pub use adreno_time as time;

pub use adreno_preempt::{PreemptConfig, PreemptController, PreemptDevice, PreemptState};
