//! Fault reporting.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultReason {
    /// The watchdog expired while a switch was still triggered.
    Timeout,
    /// The switch interrupt fired but `CP_CONTEXT_SWITCH_CNTL` still reported a switch in progress.
    SwitchStuck,
}

impl FaultReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            FaultReason::Timeout => "timeout",
            FaultReason::SwitchStuck => "switch-stuck",
        }
    }
}

impl fmt::Display for FaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed preemption, as handed to the recovery path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreemptFault {
    pub reason: FaultReason,
    pub cur_ring: usize,
    /// Ring the failed switch was heading to, if it was still known.
    pub next_ring: Option<usize>,
}

/// Schedules device recovery.
///
/// Called from interrupt and timer context: implementations must only queue the work (the
/// recovery itself resets the device and eventually calls
/// [`crate::PreemptController::hw_init`]).
pub trait RecoveryDispatch: Send + Sync {
    fn request_recovery(&self, fault: PreemptFault);
}
