use std::time::Duration;

/// Tunables for the preemption controller.
///
/// `Default` gives the values the hardware is normally run with; tests and host harnesses override
/// individual fields with struct-update syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreemptConfig {
    /// Preemption granularity written to `CP_CONTEXT_SWITCH_CNTL` (two bits).
    pub preempt_level: u8,
    /// Save and restore GMEM across switches.
    pub uses_gmem: bool,
    pub skip_save_restore: bool,

    /// How long a triggered switch may take before it is declared faulted.
    pub watchdog_timeout: Duration,

    /// Retries a new submission makes while another context is evaluating or aborting.
    pub submit_spin_limit: u32,
    /// Attempts per fenced register write before it is reported as failed.
    pub fenced_write_max_attempts: u32,

    /// Hold the GMU power-collapse keepalive across the trigger sequence.
    pub power_keepalive: bool,

    /// Size of each privileged (secure and non-secure) save area per ring.
    pub context_record_size: usize,
    /// Size of the non-privileged save area per ring and of each queue record.
    pub user_record_size: usize,
}

impl PreemptConfig {
    pub const DEFAULT_CONTEXT_RECORD_SIZE: usize = 2860 * 1024;
    pub const DEFAULT_USER_RECORD_SIZE: usize = 192 * 1024;
}

impl Default for PreemptConfig {
    fn default() -> Self {
        Self {
            preempt_level: 1,
            uses_gmem: true,
            skip_save_restore: false,
            watchdog_timeout: Duration::from_secs(10),
            submit_spin_limit: 1 << 20,
            fenced_write_max_attempts: 100,
            power_keepalive: true,
            context_record_size: Self::DEFAULT_CONTEXT_RECORD_SIZE,
            user_record_size: Self::DEFAULT_USER_RECORD_SIZE,
        }
    }
}
