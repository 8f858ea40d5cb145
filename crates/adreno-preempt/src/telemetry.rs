//! Preemption events and counters.
//!
//! Events are a passive stream: sinks observe them but cannot influence the sequence. Every sink is
//! called from whatever context produced the event (including the interrupt handler), so
//! implementations must not block.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::recovery::FaultReason;
use crate::state::PreemptState;

/// Why a trigger attempt returned without starting a switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerExitReason {
    /// Another context owned the state machine.
    Busy,
    /// The best ring was already current, or nothing had work.
    NoSwitch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreemptEvent {
    /// A submission published its write pointer, either to `CP_RB_WPTR` or deferred to the
    /// preemption path.
    SubmitFlush { ring: usize, wptr: u32, deferred: bool },
    TriggerExit {
        reason: TriggerExitReason,
        new_submission: bool,
        state: PreemptState,
    },
    /// A switch from `from` to `to` was handed to hardware.
    Trigger { from: usize, to: usize, wptr: u32 },
    /// A switch completed; `ring` is now current.
    Interrupt { ring: usize },
    Fault { ring: usize, reason: FaultReason },
    /// A deferred write pointer was applied. `old` is the value read back from hardware.
    WptrUpdate { ring: usize, old: u32, new: u32 },
    StateChange { from: PreemptState, to: PreemptState },
    /// The state machine was reset by hardware init (not an edge of the transition table).
    Reset { from: PreemptState },
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: &PreemptEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTelemetry;

impl TelemetrySink for NullTelemetry {
    fn record(&self, _event: &PreemptEvent) {}
}

/// Forwards events to `tracing` at `TRACE` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record(&self, event: &PreemptEvent) {
        match *event {
            PreemptEvent::SubmitFlush {
                ring,
                wptr,
                deferred,
            } => tracing::trace!(target: "adreno::preempt", ring, wptr, deferred, "submit flush"),
            PreemptEvent::TriggerExit {
                reason,
                new_submission,
                state,
            } => tracing::trace!(
                target: "adreno::preempt",
                ?reason,
                new_submission,
                state = state.as_str(),
                "trigger exit"
            ),
            PreemptEvent::Trigger { from, to, wptr } => {
                tracing::trace!(target: "adreno::preempt", from, to, wptr, "trigger")
            }
            PreemptEvent::Interrupt { ring } => {
                tracing::trace!(target: "adreno::preempt", ring, "preemption irq")
            }
            PreemptEvent::Fault { ring, reason } => {
                tracing::trace!(target: "adreno::preempt", ring, ?reason, "fault")
            }
            PreemptEvent::WptrUpdate { ring, old, new } => {
                tracing::trace!(target: "adreno::preempt", ring, old, new, "wptr update")
            }
            PreemptEvent::StateChange { from, to } => tracing::trace!(
                target: "adreno::preempt",
                from = from.as_str(),
                to = to.as_str(),
                "state change"
            ),
            PreemptEvent::Reset { from } => {
                tracing::trace!(target: "adreno::preempt", from = from.as_str(), "reset")
            }
        }
    }
}

/// Buffers events in memory; used by tests and by harnesses that replay a sequence.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    events: Mutex<Vec<PreemptEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> std::sync::MutexGuard<'_, Vec<PreemptEvent>> {
        match self.events.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Drain the events recorded so far.
    pub fn take(&self) -> Vec<PreemptEvent> {
        std::mem::take(&mut *self.events())
    }

    pub fn snapshot(&self) -> Vec<PreemptEvent> {
        self.events().clone()
    }

    /// Every `StateChange` recorded so far, in order.
    pub fn state_changes(&self) -> Vec<(PreemptState, PreemptState)> {
        self.events()
            .iter()
            .filter_map(|event| match *event {
                PreemptEvent::StateChange { from, to } => Some((from, to)),
                _ => None,
            })
            .collect()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record(&self, event: &PreemptEvent) {
        self.events().push(*event);
    }
}

/// Snapshot of [`PreemptStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PreemptStatsSnapshot {
    pub triggers: u64,
    pub switches: u64,
    pub aborts: u64,
    pub faults: u64,
    pub timeouts: u64,
    pub fenced_write_retries: u64,
    pub fenced_write_failures: u64,
    pub wptr_writes: u64,
    pub deferred_wptr_flushes: u64,
    pub submit_spins: u64,
}

/// Counters for the preemption controller.
///
/// Updated with relaxed atomics from every context; a snapshot is not a consistent cut across
/// counters.
#[derive(Debug, Default)]
pub struct PreemptStats {
    triggers: AtomicU64,
    switches: AtomicU64,
    aborts: AtomicU64,
    faults: AtomicU64,
    timeouts: AtomicU64,
    fenced_write_retries: AtomicU64,
    fenced_write_failures: AtomicU64,
    wptr_writes: AtomicU64,
    deferred_wptr_flushes: AtomicU64,
    submit_spins: AtomicU64,
}

impl PreemptStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_triggers(&self) {
        self.triggers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_switches(&self) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_aborts(&self) {
        self.aborts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_faults(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_timeouts(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_fenced_write_retries(&self, retries: u32) {
        if retries != 0 {
            self.fenced_write_retries
                .fetch_add(u64::from(retries), Ordering::Relaxed);
        }
    }

    pub fn inc_fenced_write_failures(&self) {
        self.fenced_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_wptr_writes(&self) {
        self.wptr_writes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deferred_wptr_flushes(&self) {
        self.deferred_wptr_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_submit_spins(&self) {
        self.submit_spins.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PreemptStatsSnapshot {
        PreemptStatsSnapshot {
            triggers: self.triggers.load(Ordering::Relaxed),
            switches: self.switches.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            fenced_write_retries: self.fenced_write_retries.load(Ordering::Relaxed),
            fenced_write_failures: self.fenced_write_failures.load(Ordering::Relaxed),
            wptr_writes: self.wptr_writes.load(Ordering::Relaxed),
            deferred_wptr_flushes: self.deferred_wptr_flushes.load(Ordering::Relaxed),
            submit_spins: self.submit_spins.load(Ordering::Relaxed),
        }
    }
}
