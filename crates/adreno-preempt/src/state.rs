//! Preemption state machine.
//!
//! A single atomic word shared by submitters, the interrupt handler and the watchdog. The word is
//! only ever changed through [`PreemptStateCell::compare_exchange`] (an edge that may lose a race)
//! or [`PreemptStateCell::force`] (an edge owned by whoever currently drives the sequence). No lock
//! is held across either.
//!
//! ```text
//! NONE -> EVALUATE -> START -> TRIGGERED -> PENDING -> ABORT -> NONE
//!             |                   |            |
//!             +-> ABORT -> NONE   +-> FAULTED  +-> FAULTED
//! ```

use core::fmt;

use crate::sync::{fence, AtomicU32};
use std::sync::atomic::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PreemptState {
    /// No preemption sequence in flight.
    None = 0,
    /// A caller owns the machine and is choosing the next ring.
    Evaluate = 1,
    /// Records are being populated for a switch.
    Start = 2,
    /// The switch has been handed to hardware; the watchdog is armed.
    Triggered = 3,
    /// The interrupt handler is finishing the switch.
    Pending = 4,
    /// The sequence is unwinding without (further) hardware involvement.
    Abort = 5,
    /// The switch failed; only a device reset leaves this state.
    Faulted = 6,
}

impl PreemptState {
    pub const ALL: [PreemptState; 7] = [
        PreemptState::None,
        PreemptState::Evaluate,
        PreemptState::Start,
        PreemptState::Triggered,
        PreemptState::Pending,
        PreemptState::Abort,
        PreemptState::Faulted,
    ];

    pub const fn to_raw(self) -> u32 {
        self as u32
    }

    pub const fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => PreemptState::None,
            1 => PreemptState::Evaluate,
            2 => PreemptState::Start,
            3 => PreemptState::Triggered,
            4 => PreemptState::Pending,
            5 => PreemptState::Abort,
            6 => PreemptState::Faulted,
            _ => return None,
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            PreemptState::None => "none",
            PreemptState::Evaluate => "evaluate",
            PreemptState::Start => "start",
            PreemptState::Triggered => "triggered",
            PreemptState::Pending => "pending",
            PreemptState::Abort => "abort",
            PreemptState::Faulted => "faulted",
        }
    }

    /// Whether `from -> to` is an edge of the transition table.
    ///
    /// Device reset (`hw_init`) may move any state to `None`; that is not an edge of the table and
    /// is reported separately.
    pub const fn can_transition(from: PreemptState, to: PreemptState) -> bool {
        use PreemptState::*;

        matches!(
            (from, to),
            (None, Evaluate)
                | (Evaluate, Start)
                | (Evaluate, Abort)
                | (Start, Triggered)
                | (Triggered, Pending)
                | (Triggered, Faulted)
                | (Pending, Abort)
                | (Pending, Faulted)
                | (Abort, None)
        )
    }
}

impl fmt::Display for PreemptState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Integer-backed atomic holding a [`PreemptState`].
#[derive(Debug)]
pub struct PreemptStateCell {
    raw: AtomicU32,
}

impl PreemptStateCell {
    pub fn new(initial: PreemptState) -> Self {
        Self {
            raw: AtomicU32::new(initial.to_raw()),
        }
    }

    pub fn load(&self) -> PreemptState {
        decode(self.raw.load(Ordering::SeqCst))
    }

    /// Compare-and-swap `old -> new`.
    ///
    /// Returns `Ok(old)` on success and `Err(observed)` when another context moved the state
    /// first.
    pub fn compare_exchange(
        &self,
        old: PreemptState,
        new: PreemptState,
    ) -> Result<PreemptState, PreemptState> {
        self.raw
            .compare_exchange(
                old.to_raw(),
                new.to_raw(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(decode)
            .map_err(decode)
    }

    /// Compare-and-swap `old -> new`, reporting only whether this caller won the edge.
    pub fn try_transition(&self, old: PreemptState, new: PreemptState) -> bool {
        self.compare_exchange(old, new).is_ok()
    }

    /// Unconditionally set the state and return the previous one.
    ///
    /// Fenced on both sides so that contexts observing the new value also observe every memory
    /// write issued before it (`cur_ring`, `next_ring`, record contents), and no later write is
    /// observed before it.
    pub fn force(&self, new: PreemptState) -> PreemptState {
        fence(Ordering::SeqCst);
        let prev = self.raw.swap(new.to_raw(), Ordering::SeqCst);
        fence(Ordering::SeqCst);
        decode(prev)
    }
}

fn decode(raw: u32) -> PreemptState {
    // Only values produced by `to_raw` are ever stored.
    PreemptState::from_raw(raw).unwrap_or(PreemptState::Faulted)
}
