//! Ring preemption for Adreno-style GPU command processors.
//!
//! The CP runs one ring at a time. [`PreemptController`] decides when a higher-priority ring
//! should take over, programs the context-switch records and restore addresses, starts the switch,
//! and finishes it from the switch interrupt. A watchdog turns a switch that never completes into
//! a [`PreemptFault`] handed to the driver's [`RecoveryDispatch`].
//!
//! The controller is shared between submission, interrupt and timer contexts. Coordination is a
//! single lock-free [`PreemptState`] word; per-ring locks only guard a ring's write pointer.
//!
//! Hardware and driver services are reached through traits ([`GpuMmio`], [`DeviceAllocator`],
//! [`AddressSpace`], [`RecoveryDispatch`], [`TelemetrySink`] and [`adreno_time::HostClock`]); the
//! [`sim`] module provides host-side implementations of all of them.
#![forbid(unsafe_code)]

mod config;
mod controller;
mod error;
pub mod memory;
pub mod record;
pub mod recovery;
pub mod regs;
pub mod ring;
pub mod select;
pub mod sim;
pub mod state;
mod sync;
pub mod telemetry;
pub mod watchdog;

pub use config::PreemptConfig;
pub use controller::{PreemptController, PreemptDevice};
pub use error::{PreemptError, Result};
pub use memory::{
    AddressSpace, AllocError, BufferFlags, DeviceAllocator, DeviceBuffer, PageTableParams,
    StaticAddressSpace,
};
pub use record::{
    PreemptRecord, QueueRecord, RecordLayout, RecordStore, RingRecords, SmmuInfo, SubmitQueue,
    PREEMPT_RECORD_MAGIC, SMMU_INFO_MAGIC,
};
pub use recovery::{FaultReason, PreemptFault, RecoveryDispatch};
pub use regs::{ContextSwitchCntl, FencedWriteError, FencedWriter, GpuMmio};
pub use ring::{Ring, RingMemptrs};
pub use select::select_next;
pub use state::{PreemptState, PreemptStateCell};
pub use telemetry::{
    NullTelemetry, PreemptEvent, PreemptStats, PreemptStatsSnapshot, RecordingTelemetry,
    TelemetrySink, TracingTelemetry, TriggerExitReason,
};
pub use watchdog::Watchdog;
