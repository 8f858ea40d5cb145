//! The preemption controller.
//!
//! Submitters, the switch interrupt and the watchdog all drive one [`PreemptStateCell`]. Every
//! entry point first wins an edge with a compare-and-swap; from then on it owns the sequence and
//! advances the state with forced transitions until it hands ownership back (`NONE`) or to the
//! hardware (`TRIGGERED`). Losing a race is ordinary control flow, never an error.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use adreno_time::HostClock;

use crate::error::{PreemptError, Result};
use crate::memory::{BufferFlags, DeviceAllocator};
use crate::record::{RecordLayout, RecordStore, SubmitQueue};
use crate::recovery::{FaultReason, PreemptFault, RecoveryDispatch};
use crate::regs::{cp, fence_status, gmu, ContextSwitchCntl, FencedWriter, GpuMmio};
use crate::ring::Ring;
use crate::select::select_next;
use crate::state::{PreemptState, PreemptStateCell};
use crate::sync::{fence, spin_loop, AtomicUsize};
use crate::telemetry::{
    PreemptEvent, PreemptStats, PreemptStatsSnapshot, TelemetrySink, TriggerExitReason,
};
use crate::watchdog::Watchdog;
use crate::PreemptConfig;

const NO_RING: usize = usize::MAX;

fn decode_ring(raw: usize) -> Option<usize> {
    (raw != NO_RING).then_some(raw)
}

/// Everything the controller needs from the surrounding driver.
#[derive(Clone)]
pub struct PreemptDevice {
    /// Rings in priority order (index 0 is the highest priority).
    pub rings: Vec<Arc<Ring>>,
    pub mmio: Arc<dyn GpuMmio>,
    pub allocator: Arc<dyn DeviceAllocator>,
    pub recovery: Arc<dyn RecoveryDispatch>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub clock: Arc<dyn HostClock>,
}

pub struct PreemptController {
    config: PreemptConfig,
    rings: Vec<Arc<Ring>>,
    /// Rings in use; collapses to 1 when preemption is unavailable.
    nr_rings: usize,
    records: Option<RecordStore>,

    mmio: Arc<dyn GpuMmio>,
    allocator: Arc<dyn DeviceAllocator>,
    recovery: Arc<dyn RecoveryDispatch>,
    telemetry: Arc<dyn TelemetrySink>,
    clock: Arc<dyn HostClock>,

    state: PreemptStateCell,
    cur_ring: AtomicUsize,
    next_ring: AtomicUsize,
    watchdog: Watchdog,
    stats: PreemptStats,
}

impl PreemptController {
    /// Set up preemption for `device`.
    ///
    /// With a single ring there is nothing to preempt and no records are allocated. If any record
    /// allocation fails, everything allocated so far is released and the device runs on ring 0
    /// only for the rest of its lifetime.
    pub fn init(device: PreemptDevice, config: PreemptConfig) -> Result<Self> {
        let PreemptDevice {
            rings,
            mmio,
            allocator,
            recovery,
            telemetry,
            clock,
        } = device;

        if rings.is_empty() {
            return Err(PreemptError::NoRings);
        }

        let (nr_rings, records) = if rings.len() == 1 {
            (1, None)
        } else {
            let layout = RecordLayout::from_config(&config);
            match RecordStore::alloc(&rings, allocator.as_ref(), layout) {
                Ok(records) => (rings.len(), Some(records)),
                Err(err) => {
                    tracing::warn!(
                        rings = rings.len(),
                        "preemption records unavailable ({err}); falling back to a single ring"
                    );
                    (1, None)
                }
            }
        };

        Ok(Self {
            watchdog: Watchdog::new(config.watchdog_timeout),
            config,
            rings,
            nr_rings,
            records,
            mmio,
            allocator,
            recovery,
            telemetry,
            clock,
            state: PreemptStateCell::new(PreemptState::None),
            cur_ring: AtomicUsize::new(0),
            next_ring: AtomicUsize::new(NO_RING),
            stats: PreemptStats::new(),
        })
    }

    /// Release the context-switch records. Preemption stays off afterwards.
    pub fn fini(&mut self) {
        if let Some(records) = self.records.take() {
            records.release(self.allocator.as_ref());
        }
        self.nr_rings = 1;
        self.cur_ring.store(0, Ordering::SeqCst);
        self.next_ring.store(NO_RING, Ordering::SeqCst);
        self.watchdog.cancel();
    }

    pub fn config(&self) -> &PreemptConfig {
        &self.config
    }

    pub fn state(&self) -> PreemptState {
        self.state.load()
    }

    pub fn cur_ring(&self) -> usize {
        self.cur_ring.load(Ordering::SeqCst)
    }

    pub fn next_ring(&self) -> Option<usize> {
        decode_ring(self.next_ring.load(Ordering::SeqCst))
    }

    pub fn nr_rings(&self) -> usize {
        self.nr_rings
    }

    pub fn ring(&self, index: usize) -> Option<&Arc<Ring>> {
        self.rings[..self.nr_rings].get(index)
    }

    pub fn preemption_enabled(&self) -> bool {
        self.nr_rings > 1 && self.records.is_some()
    }

    pub fn watchdog_deadline_ns(&self) -> Option<u64> {
        self.watchdog.deadline_ns()
    }

    pub fn stats(&self) -> PreemptStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn records(&self) -> Option<&RecordStore> {
        self.records.as_ref()
    }

    /// Re-establish the preemption baseline after the CP has been (re)started.
    pub fn hw_init(&self) {
        let Some(records) = self.records.as_ref().filter(|_| self.nr_rings > 1) else {
            return;
        };

        for (index, ring) in self.rings.iter().enumerate() {
            if let Some(ring_records) = records.ring(index) {
                ring_records.reset(ring.iova());
            }
        }

        // No pagetable switch pending.
        self.mmio.gpu_write64(cp::CP_CONTEXT_SWITCH_SMMU_INFO, 0);
        self.mmio
            .gpu_write(cp::RB_CONTEXT_SWITCH_GMEM_SAVE_RESTORE, 0x1);

        self.watchdog.cancel();
        self.next_ring.store(NO_RING, Ordering::SeqCst);
        self.cur_ring.store(0, Ordering::SeqCst);
        let from = self.state.force(PreemptState::None);
        self.emit(PreemptEvent::Reset { from });
    }

    /// Account for `dwords` of new commands on `ring`, publish them and give the preemption
    /// sequence a chance to switch to it. Returns the ring's new write pointer.
    pub fn submit(&self, ring: usize, dwords: u32) -> Result<u32> {
        let r = self.checked_ring(ring)?;
        let (wptr, _seqno) = r.advance(dwords);
        self.flush(ring)?;
        self.on_new_submission();
        Ok(wptr)
    }

    /// Publish `ring`'s write pointer.
    ///
    /// The register is written directly only when `ring` is executing and no preemption is in
    /// flight; otherwise the update is left for the preemption path, which applies it once the ring
    /// is current again.
    pub fn flush(&self, ring: usize) -> Result<()> {
        let r = self.checked_ring(ring)?;

        let mut guard = r.lock_wptr();
        let wptr = guard.wptr;
        let direct = self.state.load() == PreemptState::None && self.cur_ring() == ring;
        if direct {
            self.mmio.gpu_write(cp::CP_RB_WPTR, wptr);
            self.stats.inc_wptr_writes();
        } else {
            guard.restore_wptr = true;
        }
        drop(guard);

        self.emit(PreemptEvent::SubmitFlush {
            ring,
            wptr,
            deferred: !direct,
        });
        Ok(())
    }

    pub fn on_new_submission(&self) {
        self.trigger(true);
    }

    /// Switch interrupt from the CP.
    pub fn on_interrupt(&self) {
        if !self.preemption_enabled() {
            return;
        }

        if !self.try_transition(PreemptState::Triggered, PreemptState::Pending) {
            return;
        }

        self.watchdog.cancel();

        // The CP clears the stop bit before raising the interrupt. If it is still set the switch
        // did not complete.
        let cntl =
            ContextSwitchCntl::from_bits_retain(self.mmio.gpu_read(cp::CP_CONTEXT_SWITCH_CNTL));
        if cntl.switch_in_progress() {
            self.force_transition(PreemptState::Faulted);
            self.fault(FaultReason::SwitchStuck);
            return;
        }

        match decode_ring(self.next_ring.swap(NO_RING, Ordering::SeqCst)) {
            Some(next) => self.cur_ring.store(next, Ordering::SeqCst),
            None => tracing::error!("preemption interrupt without a target ring"),
        }
        fence(Ordering::SeqCst);

        self.force_transition(PreemptState::Abort);
        let cur = self.cur_ring();
        self.update_wptr(cur);
        self.stats.inc_switches();
        self.emit(PreemptEvent::Interrupt { ring: cur });
        self.force_transition(PreemptState::None);

        self.trigger(false);
    }

    /// Watchdog expiry.
    pub fn on_watchdog_timeout(&self) {
        if !self.preemption_enabled() {
            return;
        }

        if !self.try_transition(PreemptState::Triggered, PreemptState::Faulted) {
            return;
        }

        self.watchdog.cancel();
        self.stats.inc_timeouts();
        self.fault(FaultReason::Timeout);
    }

    /// Poll the watchdog against the host clock.
    ///
    /// An expired deadline is claimed before the state is checked, so an expiry observed for one
    /// switch can never fault the switch that re-armed the watchdog after it.
    pub fn tick(&self) {
        let Some(deadline) = self.watchdog.deadline_ns() else {
            return;
        };
        if self.clock.now_ns() < deadline {
            return;
        }
        if self.state.load() != PreemptState::Triggered {
            // Still in START (or already resolved): leave the deadline for the next tick.
            return;
        }
        if self.watchdog.claim(deadline) {
            self.on_watchdog_timeout();
        }
    }

    pub fn queue_open(&self, queue: &mut SubmitQueue) -> Result<()> {
        if !self.preemption_enabled() || queue.record().is_some() {
            return Ok(());
        }

        let buffer = self
            .allocator
            .alloc(self.config.user_record_size, BufferFlags::WC)?;
        queue.attach(buffer);
        Ok(())
    }

    pub fn queue_close(&self, queue: &mut SubmitQueue) {
        if let Some(buffer) = queue.detach() {
            self.allocator.free(buffer);
        }
    }

    /// Try to start a switch to the highest-priority ring with work.
    ///
    /// A new submission that finds another context evaluating or aborting spins until that context
    /// finishes, since it may already have looked at this ring before the submission landed.
    /// Everyone else leaves as soon as the machine is busy.
    pub fn trigger(&self, new_submission: bool) {
        if !self.preemption_enabled() {
            return;
        }

        let mut observed = self
            .state
            .compare_exchange(PreemptState::None, PreemptState::Evaluate);
        let mut spins = 0u32;
        while new_submission
            && matches!(observed, Err(PreemptState::Evaluate | PreemptState::Abort))
        {
            if spins >= self.config.submit_spin_limit {
                tracing::warn!(spins, "preemption state stayed busy; giving up on trigger");
                break;
            }
            spins += 1;
            self.stats.inc_submit_spins();
            spin_loop();
            observed = self
                .state
                .compare_exchange(PreemptState::None, PreemptState::Evaluate);
        }

        if let Err(state) = observed {
            self.emit(PreemptEvent::TriggerExit {
                reason: TriggerExitReason::Busy,
                new_submission,
                state,
            });
            return;
        }
        self.emit(PreemptEvent::StateChange {
            from: PreemptState::None,
            to: PreemptState::Evaluate,
        });

        let cur = self.cur_ring();
        let target = select_next(&self.rings[..self.nr_rings], cur);

        let target = match target {
            Some(target) if target != cur => target,
            _ => {
                self.force_transition(PreemptState::Abort);
                self.update_wptr(cur);
                self.force_transition(PreemptState::None);
                self.stats.inc_aborts();
                self.emit(PreemptEvent::TriggerExit {
                    reason: TriggerExitReason::NoSwitch,
                    new_submission,
                    state: PreemptState::None,
                });
                return;
            }
        };

        self.force_transition(PreemptState::Start);
        self.start_switch(cur, target);
    }

    /// Populate the target's records and hand the switch to the CP. Runs in `START`.
    fn start_switch(&self, cur: usize, target: usize) {
        let Some((records, ring_records)) = self
            .records
            .as_ref()
            .and_then(|records| Some((records, records.ring(target)?)))
        else {
            // Records went away under us; back out rather than sit in START.
            tracing::error!(target, "no context-switch records for target ring");
            self.force_transition(PreemptState::Abort);
            self.force_transition(PreemptState::None);
            self.stats.inc_aborts();
            return;
        };
        let ring = &self.rings[target];

        let wptr = {
            let mut guard = ring.lock_wptr();
            let params = ring.aspace().pagetable_params();
            let context_idr = ring.memptrs().context_idr();
            fence(Ordering::SeqCst);

            ring_records.set_switch_target(params, context_idr, guard.wptr);
            fence(Ordering::SeqCst);

            // The CP restores the write pointer from the record; a submission racing with us sets
            // the flag again.
            guard.restore_wptr = false;
            guard.wptr
        };

        self.emit(PreemptEvent::Trigger {
            from: cur,
            to: target,
            wptr,
        });

        // Keep the GMU from power collapsing between the fenced writes below.
        self.set_keepalive(true);

        let writer = FencedWriter::new(
            self.mmio.as_ref(),
            fence_status::WRITE_DROPPED1,
            self.config.fenced_write_max_attempts,
        );
        self.fenced_write64(
            &writer,
            cp::CP_CONTEXT_SWITCH_SMMU_INFO,
            ring_records.smmu_info_iova(),
        );
        self.fenced_write64(
            &writer,
            cp::CP_CONTEXT_SWITCH_PRIV_NON_SECURE_RESTORE_ADDR,
            ring_records.priv_non_secure_iova(),
        );
        self.fenced_write64(
            &writer,
            cp::CP_CONTEXT_SWITCH_PRIV_SECURE_RESTORE_ADDR,
            ring_records.priv_secure_iova(),
        );
        // Whatever user context the CP saved when it last switched this ring out.
        self.fenced_write64(
            &writer,
            cp::CP_CONTEXT_SWITCH_NON_PRIV_RESTORE_ADDR,
            records.user_ctx_iova(target),
        );

        self.next_ring.store(target, Ordering::SeqCst);
        self.watchdog.arm(self.clock.now_ns());
        self.force_transition(PreemptState::Triggered);

        // Post any earlier WPTR writes before starting the switch.
        let _ = self.mmio.gpu_read(cp::CP_RB_WPTR);
        fence(Ordering::SeqCst);

        let cntl = ContextSwitchCntl::trigger(
            self.config.preempt_level,
            self.config.uses_gmem,
            self.config.skip_save_restore,
        );
        self.fenced_write(&writer, cp::CP_CONTEXT_SWITCH_CNTL, cntl.bits());
        self.stats.inc_triggers();

        self.set_keepalive(false);
    }

    /// Apply a deferred write pointer for `ring`, if one is pending.
    ///
    /// The lock only covers reading and clearing the pending update; the register is written after
    /// it is dropped. Any submission landing in between defers again and is picked up by the next
    /// trigger.
    fn update_wptr(&self, ring: usize) {
        let Some(r) = self.rings.get(ring) else {
            return;
        };

        let wptr = {
            let mut guard = r.lock_wptr();
            if !guard.restore_wptr {
                return;
            }
            guard.restore_wptr = false;
            guard.wptr
        };
        fence(Ordering::SeqCst);

        let old = self.mmio.gpu_read(cp::CP_RB_WPTR);
        self.emit(PreemptEvent::WptrUpdate {
            ring,
            old,
            new: wptr,
        });
        if old != wptr {
            self.mmio.gpu_write(cp::CP_RB_WPTR, wptr);
            self.stats.inc_wptr_writes();
        }
        self.stats.inc_deferred_wptr_flushes();
    }

    fn fault(&self, reason: FaultReason) {
        let fault = PreemptFault {
            reason,
            cur_ring: self.cur_ring(),
            next_ring: decode_ring(self.next_ring.swap(NO_RING, Ordering::SeqCst)),
        };

        tracing::error!(
            reason = reason.as_str(),
            cur_ring = fault.cur_ring,
            next_ring = ?fault.next_ring,
            "preemption faulted; requesting recovery"
        );
        self.stats.inc_faults();
        self.emit(PreemptEvent::Fault {
            ring: fault.next_ring.unwrap_or(fault.cur_ring),
            reason,
        });
        self.recovery.request_recovery(fault);
    }

    fn set_keepalive(&self, on: bool) {
        if self.config.power_keepalive {
            self.mmio
                .gmu_write(gmu::GMU_PWR_COL_PREEMPT_KEEPALIVE, u32::from(on));
        }
    }

    fn fenced_write(&self, writer: &FencedWriter<'_>, reg: u32, value: u32) {
        match writer.write(reg, value) {
            Ok(retries) => self.stats.add_fenced_write_retries(retries),
            Err(err) => self.fenced_write_failed(err),
        }
    }

    fn fenced_write64(&self, writer: &FencedWriter<'_>, reg: u32, value: u64) {
        match writer.write64(reg, value) {
            Ok(retries) => self.stats.add_fenced_write_retries(retries),
            Err(err) => self.fenced_write_failed(err),
        }
    }

    fn fenced_write_failed(&self, err: crate::regs::FencedWriteError) {
        // Carry on: a switch that never starts is caught by the watchdog.
        tracing::error!(reg = err.reg, attempts = err.attempts, "fenced write failed");
        self.stats.inc_fenced_write_failures();
    }

    fn try_transition(&self, old: PreemptState, new: PreemptState) -> bool {
        let won = self.state.try_transition(old, new);
        if won {
            self.emit(PreemptEvent::StateChange { from: old, to: new });
        }
        won
    }

    fn force_transition(&self, new: PreemptState) {
        let from = self.state.force(new);
        self.emit(PreemptEvent::StateChange { from, to: new });
    }

    fn checked_ring(&self, ring: usize) -> Result<&Arc<Ring>> {
        self.ring(ring).ok_or(PreemptError::NoSuchRing {
            ring,
            nr_rings: self.nr_rings,
        })
    }

    fn emit(&self, event: PreemptEvent) {
        self.telemetry.record(&event);
    }
}
