//! Host-side stand-ins for the hardware and the driver services around the controller.
//!
//! [`SimGpu`] is a plain register file with just enough behaviour to exercise the preemption
//! paths: dropped writes latch the GMU fence status, and a switch stays "in progress" until
//! [`SimGpu::complete_switch`] is called. Nothing here executes commands.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use adreno_time::FakeHostClock;

use crate::memory::{
    AddressSpace, AllocError, BufferFlags, DeviceAllocator, DeviceBuffer, PageTableParams,
};
use crate::recovery::{PreemptFault, RecoveryDispatch};
use crate::regs::{cp, fence_status, gmu, ContextSwitchCntl, GpuMmio};
use crate::ring::Ring;
use crate::telemetry::RecordingTelemetry;
use crate::PreemptDevice;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegBlock {
    Gpu,
    Gmu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegWrite {
    pub block: RegBlock,
    pub reg: u32,
    pub value: u32,
    /// The write fence swallowed this write.
    pub dropped: bool,
}

#[derive(Debug, Default)]
struct SimRegs {
    gpu: HashMap<u32, u32>,
    gmu: HashMap<u32, u32>,
    drop_next: u32,
    dropped: u64,
    log: Vec<RegWrite>,
}

#[derive(Debug, Default)]
pub struct SimGpu {
    regs: Mutex<SimRegs>,
}

impl SimGpu {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the next `count` CP register writes as if the GPU were power collapsed.
    pub fn drop_next_writes(&self, count: u32) {
        lock(&self.regs).drop_next = count;
    }

    pub fn dropped_writes(&self) -> u64 {
        lock(&self.regs).dropped
    }

    pub fn reg(&self, reg: u32) -> u32 {
        lock(&self.regs).gpu.get(&reg).copied().unwrap_or(0)
    }

    pub fn gmu_reg(&self, reg: u32) -> u32 {
        lock(&self.regs).gmu.get(&reg).copied().unwrap_or(0)
    }

    /// Set a register from the hardware side (not logged, never dropped).
    pub fn poke(&self, reg: u32, value: u32) {
        lock(&self.regs).gpu.insert(reg, value);
    }

    pub fn switch_in_progress(&self) -> bool {
        ContextSwitchCntl::from_bits_retain(self.reg(cp::CP_CONTEXT_SWITCH_CNTL))
            .switch_in_progress()
    }

    /// Finish the pending context switch, if any. Returns whether one was pending; the caller then
    /// delivers the switch interrupt.
    pub fn complete_switch(&self) -> bool {
        let mut regs = lock(&self.regs);
        let cntl = regs.gpu.entry(cp::CP_CONTEXT_SWITCH_CNTL).or_insert(0);
        let pending = *cntl & ContextSwitchCntl::STOP.bits() != 0;
        *cntl &= !ContextSwitchCntl::STOP.bits();
        pending
    }

    pub fn writes(&self) -> Vec<RegWrite> {
        lock(&self.regs).log.clone()
    }

    pub fn take_writes(&self) -> Vec<RegWrite> {
        std::mem::take(&mut lock(&self.regs).log)
    }

    /// Values that actually landed in CP register `reg`, in order.
    pub fn writes_to(&self, reg: u32) -> Vec<u32> {
        lock(&self.regs)
            .log
            .iter()
            .filter(|w| w.block == RegBlock::Gpu && w.reg == reg && !w.dropped)
            .map(|w| w.value)
            .collect()
    }
}

impl GpuMmio for SimGpu {
    fn gpu_read(&self, reg: u32) -> u32 {
        self.reg(reg)
    }

    fn gpu_write(&self, reg: u32, value: u32) {
        let mut regs = lock(&self.regs);
        let dropped = regs.drop_next > 0;
        if dropped {
            regs.drop_next -= 1;
            regs.dropped += 1;
            *regs.gmu.entry(gmu::GMU_AHB_FENCE_STATUS).or_insert(0) |=
                fence_status::WRITE_DROPPED1;
        } else {
            regs.gpu.insert(reg, value);
        }
        regs.log.push(RegWrite {
            block: RegBlock::Gpu,
            reg,
            value,
            dropped,
        });
    }

    fn gmu_read(&self, reg: u32) -> u32 {
        self.gmu_reg(reg)
    }

    fn gmu_write(&self, reg: u32, value: u32) {
        let mut regs = lock(&self.regs);
        if reg == gmu::GMU_AHB_FENCE_STATUS_CLR {
            *regs.gmu.entry(gmu::GMU_AHB_FENCE_STATUS).or_insert(0) &= !value;
        } else {
            regs.gmu.insert(reg, value);
        }
        regs.log.push(RegWrite {
            block: RegBlock::Gmu,
            reg,
            value,
            dropped: false,
        });
    }
}

#[derive(Debug)]
struct AllocState {
    next_iova: u64,
    count: u64,
    fail_at: Option<u64>,
    fail_all: bool,
    live: HashSet<u64>,
}

/// Bump allocator over a fake device address space.
#[derive(Debug)]
pub struct SimAllocator {
    state: Mutex<AllocState>,
}

impl SimAllocator {
    pub const BASE_IOVA: u64 = 0x1_0000_0000;
    const PAGE_SIZE: u64 = 4096;

    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocState {
                next_iova: Self::BASE_IOVA,
                count: 0,
                fail_at: None,
                fail_all: false,
                live: HashSet::new(),
            }),
        }
    }

    /// Fail the `index`th allocation (0-based, counting from construction).
    pub fn fail_at(&self, index: u64) {
        lock(&self.state).fail_at = Some(index);
    }

    pub fn fail_all(&self, fail: bool) {
        lock(&self.state).fail_all = fail;
    }

    /// Buffers allocated and not yet freed.
    pub fn live(&self) -> usize {
        lock(&self.state).live.len()
    }

    /// Allocation attempts so far, including failed ones.
    pub fn allocations(&self) -> u64 {
        lock(&self.state).count
    }
}

impl Default for SimAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceAllocator for SimAllocator {
    fn alloc(&self, size: usize, flags: BufferFlags) -> Result<DeviceBuffer, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }

        let mut state = lock(&self.state);
        let index = state.count;
        state.count += 1;
        if state.fail_all || state.fail_at == Some(index) {
            return Err(AllocError::OutOfMemory { size });
        }

        let iova = state.next_iova;
        state.next_iova += (size as u64).div_ceil(Self::PAGE_SIZE) * Self::PAGE_SIZE;
        state.live.insert(iova);
        Ok(DeviceBuffer::new(iova, size, flags))
    }

    fn free(&self, buffer: DeviceBuffer) {
        if !lock(&self.state).live.remove(&buffer.iova()) {
            tracing::warn!(iova = buffer.iova(), "freeing unknown device buffer");
        }
    }
}

/// Address space whose page tables can be swapped out from under the controller, as happens when a
/// ring starts running a different process.
#[derive(Debug, Default)]
pub struct SimAddressSpace {
    params: Mutex<PageTableParams>,
}

impl SimAddressSpace {
    pub fn new(params: PageTableParams) -> Self {
        Self {
            params: Mutex::new(params),
        }
    }

    pub fn set(&self, params: PageTableParams) {
        *lock(&self.params) = params;
    }
}

impl AddressSpace for SimAddressSpace {
    fn pagetable_params(&self) -> PageTableParams {
        *lock(&self.params)
    }
}

/// Records every recovery request.
#[derive(Debug, Default)]
pub struct CountingRecovery {
    faults: Mutex<Vec<PreemptFault>>,
}

impl CountingRecovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        lock(&self.faults).len()
    }

    pub fn faults(&self) -> Vec<PreemptFault> {
        lock(&self.faults).clone()
    }
}

impl RecoveryDispatch for CountingRecovery {
    fn request_recovery(&self, fault: PreemptFault) {
        lock(&self.faults).push(fault);
    }
}

/// Make the CP look like it fetched and retired everything queued on `ring`.
pub fn drain_ring(ring: &Ring) {
    ring.memptrs().set_rptr(ring.wptr());
    ring.memptrs().set_fence(ring.last_seqno());
}

/// A complete simulated device: register file, allocator, recovery, telemetry, clock and rings.
pub struct SimDevice {
    pub gpu: Arc<SimGpu>,
    pub allocator: Arc<SimAllocator>,
    pub recovery: Arc<CountingRecovery>,
    pub telemetry: Arc<RecordingTelemetry>,
    pub clock: Arc<FakeHostClock>,
    pub aspaces: Vec<Arc<SimAddressSpace>>,
    pub rings: Vec<Arc<Ring>>,
}

impl SimDevice {
    pub const RING_BASE_IOVA: u64 = 0x4000_0000;
    pub const MEMPTRS_BASE_IOVA: u64 = 0x5000_0000;

    pub fn new(nr_rings: usize) -> Self {
        let aspaces: Vec<Arc<SimAddressSpace>> = (0..nr_rings)
            .map(|id| {
                Arc::new(SimAddressSpace::new(PageTableParams {
                    ttbr0: 0x8_0000_0000 + ((id as u64) << 16),
                    asid: id as u32,
                }))
            })
            .collect();
        let rings = aspaces
            .iter()
            .enumerate()
            .map(|(id, aspace)| {
                Arc::new(Ring::new(
                    id,
                    Self::RING_BASE_IOVA + ((id as u64) << 16),
                    Self::MEMPTRS_BASE_IOVA + ((id as u64) << 8),
                    aspace.clone(),
                ))
            })
            .collect();

        Self {
            gpu: Arc::new(SimGpu::new()),
            allocator: Arc::new(SimAllocator::new()),
            recovery: Arc::new(CountingRecovery::new()),
            telemetry: Arc::new(RecordingTelemetry::new()),
            clock: Arc::new(FakeHostClock::new(0)),
            aspaces,
            rings,
        }
    }

    pub fn device(&self) -> PreemptDevice {
        PreemptDevice {
            rings: self.rings.clone(),
            mmio: self.gpu.clone(),
            allocator: self.allocator.clone(),
            recovery: self.recovery.clone(),
            telemetry: self.telemetry.clone(),
            clock: self.clock.clone(),
        }
    }
}
