//! Hardware command rings as seen by the preemption controller.
//!
//! A ring's priority is its index in the device's ring list (0 is the highest). The command stream
//! itself is opaque here; the controller only tracks the write pointer the driver has produced,
//! the read pointer and fence the CP writes back into the ring's memptrs, and the address space
//! the ring executes in.

use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use core::mem::offset_of;

use crate::memory::AddressSpace;
use crate::sync::{lock, AtomicU32, AtomicU64, Mutex, MutexGuard};

/// Default ring size (32 KiB).
pub const RING_SIZE_BYTES: u32 = 32 * 1024;
pub const RING_SIZE_DWORDS: u32 = RING_SIZE_BYTES / 4;

/// Fetch block size the CP uses for ring reads.
const RB_BLKSIZE_BYTES: u32 = 32;

/// Hardware-written shadow of a ring's progress, as laid out in device memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RingMemptrsLayout {
    pub rptr: u32,
    pub fence: u32,
    pub bv_fence: u32,
    pub context_idr: u32,
    pub ttbr0: u64,
}

pub const MEMPTRS_RPTR_OFFSET: u64 = offset_of!(RingMemptrsLayout, rptr) as u64;
pub const MEMPTRS_FENCE_OFFSET: u64 = offset_of!(RingMemptrsLayout, fence) as u64;
pub const MEMPTRS_BV_FENCE_OFFSET: u64 = offset_of!(RingMemptrsLayout, bv_fence) as u64;
pub const MEMPTRS_CONTEXT_IDR_OFFSET: u64 = offset_of!(RingMemptrsLayout, context_idr) as u64;
pub const MEMPTRS_TTBR0_OFFSET: u64 = offset_of!(RingMemptrsLayout, ttbr0) as u64;

/// Host view of a ring's memptrs.
///
/// The CP is the writer for every field; the `set_*` methods exist for whatever stands in for the
/// CP (the simulation model, or a device model feeding back real hardware state).
#[derive(Debug, Default)]
pub struct RingMemptrs {
    rptr: AtomicU32,
    fence: AtomicU32,
    bv_fence: AtomicU32,
    context_idr: AtomicU32,
    ttbr0: AtomicU64,
}

impl RingMemptrs {
    pub fn rptr(&self) -> u32 {
        self.rptr.load(Ordering::SeqCst)
    }

    pub fn set_rptr(&self, rptr: u32) {
        self.rptr.store(rptr, Ordering::SeqCst);
    }

    /// Sequence number of the last completed submission.
    pub fn fence(&self) -> u32 {
        self.fence.load(Ordering::SeqCst)
    }

    pub fn set_fence(&self, fence: u32) {
        self.fence.store(fence, Ordering::SeqCst);
    }

    pub fn bv_fence(&self) -> u32 {
        self.bv_fence.load(Ordering::SeqCst)
    }

    pub fn set_bv_fence(&self, fence: u32) {
        self.bv_fence.store(fence, Ordering::SeqCst);
    }

    pub fn context_idr(&self) -> u32 {
        self.context_idr.load(Ordering::SeqCst)
    }

    pub fn set_context_idr(&self, context_idr: u32) {
        self.context_idr.store(context_idr, Ordering::SeqCst);
    }

    pub fn ttbr0(&self) -> u64 {
        self.ttbr0.load(Ordering::SeqCst)
    }

    pub fn set_ttbr0(&self, ttbr0: u64) {
        self.ttbr0.store(ttbr0, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> RingMemptrsLayout {
        RingMemptrsLayout {
            rptr: self.rptr(),
            fence: self.fence(),
            bv_fence: self.bv_fence(),
            context_idr: self.context_idr(),
            ttbr0: self.ttbr0(),
        }
    }
}

/// Write-pointer state guarded by the ring's preemption lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct RingWptr {
    /// Write pointer in dwords.
    pub wptr: u32,
    /// Set when a submission could not write `CP_RB_WPTR` directly; whoever next finishes a
    /// preemption sequence on this ring applies it.
    pub restore_wptr: bool,
}

/// Whether `fence` has reached `seqno`, accounting for wraparound.
pub fn seqno_reached(fence: u32, seqno: u32) -> bool {
    fence.wrapping_sub(seqno) as i32 >= 0
}

/// Default `CP_RB_CNTL` for a ring of `size_bytes`: log2 of the size and of the fetch block size,
/// both in quadwords.
pub fn rb_cntl_default(size_bytes: u32) -> u32 {
    let bufsz = (size_bytes / 8).max(1).ilog2();
    let blksz = (RB_BLKSIZE_BYTES / 8).ilog2();
    (blksz << 8) | bufsz
}

pub struct Ring {
    id: usize,
    iova: u64,
    memptrs_iova: u64,
    size_dwords: u32,
    memptrs: RingMemptrs,
    /// Sequence number of the last submission queued on this ring.
    seqno: AtomicU32,
    wptr: Mutex<RingWptr>,
    aspace: Arc<dyn AddressSpace>,
}

impl Ring {
    pub fn new(id: usize, iova: u64, memptrs_iova: u64, aspace: Arc<dyn AddressSpace>) -> Self {
        let memptrs = RingMemptrs::default();
        memptrs.set_ttbr0(aspace.pagetable_params().ttbr0);

        Self {
            id,
            iova,
            memptrs_iova,
            size_dwords: RING_SIZE_DWORDS,
            memptrs,
            seqno: AtomicU32::new(0),
            wptr: Mutex::new(RingWptr::default()),
            aspace,
        }
    }

    /// Override the ring size. Must be a power of two.
    pub fn with_size_dwords(mut self, size_dwords: u32) -> Self {
        assert!(
            size_dwords.is_power_of_two(),
            "ring size must be a power of two, got {size_dwords}"
        );
        self.size_dwords = size_dwords;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn iova(&self) -> u64 {
        self.iova
    }

    pub fn memptrs_iova(&self) -> u64 {
        self.memptrs_iova
    }

    /// Device address of the CP's read-pointer shadow.
    pub fn rptr_iova(&self) -> u64 {
        self.memptrs_iova + MEMPTRS_RPTR_OFFSET
    }

    /// Device address of the secondary stream's progress shadow.
    pub fn bv_rptr_iova(&self) -> u64 {
        self.memptrs_iova + MEMPTRS_BV_FENCE_OFFSET
    }

    pub fn size_dwords(&self) -> u32 {
        self.size_dwords
    }

    pub fn size_bytes(&self) -> u32 {
        self.size_dwords * 4
    }

    pub fn rb_cntl(&self) -> u32 {
        rb_cntl_default(self.size_bytes())
    }

    pub fn memptrs(&self) -> &RingMemptrs {
        &self.memptrs
    }

    pub fn aspace(&self) -> &Arc<dyn AddressSpace> {
        &self.aspace
    }

    pub fn last_seqno(&self) -> u32 {
        self.seqno.load(Ordering::SeqCst)
    }

    /// Current driver write pointer, in dwords.
    pub fn wptr(&self) -> u32 {
        self.lock_wptr().wptr
    }

    /// Whether a write pointer update is waiting to be applied by the preemption path.
    pub fn restore_wptr_pending(&self) -> bool {
        self.lock_wptr().restore_wptr
    }

    pub(crate) fn lock_wptr(&self) -> MutexGuard<'_, RingWptr> {
        lock(&self.wptr)
    }

    /// Account for `dwords` of new commands; returns the new write pointer and sequence number.
    pub(crate) fn advance(&self, dwords: u32) -> (u32, u32) {
        let mut guard = self.lock_wptr();
        guard.wptr = guard.wptr.wrapping_add(dwords) & (self.size_dwords - 1);
        let seqno = self.seqno.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        (guard.wptr, seqno)
    }

    /// Whether the ring has commands the CP has not consumed yet.
    ///
    /// The current ring also counts as busy while its last submission has not retired, even if the
    /// CP already fetched everything.
    pub(crate) fn has_work(&self, is_current: bool) -> bool {
        let guard = self.lock_wptr();
        let fetched = guard.wptr == self.memptrs.rptr();
        let retired = seqno_reached(self.memptrs.fence(), self.last_seqno());
        drop(guard);

        !fetched || (is_current && !retired)
    }
}

impl fmt::Debug for Ring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ring")
            .field("id", &self.id)
            .field("iova", &format_args!("{:#x}", self.iova))
            .field("size_dwords", &self.size_dwords)
            .field("memptrs", &self.memptrs)
            .field("seqno", &self.last_seqno())
            .finish_non_exhaustive()
    }
}
