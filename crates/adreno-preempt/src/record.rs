//! Context-switch records.
//!
//! Each ring owns one write-combined device buffer the CP saves into and restores from:
//!
//! ```text
//! 0x0000                       SmmuInfo (address space to switch to)
//! 0x1000                       privileged non-secure area, starting with PreemptRecord
//! 0x1000 + ctx                 privileged secure area
//! 0x1000 + 2 * ctx             non-privileged (user) area
//! ```
//!
//! A separate scratch table holds one 64-bit slot per ring where the CP writes back the user
//! context address of the queue it switched out of.

use std::mem::{offset_of, size_of};
use std::sync::Arc;

use crate::memory::{AllocError, BufferFlags, DeviceAllocator, DeviceBuffer, PageTableParams};
use crate::ring::Ring;
use crate::PreemptConfig;

pub const PREEMPT_RECORD_MAGIC: u32 = 0xae39_9d6e;
pub const SMMU_INFO_MAGIC: u32 = 0x2413_50d5;

/// Context bank used by the CP's own SMMU context.
pub const SMMU_INFO_CONTEXT_BANK: u32 = 0;

/// Ring state the CP saves on switch-out and restores on switch-in.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreemptRecord {
    pub magic: u32,
    pub info: u32,
    pub errno: u32,
    pub data: u32,
    pub cntl: u32,
    pub rptr: u32,
    pub wptr: u32,
    pub _pad: u32,
    pub rptr_addr: u64,
    pub rbase: u64,
    pub counter: u64,
    pub bv_rptr_addr: u64,
}

pub const RECORD_MAGIC_OFFSET: usize = offset_of!(PreemptRecord, magic);
pub const RECORD_INFO_OFFSET: usize = offset_of!(PreemptRecord, info);
pub const RECORD_ERRNO_OFFSET: usize = offset_of!(PreemptRecord, errno);
pub const RECORD_DATA_OFFSET: usize = offset_of!(PreemptRecord, data);
pub const RECORD_CNTL_OFFSET: usize = offset_of!(PreemptRecord, cntl);
pub const RECORD_RPTR_OFFSET: usize = offset_of!(PreemptRecord, rptr);
pub const RECORD_WPTR_OFFSET: usize = offset_of!(PreemptRecord, wptr);
pub const RECORD_RPTR_ADDR_OFFSET: usize = offset_of!(PreemptRecord, rptr_addr);
pub const RECORD_RBASE_OFFSET: usize = offset_of!(PreemptRecord, rbase);
pub const RECORD_COUNTER_OFFSET: usize = offset_of!(PreemptRecord, counter);
pub const RECORD_BV_RPTR_ADDR_OFFSET: usize = offset_of!(PreemptRecord, bv_rptr_addr);

impl PreemptRecord {
    pub const SIZE_BYTES: usize = size_of::<Self>();

    pub fn read_from(buf: &DeviceBuffer, base: usize) -> Self {
        Self {
            magic: buf.read_u32(base + RECORD_MAGIC_OFFSET),
            info: buf.read_u32(base + RECORD_INFO_OFFSET),
            errno: buf.read_u32(base + RECORD_ERRNO_OFFSET),
            data: buf.read_u32(base + RECORD_DATA_OFFSET),
            cntl: buf.read_u32(base + RECORD_CNTL_OFFSET),
            rptr: buf.read_u32(base + RECORD_RPTR_OFFSET),
            wptr: buf.read_u32(base + RECORD_WPTR_OFFSET),
            _pad: 0,
            rptr_addr: buf.read_u64(base + RECORD_RPTR_ADDR_OFFSET),
            rbase: buf.read_u64(base + RECORD_RBASE_OFFSET),
            counter: buf.read_u64(base + RECORD_COUNTER_OFFSET),
            bv_rptr_addr: buf.read_u64(base + RECORD_BV_RPTR_ADDR_OFFSET),
        }
    }
}

/// Address space the CP switches to together with the ring.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SmmuInfo {
    pub magic: u32,
    pub _pad: u32,
    pub ttbr0: u64,
    pub asid: u32,
    pub context_idr: u32,
    pub context_bank: u32,
}

pub const SMMU_INFO_MAGIC_OFFSET: usize = offset_of!(SmmuInfo, magic);
pub const SMMU_INFO_TTBR0_OFFSET: usize = offset_of!(SmmuInfo, ttbr0);
pub const SMMU_INFO_ASID_OFFSET: usize = offset_of!(SmmuInfo, asid);
pub const SMMU_INFO_CONTEXT_IDR_OFFSET: usize = offset_of!(SmmuInfo, context_idr);
pub const SMMU_INFO_CONTEXT_BANK_OFFSET: usize = offset_of!(SmmuInfo, context_bank);

impl SmmuInfo {
    pub fn read_from(buf: &DeviceBuffer, base: usize) -> Self {
        Self {
            magic: buf.read_u32(base + SMMU_INFO_MAGIC_OFFSET),
            _pad: 0,
            ttbr0: buf.read_u64(base + SMMU_INFO_TTBR0_OFFSET),
            asid: buf.read_u32(base + SMMU_INFO_ASID_OFFSET),
            context_idr: buf.read_u32(base + SMMU_INFO_CONTEXT_IDR_OFFSET),
            context_bank: buf.read_u32(base + SMMU_INFO_CONTEXT_BANK_OFFSET),
        }
    }
}

const _: () = {
    assert!(PreemptRecord::SIZE_BYTES == 64);
    assert!(RECORD_RPTR_ADDR_OFFSET == 32);
    assert!(size_of::<SmmuInfo>() <= RecordLayout::PRIV_NON_SECURE);
};

/// Offsets of the areas inside a per-ring record buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    context_record_size: usize,
    user_record_size: usize,
}

impl RecordLayout {
    pub const SMMU_INFO: usize = 0;
    pub const PRIV_NON_SECURE: usize = 4096;

    pub fn new(context_record_size: usize, user_record_size: usize) -> Self {
        let context_record_size = align_up(context_record_size.max(PreemptRecord::SIZE_BYTES), 8);
        Self {
            context_record_size,
            user_record_size: align_up(user_record_size, 8),
        }
    }

    pub fn from_config(config: &PreemptConfig) -> Self {
        Self::new(config.context_record_size, config.user_record_size)
    }

    pub fn priv_secure(&self) -> usize {
        Self::PRIV_NON_SECURE + self.context_record_size
    }

    pub fn non_priv(&self) -> usize {
        self.priv_secure() + self.context_record_size
    }

    pub fn total_size(&self) -> usize {
        self.non_priv() + self.user_record_size
    }
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// One ring's record buffer.
#[derive(Debug, Clone)]
pub struct RingRecords {
    buffer: DeviceBuffer,
    layout: RecordLayout,
}

impl RingRecords {
    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn smmu_info_iova(&self) -> u64 {
        self.buffer.iova() + RecordLayout::SMMU_INFO as u64
    }

    pub fn priv_non_secure_iova(&self) -> u64 {
        self.buffer.iova() + RecordLayout::PRIV_NON_SECURE as u64
    }

    pub fn priv_secure_iova(&self) -> u64 {
        self.buffer.iova() + self.layout.priv_secure() as u64
    }

    pub fn non_priv_iova(&self) -> u64 {
        self.buffer.iova() + self.layout.non_priv() as u64
    }

    pub fn preempt_record(&self) -> PreemptRecord {
        PreemptRecord::read_from(&self.buffer, RecordLayout::PRIV_NON_SECURE)
    }

    pub fn smmu_info(&self) -> SmmuInfo {
        SmmuInfo::read_from(&self.buffer, RecordLayout::SMMU_INFO)
    }

    /// Zero the buffer and write the fields that never change for this ring.
    fn populate(&self, ring: &Ring) {
        let buf = &self.buffer;
        let smmu = RecordLayout::SMMU_INFO;
        let rec = RecordLayout::PRIV_NON_SECURE;
        let params = ring.aspace().pagetable_params();

        buf.fill_zero(0, buf.len());

        buf.write_u32(smmu + SMMU_INFO_MAGIC_OFFSET, SMMU_INFO_MAGIC);
        buf.write_u64(smmu + SMMU_INFO_TTBR0_OFFSET, params.ttbr0);
        buf.write_u32(smmu + SMMU_INFO_ASID_OFFSET, params.asid);
        buf.write_u32(smmu + SMMU_INFO_CONTEXT_IDR_OFFSET, 0);
        buf.write_u32(smmu + SMMU_INFO_CONTEXT_BANK_OFFSET, SMMU_INFO_CONTEXT_BANK);

        buf.write_u32(rec + RECORD_MAGIC_OFFSET, PREEMPT_RECORD_MAGIC);
        buf.write_u32(rec + RECORD_INFO_OFFSET, 0);
        buf.write_u32(rec + RECORD_DATA_OFFSET, 0);
        buf.write_u32(rec + RECORD_RPTR_OFFSET, ring.memptrs().rptr());
        buf.write_u32(rec + RECORD_WPTR_OFFSET, 0);
        buf.write_u32(rec + RECORD_CNTL_OFFSET, ring.rb_cntl());
        buf.write_u64(rec + RECORD_RPTR_ADDR_OFFSET, ring.rptr_iova());
        buf.write_u64(rec + RECORD_RBASE_OFFSET, ring.iova());
        buf.write_u64(rec + RECORD_COUNTER_OFFSET, 0);
        buf.write_u64(rec + RECORD_BV_RPTR_ADDR_OFFSET, ring.bv_rptr_iova());
    }

    /// Reset the progress fields after the CP has been (re)initialised.
    pub(crate) fn reset(&self, rbase: u64) {
        let rec = RecordLayout::PRIV_NON_SECURE;
        self.buffer.write_u32(rec + RECORD_WPTR_OFFSET, 0);
        self.buffer.write_u32(rec + RECORD_RPTR_OFFSET, 0);
        self.buffer.write_u32(rec + RECORD_INFO_OFFSET, 0);
        self.buffer.write_u32(rec + RECORD_DATA_OFFSET, 0);
        self.buffer.write_u64(rec + RECORD_RBASE_OFFSET, rbase);
    }

    /// Publish the address space and write pointer the CP restores when switching to this ring.
    /// Point the records at the target ring's current translation context and write pointer.
    pub(crate) fn set_switch_target(&self, params: PageTableParams, context_idr: u32, wptr: u32) {
        let smmu = RecordLayout::SMMU_INFO;
        self.buffer.write_u64(smmu + SMMU_INFO_TTBR0_OFFSET, params.ttbr0);
        self.buffer.write_u32(smmu + SMMU_INFO_ASID_OFFSET, params.asid);
        self.buffer.write_u32(smmu + SMMU_INFO_CONTEXT_IDR_OFFSET, context_idr);
        self.buffer
            .write_u32(RecordLayout::PRIV_NON_SECURE + RECORD_WPTR_OFFSET, wptr);
    }
}

/// Every context-switch buffer owned by the controller.
#[derive(Debug)]
pub struct RecordStore {
    rings: Vec<RingRecords>,
    scratch: DeviceBuffer,
}

impl RecordStore {
    pub const SCRATCH_SLOT_BYTES: usize = size_of::<u64>();

    /// Allocate and populate records for `rings`.
    ///
    /// On failure everything allocated so far is handed back to `allocator`.
    pub fn alloc(
        rings: &[Arc<Ring>],
        allocator: &dyn DeviceAllocator,
        layout: RecordLayout,
    ) -> Result<Self, AllocError> {
        let mut records = Vec::with_capacity(rings.len());

        for ring in rings {
            match allocator.alloc(layout.total_size(), BufferFlags::WC) {
                Ok(buffer) => {
                    let ring_records = RingRecords { buffer, layout };
                    ring_records.populate(ring);
                    records.push(ring_records);
                }
                Err(err) => {
                    release_all(records, allocator);
                    return Err(err);
                }
            }
        }

        let scratch = match allocator.alloc(rings.len() * Self::SCRATCH_SLOT_BYTES, BufferFlags::WC)
        {
            Ok(scratch) => scratch,
            Err(err) => {
                release_all(records, allocator);
                return Err(err);
            }
        };
        scratch.fill_zero(0, scratch.len());

        Ok(Self {
            rings: records,
            scratch,
        })
    }

    pub fn release(self, allocator: &dyn DeviceAllocator) {
        release_all(self.rings, allocator);
        allocator.free(self.scratch);
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }

    pub fn ring(&self, index: usize) -> Option<&RingRecords> {
        self.rings.get(index)
    }

    pub fn scratch(&self) -> &DeviceBuffer {
        &self.scratch
    }

    /// User context address the CP left behind when it last switched `ring` out.
    pub fn user_ctx_iova(&self, ring: usize) -> u64 {
        self.scratch.read_u64(ring * Self::SCRATCH_SLOT_BYTES)
    }
}

fn release_all(records: Vec<RingRecords>, allocator: &dyn DeviceAllocator) {
    for record in records {
        allocator.free(record.buffer);
    }
}

/// Per-queue save/restore area for user state (e.g. streamout buffers).
#[derive(Debug, Clone)]
pub struct QueueRecord {
    buffer: DeviceBuffer,
}

impl QueueRecord {
    pub fn buffer(&self) -> &DeviceBuffer {
        &self.buffer
    }

    pub fn iova(&self) -> u64 {
        self.buffer.iova()
    }
}

/// A userspace submission queue, bound to one ring.
#[derive(Debug)]
pub struct SubmitQueue {
    pub id: u32,
    pub ring: usize,
    record: Option<QueueRecord>,
}

impl SubmitQueue {
    pub fn new(id: u32, ring: usize) -> Self {
        Self {
            id,
            ring,
            record: None,
        }
    }

    pub fn record(&self) -> Option<&QueueRecord> {
        self.record.as_ref()
    }

    pub(crate) fn attach(&mut self, buffer: DeviceBuffer) {
        self.record = Some(QueueRecord { buffer });
    }

    pub(crate) fn detach(&mut self) -> Option<DeviceBuffer> {
        self.record.take().map(|record| record.buffer)
    }
}
