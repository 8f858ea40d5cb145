//! Device-addressable memory shared between the driver and the GPU.
//!
//! Buffers are word-granular and backed by atomics: the GPU writes context-switch state into the
//! same memory the driver populates, so host accesses must never tear or be elided. Ordering with
//! respect to register writes is provided by the explicit fences in the preemption sequence, so
//! individual accesses are `Relaxed`.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

bitflags::bitflags! {
    /// Allocation attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferFlags: u32 {
        /// Write-combined CPU mapping.
        const WC = 1 << 0;
        /// Only accessible from privileged GPU contexts.
        const MAP_PRIV = 1 << 1;
        /// GPU may not write.
        const GPU_READ_ONLY = 1 << 2;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("out of device memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    #[error("zero-sized device allocation")]
    ZeroSize,
}

/// A device-addressable allocation with a host-visible mapping.
///
/// Cloning shares the same underlying memory (the device keeps its own reference for as long as
/// the buffer is mapped).
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferInner>,
}

struct BufferInner {
    iova: u64,
    flags: BufferFlags,
    words: Box<[AtomicU32]>,
}

impl DeviceBuffer {
    /// Create a zeroed buffer mapped at `iova`. `size` is rounded up to a whole number of words.
    pub fn new(iova: u64, size: usize, flags: BufferFlags) -> Self {
        let words = size.div_ceil(4);
        Self {
            inner: Arc::new(BufferInner {
                iova,
                flags,
                words: (0..words).map(|_| AtomicU32::new(0)).collect(),
            }),
        }
    }

    pub fn iova(&self) -> u64 {
        self.inner.iova
    }

    pub fn flags(&self) -> BufferFlags {
        self.inner.flags
    }

    pub fn len(&self) -> usize {
        self.inner.words.len() * 4
    }

    pub fn is_empty(&self) -> bool {
        self.inner.words.is_empty()
    }

    /// Whether both handles refer to the same allocation.
    pub fn same_buffer(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn word(&self, offset: usize) -> &AtomicU32 {
        assert_eq!(offset % 4, 0, "unaligned device buffer access at {offset:#x}");
        &self.inner.words[offset / 4]
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        self.word(offset).load(Ordering::Relaxed)
    }

    pub fn write_u32(&self, offset: usize, value: u32) {
        self.word(offset).store(value, Ordering::Relaxed);
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let lo = u64::from(self.read_u32(offset));
        let hi = u64::from(self.read_u32(offset + 4));
        (hi << 32) | lo
    }

    pub fn write_u64(&self, offset: usize, value: u64) {
        self.write_u32(offset, value as u32);
        self.write_u32(offset + 4, (value >> 32) as u32);
    }

    /// Zero `len` bytes starting at `offset`.
    pub fn fill_zero(&self, offset: usize, len: usize) {
        assert_eq!(offset % 4, 0, "unaligned device buffer access at {offset:#x}");
        let start = offset / 4;
        let end = (offset + len).div_ceil(4);
        for word in &self.inner.words[start..end] {
            word.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("iova", &format_args!("{:#x}", self.iova()))
            .field("len", &self.len())
            .field("flags", &self.flags())
            .finish()
    }
}

/// Allocator for device-addressable memory (the GPU's kernel address space).
pub trait DeviceAllocator: Send + Sync {
    fn alloc(&self, size: usize, flags: BufferFlags) -> Result<DeviceBuffer, AllocError>;

    /// Unmap and release a buffer previously returned by [`DeviceAllocator::alloc`].
    fn free(&self, buffer: DeviceBuffer);
}

/// Page-table parameters of an address space, as the SMMU consumes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageTableParams {
    pub ttbr0: u64,
    pub asid: u32,
}

/// The translation context a ring's submissions execute in.
pub trait AddressSpace: Send + Sync {
    fn pagetable_params(&self) -> PageTableParams;
}

/// Address space with fixed parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StaticAddressSpace(pub PageTableParams);

impl AddressSpace for StaticAddressSpace {
    fn pagetable_params(&self) -> PageTableParams {
        self.0
    }
}
