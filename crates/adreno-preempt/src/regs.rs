//! Register map and register-access abstraction.
//!
//! Offsets are dword indices into the respective register block (CP/RBBM block for `gpu_*`, GMU
//! block for `gmu_*`), matching how the hardware documentation numbers them.

use thiserror::Error;

pub mod cp {
    //! Command-processor registers touched by the preemption sequence.

    pub const CP_RB_RPTR: u32 = 0x0806;
    pub const CP_RB_WPTR: u32 = 0x0807;

    /// Context-switch control. Writing bit 0 starts a switch; hardware clears it when done.
    pub const CP_CONTEXT_SWITCH_CNTL: u32 = 0x08a0;
    /// 64-bit (lo/hi) address of the target ring's address-space record.
    pub const CP_CONTEXT_SWITCH_SMMU_INFO: u32 = 0x08a1;
    pub const CP_CONTEXT_SWITCH_PRIV_NON_SECURE_RESTORE_ADDR: u32 = 0x08a3;
    pub const CP_CONTEXT_SWITCH_PRIV_SECURE_RESTORE_ADDR: u32 = 0x08a5;
    pub const CP_CONTEXT_SWITCH_NON_PRIV_RESTORE_ADDR: u32 = 0x08a7;

    pub const RB_CONTEXT_SWITCH_GMEM_SAVE_RESTORE: u32 = 0x88e4;
}

pub mod gmu {
    //! GMU registers: write fence status and power-collapse keepalive.

    pub const GMU_AHB_FENCE_STATUS: u32 = 0x9313;
    pub const GMU_AHB_FENCE_STATUS_CLR: u32 = 0x9314;
    pub const GMU_PWR_COL_PREEMPT_KEEPALIVE: u32 = 0x1f8c4;
}

pub mod fence_status {
    pub const WRITE_DROPPED0: u32 = 1 << 0;
    pub const WRITE_DROPPED1: u32 = 1 << 1;
}

bitflags::bitflags! {
    /// `CP_CONTEXT_SWITCH_CNTL` bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ContextSwitchCntl: u32 {
        /// Start the switch (write) / switch still in progress (read).
        const STOP = 1 << 0;
        const LEVEL_MASK = 0b11 << 6;
        const USES_GMEM = 1 << 8;
        const SKIP_SAVE_RESTORE = 1 << 9;
    }
}

impl ContextSwitchCntl {
    const LEVEL_SHIFT: u32 = 6;

    /// Control word that starts a switch with the given knobs.
    pub fn trigger(level: u8, uses_gmem: bool, skip_save_restore: bool) -> Self {
        let level = (u32::from(level) << Self::LEVEL_SHIFT) & Self::LEVEL_MASK.bits();
        let mut cntl = Self::from_bits_retain(level);
        cntl.set(Self::USES_GMEM, uses_gmem);
        cntl.set(Self::SKIP_SAVE_RESTORE, skip_save_restore);
        cntl | Self::STOP
    }

    pub fn level(self) -> u8 {
        ((self.bits() & Self::LEVEL_MASK.bits()) >> Self::LEVEL_SHIFT) as u8
    }

    pub fn switch_in_progress(self) -> bool {
        self.contains(Self::STOP)
    }
}

/// Memory-mapped register access for one GPU.
///
/// Register access is inherently shared between execution contexts, so all methods take `&self`;
/// implementations provide their own interior mutability.
pub trait GpuMmio: Send + Sync {
    fn gpu_read(&self, reg: u32) -> u32;
    fn gpu_write(&self, reg: u32, value: u32);
    fn gmu_read(&self, reg: u32) -> u32;
    fn gmu_write(&self, reg: u32, value: u32);

    /// Write a 64-bit value to a lo/hi register pair.
    fn gpu_write64(&self, reg: u32, value: u64) {
        self.gpu_write(reg, lower_32_bits(value));
        self.gpu_write(reg + 1, upper_32_bits(value));
    }
}

pub const fn lower_32_bits(value: u64) -> u32 {
    value as u32
}

pub const fn upper_32_bits(value: u64) -> u32 {
    (value >> 32) as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("write to register {reg:#x} dropped {attempts} times")]
pub struct FencedWriteError {
    pub reg: u32,
    pub attempts: u32,
}

/// Generic write/poll/retry combinator.
///
/// `write` issues the access, `dropped` polls whatever status tells whether it was lost. Returns
/// the number of retries needed, or the number of attempts made when every one was dropped.
pub fn retry_on_drop<W, P>(max_attempts: u32, mut write: W, mut dropped: P) -> Result<u32, u32>
where
    W: FnMut(),
    P: FnMut() -> bool,
{
    let max_attempts = max_attempts.max(1);
    for attempt in 0..max_attempts {
        write();
        if !dropped() {
            return Ok(attempt);
        }
    }
    Err(max_attempts)
}

/// Register writes that go through the GMU write fence.
///
/// While the GPU is power collapsed the fence drops register writes and latches a bit in
/// `GMU_AHB_FENCE_STATUS`; every write is therefore confirmed by reading that status back and
/// reissued if the drop bit is set.
#[derive(Clone, Copy)]
pub struct FencedWriter<'a> {
    mmio: &'a dyn GpuMmio,
    mask: u32,
    max_attempts: u32,
}

impl<'a> FencedWriter<'a> {
    pub fn new(mmio: &'a dyn GpuMmio, mask: u32, max_attempts: u32) -> Self {
        Self {
            mmio,
            mask,
            max_attempts,
        }
    }

    /// Fenced 32-bit write; returns the number of retries it took.
    pub fn write(&self, reg: u32, value: u32) -> Result<u32, FencedWriteError> {
        let mmio = self.mmio;
        let mask = self.mask;
        retry_on_drop(
            self.max_attempts,
            || mmio.gpu_write(reg, value),
            || {
                let status = mmio.gmu_read(gmu::GMU_AHB_FENCE_STATUS);
                if status & mask == 0 {
                    return false;
                }
                mmio.gmu_write(gmu::GMU_AHB_FENCE_STATUS_CLR, status & mask);
                tracing::debug!(reg, "fenced register write dropped; retrying");
                true
            },
        )
        .map_err(|attempts| FencedWriteError { reg, attempts })
    }

    /// Fenced write of a 64-bit value to a lo/hi register pair; each half is fenced on its own.
    pub fn write64(&self, reg: u32, value: u64) -> Result<u32, FencedWriteError> {
        let lo = self.write(reg, lower_32_bits(value))?;
        let hi = self.write(reg + 1, upper_32_bits(value))?;
        Ok(lo + hi)
    }
}
