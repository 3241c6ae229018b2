//! Fixed-layout synchronization block.
//!
//! A block is one aligned region: a typed header of atomics at offset 0,
//! padding up to [`MEM_PAD_ALIGN`], then `buffer_size` bytes of payload split
//! into [`MAX_FLAGS`] step slots. Peers compiled separately agree on the
//! offsets below; they are asserted at compile time and never inferred from
//! struct packing.

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::mem::{offset_of, size_of};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use crate::error::{RingError, Result};
use crate::memory::buffer::{MemKind, StagedRef};
use crate::types::{DeviceIndex, MAX_FLAGS, MEM_PAD_ALIGN};

pub const FLAGS_OFFSET: usize = 0;
pub const RECV_PTRS_OFFSET: usize = 64;
pub const OP_COUNTER_OFFSET: usize = 192;
pub const HEADER_BYTES: usize = 200;
pub const PAYLOAD_OFFSET: usize = MEM_PAD_ALIGN;

/// Header of a synchronization block.
///
/// `flags[k]` and `recv_ptrs[k]` belong to step slot `k`. `op_counter` counts
/// settled collective calls; it is only meaningful in host blocks.
#[repr(C)]
pub struct SyncHeader {
    pub(crate) flags: [AtomicU32; MAX_FLAGS],
    pub(crate) recv_ptrs: [AtomicU64; MAX_FLAGS],
    pub(crate) op_counter: AtomicU64,
}

const _: () = {
    assert!(offset_of!(SyncHeader, flags) == FLAGS_OFFSET);
    assert!(offset_of!(SyncHeader, recv_ptrs) == RECV_PTRS_OFFSET);
    assert!(offset_of!(SyncHeader, op_counter) == OP_COUNTER_OFFSET);
    assert!(size_of::<SyncHeader>() == HEADER_BYTES);
    assert!(HEADER_BYTES <= PAYLOAD_OFFSET);
};

/// An owned synchronization block plus its payload.
///
/// Shared through `Arc`; peer references hold only `Weak` handles, so the
/// owning communicator is the sole party that can keep it alive. A consumer
/// guard may still hold a strong handle after teardown, so teardown also
/// marks the block released and peer references refuse to resolve it.
pub struct SyncRegion {
    base: NonNull<u8>,
    layout: Layout,
    kind: MemKind,
    owner: DeviceIndex,
    buffer_size: usize,
    released: AtomicBool,
}

// SAFETY: the header is made of atomics. Payload slots are written by the
// owning device before the release store that publishes them and read by the
// single consumer after the matching acquire load.
unsafe impl Send for SyncRegion {}
unsafe impl Sync for SyncRegion {}

impl SyncRegion {
    /// Allocate a zeroed block (all flags drained, counter 0).
    pub fn new(owner: DeviceIndex, kind: MemKind, buffer_size: usize) -> Result<Self> {
        check_buffer_size(buffer_size)?;
        let size = PAYLOAD_OFFSET
            .checked_add(buffer_size)
            .ok_or_else(|| RingError::Config(format!("buffer size {buffer_size} overflows")))?;
        let layout = Layout::from_size_align(size, MEM_PAD_ALIGN)
            .map_err(|e| RingError::Config(format!("block layout: {e}")))?;
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw).ok_or_else(|| {
            RingError::device(format!(
                "allocation of {size} byte {kind:?} block for device {owner} failed"
            ))
        })?;
        Ok(Self {
            base,
            layout,
            kind,
            owner,
            buffer_size,
            released: AtomicBool::new(false),
        })
    }

    pub fn header(&self) -> &SyncHeader {
        // SAFETY: base is MEM_PAD_ALIGN-aligned, zero-initialized and at least
        // HEADER_BYTES long; an all-zero header is a valid value.
        unsafe { &*(self.base.as_ptr() as *const SyncHeader) }
    }

    pub fn kind(&self) -> MemKind {
        self.kind
    }

    pub fn owner(&self) -> DeviceIndex {
        self.owner
    }

    pub fn base_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn payload_addr(&self) -> u64 {
        self.base_addr() + PAYLOAD_OFFSET as u64
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Bytes available to a single step slot.
    pub fn slot_size(&self) -> usize {
        self.buffer_size / MAX_FLAGS
    }

    /// Payload slot for `step`.
    pub fn slot(&self, step: usize) -> Result<StagedRef> {
        check_step(step)?;
        let addr = self.payload_addr() + (step * self.slot_size()) as u64;
        // SAFETY: the slot lies inside this allocation and has kind `self.kind`.
        Ok(unsafe { StagedRef::new(self.kind, addr, self.slot_size()) })
    }

    /// Copy `data` into the payload slot for `step` and return its address.
    ///
    /// Only the owning device may stage into a slot, and only while the slot
    /// is drained.
    pub fn write_slot(&self, step: usize, data: &[u8]) -> Result<u64> {
        let slot = self.slot(step)?;
        if data.len() > slot.len_bytes() {
            return Err(RingError::PayloadTooLarge {
                len: data.len(),
                capacity: slot.len_bytes(),
            });
        }
        let dst = slot.as_u64() as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }
        Ok(slot.as_u64())
    }

    /// True once the owning communicator has torn this block down.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn mark_released(&self) {
        self.released.store(true, Ordering::Release);
    }

    /// True if `[addr, addr + len)` lies inside this block's payload.
    pub fn contains(&self, addr: u64, len: usize) -> bool {
        let start = self.payload_addr();
        let end = start + self.buffer_size as u64;
        addr >= start && addr.saturating_add(len as u64) <= end
    }
}

impl Drop for SyncRegion {
    fn drop(&mut self) {
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

impl std::fmt::Debug for SyncRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncRegion")
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("base", &format_args!("0x{:x}", self.base_addr()))
            .field("buffer_size", &self.buffer_size)
            .field("released", &self.is_released())
            .finish()
    }
}

pub(crate) fn check_step(step: usize) -> Result<()> {
    if step >= MAX_FLAGS {
        return Err(RingError::StepOutOfRange {
            step,
            max: MAX_FLAGS,
        });
    }
    Ok(())
}

pub(crate) fn check_buffer_size(buffer_size: usize) -> Result<()> {
    if buffer_size < MAX_FLAGS || buffer_size % MAX_FLAGS != 0 {
        return Err(RingError::Config(format!(
            "buffer size {buffer_size} must be a non-zero multiple of {MAX_FLAGS}"
        )));
    }
    Ok(())
}
