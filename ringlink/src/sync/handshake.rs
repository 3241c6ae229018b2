//! Producer/consumer handshake on a synchronization block.
//!
//! The flag is the lock. A producer stores the step pointer and then
//! release-stores READY; a consumer acquire-loads the flag before it reads
//! the pointer, and release-stores DRAINED when it is done with the slot.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::task::Poll;

use tokio_util::sync::CancellationToken;

use crate::diag::ring_warn;
use crate::error::{RingError, Result};
use crate::memory::{SyncHeader, SyncRegion, check_step};
use crate::sync::backoff::{BackoffPolicy, poll_until};
use crate::types::Epoch;

pub const FLAG_DRAINED: u32 = 0;
pub const FLAG_READY: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    Drained,
    Ready,
}

impl SyncHeader {
    pub fn slot_state(&self, step: usize) -> Result<SlotState> {
        check_step(step)?;
        Ok(match self.flags[step].load(Ordering::Acquire) {
            FLAG_READY => SlotState::Ready,
            _ => SlotState::Drained,
        })
    }

    /// True when no step slot is awaiting a consumer.
    pub fn all_drained(&self) -> bool {
        self.flags
            .iter()
            .all(|f| f.load(Ordering::Acquire) != FLAG_READY)
    }

    /// Settled-call counter of the owning communicator.
    pub fn op_counter(&self) -> u64 {
        self.op_counter.load(Ordering::Acquire)
    }

    /// Advertise `ptr` for `step`. The pointer store is ordered before the
    /// flag store that makes it visible.
    pub fn publish(&self, step: usize, ptr: u64) -> Result<()> {
        check_step(step)?;
        if self.flags[step].load(Ordering::Acquire) == FLAG_READY {
            ring_warn!(step, "publish into a slot that was never drained");
            return Err(RingError::SlotBusy { step });
        }
        self.recv_ptrs[step].store(ptr, Ordering::Relaxed);
        self.flags[step].store(FLAG_READY, Ordering::Release);
        Ok(())
    }

    pub(crate) fn advance_op_counter(&self) -> u64 {
        self.op_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn drain(&self, step: usize) {
        self.flags[step].store(FLAG_DRAINED, Ordering::Release);
    }
}

/// Exclusive access to a published step slot.
///
/// Holds the producer's block alive while the consumer works on the slot;
/// dropping the guard drains the slot so the producer can reuse it.
#[must_use = "dropping the guard drains the slot immediately"]
pub struct SlotGuard {
    region: Arc<SyncRegion>,
    step: usize,
    ptr: u64,
    drained: bool,
}

impl SlotGuard {
    pub fn step(&self) -> usize {
        self.step
    }

    /// The address the producer published for this step.
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// The producer's block this slot belongs to.
    pub fn region(&self) -> &SyncRegion {
        &self.region
    }

    /// View `len` bytes at the published address.
    ///
    /// # Safety
    /// The published address must be host-addressable and valid for `len`
    /// bytes for as long as the guard lives.
    pub unsafe fn bytes(&self, len: usize) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, len) }
    }

    /// Hand the slot back to the producer.
    pub fn drain(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.drained {
            self.region.header().drain(self.step);
            self.drained = true;
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SlotGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlotGuard")
            .field("owner", &self.region.owner())
            .field("step", &self.step)
            .field("ptr", &format_args!("0x{:x}", self.ptr))
            .finish()
    }
}

/// Check `step` of `producer` once.
///
/// `counter` is the producer's host block carrying its settled-call counter.
/// A READY flag seen while that counter is below `epoch.required_counter()`
/// was left over from an earlier epoch and is rejected.
pub fn try_consume(
    producer: &Arc<SyncRegion>,
    counter: &SyncRegion,
    step: usize,
    epoch: Epoch,
) -> Result<Poll<SlotGuard>> {
    let header = producer.header();
    if header.slot_state(step)? != SlotState::Ready {
        return Ok(Poll::Pending);
    }
    let observed = counter.header().op_counter();
    let required = epoch.required_counter();
    if observed < required {
        ring_warn!(
            producer = producer.owner(),
            step,
            epoch = epoch.get(),
            observed,
            "ready flag from an earlier epoch"
        );
        return Err(RingError::StaleEpoch {
            step,
            epoch: epoch.get(),
            required,
            observed,
        });
    }
    let ptr = header.recv_ptrs[step].load(Ordering::Relaxed);
    Ok(Poll::Ready(SlotGuard {
        region: Arc::clone(producer),
        step,
        ptr,
        drained: false,
    }))
}

/// Poll `step` of `producer` until it is ready.
pub fn consume(
    producer: &Arc<SyncRegion>,
    counter: &SyncRegion,
    step: usize,
    epoch: Epoch,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<SlotGuard> {
    poll_until(policy, cancel, || try_consume(producer, counter, step, epoch))
}

/// Poll until the consumer has drained `step` of the producer's own block.
pub fn wait_drained(
    region: &SyncRegion,
    step: usize,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    poll_until(policy, cancel, || {
        Ok(match region.header().slot_state(step)? {
            SlotState::Drained => Poll::Ready(()),
            SlotState::Ready => Poll::Pending,
        })
    })
}

/// Poll until every step slot of `region` is drained.
pub fn wait_all_drained(
    region: &SyncRegion,
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
) -> Result<()> {
    poll_until(policy, cancel, || {
        Ok(if region.header().all_drained() {
            Poll::Ready(())
        } else {
            Poll::Pending
        })
    })
}
