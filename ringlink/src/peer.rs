//! Peer references: how one device reaches a ring neighbor's block.

use std::sync::{Arc, Weak};
use std::task::Poll;

use tokio_util::sync::CancellationToken;

use crate::device::MappingHandle;
use crate::error::{RingError, Result};
use crate::memory::{MemKind, StagedRef, SyncRegion};
use crate::sync::{self, BackoffPolicy, SlotGuard, poll_until};
use crate::types::{DeviceIndex, Epoch};

/// How the neighbor's block is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressMode {
    /// Ordinary device-memory addressing, no staging copy.
    DeviceDirect,
    /// At least one direction goes through host memory.
    HostStaged,
}

impl AddressMode {
    /// Memory space of the blocks exchanged over a link in this mode.
    pub fn mem_kind(self) -> MemKind {
        match self {
            AddressMode::DeviceDirect => MemKind::Device,
            AddressMode::HostStaged => MemKind::Host,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Locality {
    SameProcess,
    CrossProcess,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// The neighbor this device receives from.
    Prev,
    /// The neighbor this device sends to.
    Next,
}

/// Index into a communicator's peer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerSlot {
    pub ring: usize,
    pub direction: Direction,
}

impl PeerSlot {
    pub const fn prev(ring: usize) -> Self {
        Self {
            ring,
            direction: Direction::Prev,
        }
    }

    pub const fn next(ring: usize) -> Self {
        Self {
            ring,
            direction: Direction::Next,
        }
    }

    pub(crate) const fn index(self) -> usize {
        self.ring * 2
            + match self.direction {
                Direction::Prev => 0,
                Direction::Next => 1,
            }
    }
}

/// Resources mapped for one cross-process link. Released exactly once, by
/// the communicator that owns the reference, during teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CleanupHandles {
    pub device: Option<MappingHandle>,
    pub host: Option<MappingHandle>,
}

/// What the bootstrap wires into a peer reference.
pub(crate) struct PeerTarget<'a> {
    pub device: DeviceIndex,
    pub neighbor: DeviceIndex,
    pub slot: PeerSlot,
    pub ring_position: usize,
    pub remote: &'a Arc<SyncRegion>,
    pub local: &'a Arc<SyncRegion>,
    pub counter: &'a Arc<SyncRegion>,
    pub mode: AddressMode,
    pub locality: Locality,
    pub remote_recv: bool,
    pub cleanup: Option<CleanupHandles>,
}

/// Addressing descriptor for one ring neighbor.
///
/// Holds only weak views: the neighbor's block as seen from this device
/// (`remote`), this device's own block for the same link (`local`), and the
/// neighbor's host block carrying its completion counter. Once either end
/// is torn down every resolve fails instead of handing out a dangling
/// address, even while a consumer guard still pins the block.
#[derive(Debug, Clone)]
pub struct PeerRef {
    device: DeviceIndex,
    neighbor: DeviceIndex,
    slot: PeerSlot,
    ring_position: usize,
    remote: Weak<SyncRegion>,
    local: Weak<SyncRegion>,
    counter: Weak<SyncRegion>,
    mode: AddressMode,
    locality: Locality,
    remote_recv: bool,
    cleanup: Option<CleanupHandles>,
}

impl PeerRef {
    pub(crate) fn new(target: PeerTarget<'_>) -> Self {
        let cleanup = match target.locality {
            Locality::CrossProcess => target.cleanup,
            Locality::SameProcess => None,
        };
        Self {
            device: target.device,
            neighbor: target.neighbor,
            slot: target.slot,
            ring_position: target.ring_position,
            remote: Arc::downgrade(target.remote),
            local: Arc::downgrade(target.local),
            counter: Arc::downgrade(target.counter),
            mode: target.mode,
            locality: target.locality,
            remote_recv: target.remote_recv,
            cleanup,
        }
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    pub fn neighbor(&self) -> DeviceIndex {
        self.neighbor
    }

    pub fn slot(&self) -> PeerSlot {
        self.slot
    }

    /// The neighbor's position in this reference's ring.
    pub fn ring_position(&self) -> usize {
        self.ring_position
    }

    pub fn mode(&self) -> AddressMode {
        self.mode
    }

    pub fn locality(&self) -> Locality {
        self.locality
    }

    pub fn remote_recv_allowed(&self) -> bool {
        self.remote_recv
    }

    pub fn cleanup(&self) -> Option<CleanupHandles> {
        self.cleanup
    }

    pub(crate) fn take_cleanup(&mut self) -> Option<CleanupHandles> {
        self.cleanup.take()
    }

    /// The neighbor's block, if both ends of the link are still alive.
    pub fn resolve_remote(&self) -> Result<Arc<SyncRegion>> {
        self.resolve_local()?;
        live(&self.remote, self.neighbor)
    }

    /// This device's own block for the link, if it is still alive.
    pub fn resolve_local(&self) -> Result<Arc<SyncRegion>> {
        live(&self.local, self.device)
    }

    fn resolve_counter(&self) -> Result<Arc<SyncRegion>> {
        self.resolve_local()?;
        live(&self.counter, self.neighbor)
    }

    /// The neighbor's settled-call counter.
    pub fn neighbor_op_counter(&self) -> Result<u64> {
        Ok(self.resolve_counter()?.header().op_counter())
    }

    /// Base address of the neighbor's block in the space this link uses.
    pub fn remote_addr(&self) -> Result<StagedRef> {
        let remote = self.resolve_remote()?;
        // SAFETY: the region is alive and its kind matches its allocation.
        Ok(unsafe {
            StagedRef::new(
                remote.kind(),
                remote.base_addr(),
                remote.buffer_size() + crate::memory::PAYLOAD_OFFSET,
            )
        })
    }

    /// Fail unless this link may push into the neighbor's receive buffer.
    pub fn require_remote_recv(&self) -> Result<()> {
        if self.remote_recv {
            Ok(())
        } else {
            Err(RingError::RemoteRecvDisallowed {
                device: self.device,
                neighbor: self.neighbor,
            })
        }
    }

    /// Check the neighbor's `step` slot once.
    pub fn try_consume(&self, step: usize, epoch: Epoch) -> Result<Poll<SlotGuard>> {
        let remote = self.resolve_remote()?;
        let counter = self.resolve_counter()?;
        sync::try_consume(&remote, &counter, step, epoch)
    }

    /// Poll the neighbor's `step` slot until it is ready. The neighbor is
    /// re-resolved on every check, so a teardown mid-poll fails the poll.
    pub fn consume(
        &self,
        step: usize,
        epoch: Epoch,
        policy: &BackoffPolicy,
        cancel: &CancellationToken,
    ) -> Result<SlotGuard> {
        poll_until(policy, cancel, || self.try_consume(step, epoch))
    }
}

/// Upgrade `weak` unless its owner has dropped or released it.
fn live(weak: &Weak<SyncRegion>, owner: DeviceIndex) -> Result<Arc<SyncRegion>> {
    match weak.upgrade() {
        Some(region) if !region.is_released() => Ok(region),
        _ => Err(RingError::PeerReleased { device: owner }),
    }
}
