//! Per-device communicator: owned blocks, peer table and call lifecycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::device::{DeviceRuntime, EventHandle, QueueHandle};
use crate::diag::ring_warn;
use crate::error::{RingError, Result};
use crate::memory::{CopyKind, MemKind, StagedRef, SyncRegion};
use crate::peer::{PeerRef, PeerSlot};
use crate::ring::{Neighbors, RingTables};
use crate::sync::{self, BackoffPolicy, SlotGuard, SlotState};
use crate::types::{DeviceIndex, Epoch, Rank};

/// Lifecycle of a communicator.
///
/// `Uninitialized → Ready → (Queued → Settled)* → Destroyed`. A call is
/// queued by [`Communicator::begin_call`] and settled by
/// [`Communicator::settle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommState {
    /// Blocks allocated, peers not yet wired.
    Uninitialized,
    Ready,
    /// A collective call has been issued and not yet settled.
    Queued,
    Settled,
    Destroyed,
}

/// Everything the computational collaborator needs for one received step.
///
/// Holds the producer's slot: dropping the handoff (or calling
/// [`StepHandoff::finish`]) drains it so the producer may reuse it.
#[must_use = "dropping the handoff drains the slot immediately"]
#[derive(Debug)]
pub struct StepHandoff {
    guard: SlotGuard,
    src: StagedRef,
    dst: StagedRef,
    copy: CopyKind,
    queue: QueueHandle,
}

impl StepHandoff {
    /// The producer's published address, sized to one step slot.
    pub fn src(&self) -> StagedRef {
        self.src
    }

    /// This device's outgoing slot for the same step. The next device may
    /// still be reading it; see [`Communicator::wait_drained`].
    pub fn dst(&self) -> StagedRef {
        self.dst
    }

    pub fn copy_kind(&self) -> CopyKind {
        self.copy
    }

    /// Queue the collaborator must enqueue its kernel on.
    pub fn queue(&self) -> QueueHandle {
        self.queue
    }

    pub fn step(&self) -> usize {
        self.guard.step()
    }

    /// View `len` bytes of the producer's data.
    ///
    /// # Safety
    /// The published address must be host-addressable and valid for `len`
    /// bytes.
    pub unsafe fn src_bytes(&self, len: usize) -> &[u8] {
        unsafe { self.guard.bytes(len) }
    }

    /// Drain the producer's slot.
    pub fn finish(self) {
        self.guard.drain();
    }
}

/// One device's view of a ring group.
///
/// Owns a device block and a host block per ring. The host block of ring 0
/// carries the settled-call counter neighbors gate their epochs on.
pub struct Communicator {
    device: DeviceIndex,
    rank: Rank,
    tables: Arc<RingTables>,
    dev_blocks: Vec<Arc<SyncRegion>>,
    host_blocks: Vec<Arc<SyncRegion>>,
    buffer_size: usize,
    peers: Box<[PeerRef]>,
    use_remote_recv: bool,
    op_sched: u64,
    prev_queue: QueueHandle,
    done_event: Option<EventHandle>,
    state: CommState,
    backoff: BackoffPolicy,
    runtime: Arc<dyn DeviceRuntime>,
}

impl Communicator {
    /// Allocate zeroed blocks for every ring. Peers are wired afterwards by
    /// [`Communicator::attach_peers`].
    pub(crate) fn allocate(
        device: DeviceIndex,
        rank: Rank,
        tables: Arc<RingTables>,
        buffer_size: usize,
        use_remote_recv: bool,
        backoff: BackoffPolicy,
        runtime: Arc<dyn DeviceRuntime>,
    ) -> Result<Self> {
        let n_rings = tables.n_rings();
        let mut dev_blocks = Vec::with_capacity(n_rings);
        let mut host_blocks = Vec::with_capacity(n_rings);
        for _ in 0..n_rings {
            dev_blocks.push(Arc::new(SyncRegion::new(
                device,
                MemKind::Device,
                buffer_size,
            )?));
            host_blocks.push(Arc::new(SyncRegion::new(device, MemKind::Host, buffer_size)?));
        }
        let done_event = runtime.create_event(device)?;
        Ok(Self {
            device,
            rank,
            tables,
            dev_blocks,
            host_blocks,
            buffer_size,
            peers: Box::new([]),
            use_remote_recv,
            op_sched: 0,
            prev_queue: QueueHandle::DEFAULT,
            done_event: Some(done_event),
            state: CommState::Uninitialized,
            backoff,
            runtime,
        })
    }

    /// Install the peer table, one `Prev` and one `Next` entry per ring in
    /// [`PeerSlot`] order.
    pub(crate) fn attach_peers(&mut self, peers: Vec<PeerRef>) -> Result<()> {
        self.expect_state("attach_peers", &[CommState::Uninitialized])?;
        let expected = self.tables.n_rings() * 2;
        if peers.len() != expected {
            return Err(RingError::Config(format!(
                "device {}: expected {expected} peer references, got {}",
                self.device,
                peers.len()
            )));
        }
        for (i, p) in peers.iter().enumerate() {
            if p.slot().index() != i || p.device() != self.device {
                return Err(RingError::Config(format!(
                    "device {}: peer reference {i} is out of order ({:?} of device {})",
                    self.device,
                    p.slot(),
                    p.device()
                )));
            }
        }
        self.peers = peers.into_boxed_slice();
        self.state = CommState::Ready;
        Ok(())
    }

    pub fn device(&self) -> DeviceIndex {
        self.device
    }

    /// This device's user rank.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn n_dev(&self) -> usize {
        self.tables.n_dev()
    }

    pub fn n_rings(&self) -> usize {
        self.tables.n_rings()
    }

    pub fn tables(&self) -> &RingTables {
        &self.tables
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn state(&self) -> CommState {
        self.state
    }

    pub fn use_remote_recv(&self) -> bool {
        self.use_remote_recv
    }

    /// Number of calls issued so far.
    pub fn op_sched(&self) -> u64 {
        self.op_sched
    }

    /// Number of calls settled so far, as neighbors observe it.
    pub fn op_counter(&self) -> Result<u64> {
        self.ensure_live()?;
        Ok(self.counter_block()?.header().op_counter())
    }

    /// The queue of the most recent call.
    pub fn queue(&self) -> QueueHandle {
        self.prev_queue
    }

    /// Default poll pacing from the group's configuration.
    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Epoch of the call in flight.
    pub fn epoch(&self) -> Result<Epoch> {
        self.expect_state("epoch", &[CommState::Queued])?;
        Ok(Epoch::new(self.op_sched))
    }

    /// This device's index within `ring`.
    pub fn ring_position(&self, ring: usize) -> Result<usize> {
        self.tables.position(ring, self.device)
    }

    pub fn neighbors(&self, ring: usize) -> Result<Neighbors> {
        self.tables.neighbors(ring, self.device)
    }

    pub fn peer(&self, slot: PeerSlot) -> Result<&PeerRef> {
        self.ensure_live()?;
        self.check_ring(slot.ring)?;
        self.peers.get(slot.index()).ok_or(RingError::InvalidState {
            op: "peer",
            state: self.state,
        })
    }

    /// The whole peer table in [`PeerSlot`] order.
    pub fn peers(&self) -> Result<&[PeerRef]> {
        self.ensure_live()?;
        Ok(&self.peers)
    }

    /// This device's block of `kind` for `ring`.
    pub(crate) fn block(&self, ring: usize, kind: MemKind) -> Result<&Arc<SyncRegion>> {
        self.ensure_live()?;
        self.check_ring(ring)?;
        let blocks = match kind {
            MemKind::Device => &self.dev_blocks,
            MemKind::Host => &self.host_blocks,
        };
        Ok(&blocks[ring])
    }

    /// The block this device publishes into on `ring`: the device block when
    /// the link to the next device is device-direct, the host block otherwise.
    pub fn outgoing(&self, ring: usize) -> Result<&Arc<SyncRegion>> {
        let kind = self.peer(PeerSlot::next(ring))?.mode().mem_kind();
        self.block(ring, kind)
    }

    /// Start a collective call on `queue` and return its epoch.
    ///
    /// When the queue differs from the previous call's, the new queue first
    /// waits on the previous call's done event.
    pub fn begin_call(&mut self, queue: QueueHandle) -> Result<Epoch> {
        self.expect_state("begin_call", &[CommState::Ready, CommState::Settled])?;
        if queue != self.prev_queue
            && self.op_sched > 0
            && let Some(event) = self.done_event
        {
            tracing::debug!(
                device = self.device,
                from = self.prev_queue.0,
                to = queue.0,
                "queue changed, waiting on previous call"
            );
            self.runtime.queue_wait_event(queue, event)?;
        }
        self.prev_queue = queue;
        self.op_sched += 1;
        self.state = CommState::Queued;
        Ok(Epoch::new(self.op_sched))
    }

    /// Advertise `ptr` for `step` on `ring`.
    pub fn publish(&self, ring: usize, step: usize, ptr: u64) -> Result<()> {
        self.expect_state("publish", &[CommState::Queued])?;
        self.outgoing(ring)?.header().publish(step, ptr)
    }

    /// Stage `data` into this device's outgoing slot and publish it.
    pub fn publish_payload(&self, ring: usize, step: usize, data: &[u8]) -> Result<u64> {
        self.expect_state("publish_payload", &[CommState::Queued])?;
        let block = self.outgoing(ring)?;
        if block.header().slot_state(step)? == SlotState::Ready {
            ring_warn!(device = self.device, ring, step, "staging into an undrained slot");
            return Err(RingError::SlotBusy { step });
        }
        let ptr = block.write_slot(step, data)?;
        block.header().publish(step, ptr)?;
        Ok(ptr)
    }

    /// Wait for the previous device's `step` on `ring` and hand it over.
    pub fn resolve_step(
        &self,
        ring: usize,
        step: usize,
        policy: &BackoffPolicy,
        cancel: &CancellationToken,
    ) -> Result<StepHandoff> {
        self.expect_state("resolve_step", &[CommState::Queued])?;
        let epoch = Epoch::new(self.op_sched);
        let dst = self.outgoing(ring)?.slot(step)?;
        let prev = self.peer(PeerSlot::prev(ring))?;
        let guard = prev.consume(step, epoch, policy, cancel)?;
        let producer = guard.region();
        // SAFETY: the guard keeps the producer's block alive and its kind
        // tags the space the published address lives in.
        let src = unsafe { StagedRef::new(producer.kind(), guard.ptr(), producer.slot_size()) };
        Ok(StepHandoff {
            copy: CopyKind::between(src.kind(), dst.kind()),
            guard,
            src,
            dst,
            queue: self.prev_queue,
        })
    }

    /// The next device's receive slot for `step`, for kernels that write
    /// straight into the neighbor. Only available when remote receive is
    /// enabled for the link.
    ///
    /// The slot doubles as the next device's outgoing slot, so it is only
    /// handed out while drained. A slot still READY fails with `SlotBusy`.
    pub fn push_target(&self, ring: usize, step: usize) -> Result<StagedRef> {
        self.ensure_live()?;
        let next = self.peer(PeerSlot::next(ring))?;
        if !self.use_remote_recv {
            return Err(RingError::RemoteRecvDisallowed {
                device: self.device,
                neighbor: next.neighbor(),
            });
        }
        next.require_remote_recv()?;
        let target = next.resolve_remote()?;
        if target.header().slot_state(step)? == SlotState::Ready {
            ring_warn!(
                device = self.device,
                neighbor = next.neighbor(),
                ring,
                step,
                "push target still holds an unconsumed handoff"
            );
            return Err(RingError::SlotBusy { step });
        }
        target.slot(step)
    }

    /// Wait until the next device has drained `step` of this device's
    /// outgoing block on `ring`.
    pub fn wait_drained(
        &self,
        ring: usize,
        step: usize,
        policy: &BackoffPolicy,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.ensure_live()?;
        sync::wait_drained(self.outgoing(ring)?, step, policy, cancel)
    }

    /// Complete the call in flight and return the new settled-call count.
    ///
    /// Waits for the call's work on its queue, then for the next device to
    /// drain every outgoing slot, and only then advances the counter.
    pub fn settle(&mut self, policy: &BackoffPolicy, cancel: &CancellationToken) -> Result<u64> {
        self.expect_state("settle", &[CommState::Queued])?;
        if let Some(event) = self.done_event {
            self.runtime.record_event(event, self.prev_queue)?;
            self.runtime.synchronize_event(event)?;
        }
        for ring in 0..self.n_rings() {
            sync::wait_all_drained(self.outgoing(ring)?, policy, cancel)?;
        }
        let counter = self.counter_block()?.header().advance_op_counter();
        self.state = CommState::Settled;
        tracing::debug!(device = self.device, op_counter = counter, "call settled");
        Ok(counter)
    }

    /// Release every cross-process mapping once, destroy the done event and
    /// free the owned blocks. Later operations fail with `Destroyed`, and
    /// peer references into this device's blocks fail with `PeerReleased`.
    ///
    /// Teardown runs to completion even when a release fails; the first
    /// failure is returned.
    pub fn destroy(&mut self) -> Result<()> {
        self.ensure_live()?;
        self.teardown()
    }

    fn teardown(&mut self) -> Result<()> {
        let mut first_err = None;
        for peer in self.peers.iter_mut() {
            let Some(handles) = peer.take_cleanup() else {
                continue;
            };
            for handle in [handles.device, handles.host].into_iter().flatten() {
                if let Err(e) = self.runtime.release_mapping(handle) {
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(event) = self.done_event.take()
            && let Err(e) = self.runtime.destroy_event(event)
        {
            first_err.get_or_insert(e);
        }
        for block in self.dev_blocks.drain(..).chain(self.host_blocks.drain(..)) {
            block.mark_released();
        }
        self.peers = Box::new([]);
        self.state = CommState::Destroyed;
        tracing::debug!(device = self.device, "communicator destroyed");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn counter_block(&self) -> Result<&Arc<SyncRegion>> {
        self.host_blocks.first().ok_or(RingError::Destroyed)
    }

    fn check_ring(&self, ring: usize) -> Result<()> {
        let n_rings = self.tables.n_rings();
        if ring >= n_rings {
            return Err(RingError::RingOutOfRange { ring, n_rings });
        }
        Ok(())
    }

    fn ensure_live(&self) -> Result<()> {
        if self.state == CommState::Destroyed {
            return Err(RingError::Destroyed);
        }
        Ok(())
    }

    fn expect_state(&self, op: &'static str, allowed: &[CommState]) -> Result<()> {
        self.ensure_live()?;
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(RingError::InvalidState {
                op,
                state: self.state,
            })
        }
    }
}

impl Drop for Communicator {
    fn drop(&mut self) {
        if self.state != CommState::Destroyed
            && let Err(e) = self.teardown()
        {
            ring_warn!(device = self.device, "teardown on drop failed: {e}");
        }
    }
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("device", &self.device)
            .field("rank", &self.rank)
            .field("n_rings", &self.tables.n_rings())
            .field("state", &self.state)
            .field("op_sched", &self.op_sched)
            .field("queue", &self.prev_queue)
            .finish()
    }
}
