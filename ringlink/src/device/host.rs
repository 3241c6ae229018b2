use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::device::adapter::{
    DeviceRuntime, EventHandle, MappingHandle, MappingKind, QueueHandle,
};
use crate::error::{RingError, Result};
use crate::types::DeviceIndex;

/// DeviceRuntime backed by host memory. Work is executed by the caller as it
/// is issued, so every recorded event is already complete.
#[derive(Debug)]
pub struct HostRuntime {
    next_id: AtomicU64,
    peer_access: bool,
    ipc: bool,
    state: Mutex<HostState>,
}

#[derive(Debug, Default)]
struct HostState {
    events: HashMap<u64, EventRecord>,
    mappings: HashMap<u64, MappingRecord>,
    released: HashSet<u64>,
    waits: Vec<(QueueHandle, EventHandle)>,
}

#[derive(Debug)]
struct EventRecord {
    device: DeviceIndex,
    recorded_on: Option<QueueHandle>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRecord {
    pub kind: MappingKind,
    pub device: DeviceIndex,
    pub peer: DeviceIndex,
    pub addr: u64,
}

impl HostRuntime {
    /// All devices can address each other in-process; no cross-process IPC.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            peer_access: true,
            ipc: false,
            state: Mutex::new(HostState::default()),
        }
    }

    pub fn with_peer_access(mut self, enabled: bool) -> Self {
        self.peer_access = enabled;
        self
    }

    pub fn with_ipc(mut self, enabled: bool) -> Self {
        self.ipc = enabled;
        self
    }

    /// Every `(queue, event)` pair passed to `queue_wait_event`, in order.
    pub fn queue_waits(&self) -> Result<Vec<(QueueHandle, EventHandle)>> {
        Ok(self.lock()?.waits.clone())
    }

    /// Mappings that have been created and not yet released.
    pub fn live_mappings(&self) -> Result<Vec<MappingRecord>> {
        Ok(self.lock()?.mappings.values().copied().collect())
    }

    pub fn released_mappings(&self) -> Result<usize> {
        Ok(self.lock()?.released.len())
    }

    pub fn live_events(&self) -> Result<usize> {
        Ok(self.lock()?.events.len())
    }

    /// Queue the event was last recorded on, if any.
    pub fn event_queue(&self, event: EventHandle) -> Result<Option<QueueHandle>> {
        let state = self.lock()?;
        let rec = state
            .events
            .get(&event.0)
            .ok_or_else(|| RingError::device(format!("unknown event {}", event.0)))?;
        Ok(rec.recorded_on)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HostState>> {
        self.state
            .lock()
            .map_err(|_| RingError::LockPoisoned("host runtime state"))
    }

    fn fresh_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for HostRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for HostRuntime {
    fn create_event(&self, device: DeviceIndex) -> Result<EventHandle> {
        let id = self.fresh_id();
        self.lock()?.events.insert(
            id,
            EventRecord {
                device,
                recorded_on: None,
            },
        );
        Ok(EventHandle(id))
    }

    fn record_event(&self, event: EventHandle, queue: QueueHandle) -> Result<()> {
        let mut state = self.lock()?;
        let rec = state
            .events
            .get_mut(&event.0)
            .ok_or_else(|| RingError::device(format!("record of unknown event {}", event.0)))?;
        rec.recorded_on = Some(queue);
        tracing::trace!(event = event.0, device = rec.device, queue = queue.0, "event recorded");
        Ok(())
    }

    fn queue_wait_event(&self, queue: QueueHandle, event: EventHandle) -> Result<()> {
        let mut state = self.lock()?;
        if !state.events.contains_key(&event.0) {
            return Err(RingError::device(format!(
                "queue {} waits on unknown event {}",
                queue.0, event.0
            )));
        }
        state.waits.push((queue, event));
        Ok(())
    }

    fn synchronize_event(&self, event: EventHandle) -> Result<()> {
        if self.lock()?.events.contains_key(&event.0) {
            Ok(())
        } else {
            Err(RingError::device(format!(
                "synchronize on unknown event {}",
                event.0
            )))
        }
    }

    fn destroy_event(&self, event: EventHandle) -> Result<()> {
        self.lock()?
            .events
            .remove(&event.0)
            .map(|_| ())
            .ok_or_else(|| RingError::device(format!("destroy of unknown event {}", event.0)))
    }

    fn can_access_peer(&self, device: DeviceIndex, peer: DeviceIndex) -> bool {
        device == peer || self.peer_access
    }

    fn supports_ipc(&self, _device: DeviceIndex, _peer: DeviceIndex) -> bool {
        self.ipc
    }

    fn map_peer(
        &self,
        kind: MappingKind,
        device: DeviceIndex,
        peer: DeviceIndex,
        addr: u64,
    ) -> Result<MappingHandle> {
        if kind == MappingKind::Device && !self.ipc {
            return Err(RingError::device(format!(
                "device {device} cannot open device memory of {peer} without IPC support"
            )));
        }
        let id = self.fresh_id();
        self.lock()?.mappings.insert(
            id,
            MappingRecord {
                kind,
                device,
                peer,
                addr,
            },
        );
        Ok(MappingHandle(id))
    }

    fn release_mapping(&self, handle: MappingHandle) -> Result<()> {
        let mut state = self.lock()?;
        if state.mappings.remove(&handle.0).is_some() {
            state.released.insert(handle.0);
            Ok(())
        } else if state.released.contains(&handle.0) {
            Err(RingError::DoubleRelease { handle: handle.0 })
        } else {
            Err(RingError::device(format!("release of unknown mapping {}", handle.0)))
        }
    }
}
