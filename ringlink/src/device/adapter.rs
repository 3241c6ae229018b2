use crate::error::Result;
use crate::types::DeviceIndex;

/// Handle of a device execution queue (a stream). Work on one queue runs in
/// issue order; different queues are unordered unless joined by an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle(pub u64);

impl QueueHandle {
    /// The device's default queue.
    pub const DEFAULT: QueueHandle = QueueHandle(0);
}

/// Handle of a completion marker recorded on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(pub u64);

/// Handle of a resource registered for one cross-process link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MappingHandle(pub u64);

/// Which side of a cross-process link a mapping covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MappingKind {
    /// A peer's device block opened in this process.
    Device,
    /// A peer's host block registered with this process.
    Host,
}

/// The device execution layer underneath the ring core.
///
/// The core never moves payload bytes itself: it orders queues with events
/// and asks the runtime which links support direct device addressing.
///
/// - `HostRuntime` (built-in): host memory stands in for device memory and
///   every event completes when it is recorded.
/// - GPU runtimes: stream/event calls of the vendor driver (implemented externally).
pub trait DeviceRuntime: Send + Sync {
    /// Create a completion marker on `device`.
    fn create_event(&self, device: DeviceIndex) -> Result<EventHandle>;

    /// Record `event` after all work currently issued on `queue`.
    fn record_event(&self, event: EventHandle, queue: QueueHandle) -> Result<()>;

    /// Make future work on `queue` wait for `event`, without blocking the host.
    fn queue_wait_event(&self, queue: QueueHandle, event: EventHandle) -> Result<()>;

    /// Block the host until `event` has completed.
    fn synchronize_event(&self, event: EventHandle) -> Result<()>;

    fn destroy_event(&self, event: EventHandle) -> Result<()>;

    /// Whether `device` can address `peer`'s memory directly inside one process.
    fn can_access_peer(&self, device: DeviceIndex, peer: DeviceIndex) -> bool;

    /// Whether `device` can open `peer`'s device memory across processes.
    fn supports_ipc(&self, device: DeviceIndex, peer: DeviceIndex) -> bool;

    /// Register `peer`'s block at `addr` for use by `device` across processes.
    fn map_peer(
        &self,
        kind: MappingKind,
        device: DeviceIndex,
        peer: DeviceIndex,
        addr: u64,
    ) -> Result<MappingHandle>;

    /// Release a mapping created by [`DeviceRuntime::map_peer`]. Releasing
    /// the same handle twice is a protocol violation.
    fn release_mapping(&self, handle: MappingHandle) -> Result<()>;
}
