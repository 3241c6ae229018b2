pub mod bootstrap;
pub mod comm;
pub mod config;
pub mod device;
pub mod diag;
pub mod error;
pub mod memory;
pub mod peer;
pub mod ring;
pub mod sync;
pub mod types;

pub use bootstrap::{DeviceSpec, GroupSpec, init_group, init_local_group};
pub use comm::{CommState, Communicator, StepHandoff};
pub use config::RingConfig;
pub use device::{DeviceRuntime, EventHandle, HostRuntime, MappingHandle, QueueHandle};
pub use diag::DebugLevel;
pub use error::{Result, RingError};
pub use memory::{BufferPtr, BufferRef, CopyKind, Device, Host, MemKind, StagedRef, SyncRegion};
pub use peer::{AddressMode, CleanupHandles, Direction, Locality, PeerRef, PeerSlot};
pub use ring::{Neighbors, RingOrder, RingTables};
pub use sync::{BackoffPolicy, SlotGuard, SlotState};
pub use types::{DEFAULT_BUFFER_SIZE, DeviceIndex, Epoch, MAX_FLAGS, MAX_RINGS, Rank};
