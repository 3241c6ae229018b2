mod adapter;
mod host;

pub use adapter::{DeviceRuntime, EventHandle, MappingHandle, MappingKind, QueueHandle};
pub use host::{HostRuntime, MappingRecord};
