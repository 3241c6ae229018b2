mod block;
mod buffer;

pub use block::{
    FLAGS_OFFSET, HEADER_BYTES, OP_COUNTER_OFFSET, PAYLOAD_OFFSET, RECV_PTRS_OFFSET, SyncHeader,
    SyncRegion,
};
pub(crate) use block::{check_buffer_size, check_step};
pub use buffer::{BufferPtr, BufferRef, CopyKind, Device, Host, MemKind, MemorySpace, StagedRef};
