mod backoff;
mod handshake;

pub use backoff::{BackoffPolicy, poll_until};
pub use handshake::{
    FLAG_DRAINED, FLAG_READY, SlotGuard, SlotState, consume, try_consume, wait_all_drained,
    wait_drained,
};
