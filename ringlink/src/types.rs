/// Index of a device as numbered by the bootstrap collaborator.
pub type DeviceIndex = usize;

/// Rank in the user's desired data-owner order (0-indexed).
pub type Rank = usize;

/// Identifier of the OS process that drives a device.
pub type ProcessId = u32;

/// Maximum number of simultaneous rings per communicator.
pub const MAX_RINGS: usize = 8;

/// In-flight step slots per synchronization block.
pub const MAX_FLAGS: usize = 16;

/// Default payload bytes adjacent to each synchronization block (32 MiB).
pub const DEFAULT_BUFFER_SIZE: usize = 1 << 25;

/// Alignment of every synchronization block, and offset of its payload.
pub const MEM_PAD_ALIGN: usize = 4096;

/// One collective call on a communicator, numbered from 1.
///
/// A producer's completion counter equals the number of calls it has
/// settled, so flags published for epoch `e` are only trustworthy once the
/// producer's counter has reached `e - 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Epoch(u64);

impl Epoch {
    pub const FIRST: Epoch = Epoch(1);

    pub const fn new(call: u64) -> Self {
        Self(call)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Minimum producer completion counter at which flags of this epoch are live.
    pub const fn required_counter(self) -> u64 {
        self.0.saturating_sub(1)
    }

    pub const fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for Epoch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "epoch {}", self.0)
    }
}
