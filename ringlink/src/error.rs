use crate::comm::CommState;
use crate::types::DeviceIndex;

pub type Result<T> = std::result::Result<T, RingError>;

#[derive(Debug, thiserror::Error)]
pub enum RingError {
    #[error("device runtime error: {message}")]
    Device {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid device count {n_dev}: at least one device is required")]
    DeviceCount { n_dev: usize },

    #[error("invalid rank order: {reason}")]
    InvalidRankOrder { reason: String },

    #[error("ring {ring}: {table} is not a permutation of [0, {n_dev}): {reason}")]
    NonBijective {
        ring: usize,
        table: &'static str,
        n_dev: usize,
        reason: String,
    },

    #[error("requested {requested} rings, at most {max} are supported")]
    TooManyRings { requested: usize, max: usize },

    #[error("ring {ring} out of range: communicator has {n_rings} rings")]
    RingOutOfRange { ring: usize, n_rings: usize },

    #[error("step slot {step} out of range: blocks have {max} slots")]
    StepOutOfRange { step: usize, max: usize },

    #[error("step slot {step} is still ready: previous publish was never drained")]
    SlotBusy { step: usize },

    #[error(
        "stale flag on step slot {step}: epoch {epoch} needs producer counter >= {required}, observed {observed}"
    )]
    StaleEpoch {
        step: usize,
        epoch: u64,
        required: u64,
        observed: u64,
    },

    #[error("payload of {len} bytes exceeds step slot capacity of {capacity} bytes")]
    PayloadTooLarge { len: usize, capacity: usize },

    #[error("cleanup handle {handle} released twice")]
    DoubleRelease { handle: u64 },

    #[error("peer reference to device {device} no longer resolves: its memory was released")]
    PeerReleased { device: DeviceIndex },

    #[error("remote receive is not allowed on the link from device {device} to device {neighbor}")]
    RemoteRecvDisallowed {
        device: DeviceIndex,
        neighbor: DeviceIndex,
    },

    #[error("{op} is not valid in communicator state {state:?}")]
    InvalidState { op: &'static str, state: CommState },

    #[error("communicator has been destroyed")]
    Destroyed,

    #[error("poll cancelled")]
    Cancelled,

    #[error("poll budget of {iterations} iterations exhausted")]
    PollBudgetExhausted { iterations: u64 },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl RingError {
    /// Create a `Device` error with just a message.
    pub fn device(msg: impl Into<String>) -> Self {
        Self::Device {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Device` error with a message and a source error.
    pub fn device_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Device {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }

    /// True for errors caused by a broken handshake or bad configuration
    /// rather than by the device layer or the caller's poll policy.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            RingError::NonBijective { .. }
                | RingError::InvalidRankOrder { .. }
                | RingError::SlotBusy { .. }
                | RingError::StaleEpoch { .. }
                | RingError::DoubleRelease { .. }
                | RingError::InvalidState { .. }
        )
    }
}
