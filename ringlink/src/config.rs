//! Group configuration.
//!
//! All values have defaults. Override via environment variables (prefixed
//! `RINGLINK_`) or by constructing a custom `RingConfig`.

use crate::ring::parse_ring_orders;
use crate::sync::BackoffPolicy;
use crate::types::{DEFAULT_BUFFER_SIZE, DeviceIndex};

/// Parameters fixed when a ring group is created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    /// Payload bytes next to every synchronization block. Must be a
    /// non-zero multiple of `MAX_FLAGS`.
    pub buffer_size: usize,

    /// Requested ring count; clamped to the device count. Each ring costs
    /// a device block and a host block of `buffer_size` per device.
    pub n_rings: usize,

    /// Let kernels write straight into the next device's receive buffer.
    /// Only valid when every link is same-process, device-direct and on
    /// one socket.
    pub remote_recv: bool,

    /// Explicit device order per ring. Replaces the default rotations.
    pub ring_orders: Option<Vec<Vec<DeviceIndex>>>,

    /// Default pacing for handshake polls.
    pub backoff: BackoffPolicy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            n_rings: 1,
            remote_recv: false,
            ring_orders: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RingConfig {
    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `RINGLINK_BUFFER_SIZE`
    /// - `RINGLINK_NRINGS`
    /// - `RINGLINK_REMOTE_RECV` (`1`/`true` to enable)
    /// - `RINGLINK_RING_ORDERS` (e.g. `"0 1 2 3|0 2 1 3"`)
    /// - `RINGLINK_SPIN_ITERS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = get("RINGLINK_BUFFER_SIZE")
            && let Ok(n) = v.trim().parse::<usize>()
        {
            cfg.buffer_size = n;
        }
        if let Some(v) = get("RINGLINK_NRINGS")
            && let Ok(n) = v.trim().parse::<usize>()
        {
            cfg.n_rings = n;
        }
        if let Some(v) = get("RINGLINK_REMOTE_RECV") {
            match v.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => cfg.remote_recv = true,
                "0" | "false" | "no" => cfg.remote_recv = false,
                _ => {}
            }
        }
        if let Some(v) = get("RINGLINK_RING_ORDERS") {
            match parse_ring_orders(&v) {
                Ok(orders) if orders.iter().all(|o| !o.is_empty()) => {
                    cfg.ring_orders = Some(orders)
                }
                Ok(_) => {}
                Err(e) => tracing::warn!("ignoring RINGLINK_RING_ORDERS: {e}"),
            }
        }
        if let Some(v) = get("RINGLINK_SPIN_ITERS")
            && let Ok(n) = v.trim().parse::<u64>()
        {
            cfg.backoff.spin_iters = n;
        }

        cfg
    }
}
