//! Process-wide diagnostics level.
//!
//! The level is set once at startup (explicitly through [`init`], or lazily
//! from `RINGLINK_DEBUG`) and only read afterwards. Call sites log through
//! `tracing`; at [`DebugLevel::Abort`] a warning terminates the process.

use std::str::FromStr;
use std::sync::OnceLock;

use crate::error::{RingError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum DebugLevel {
    None = 0,
    Warn = 1,
    Info = 2,
    Abort = 3,
}

impl FromStr for DebugLevel {
    type Err = RingError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NONE" | "0" => Ok(DebugLevel::None),
            "WARN" | "1" => Ok(DebugLevel::Warn),
            "INFO" | "2" => Ok(DebugLevel::Info),
            "ABORT" | "3" => Ok(DebugLevel::Abort),
            other => Err(RingError::Config(format!(
                "unknown debug level {other:?}; expected NONE, WARN, INFO or ABORT"
            ))),
        }
    }
}

static LEVEL: OnceLock<DebugLevel> = OnceLock::new();

/// Fix the process-wide level. Setting the same level twice is a no-op;
/// changing it after it was fixed is an error.
pub fn init(level: DebugLevel) -> Result<()> {
    let current = *LEVEL.get_or_init(|| level);
    if current != level {
        return Err(RingError::Config(format!(
            "debug level already fixed at {current:?}"
        )));
    }
    Ok(())
}

/// Current level. Falls back to `RINGLINK_DEBUG`, then to `Warn`.
pub fn level() -> DebugLevel {
    *LEVEL.get_or_init(|| {
        std::env::var("RINGLINK_DEBUG")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DebugLevel::Warn)
    })
}

pub fn enabled(at: DebugLevel) -> bool {
    at != DebugLevel::None && level() >= at
}

/// Log a protocol anomaly. Aborts the process at [`DebugLevel::Abort`].
macro_rules! ring_warn {
    ($($arg:tt)+) => {
        if $crate::diag::enabled($crate::diag::DebugLevel::Warn) {
            tracing::warn!($($arg)+);
            if $crate::diag::enabled($crate::diag::DebugLevel::Abort) {
                std::process::abort();
            }
        }
    };
}

macro_rules! ring_info {
    ($($arg:tt)+) => {
        if $crate::diag::enabled($crate::diag::DebugLevel::Info) {
            tracing::info!($($arg)+);
        }
    };
}

pub(crate) use {ring_info, ring_warn};
