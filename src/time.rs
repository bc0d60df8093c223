//! Monotonic time helpers.
//!
//! All deadlines in the crate are computed against `tokio::time::Instant`
//! so they follow the runtime clock (and the mock clock under
//! `tokio::time::pause`). `now_ms` is measured from a process-wide epoch
//! and is used for window and slot arithmetic only, never persisted.

use std::sync::OnceLock;

use tokio::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

#[inline]
pub(crate) fn now() -> Instant {
    Instant::now()
}

/// Milliseconds since the process epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    now().saturating_duration_since(epoch()).as_millis() as u64
}
