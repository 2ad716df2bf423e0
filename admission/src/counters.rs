//! Lock-free decision counters with deferred export.
//!
//! The hot path only bumps atomics. Housekeeping and shutdown call
//! [`PendingCounter::take_pending`] and forward the delta to the `metrics`
//! recorder, so no registry lookup happens per record.
//!
//! All operations use `Ordering::Relaxed`; each counter is independent and
//! monotonic.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter that remembers how much has been exported.
#[derive(Debug, Default)]
pub struct PendingCounter {
    total: AtomicU64,
    exported: AtomicU64,
}

impl PendingCounter {
    /// Creates a zeroed counter.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            exported: AtomicU64::new(0),
        }
    }

    /// Adds `n`.
    pub fn add(&self, n: u64) {
        if n > 0 {
            self.total.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Adds one.
    pub fn incr(&self) {
        self.add(1);
    }

    /// Lifetime total.
    #[must_use]
    pub fn get(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    /// Returns the amount added since the previous call.
    pub fn take_pending(&self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        let previous = self.exported.swap(total, Ordering::Relaxed);
        total.saturating_sub(previous)
    }
}

/// Forwards the pending delta of `counter` to the named `metrics` counter.
#[macro_export]
#[doc(hidden)]
macro_rules! flush_counter {
    ($counter:expr, $name:literal $(, $label:literal => $value:expr)* $(,)?) => {{
        let pending = $counter.take_pending();
        if pending > 0 {
            ::metrics::counter!($name $(, $label => $value)*).increment(pending);
        }
    }};
}
