//! Per-tenant cardinality budget and volume ledger.

use crate::store::LruMap;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Where a record goes after the budget check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Signature tracked (or newly admitted); keep full detail.
    Retained,
    /// Signature would exceed the ceiling; coalesce into the overflow bucket.
    Overflow {
        /// `true` for the first overflow of the current window.
        onset: bool,
    },
}

/// Totals of a closed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WindowSummary {
    /// Records overflowed in the window.
    pub overflow: u64,
    /// Estimated bytes observed in the window.
    pub bytes: u64,
}

/// Point-in-time view of a budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BudgetSnapshot {
    /// Distinct signatures allowed per window.
    pub ceiling: usize,
    /// Signatures currently tracked.
    pub tracked_signatures: usize,
    /// Records overflowed in the open window.
    pub window_overflow: u64,
    /// Records retained with full detail since the budget was created.
    pub total_retained: u64,
    /// Records overflowed since the budget was created.
    pub total_overflow: u64,
    /// Records observed since the budget was created.
    pub total_observed: u64,
    /// Estimated bytes observed in the open window.
    pub window_bytes: u64,
    /// Estimated bytes observed since the budget was created.
    pub total_bytes: u64,
}

/// Signature set and overflow aggregate of one tenant.
///
/// `total_observed == total_retained + total_overflow` holds after every call.
#[derive(Debug)]
pub struct CostBudget {
    ceiling: usize,
    signatures: LruMap<u64, ()>,
    window_started: Instant,
    window_overflow: u64,
    pending_overflow: u64,
    total_retained: u64,
    total_overflow: u64,
    total_observed: u64,
    window_bytes: u64,
    total_bytes: u64,
    pending_bytes: u64,
}

impl CostBudget {
    /// Creates an empty budget for `ceiling` distinct signatures.
    #[must_use]
    pub fn new(ceiling: usize, now: Instant) -> Self {
        Self {
            ceiling,
            signatures: LruMap::new(ceiling),
            window_started: now,
            window_overflow: 0,
            pending_overflow: 0,
            total_retained: 0,
            total_overflow: 0,
            total_observed: 0,
            window_bytes: 0,
            total_bytes: 0,
            pending_bytes: 0,
        }
    }

    /// Checks one record's signature against the budget.
    ///
    /// Tracked signatures are refreshed; they expire `ttl` after their last
    /// use. A new signature is tracked while fewer than `ceiling` are live.
    pub fn admit(&mut self, signature: u64, now: Instant, ttl: Duration) -> Verdict {
        self.total_observed += 1;
        if !self.signatures.contains_live(&signature, now) {
            self.signatures.pop_expired_lru(now);
            if self.signatures.len() >= self.ceiling {
                let onset = self.window_overflow == 0;
                self.window_overflow += 1;
                self.pending_overflow += 1;
                self.total_overflow += 1;
                return Verdict::Overflow { onset };
            }
        }
        self.signatures.put(signature, (), now, Some(ttl));
        self.total_retained += 1;
        Verdict::Retained
    }

    /// Adds `bytes` of observed volume.
    pub fn add_volume(&mut self, bytes: u64) {
        self.window_bytes = self.window_bytes.saturating_add(bytes);
        self.total_bytes = self.total_bytes.saturating_add(bytes);
        self.pending_bytes = self.pending_bytes.saturating_add(bytes);
    }

    /// Closes the window if `window` has elapsed and returns its totals.
    pub fn roll_window(&mut self, now: Instant, window: Duration) -> Option<WindowSummary> {
        if now.saturating_duration_since(self.window_started) < window {
            return None;
        }
        self.signatures.pop_expired_lru(now);
        self.window_started = now;
        Some(WindowSummary {
            overflow: std::mem::take(&mut self.window_overflow),
            bytes: std::mem::take(&mut self.window_bytes),
        })
    }

    /// Returns overflow records not yet exported to metrics.
    pub fn take_pending_overflow(&mut self) -> u64 {
        std::mem::take(&mut self.pending_overflow)
    }

    /// Returns observed bytes not yet exported to metrics.
    pub fn take_pending_bytes(&mut self) -> u64 {
        std::mem::take(&mut self.pending_bytes)
    }

    /// Current view.
    #[must_use]
    pub fn snapshot(&self) -> BudgetSnapshot {
        BudgetSnapshot {
            ceiling: self.ceiling,
            tracked_signatures: self.signatures.len(),
            window_overflow: self.window_overflow,
            total_retained: self.total_retained,
            total_overflow: self.total_overflow,
            total_observed: self.total_observed,
            window_bytes: self.window_bytes,
            total_bytes: self.total_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_ceiling_splits_retained_and_overflow() {
        let now = Instant::now();
        let mut budget = CostBudget::new(50, now);
        let verdicts: Vec<_> = (0..200u64).map(|s| budget.admit(s, now, WINDOW)).collect();

        let retained = verdicts.iter().filter(|v| **v == Verdict::Retained).count();
        assert_eq!(retained, 50);
        assert_eq!(verdicts[50], Verdict::Overflow { onset: true });
        assert_eq!(verdicts[51], Verdict::Overflow { onset: false });

        let snap = budget.snapshot();
        assert_eq!(snap.total_retained + snap.total_overflow, snap.total_observed);
        assert_eq!(snap.total_overflow, 150);
    }

    #[test]
    fn test_tracked_signature_stays_retained_when_full() {
        let now = Instant::now();
        let mut budget = CostBudget::new(2, now);
        budget.admit(1, now, WINDOW);
        budget.admit(2, now, WINDOW);
        assert_eq!(budget.admit(3, now, WINDOW), Verdict::Overflow { onset: true });
        assert_eq!(budget.admit(1, now, WINDOW), Verdict::Retained);
    }

    #[test]
    fn test_idle_signatures_expire_and_free_room() {
        let start = Instant::now();
        let mut budget = CostBudget::new(2, start);
        budget.admit(1, start, WINDOW);
        budget.admit(2, start + Duration::from_secs(30), WINDOW);

        let later = start + WINDOW;
        assert_eq!(budget.admit(3, later, WINDOW), Verdict::Retained);
        assert_eq!(budget.admit(4, later, WINDOW), Verdict::Overflow { onset: true });
    }

    #[test]
    fn test_roll_window_resets_overflow_but_keeps_totals() {
        let start = Instant::now();
        let mut budget = CostBudget::new(1, start);
        budget.admit(1, start, WINDOW);
        budget.admit(2, start, WINDOW);
        budget.admit(3, start, WINDOW);

        assert_eq!(budget.roll_window(start + Duration::from_secs(10), WINDOW), None);
        budget.add_volume(300);
        assert_eq!(
            budget.roll_window(start + WINDOW, WINDOW),
            Some(WindowSummary { overflow: 2, bytes: 300 })
        );
        let snap = budget.snapshot();
        assert_eq!(snap.window_overflow, 0);
        assert_eq!(snap.total_overflow, 2);
        assert_eq!(budget.take_pending_overflow(), 2);
        assert_eq!(budget.take_pending_overflow(), 0);
        assert_eq!(snap.window_bytes, 0);
        assert_eq!(snap.total_bytes, 300);
        assert_eq!(budget.take_pending_bytes(), 300);
        assert_eq!(budget.take_pending_bytes(), 0);
    }
}
