use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Per-run outcome counters shared by every worker.
#[derive(Debug, Default)]
pub struct Statistics {
    copies: AtomicU64,
    updates: AtomicU64,
    skipped: AtomicU64,
    fails: AtomicU64,
    duplicates: AtomicU64,
}

/// Point-in-time copy of [`Statistics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsSnapshot {
    pub copies: u64,
    pub updates: u64,
    pub skipped: u64,
    pub fails: u64,
    pub duplicates: u64,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_copy(&self) {
        self.copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_update(&self) {
        self.updates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy failures, metadata write failures and unresolvable dates.
    pub fn record_fail(&self) {
        self.fails.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_duplicate(&self) {
        self.duplicates.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            copies: self.copies.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            fails: self.fails.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrent_increments() {
        let stats = Statistics::new();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..1000 {
                        stats.record_copy();
                        stats.record_fail();
                    }
                });
            }
        });
        let snap = stats.snapshot();
        assert_eq!(snap.copies, 8000);
        assert_eq!(snap.fails, 8000);
        assert_eq!(snap.updates, 0);
    }
}
