use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide transfer outcome counters.
///
/// Counters are only used for reporting. Each executor call records exactly one
/// outcome, after its retry loop has settled.
#[derive(Debug, Default)]
pub struct TransferStats {
    transfers: AtomicU64,
    suspicious: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_suspicious(&self) {
        self.suspicious.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            transfers: self.transfers.load(Ordering::Relaxed),
            suspicious: self.suspicious.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StatsSnapshot {
    pub transfers: u64,
    pub suspicious: u64,
    pub rejected: u64,
    pub failed: u64,
}

impl StatsSnapshot {
    pub fn attempted(&self) -> u64 {
        self.transfers + self.suspicious + self.rejected + self.failed
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "done {} transfers ({} suspicious transfers detected, {} rejected, {} failed)",
            self.transfers, self.suspicious, self.rejected, self.failed
        )
    }
}
