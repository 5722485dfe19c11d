use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A point-in-time copy of a layer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerStats {
    /// Inodes in the layer
    pub inodes: u64,

    /// Pages in the layer
    pub pages: u64,

    /// Read operations
    pub reads: u64,

    /// Write operations
    pub writes: u64,

    /// Inodes written back
    pub inodes_written: u64,
}

/// The live counters of a layer. Bookkeeping only.
#[derive(Debug, Default)]
pub(crate) struct LayerCounters {
    inodes: AtomicU64,
    pages: AtomicU64,
    reads: AtomicU64,
    writes: AtomicU64,
    inodes_written: AtomicU64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerCounters {
    pub(crate) fn from_stats(stats: &LayerStats) -> Self {
        Self {
            inodes: AtomicU64::new(stats.inodes),
            pages: AtomicU64::new(stats.pages),
            reads: AtomicU64::new(stats.reads),
            writes: AtomicU64::new(stats.writes),
            inodes_written: AtomicU64::new(stats.inodes_written),
        }
    }

    pub(crate) fn add_inodes(&self, count: u64) {
        self.inodes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_pages(&self, count: u64) {
        self.pages.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_reads(&self, count: u64) {
        self.reads.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_writes(&self, count: u64) {
        self.writes.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn add_inodes_written(&self, count: u64) {
        self.inodes_written.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> LayerStats {
        LayerStats {
            inodes: self.inodes.load(Ordering::Relaxed),
            pages: self.pages.load(Ordering::Relaxed),
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            inodes_written: self.inodes_written.load(Ordering::Relaxed),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::ops::Add for LayerStats {
    type Output = LayerStats;

    fn add(self, other: LayerStats) -> LayerStats {
        LayerStats {
            inodes: self.inodes + other.inodes,
            pages: self.pages + other.pages,
            reads: self.reads + other.reads,
            writes: self.writes + other.writes,
            inodes_written: self.inodes_written + other.inodes_written,
        }
    }
}

impl std::iter::Sum for LayerStats {
    fn sum<I: Iterator<Item = LayerStats>>(iter: I) -> Self {
        iter.fold(LayerStats::default(), |acc, stats| acc + stats)
    }
}
