use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::{
        atomic::{AtomicI64, AtomicU8, Ordering},
        Arc,
    },
};

use chrono::{DateTime, TimeZone, Utc};
use getset::CopyGetters;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    extent::{ExtentList, ExtentOwner},
    ino, LayerFsResult, LayerHandle, ROOT_INODE,
};

use super::{dirty::DirtyQueue, stats::LayerCounters, LayerStats};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Where a layer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerState {
    /// Accepts writes.
    Active,

    /// A committed snapshot; writes are rejected.
    Frozen,

    /// Being unlinked from the tree under its exclusive lock.
    Deleting,
}

/// One file system layer: a node of the snapshot tree.
///
/// Tree links (parent, first snapshot, next sibling) are kept by the global registry under the
/// global lock. Everything here belongs to the layer alone.
///
/// ## Locking
///
/// - `gate` is taken shared by every file operation on the layer and exclusive by snapshot
///   creation and deletion.
/// - `extents` guards the block map and the metadata free list. It is only taken while the gate
///   is held and never across another layer's `extents`, except by deletion which holds both
///   gates exclusively.
/// - `icache_locks` are the inode-cache bucket locks.
/// - the dirty queue carries its own mutex.
#[derive(CopyGetters)]
pub struct Layer {
    /// Index of this layer in the global registry
    #[getset(get_copy = "pub with_prefix")]
    handle: LayerHandle,

    /// Root inode of the layer's namespace
    #[getset(get_copy = "pub with_prefix")]
    root: u64,

    /// Superblock location, opaque to the core
    #[getset(get_copy = "pub with_prefix")]
    sblock: u64,

    /// Creation time
    #[getset(get_copy = "pub with_prefix")]
    ctime: DateTime<Utc>,

    /// Last access time, seconds since the epoch
    atime: AtomicI64,

    /// Lifecycle state
    state: AtomicU8,

    /// Operation gate
    gate: Arc<RwLock<()>>,

    /// Block map and metadata space
    extents: Mutex<LayerExtents>,

    /// Inode-cache bucket locks
    icache_locks: Box<[Mutex<()>]>,

    /// Blocks pending writeback
    dirty: DirtyQueue,

    /// Bookkeeping counters
    counters: LayerCounters,
}

/// The extent lists of a layer.
#[derive(Debug, Clone)]
pub(crate) struct LayerExtents {
    /// Logical-to-physical map of the blocks this layer owns exclusively
    pub(crate) emap: ExtentList,

    /// Metadata blocks the layer freed and can hand out again
    pub(crate) meta_free: ExtentList,

    /// Next block of the reserved metadata run
    pub(crate) meta_next: u64,

    /// Blocks left in the reserved metadata run
    pub(crate) meta_count: u64,
}

/// Everything needed to rebuild a layer.
pub(crate) struct LayerParts {
    pub(crate) handle: LayerHandle,
    pub(crate) sblock: u64,
    pub(crate) state: LayerState,
    pub(crate) ctime: DateTime<Utc>,
    pub(crate) extents: LayerExtents,
    pub(crate) stats: LayerStats,
    pub(crate) icache_buckets: usize,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Layer {
    /// Creates an empty layer.
    pub(crate) fn new(
        handle: LayerHandle,
        sblock: u64,
        read_only: bool,
        total_blocks: u64,
        icache_buckets: usize,
    ) -> Self {
        let state = if read_only {
            LayerState::Frozen
        } else {
            LayerState::Active
        };

        Self::from_parts(LayerParts {
            handle,
            sblock,
            state,
            ctime: Utc::now(),
            extents: LayerExtents::new(handle, total_blocks),
            stats: LayerStats::default(),
            icache_buckets,
        })
    }

    pub(crate) fn from_parts(parts: LayerParts) -> Self {
        let icache_locks = (0..parts.icache_buckets.max(1))
            .map(|_| Mutex::new(()))
            .collect();

        Self {
            handle: parts.handle,
            root: ino::encode(parts.handle, ROOT_INODE),
            sblock: parts.sblock,
            ctime: parts.ctime,
            atime: AtomicI64::new(parts.ctime.timestamp()),
            state: AtomicU8::new(parts.state.into()),
            gate: Arc::new(RwLock::new(())),
            extents: Mutex::new(parts.extents),
            icache_locks,
            dirty: DirtyQueue::default(),
            counters: LayerCounters::from_stats(&parts.stats),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LayerState {
        LayerState::from(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` for a frozen snapshot.
    pub fn is_read_only(&self) -> bool {
        self.state() == LayerState::Frozen
    }

    /// Last access time.
    pub fn atime(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.atime.load(Ordering::Relaxed), 0)
            .single()
            .unwrap_or(self.ctime)
    }

    /// A copy of the layer's counters.
    pub fn stats(&self) -> LayerStats {
        self.counters.snapshot()
    }

    /// Number of blocks the layer maps itself.
    pub fn mapped_blocks(&self) -> u64 {
        self.extents.lock().emap.total()
    }

    /// Locks the inode-cache bucket `ino` hashes to.
    pub fn lock_inode_bucket(&self, ino: u64) -> MutexGuard<'_, ()> {
        self.icache_locks[self.bucket_of(ino)].lock()
    }

    /// Takes every block waiting for writeback.
    pub fn drain_dirty(&self) -> Vec<u64> {
        self.dirty.drain()
    }

    /// Number of blocks waiting for writeback.
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    fn bucket_of(&self, ino: u64) -> usize {
        let mut hasher = DefaultHasher::new();
        ino.hash(&mut hasher);
        (hasher.finish() % self.icache_locks.len() as u64) as usize
    }

    pub(crate) fn set_state(&self, state: LayerState) {
        self.state.store(state.into(), Ordering::Release);
    }

    pub(crate) fn touch(&self) {
        self.atime.store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub(crate) fn gate(&self) -> &Arc<RwLock<()>> {
        &self.gate
    }

    pub(crate) fn extents(&self) -> MutexGuard<'_, LayerExtents> {
        self.extents.lock()
    }

    pub(crate) fn dirty(&self) -> &DirtyQueue {
        &self.dirty
    }

    pub(crate) fn counters(&self) -> &LayerCounters {
        &self.counters
    }
}

impl LayerExtents {
    pub(crate) fn new(handle: LayerHandle, total_blocks: u64) -> Self {
        Self {
            emap: ExtentList::emap(ExtentOwner::Layer(handle), total_blocks),
            meta_free: ExtentList::space(ExtentOwner::Layer(handle), total_blocks),
            meta_next: 0,
            meta_count: 0,
        }
    }

    /// Hands out `count` metadata blocks from what the layer already holds.
    ///
    /// The private free list is searched first-fit, then the reserved run is carved from its
    /// front. Returns `None` when neither can satisfy the request.
    pub(crate) fn alloc_meta(&mut self, count: u64) -> LayerFsResult<Option<u64>> {
        if let Some(start) = self.meta_free.first_fit(count) {
            self.meta_free.remove(start, count)?;
            return Ok(Some(start));
        }

        if self.meta_count >= count {
            let start = self.meta_next;
            self.meta_next += count;
            self.meta_count -= count;
            return Ok(Some(start));
        }

        Ok(None)
    }

    /// Replaces the reserved run, keeping what was left of the old one in the free list.
    pub(crate) fn reserve(&mut self, start: u64, count: u64) -> LayerFsResult<()> {
        if self.meta_count > 0 {
            self.meta_free.insert(self.meta_next, 0, self.meta_count)?;
        }
        self.meta_next = start;
        self.meta_count = count;
        Ok(())
    }

    /// The metadata blocks the layer holds: its private free list and the unused reserved run.
    pub(crate) fn meta_space(&self) -> Vec<(u64, u64)> {
        let mut ranges: Vec<_> = self
            .meta_free
            .iter()
            .map(|extent| (extent.get_start(), extent.get_count()))
            .collect();

        if self.meta_count > 0 {
            ranges.push((self.meta_next, self.meta_count));
        }
        ranges
    }

    /// Drops every mapping and all metadata space.
    pub(crate) fn clear(&mut self) {
        self.emap.take_all();
        self.meta_free.take_all();
        self.meta_next = 0;
        self.meta_count = 0;
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl From<LayerState> for u8 {
    fn from(state: LayerState) -> Self {
        match state {
            LayerState::Active => 0,
            LayerState::Frozen => 1,
            LayerState::Deleting => 2,
        }
    }
}

impl From<u8> for LayerState {
    fn from(value: u8) -> Self {
        match value {
            0 => LayerState::Active,
            1 => LayerState::Frozen,
            _ => LayerState::Deleting,
        }
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer")
            .field("handle", &self.handle)
            .field("root", &self.root)
            .field("sblock", &self.sblock)
            .field("state", &self.state())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
