use std::sync::Arc;

use parking_lot::{ArcRwLockReadGuard, RawRwLock};

use crate::{
    extent::Extent, ino, GlobalFs, Layer, LayerFsError, LayerFsResult, LayerHandle, LayerState,
    ROOT_INODE,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

type GateGuard = ArcRwLockReadGuard<RawRwLock, ()>;

/// A file operation in flight against one layer.
///
/// The guard holds the layer's lock in shared mode for as long as it lives, so the layer cannot
/// be branched, committed or deleted underneath it. Any number of operations may run against the
/// same layer at once.
pub struct LayerOp<'a> {
    gfs: &'a GlobalFs,
    layer: Arc<Layer>,
    _gate: GateGuard,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GlobalFs {
    /// Starts an operation on the layer owning `ino`.
    ///
    /// ## Errors
    ///
    /// Returns `UnknownLayer` if the layer does not exist or was deleted while this call waited
    /// for its lock.
    pub fn begin_op(&self, ino: u64) -> LayerFsResult<LayerOp<'_>> {
        let layer = self.resolve_layer(ino)?;
        let gate = layer.gate().read_arc();

        let live = self.lock_state().holds(layer.get_handle(), &layer);
        if !live || layer.state() == LayerState::Deleting {
            return Err(LayerFsError::UnknownLayer(ino));
        }

        layer.touch();
        Ok(LayerOp {
            gfs: self,
            layer,
            _gate: gate,
        })
    }

    /// Starts an operation on the layer `handle`.
    pub fn begin_layer_op(&self, handle: LayerHandle) -> LayerFsResult<LayerOp<'_>> {
        self.begin_op(ino::encode(handle, ROOT_INODE))
    }

    /// Translates a logical block of `handle`, falling through to its ancestors.
    pub fn map_lookup(&self, handle: LayerHandle, block: u64) -> LayerFsResult<Option<u64>> {
        self.begin_layer_op(handle)?.map_lookup(block)
    }

    /// Records that `count` logical blocks of `handle` from `start` live at `block`.
    pub fn map_insert(
        &self,
        handle: LayerHandle,
        start: u64,
        block: u64,
        count: u64,
    ) -> LayerFsResult<()> {
        self.begin_layer_op(handle)?.map_insert(start, block, count)
    }

    /// Unmaps the blocks `handle` owns in a logical range and frees them.
    pub fn punch(&self, handle: LayerHandle, start: u64, count: u64) -> LayerFsResult<u64> {
        self.begin_layer_op(handle)?.punch(start, count)
    }

    /// Writes `count` logical blocks of `handle` from `start` to freshly allocated blocks.
    pub fn write(&self, handle: LayerHandle, start: u64, count: u64) -> LayerFsResult<u64> {
        self.begin_layer_op(handle)?.write(start, count)
    }
}

impl<'a> LayerOp<'a> {
    /// The layer this operation runs against.
    pub fn layer(&self) -> &Arc<Layer> {
        &self.layer
    }

    /// Handle of the layer this operation runs against.
    pub fn handle(&self) -> LayerHandle {
        self.layer.get_handle()
    }

    /// Translates a logical block to a physical one.
    ///
    /// A block the layer has not written itself is looked up in its parent, then in the parent's
    /// parent, up to the base layer. Every ancestor visited stays locked in shared mode until the
    /// lookup returns. `None` means no layer on the path maps the block.
    pub fn map_lookup(&self, block: u64) -> LayerFsResult<Option<u64>> {
        if let Some(physical) = self.layer.extents().emap.lookup(block) {
            return Ok(Some(physical));
        }

        let mut gates: Vec<GateGuard> = Vec::new();
        let mut handle = self.handle();
        loop {
            let parent = {
                let state = self.gfs.lock_state();
                if gates.len() >= state.slots.len() {
                    return Err(LayerFsError::corruption(format!(
                        "parent chain of layer {} loops",
                        self.handle()
                    )));
                }
                match state.links(handle)?.parent {
                    Some(parent) => state.layer(parent)?,
                    None => return Ok(None),
                }
            };

            gates.push(parent.gate().read_arc());
            if let Some(physical) = parent.extents().emap.lookup(block) {
                tracing::trace!(
                    layer = %self.handle(),
                    ancestor = %parent.get_handle(),
                    block,
                    physical,
                    "inherited block"
                );
                return Ok(Some(physical));
            }

            handle = parent.get_handle();
        }
    }

    /// Records that `count` logical blocks from `start` live at physical `block`.
    ///
    /// ## Errors
    ///
    /// - `ReadOnlyLayer` if the layer is frozen
    /// - `InvalidRequest` if the logical range runs past the end of the block space
    /// - `Corruption` if the range overlaps a mapping the layer already has
    pub fn map_insert(&self, start: u64, block: u64, count: u64) -> LayerFsResult<()> {
        self.check_writable()?;
        self.check_range(start, count)?;
        if block < self.gfs.config.get_reserved_blocks() {
            return Err(LayerFsError::corruption(format!(
                "mapping [{start}, +{count}) of layer {} into reserved block {block}",
                self.handle()
            )));
        }

        self.layer.extents().emap.insert(start, block, count)?;
        self.layer.counters().add_pages(count);
        Ok(())
    }

    /// Unmaps the blocks this layer owns in `[start, start + count)` and frees them.
    ///
    /// Blocks inherited from ancestors are untouched. Returns the number of logical blocks that
    /// were unmapped.
    pub fn punch(&self, start: u64, count: u64) -> LayerFsResult<u64> {
        self.check_writable()?;
        let end = self.check_range(start, count)?;

        let mut released = Vec::new();
        {
            let mut extents = self.layer.extents();
            let mut cursor = start;
            while cursor < end {
                let Some(extent) = extents.emap.first_ending_after(cursor) else {
                    break;
                };
                if extent.get_start() >= end {
                    break;
                }

                let from = cursor.max(extent.get_start());
                let physical = translate(&extent, from)?;
                let removed = extents.emap.remove(from, end.min(extent.end()) - from)?;
                released.push((physical, removed));
                cursor = from + removed;
            }
        }

        let mut state = self.gfs.lock_state();
        let mut unmapped = 0;
        for (physical, count) in released {
            state.free(physical, count)?;
            unmapped += count;
        }

        tracing::debug!(layer = %self.handle(), start, count, unmapped, "punched range");
        Ok(unmapped)
    }

    /// Points `count` logical blocks from `start` at freshly allocated blocks.
    ///
    /// Blocks the layer already owned in the range are freed first. Inherited blocks are left
    /// alone in the ancestors and simply shadowed. Returns the first physical block.
    pub fn write(&self, start: u64, count: u64) -> LayerFsResult<u64> {
        self.check_range(start, count)?;
        let block = self.allocate(count)?;
        if let Err(error) = self
            .punch(start, count)
            .and_then(|_| self.map_insert(start, block, count))
        {
            self.gfs.free(block, count)?;
            return Err(error);
        }

        self.layer.counters().add_writes(1);
        Ok(block)
    }

    /// Allocates `count` blocks from the global free list on behalf of this layer.
    pub fn allocate(&self, count: u64) -> LayerFsResult<u64> {
        self.check_writable()?;
        self.gfs.allocate(count)
    }

    /// Allocates `count` blocks of layer metadata.
    ///
    /// Blocks the layer freed earlier are reused first, then the layer's reserved run. When the
    /// run is exhausted a new one of at least `meta_chunk_blocks` is taken from the global free
    /// list.
    pub fn alloc_meta(&self, count: u64) -> LayerFsResult<u64> {
        self.check_writable()?;
        self.gfs.check_allocation(count)?;

        let mut extents = self.layer.extents();
        if let Some(start) = extents.alloc_meta(count)? {
            return Ok(start);
        }

        let chunk = self
            .gfs
            .config
            .get_meta_chunk_blocks()
            .max(count)
            .min(self.gfs.config.get_max_alloc_blocks());
        let run = self.gfs.lock_state().allocate(chunk)?;
        extents.reserve(run, chunk)?;
        tracing::debug!(layer = %self.handle(), run, chunk, "reserved metadata run");

        extents.alloc_meta(count)?.ok_or_else(|| {
            LayerFsError::corruption(format!(
                "fresh metadata run of {chunk} blocks cannot hold {count}"
            ))
        })
    }

    /// Gives `count` metadata blocks back to the layer.
    pub fn free_meta(&self, start: u64, count: u64) -> LayerFsResult<()> {
        self.check_writable()?;
        self.layer.extents().meta_free.insert(start, 0, count)
    }

    /// Queues a block for writeback.
    pub fn mark_dirty(&self, block: u64) -> LayerFsResult<()> {
        self.check_writable()?;
        self.layer.dirty().push(block);
        Ok(())
    }

    /// Counts a read.
    pub fn record_read(&self) {
        self.layer.counters().add_reads(1);
    }

    /// Counts a write.
    pub fn record_write(&self) {
        self.layer.counters().add_writes(1);
    }

    /// Counts a newly created inode.
    pub fn inode_created(&self) {
        self.layer.counters().add_inodes(1);
    }

    /// Counts an inode written back.
    pub fn inode_written(&self) {
        self.layer.counters().add_inodes_written(1);
    }

    /// Returns the end of `[start, start + count)`.
    fn check_range(&self, start: u64, count: u64) -> LayerFsResult<u64> {
        start.checked_add(count).ok_or_else(|| {
            LayerFsError::InvalidRequest(format!(
                "range [{start}, +{count}) of layer {} wraps the block space",
                self.handle()
            ))
        })
    }

    fn check_writable(&self) -> LayerFsResult<()> {
        if self.layer.is_read_only() {
            tracing::debug!(layer = %self.handle(), "write rejected on frozen layer");
            return Err(LayerFsError::ReadOnlyLayer(self.handle()));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

pub(crate) fn translate(extent: &Extent, block: u64) -> LayerFsResult<u64> {
    extent.translate(block).ok_or_else(|| {
        LayerFsError::corruption(format!("block {block} is outside extent {extent}"))
    })
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::LayerFsConfig, ErrorKind};

    fn gfs() -> GlobalFs {
        GlobalFs::new(
            LayerFsConfig::builder()
                .total_blocks(10_000)
                .meta_chunk_blocks(8)
                .build(),
        )
        .unwrap()
    }

    #[test]
    fn test_op_lookup_falls_through_to_ancestors() {
        let gfs = gfs();
        let base = LayerHandle::BASE;
        let block = gfs.write(base, 0, 4).unwrap();

        let child = gfs.create_layer(base, false).unwrap();
        let grandchild = gfs.create_layer(child, false).unwrap();
        assert_eq!(gfs.map_lookup(grandchild, 2).unwrap(), Some(block + 2));
        assert_eq!(gfs.map_lookup(grandchild, 4).unwrap(), None);

        // Writing in the child shadows the base for the child's whole subtree.
        let shadow = gfs.write(child, 2, 1).unwrap();
        assert_eq!(gfs.map_lookup(grandchild, 2).unwrap(), Some(shadow));
        assert_eq!(gfs.map_lookup(grandchild, 1).unwrap(), Some(block + 1));
        assert_eq!(gfs.map_lookup(base, 2).unwrap(), Some(block + 2));
    }

    #[test]
    fn test_op_frozen_layer_rejects_writes() {
        let gfs = gfs();
        let frozen = gfs.create_layer(LayerHandle::BASE, true).unwrap();
        let op = gfs.begin_layer_op(frozen).unwrap();

        assert!(matches!(
            op.map_insert(0, 100, 1),
            Err(LayerFsError::ReadOnlyLayer(handle)) if handle == frozen
        ));
        assert!(matches!(op.allocate(1), Err(LayerFsError::ReadOnlyLayer(_))));
        assert!(matches!(op.punch(0, 1), Err(LayerFsError::ReadOnlyLayer(_))));
        assert!(matches!(op.mark_dirty(5), Err(LayerFsError::ReadOnlyLayer(_))));
        assert_eq!(op.map_lookup(0).unwrap(), None);
        assert_eq!(op.layer().mapped_blocks(), 0);
    }

    #[test]
    fn test_op_punch_frees_only_owned_blocks() {
        let gfs = gfs();
        let free = gfs.free_blocks();
        let op = gfs.begin_layer_op(LayerHandle::BASE).unwrap();

        let block = op.write(10, 10).unwrap();
        assert_eq!(gfs.free_blocks(), free - 10);

        assert_eq!(op.punch(5, 8).unwrap(), 3);
        assert_eq!(op.punch(14, 2).unwrap(), 2);
        assert_eq!(gfs.free_blocks(), free - 5);
        assert_eq!(op.map_lookup(13).unwrap(), Some(block + 3));
        assert_eq!(op.map_lookup(14).unwrap(), None);
        assert_eq!(op.map_lookup(16).unwrap(), Some(block + 6));

        assert_eq!(op.punch(0, 100).unwrap(), 5);
        assert_eq!(gfs.free_blocks(), free);
        drop(op);
        gfs.validate().unwrap();
    }

    #[test]
    fn test_op_write_replaces_owned_blocks() {
        let gfs = gfs();
        let free = gfs.free_blocks();
        let op = gfs.begin_layer_op(LayerHandle::BASE).unwrap();

        op.write(0, 4).unwrap();
        let second = op.write(0, 4).unwrap();
        assert_eq!(op.map_lookup(0).unwrap(), Some(second));
        assert_eq!(gfs.free_blocks(), free - 4);
        assert_eq!(op.layer().stats().writes, 2);
    }

    #[test]
    fn test_op_map_insert_rejects_overlap() {
        let gfs = gfs();
        let op = gfs.begin_layer_op(LayerHandle::BASE).unwrap();
        op.map_insert(0, 500, 4).unwrap();
        assert!(matches!(
            op.map_insert(2, 900, 4),
            Err(LayerFsError::Corruption(_))
        ));
        assert!(matches!(
            op.map_insert(10, 0, 1),
            Err(LayerFsError::Corruption(_))
        ));
    }

    #[test]
    fn test_op_alloc_meta_uses_reserved_run() {
        let gfs = gfs();
        let free = gfs.free_blocks();
        let op = gfs.begin_layer_op(LayerHandle::BASE).unwrap();

        let first = op.alloc_meta(3).unwrap();
        let second = op.alloc_meta(3).unwrap();
        assert_eq!(second, first + 3);
        assert_eq!(gfs.free_blocks(), free - 8);

        op.free_meta(first, 3).unwrap();
        assert_eq!(op.alloc_meta(2).unwrap(), first);

        // Larger than the chunk: the run is sized to the request.
        let big = op.alloc_meta(20).unwrap();
        assert_eq!(big, first + 8);
        assert_eq!(gfs.free_blocks(), free - 28);
    }

    #[test]
    fn test_op_begin_op_unknown_layer() {
        let gfs = gfs();
        let stale = ino::encode(LayerHandle::new(3), 10);
        assert!(matches!(
            gfs.begin_op(stale),
            Err(LayerFsError::UnknownLayer(ino)) if ino == stale
        ));
    }

    #[test]
    fn test_op_counters() {
        let gfs = gfs();
        let op = gfs.begin_layer_op(LayerHandle::BASE).unwrap();
        op.record_read();
        op.record_read();
        op.record_write();
        op.inode_created();
        op.inode_written();
        op.mark_dirty(42).unwrap();

        let stats = op.layer().stats();
        assert_eq!((stats.reads, stats.writes), (2, 1));
        assert_eq!((stats.inodes, stats.inodes_written), (1, 1));
        assert_eq!(op.layer().drain_dirty(), vec![42]);
    }

    #[test]
    fn test_op_wrapping_range_is_an_invalid_request() {
        let gfs = gfs();
        let base = LayerHandle::BASE;
        let free = gfs.free_blocks();

        let error = gfs.write(base, u64::MAX, 1).unwrap_err();
        assert!(matches!(error, LayerFsError::InvalidRequest(_)));
        assert_eq!(error.kind(), ErrorKind::Other);
        assert_eq!(gfs.free_blocks(), free);

        let op = gfs.begin_layer_op(base).unwrap();
        assert!(matches!(
            op.map_insert(u64::MAX - 1, 100, 4),
            Err(LayerFsError::InvalidRequest(_))
        ));
        assert!(matches!(
            op.punch(5, u64::MAX),
            Err(LayerFsError::InvalidRequest(_))
        ));
        assert_eq!(op.map_lookup(u64::MAX - 1).unwrap(), None);
    }
}
