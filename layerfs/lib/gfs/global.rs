use std::{collections::BTreeSet, sync::Arc};

use getset::{CopyGetters, Getters};
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};

use crate::{
    config::LayerFsConfig,
    extent::{ExtentList, ExtentOwner},
    ino, Layer, LayerFsError, LayerFsResult, LayerHandle, LayerHooks, LayerStats, NoHooks,
    ROOT_INODE, SNAP_ROOT_INODE, TMP_ROOT_INODE,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The process-wide registry of layers and owner of the device's free space.
///
/// Slot `0` always holds the base layer. Every other live slot holds a layer reachable from the
/// base layer through `snap`/`next` links, so the slot array is the flattened snapshot tree.
///
/// ## Locking
///
/// The global lock guards the slot array, the tree links and the free list. It is taken last:
/// after any layer gate and after any layer's extent lock, and it is never held across I/O.
#[derive(Getters, CopyGetters)]
pub struct GlobalFs {
    /// Device and allocator settings
    #[getset(get = "pub with_prefix")]
    pub(crate) config: LayerFsConfig,

    /// Base-layer directory new layer roots are attached under
    #[getset(get_copy = "pub with_prefix")]
    pub(crate) snap_root: u64,

    /// Base-layer directory scratch layers live in
    #[getset(get_copy = "pub with_prefix")]
    pub(crate) tmp_root: u64,

    /// Cache callbacks of the outer file system
    pub(crate) hooks: Arc<dyn LayerHooks>,

    /// State behind the global lock
    pub(crate) state: Mutex<GlobalState>,
}

/// Everything the global lock protects.
pub(crate) struct GlobalState {
    /// Layers indexed by handle
    pub(crate) slots: Vec<Option<Slot>>,

    /// Vacated handles below `slots.len()`
    pub(crate) vacant: BTreeSet<u32>,

    /// Free blocks of the whole device
    pub(crate) free: ExtentList,

    /// Leading blocks that never enter the free list
    pub(crate) reserved_blocks: u64,

    /// Layers created since format, base layer excluded
    pub(crate) clones: u64,
}

/// One occupied registry slot.
pub(crate) struct Slot {
    pub(crate) layer: Arc<Layer>,
    pub(crate) links: TreeLinks,
}

/// The position of a layer in the snapshot tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeLinks {
    /// Layer this one was branched from; `None` only for the base layer
    pub parent: Option<LayerHandle>,

    /// First child, head of the children's sibling chain
    pub snap: Option<LayerHandle>,

    /// Next sibling in the parent's chain of children
    pub next: Option<LayerHandle>,
}

/// Aggregate counters of the whole file system.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalStats {
    /// Live layers, base layer included
    pub layers: u64,

    /// Layers created since format
    pub clones: u64,

    /// Blocks in the free list
    pub free_blocks: u64,

    /// Size of the device in blocks
    pub total_blocks: u64,

    /// Sum of every live layer's counters
    pub totals: LayerStats,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GlobalFs {
    /// Formats a fresh file system with only the base layer and no cache hooks.
    pub fn new(config: LayerFsConfig) -> LayerFsResult<Self> {
        Self::format(config, Arc::new(NoHooks))
    }

    /// Formats a fresh file system.
    ///
    /// Every block past the reserved area starts out free and the base layer is registered at
    /// handle `0`.
    pub fn format(config: LayerFsConfig, hooks: Arc<dyn LayerHooks>) -> LayerFsResult<Self> {
        config.validate()?;

        let mut free = ExtentList::space(ExtentOwner::Global, config.get_total_blocks());
        free.insert(config.get_reserved_blocks(), 0, config.usable_blocks())?;

        let mut state = GlobalState {
            slots: Vec::new(),
            vacant: BTreeSet::new(),
            free,
            reserved_blocks: config.get_reserved_blocks(),
            clones: 0,
        };
        state.register_layer(None, false, &config)?;

        tracing::info!(
            total_blocks = config.get_total_blocks(),
            free_blocks = config.usable_blocks(),
            "formatted layered file system"
        );

        Ok(Self::from_state(config, state, hooks))
    }

    pub(crate) fn from_state(
        config: LayerFsConfig,
        state: GlobalState,
        hooks: Arc<dyn LayerHooks>,
    ) -> Self {
        Self {
            config,
            snap_root: ino::encode(LayerHandle::BASE, SNAP_ROOT_INODE),
            tmp_root: ino::encode(LayerHandle::BASE, TMP_ROOT_INODE),
            hooks,
            state: Mutex::new(state),
        }
    }

    /// Returns the layer owning `ino`.
    ///
    /// ## Errors
    ///
    /// Returns `UnknownLayer` if the handle encoded in `ino` has no live layer.
    pub fn resolve_layer(&self, ino: u64) -> LayerFsResult<Arc<Layer>> {
        let state = self.state.lock();
        state
            .slot(ino::handle_of(ino))
            .map(|slot| Arc::clone(&slot.layer))
            .ok_or(LayerFsError::UnknownLayer(ino))
    }

    /// Returns the layer with the given handle.
    pub fn layer(&self, handle: LayerHandle) -> LayerFsResult<Arc<Layer>> {
        self.resolve_layer(ino::encode(handle, ROOT_INODE))
    }

    /// The base layer.
    pub fn base(&self) -> LayerFsResult<Arc<Layer>> {
        self.layer(LayerHandle::BASE)
    }

    /// Returns `true` if `ino` belongs to the base layer.
    pub fn is_global_root(&self, ino: u64) -> bool {
        ino::is_global(ino)
    }

    /// Root inode of the layer `handle`.
    pub fn layer_root(&self, handle: LayerHandle) -> LayerFsResult<u64> {
        self.layer(handle).map(|layer| layer.get_root())
    }

    /// Returns the layer whose root inode is `ino`, if `ino` is a layer root.
    pub fn layer_of_root(&self, ino: u64) -> Option<LayerHandle> {
        let layer = self.resolve_layer(ino).ok()?;
        (layer.get_root() == ino).then(|| layer.get_handle())
    }

    /// Handles of every live layer in slot order.
    pub fn handles(&self) -> Vec<LayerHandle> {
        self.state.lock().handles().collect()
    }

    /// Takes `count` contiguous blocks from the free list, first fit.
    ///
    /// ## Errors
    ///
    /// - `AllocationTooLarge` if `count` exceeds the configured limit
    /// - `OutOfSpace` if no single free extent holds `count` blocks
    pub fn allocate(&self, count: u64) -> LayerFsResult<u64> {
        self.check_allocation(count)?;
        self.state.lock().allocate(count)
    }

    /// Returns `count` blocks starting at `start` to the free list.
    pub fn free(&self, start: u64, count: u64) -> LayerFsResult<()> {
        self.state.lock().free(start, count)
    }

    /// Number of blocks in the free list.
    pub fn free_blocks(&self) -> u64 {
        self.state.lock().free.total()
    }

    /// Aggregate counters.
    pub fn stats(&self) -> GlobalStats {
        let (layers, clones, free_blocks) = {
            let state = self.state.lock();
            let layers: Vec<_> = state
                .slots
                .iter()
                .flatten()
                .map(|slot| Arc::clone(&slot.layer))
                .collect();
            (layers, state.clones, state.free.total())
        };

        GlobalStats {
            layers: layers.len() as u64,
            clones,
            free_blocks,
            total_blocks: self.config.get_total_blocks(),
            totals: layers.iter().map(|layer| layer.stats()).sum(),
        }
    }

    /// Checks every extent list, the shape of the tree, and that no block is used twice.
    ///
    /// Meant for a quiescent file system. Blocks moving between the free list and a layer while
    /// this runs can be reported as overlapping.
    pub fn validate(&self) -> LayerFsResult<()> {
        let (layers, mut ranges) = {
            let state = self.state.lock();
            state.validate_tree()?;
            state.free.validate()?;

            let layers: Vec<_> = state
                .slots
                .iter()
                .flatten()
                .map(|slot| Arc::clone(&slot.layer))
                .collect();
            let ranges: Vec<_> = state
                .free
                .iter()
                .map(|extent| (extent.get_start(), extent.get_count(), ExtentOwner::Global))
                .collect();
            (layers, ranges)
        };

        for layer in layers {
            let owner = ExtentOwner::Layer(layer.get_handle());
            let extents = layer.extents();
            extents.emap.validate()?;
            extents.meta_free.validate()?;

            ranges.extend(
                extents
                    .emap
                    .iter()
                    .map(|extent| (extent.get_block(), extent.get_count(), owner)),
            );
            ranges.extend(
                extents
                    .meta_free
                    .iter()
                    .map(|extent| (extent.get_start(), extent.get_count(), owner)),
            );
            if extents.meta_count > 0 {
                ranges.push((extents.meta_next, extents.meta_count, owner));
            }
            if !layer.get_handle().is_base() {
                ranges.push((layer.get_sblock(), 1, owner));
            }
        }

        ranges.sort_unstable_by_key(|(start, _, _)| *start);
        for (start, count, owner) in &ranges {
            let end = start.checked_add(*count);
            if *start < self.config.get_reserved_blocks()
                || end.map_or(true, |end| end > self.config.get_total_blocks())
            {
                return Err(LayerFsError::corruption(format!(
                    "blocks [{start}, +{count}) of {owner} are outside the usable device"
                )));
            }
        }
        for pair in ranges.windows(2) {
            let (start, count, owner) = pair[0];
            let (next, next_count, next_owner) = pair[1];
            if start.checked_add(count).map_or(true, |end| end > next) {
                return Err(LayerFsError::corruption(format!(
                    "blocks [{start}, +{count}) of {owner} overlap [{next}, +{next_count}) of {next_owner}"
                )));
            }
        }

        Ok(())
    }

    pub(crate) fn check_allocation(&self, count: u64) -> LayerFsResult<()> {
        if count == 0 {
            return Err(LayerFsError::InvalidRequest(
                "allocation of zero blocks".into(),
            ));
        }

        let limit = self.config.get_max_alloc_blocks();
        if count > limit {
            return Err(LayerFsError::AllocationTooLarge {
                requested: count,
                limit,
            });
        }

        Ok(())
    }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, GlobalState> {
        self.state.lock()
    }
}

impl GlobalState {
    pub(crate) fn slot(&self, handle: LayerHandle) -> Option<&Slot> {
        self.slots.get(handle.index()).and_then(Option::as_ref)
    }

    pub(crate) fn slot_mut(&mut self, handle: LayerHandle) -> LayerFsResult<&mut Slot> {
        self.slots
            .get_mut(handle.index())
            .and_then(Option::as_mut)
            .ok_or_else(|| LayerFsError::corruption(format!("tree link to empty slot {handle}")))
    }

    pub(crate) fn links(&self, handle: LayerHandle) -> LayerFsResult<TreeLinks> {
        self.slot(handle)
            .map(|slot| slot.links)
            .ok_or_else(|| LayerFsError::corruption(format!("tree link to empty slot {handle}")))
    }

    pub(crate) fn layer(&self, handle: LayerHandle) -> LayerFsResult<Arc<Layer>> {
        self.slot(handle)
            .map(|slot| Arc::clone(&slot.layer))
            .ok_or_else(|| LayerFsError::UnknownLayer(ino::encode(handle, ROOT_INODE)))
    }

    /// Returns `true` if `handle` still refers to this very layer object.
    pub(crate) fn holds(&self, handle: LayerHandle, layer: &Arc<Layer>) -> bool {
        self.slot(handle)
            .is_some_and(|slot| Arc::ptr_eq(&slot.layer, layer))
    }

    pub(crate) fn handles(&self) -> impl Iterator<Item = LayerHandle> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .map(|(index, _)| LayerHandle::new(index as u32))
    }

    /// Children of `handle`, most recent first.
    pub(crate) fn children(&self, handle: LayerHandle) -> LayerFsResult<Vec<LayerHandle>> {
        let mut children = Vec::new();
        let mut cursor = self.links(handle)?.snap;
        while let Some(child) = cursor {
            if children.len() >= self.slots.len() {
                return Err(LayerFsError::corruption(format!(
                    "sibling chain under layer {handle} loops"
                )));
            }
            children.push(child);
            cursor = self.links(child)?.next;
        }
        Ok(children)
    }

    /// Puts a new layer into the lowest free slot and makes it the first child of `parent`.
    ///
    /// Non-base layers get a superblock block from the free list.
    pub(crate) fn register_layer(
        &mut self,
        parent: Option<LayerHandle>,
        read_only: bool,
        config: &LayerFsConfig,
    ) -> LayerFsResult<Arc<Layer>> {
        let index = match self.vacant.first() {
            Some(&index) => index,
            None => u32::try_from(self.slots.len()).map_err(|_| {
                LayerFsError::InvalidRequest("layer handles exhausted".into())
            })?,
        };
        if index >= config.get_max_layers() {
            return Err(LayerFsError::InvalidRequest(format!(
                "layer table is full ({} layers)",
                config.get_max_layers()
            )));
        }

        let handle = LayerHandle::new(index);
        if parent.is_none() != handle.is_base() {
            return Err(LayerFsError::corruption(format!(
                "layer {handle} registered with parent {parent:?}"
            )));
        }
        if let Some(parent) = parent {
            self.slot_mut(parent)?;
        }

        let sblock = match parent {
            None => 0,
            Some(_) => self.allocate(1)?,
        };
        self.vacant.remove(&index);

        let layer = Arc::new(Layer::new(
            handle,
            sblock,
            read_only,
            config.get_total_blocks(),
            config.get_icache_buckets(),
        ));

        let mut links = TreeLinks {
            parent,
            ..TreeLinks::default()
        };
        if let Some(parent) = parent {
            let parent_slot = self.slot_mut(parent)?;
            links.next = parent_slot.links.snap.replace(handle);
        }

        if self.slots.len() <= index as usize {
            self.slots.resize_with(index as usize + 1, || None);
        }
        self.slots[index as usize] = Some(Slot {
            layer: Arc::clone(&layer),
            links,
        });

        Ok(layer)
    }

    /// Checks that the slot array is exactly the tree hanging off the base layer.
    pub(crate) fn validate_tree(&self) -> LayerFsResult<()> {
        let base = self
            .slot(LayerHandle::BASE)
            .ok_or_else(|| LayerFsError::corruption("no base layer"))?;
        if base.links.parent.is_some() || base.links.next.is_some() {
            return Err(LayerFsError::corruption(format!(
                "base layer has tree links {:?}",
                base.links
            )));
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let occupied = slot.is_some();
            let vacant = self.vacant.contains(&(index as u32));
            if occupied == vacant {
                return Err(LayerFsError::corruption(format!(
                    "slot {index} is occupied: {occupied}, listed vacant: {vacant}"
                )));
            }
            if let Some(slot) = slot {
                if slot.layer.get_handle().index() != index {
                    return Err(LayerFsError::corruption(format!(
                        "layer {} sits in slot {index}",
                        slot.layer.get_handle()
                    )));
                }
            }
        }

        let mut seen = vec![false; self.slots.len()];
        seen[0] = true;
        let mut reached = 1;
        let mut pending = vec![LayerHandle::BASE];
        while let Some(handle) = pending.pop() {
            for child in self.children(handle)? {
                if self.links(child)?.parent != Some(handle) {
                    return Err(LayerFsError::corruption(format!(
                        "layer {child} is a child of layer {handle} but names another parent"
                    )));
                }
                if std::mem::replace(&mut seen[child.index()], true) {
                    return Err(LayerFsError::corruption(format!(
                        "layer {child} is reachable twice"
                    )));
                }
                reached += 1;
                pending.push(child);
            }
        }

        let live = self.slots.iter().flatten().count();
        if reached != live {
            return Err(LayerFsError::corruption(format!(
                "{} of {live} layers are unreachable from the base layer",
                live - reached
            )));
        }

        Ok(())
    }

    pub(crate) fn allocate(&mut self, count: u64) -> LayerFsResult<u64> {
        let Some(start) = self.free.first_fit(count) else {
            tracing::warn!(
                requested = count,
                free_blocks = self.free.total(),
                "allocation failed"
            );
            return Err(LayerFsError::OutOfSpace { requested: count });
        };

        let taken = self.free.remove(start, count)?;
        if taken != count {
            return Err(LayerFsError::corruption(format!(
                "free extent at {start} yielded {taken} of {count} blocks"
            )));
        }

        tracing::debug!(start, count, "allocated blocks");
        Ok(start)
    }

    pub(crate) fn free(&mut self, start: u64, count: u64) -> LayerFsResult<()> {
        if start < self.reserved_blocks {
            return Err(LayerFsError::corruption(format!(
                "freeing reserved block range [{start}, +{count})"
            )));
        }

        self.free.insert(start, 0, count)?;
        tracing::debug!(start, count, "freed blocks");
        Ok(())
    }

    /// Returns a copy of the free list with every range in `ranges` given back.
    ///
    /// The live free list is left untouched, so a failure part way leaves nothing freed.
    pub(crate) fn with_freed(&self, ranges: &[(u64, u64)]) -> LayerFsResult<ExtentList> {
        let mut free = self.free.clone();
        for &(start, count) in ranges {
            if start < self.reserved_blocks {
                return Err(LayerFsError::corruption(format!(
                    "freeing reserved block range [{start}, +{count})"
                )));
            }
            free.insert(start, 0, count)?;
        }
        Ok(free)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for GlobalFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GlobalFs")
            .field("config", &self.config)
            .field("snap_root", &self.snap_root)
            .field("tmp_root", &self.tmp_root)
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
