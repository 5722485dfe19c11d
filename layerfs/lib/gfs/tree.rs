use std::sync::Arc;

use crate::{
    extent::{Extent, ExtentList},
    ino, GlobalFs, Layer, LayerFsError, LayerFsResult, LayerHandle, LayerState, ROOT_INODE,
};

use super::{global::TreeLinks, op::translate};

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GlobalFs {
    /// Branches a new layer off `parent`.
    ///
    /// The new layer becomes the first entry of the parent's children, ahead of any earlier
    /// branch. It starts empty and sees everything through its parent until it writes.
    ///
    /// ## Errors
    ///
    /// - `UnknownLayer` if `parent` does not exist
    /// - `OutOfSpace` if no block is left for the layer's superblock
    pub fn create_layer(
        &self,
        parent: LayerHandle,
        read_only: bool,
    ) -> LayerFsResult<LayerHandle> {
        let parent_layer = self.layer(parent)?;
        let _gate = parent_layer.gate().write();

        let mut state = self.lock_state();
        if !state.holds(parent, &parent_layer) || parent_layer.state() == LayerState::Deleting {
            return Err(unknown(parent));
        }

        let layer = state.register_layer(Some(parent), read_only, &self.config)?;
        state.clones += 1;

        tracing::info!(
            layer = %layer.get_handle(),
            %parent,
            read_only,
            sblock = layer.get_sblock(),
            "created layer"
        );
        Ok(layer.get_handle())
    }

    /// Freezes a layer. Committing a frozen layer again does nothing.
    pub fn commit_layer(&self, handle: LayerHandle) -> LayerFsResult<()> {
        let layer = self.layer(handle)?;
        let _gate = layer.gate().write();

        if !self.lock_state().holds(handle, &layer) {
            return Err(unknown(handle));
        }

        match layer.state() {
            LayerState::Active => {
                layer.set_state(LayerState::Frozen);
                tracing::info!(layer = %handle, "committed layer");
                Ok(())
            }
            LayerState::Frozen => Ok(()),
            LayerState::Deleting => Err(unknown(handle)),
        }
    }

    /// Removes a layer from the tree and reclaims its handle.
    ///
    /// A leaf gives all the blocks it maps back to the free list. A layer with one child folds
    /// into it: every block the child does not override moves into the child's map, the rest is
    /// freed, and the child takes the layer's place under the layer's parent.
    ///
    /// ## Errors
    ///
    /// - `BaseLayer` for handle `0`
    /// - `HasMultipleChildren` if more than one layer was branched off this one
    /// - `Busy` if the layer still has dirty pages or cached inodes or pages
    /// - `UnknownLayer` if the layer does not exist
    pub fn delete_layer(&self, handle: LayerHandle) -> LayerFsResult<()> {
        if handle.is_base() {
            return Err(LayerFsError::BaseLayer);
        }

        let folded = loop {
            let (layer, child) = {
                let state = self.lock_state();
                let layer = state.layer(handle)?;
                let child = match sole_child(&state.children(handle)?, handle)? {
                    Some(child) => Some((child, state.layer(child)?)),
                    None => None,
                };
                (layer, child)
            };

            self.check_busy(&layer)?;

            let _child_gate = child.as_ref().map(|(_, child)| child.gate().write());
            let _gate = layer.gate().write();

            // Recheck once nothing else can run on either layer.
            self.check_busy(&layer)?;
            let mut child_extents = child.as_ref().map(|(_, child)| child.extents());
            let mut extents = layer.extents();
            let mut state = self.lock_state();

            if !state.holds(handle, &layer) || layer.state() == LayerState::Deleting {
                return Err(unknown(handle));
            }
            let current = sole_child(&state.children(handle)?, handle)?;
            let unchanged = match (&current, &child) {
                (None, None) => true,
                (Some(current), Some((expected, child))) => {
                    current == expected && state.holds(*current, child)
                }
                _ => false,
            };
            if !unchanged {
                tracing::debug!(layer = %handle, "children changed while locking, retrying");
                continue;
            }

            let own: Vec<Extent> = extents.emap.iter().copied().collect();
            let folded = own.iter().map(Extent::get_count).sum::<u64>();
            let mut released = Vec::new();
            let merged = match child_extents.as_ref() {
                None => {
                    released.extend(
                        own.iter()
                            .map(|extent| (extent.get_block(), extent.get_count())),
                    );
                    None
                }
                Some(child_extents) => {
                    let mut emap = child_extents.emap.clone();
                    for extent in &own {
                        fold(&mut emap, extent, &mut released)?;
                    }
                    Some(emap)
                }
            };
            released.extend(extents.meta_space());
            released.push((layer.get_sblock(), 1));

            let free = state.with_freed(&released)?;
            unlink(&mut state, handle, current)?;

            layer.set_state(LayerState::Deleting);
            if let (Some(child_extents), Some(emap)) = (child_extents.as_mut(), merged) {
                child_extents.emap = emap;
            }
            extents.clear();
            state.free = free;
            state.slots[handle.index()] = None;
            state.vacant.insert(handle.get());
            tracing::debug!(layer = %handle, ranges = released.len(), "released blocks");

            break folded;
        };

        self.hooks.layer_removed(handle);
        tracing::info!(layer = %handle, folded, "deleted layer");
        Ok(())
    }

    /// Children of `handle`, most recently created first.
    pub fn children(&self, handle: LayerHandle) -> LayerFsResult<Vec<LayerHandle>> {
        let state = self.lock_state();
        state.layer(handle)?;
        state.children(handle)
    }

    /// The layer `handle` was branched from, `None` for the base layer.
    pub fn parent(&self, handle: LayerHandle) -> LayerFsResult<Option<LayerHandle>> {
        self.links(handle).map(|links| links.parent)
    }

    /// The position of `handle` in the tree.
    pub fn links(&self, handle: LayerHandle) -> LayerFsResult<TreeLinks> {
        let state = self.lock_state();
        state.layer(handle)?;
        state.links(handle)
    }

    /// Number of `parent` hops from `handle` to the base layer.
    pub fn depth(&self, handle: LayerHandle) -> LayerFsResult<usize> {
        let state = self.lock_state();
        state.layer(handle)?;

        let mut depth = 0;
        let mut cursor = handle;
        while let Some(parent) = state.links(cursor)?.parent {
            depth += 1;
            if depth >= state.slots.len() {
                return Err(LayerFsError::corruption(format!(
                    "parent chain of layer {handle} loops"
                )));
            }
            cursor = parent;
        }

        if !cursor.is_base() {
            return Err(LayerFsError::corruption(format!(
                "parent chain of layer {handle} ends at layer {cursor}"
            )));
        }
        Ok(depth)
    }

    fn check_busy(&self, layer: &Arc<Layer>) -> LayerFsResult<()> {
        let handle = layer.get_handle();
        let dirty = layer.dirty_count();
        let inodes = self.hooks.has_cached_inodes(handle);
        let pages = self.hooks.has_cached_pages(handle);

        if dirty > 0 || inodes || pages {
            tracing::warn!(layer = %handle, dirty, inodes, pages, "layer is busy");
            return Err(LayerFsError::Busy(handle));
        }
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn unknown(handle: LayerHandle) -> LayerFsError {
    LayerFsError::UnknownLayer(ino::encode(handle, ROOT_INODE))
}

fn sole_child(
    children: &[LayerHandle],
    handle: LayerHandle,
) -> LayerFsResult<Option<LayerHandle>> {
    match children {
        [] => Ok(None),
        [child] => Ok(Some(*child)),
        _ => {
            tracing::warn!(layer = %handle, children = children.len(), "delete rejected");
            Err(LayerFsError::HasMultipleChildren(handle))
        }
    }
}

/// Moves the parts of `extent` the child does not map into the child's map.
///
/// Physical ranges the child already overrides are pushed to `released`.
fn fold(
    child: &mut ExtentList,
    extent: &Extent,
    released: &mut Vec<(u64, u64)>,
) -> LayerFsResult<()> {
    let end = extent.end();
    let mut cursor = extent.get_start();

    while cursor < end {
        let physical = translate(extent, cursor)?;
        match child.first_ending_after(cursor) {
            Some(over) if over.get_start() <= cursor => {
                let stop = end.min(over.end());
                released.push((physical, stop - cursor));
                cursor = stop;
            }
            next => {
                let stop = next.map_or(end, |next| end.min(next.get_start()));
                child.insert(cursor, physical, stop - cursor)?;
                cursor = stop;
            }
        }
    }

    Ok(())
}

/// Takes `handle` out of its parent's children, putting `child` in its place.
fn unlink(
    state: &mut super::global::GlobalState,
    handle: LayerHandle,
    child: Option<LayerHandle>,
) -> LayerFsResult<()> {
    let links = state.links(handle)?;
    let parent = links.parent.ok_or_else(|| {
        LayerFsError::corruption(format!("layer {handle} has no parent"))
    })?;
    if let Some(child) = child {
        state.links(child)?;
    }

    let previous = if state.links(parent)?.snap == Some(handle) {
        None
    } else {
        let siblings = state.children(parent)?;
        let previous = siblings
            .iter()
            .zip(siblings.iter().skip(1))
            .find(|(_, next)| **next == handle)
            .map(|(previous, _)| *previous)
            .ok_or_else(|| {
                LayerFsError::corruption(format!(
                    "layer {handle} is missing from the children of layer {parent}"
                ))
            })?;
        Some(previous)
    };

    // Every slot touched below was read above.
    if let Some(child) = child {
        let child_links = &mut state.slot_mut(child)?.links;
        child_links.parent = Some(parent);
        child_links.next = links.next;
    }
    let replacement = child.or(links.next);
    match previous {
        None => state.slot_mut(parent)?.links.snap = replacement,
        Some(previous) => state.slot_mut(previous)?.links.next = replacement,
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
