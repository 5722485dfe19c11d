use std::{collections::BTreeSet, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    config::LayerFsConfig,
    extent::{ExtentKind, ExtentList, ExtentOwner, ExtentRecord},
    layer::{LayerExtents, LayerParts},
    GlobalFs, Layer, LayerFsError, LayerFsResult, LayerHandle, LayerHooks, LayerState,
    LayerStats, NoHooks,
};

use super::global::{GlobalState, Slot, TreeLinks};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything needed to rebuild a registry: the superblock fields the core owns, the free list
/// and every layer's lists and links.
///
/// Extent lists are stored as `(start, block, count, kind)` records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FsImage {
    /// Device-wide fields
    pub superblock: SuperBlock,

    /// The global free list
    pub free: Vec<ExtentRecord>,

    /// Every live layer, base layer first
    pub layers: Vec<LayerImage>,
}

/// The superblock fields the core reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuperBlock {
    /// Size of the device in blocks
    pub tblocks: u64,

    /// Leading blocks kept out of the free list
    pub reserved_blocks: u64,

    /// Layers created since format
    pub clones: u64,
}

/// The persisted form of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerImage {
    /// Slot of the layer
    pub handle: LayerHandle,

    /// Position in the tree
    pub links: TreeLinks,

    /// Lifecycle state, never `deleting`
    pub state: LayerState,

    /// Superblock location
    pub sblock: u64,

    /// Creation time
    pub ctime: DateTime<Utc>,

    /// Next block of the reserved metadata run
    pub meta_next: u64,

    /// Blocks left in the reserved metadata run
    pub meta_count: u64,

    /// Block map
    pub emap: Vec<ExtentRecord>,

    /// Freed metadata blocks
    pub meta_free: Vec<ExtentRecord>,

    /// Counters
    pub stats: LayerStats,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl GlobalFs {
    /// Captures the whole registry.
    ///
    /// Each layer's lists are read under that layer's lock, so the image is only consistent when
    /// no operation is running.
    pub fn image(&self) -> FsImage {
        let (slots, superblock, free) = {
            let state = self.lock_state();
            let slots: Vec<_> = state
                .slots
                .iter()
                .flatten()
                .map(|slot| (Arc::clone(&slot.layer), slot.links))
                .collect();
            let superblock = SuperBlock {
                tblocks: self.config.get_total_blocks(),
                reserved_blocks: state.reserved_blocks,
                clones: state.clones,
            };
            (slots, superblock, state.free.records())
        };

        let layers = slots
            .into_iter()
            .map(|(layer, links)| {
                let extents = layer.extents();
                LayerImage {
                    handle: layer.get_handle(),
                    links,
                    state: layer.state(),
                    sblock: layer.get_sblock(),
                    ctime: layer.get_ctime(),
                    meta_next: extents.meta_next,
                    meta_count: extents.meta_count,
                    emap: extents.emap.records(),
                    meta_free: extents.meta_free.records(),
                    stats: layer.stats(),
                }
            })
            .collect();

        FsImage {
            superblock,
            free,
            layers,
        }
    }

    /// Rebuilds a registry from an image and validates it.
    ///
    /// ## Errors
    ///
    /// - `InvalidImage` if the image does not fit the configuration or describes an impossible
    ///   registry
    /// - `Corruption` if a rebuilt list or the tree breaks an invariant
    pub fn restore(
        config: LayerFsConfig,
        image: FsImage,
        hooks: Arc<dyn LayerHooks>,
    ) -> LayerFsResult<Self> {
        config.validate()?;

        let total = config.get_total_blocks();
        if image.superblock.tblocks != total
            || image.superblock.reserved_blocks != config.get_reserved_blocks()
        {
            return Err(LayerFsError::InvalidImage(format!(
                "image of {} blocks ({} reserved) does not fit a device of {total} ({} reserved)",
                image.superblock.tblocks,
                image.superblock.reserved_blocks,
                config.get_reserved_blocks()
            )));
        }

        let free = ExtentList::from_records(
            ExtentKind::Space,
            ExtentOwner::Global,
            total,
            image.free,
        )?;

        let mut slots: Vec<Option<Slot>> = Vec::new();
        for layer in image.layers {
            let handle = layer.handle;
            if handle.get() >= config.get_max_layers() {
                return Err(LayerFsError::InvalidImage(format!(
                    "layer {handle} is outside a table of {} layers",
                    config.get_max_layers()
                )));
            }
            if layer.state == LayerState::Deleting {
                return Err(LayerFsError::InvalidImage(format!(
                    "layer {handle} was saved mid-deletion"
                )));
            }

            let owner = ExtentOwner::Layer(handle);
            let extents = LayerExtents {
                emap: ExtentList::from_records(ExtentKind::Emap, owner, total, layer.emap)?,
                meta_free: ExtentList::from_records(
                    ExtentKind::Space,
                    owner,
                    total,
                    layer.meta_free,
                )?,
                meta_next: layer.meta_next,
                meta_count: layer.meta_count,
            };

            let rebuilt = Layer::from_parts(LayerParts {
                handle,
                sblock: layer.sblock,
                state: layer.state,
                ctime: layer.ctime,
                extents,
                stats: layer.stats,
                icache_buckets: config.get_icache_buckets(),
            });

            if slots.len() <= handle.index() {
                slots.resize_with(handle.index() + 1, || None);
            }
            if slots[handle.index()].is_some() {
                return Err(LayerFsError::InvalidImage(format!(
                    "layer {handle} appears twice"
                )));
            }
            slots[handle.index()] = Some(Slot {
                layer: Arc::new(rebuilt),
                links: layer.links,
            });
        }

        let vacant: BTreeSet<u32> = slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_none())
            .map(|(index, _)| index as u32)
            .collect();

        let state = GlobalState {
            slots,
            vacant,
            free,
            reserved_blocks: image.superblock.reserved_blocks,
            clones: image.superblock.clones,
        };
        let layers = state.slots.iter().flatten().count();

        let gfs = Self::from_state(config, state, hooks);
        gfs.validate()?;

        tracing::info!(layers, free_blocks = gfs.free_blocks(), "restored image");
        Ok(gfs)
    }

    /// Reads a JSON image from `path` and restores it without cache hooks.
    pub fn load(config: LayerFsConfig, path: impl AsRef<Path>) -> LayerFsResult<Self> {
        let image = FsImage::load(path)?;
        Self::restore(config, image, Arc::new(NoHooks))
    }
}

impl FsImage {
    /// Serializes the image as pretty-printed JSON.
    pub fn to_json(&self) -> LayerFsResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parses a JSON image.
    pub fn from_json(source: &str) -> LayerFsResult<Self> {
        Ok(serde_json::from_str(source)?)
    }

    /// Reads a JSON image from `path`.
    pub fn load(path: impl AsRef<Path>) -> LayerFsResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loading image");
        Self::from_json(&source)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LayerFsConfig {
        LayerFsConfig::builder().total_blocks(5000).build()
    }

    fn populated() -> (GlobalFs, LayerHandle, LayerHandle) {
        let gfs = GlobalFs::new(config()).unwrap();
        let base = LayerHandle::BASE;
        gfs.write(base, 0, 32).unwrap();

        let frozen = gfs.create_layer(base, false).unwrap();
        gfs.write(frozen, 4, 4).unwrap();
        gfs.commit_layer(frozen).unwrap();

        let active = gfs.create_layer(frozen, false).unwrap();
        {
            let op = gfs.begin_layer_op(active).unwrap();
            op.write(6, 1).unwrap();
            let meta = op.alloc_meta(3).unwrap();
            op.free_meta(meta, 1).unwrap();
            op.record_read();
        }

        let scratch = gfs.create_layer(base, false).unwrap();
        gfs.delete_layer(scratch).unwrap();

        (gfs, frozen, active)
    }

    #[test]
    fn test_image_restore_rebuilds_identical_registry() {
        let (gfs, frozen, active) = populated();
        let image = gfs.image();

        let restored = GlobalFs::restore(config(), image.clone(), Arc::new(NoHooks)).unwrap();
        assert_eq!(restored.image(), image);
        assert_eq!(restored.handles(), gfs.handles());
        assert_eq!(restored.free_blocks(), gfs.free_blocks());
        assert!(restored.layer(frozen).unwrap().is_read_only());
        assert_eq!(restored.children(frozen).unwrap(), vec![active]);

        for block in 0..40 {
            assert_eq!(
                restored.map_lookup(active, block).unwrap(),
                gfs.map_lookup(active, block).unwrap()
            );
        }

        // The vacated slot is reused first.
        let created = restored.create_layer(LayerHandle::BASE, false).unwrap();
        assert_eq!(created.get(), 3);
    }

    #[test]
    fn test_image_json_round_trip() {
        let (gfs, _, _) = populated();
        let image = gfs.image();
        let json = image.to_json().unwrap();
        assert_eq!(FsImage::from_json(&json).unwrap(), image);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image.json");
        std::fs::write(&path, &json).unwrap();
        let loaded = GlobalFs::load(config(), &path).unwrap();
        assert_eq!(loaded.image(), image);
    }

    #[test]
    fn test_image_restore_rejects_mismatched_device() {
        let (gfs, _, _) = populated();
        let image = gfs.image();
        let bigger = LayerFsConfig::builder().total_blocks(6000).build();

        assert!(matches!(
            GlobalFs::restore(bigger, image, Arc::new(NoHooks)),
            Err(LayerFsError::InvalidImage(_))
        ));
    }

    #[test]
    fn test_image_restore_rejects_double_use_of_a_block() {
        let (gfs, _, active) = populated();
        let mut image = gfs.image();

        let free = image.free[0];
        let layer = image
            .layers
            .iter_mut()
            .find(|layer| layer.handle == active)
            .unwrap();
        layer.emap.push(ExtentRecord {
            start: 1000,
            block: free.start,
            count: 1,
            kind: ExtentKind::Emap,
        });

        assert!(matches!(
            GlobalFs::restore(config(), image, Arc::new(NoHooks)),
            Err(LayerFsError::Corruption(_))
        ));
    }

    #[test]
    fn test_image_restore_rejects_unreachable_layer() {
        let (gfs, frozen, _) = populated();
        let mut image = gfs.image();

        for layer in &mut image.layers {
            if layer.handle == frozen {
                layer.links.snap = None;
            }
        }

        let error = GlobalFs::restore(config(), image, Arc::new(NoHooks)).unwrap_err();
        assert!(matches!(error, LayerFsError::Corruption(_)));
        assert!(error.to_string().contains("unreachable"), "{error}");
    }

    #[test]
    fn test_image_restore_rejects_blocks_past_u64_max() {
        let (gfs, _, active) = populated();

        let mut image = gfs.image();
        for layer in &mut image.layers {
            if layer.handle == active {
                layer.sblock = u64::MAX;
            }
        }
        assert!(matches!(
            GlobalFs::restore(config(), image, Arc::new(NoHooks)),
            Err(LayerFsError::Corruption(_))
        ));

        let mut image = gfs.image();
        for layer in &mut image.layers {
            if layer.handle == active {
                layer.meta_next = u64::MAX - 1;
                layer.meta_count = 4;
            }
        }
        assert!(matches!(
            GlobalFs::restore(config(), image, Arc::new(NoHooks)),
            Err(LayerFsError::Corruption(_))
        ));
    }

    #[test]
    fn test_image_restore_rejects_handle_outside_layer_table() {
        let (gfs, _, active) = populated();
        let mut image = gfs.image();

        let mut stray = image
            .layers
            .iter()
            .find(|layer| layer.handle == active)
            .unwrap()
            .clone();
        stray.handle = LayerHandle::new(u32::MAX);
        stray.emap.clear();
        stray.meta_free.clear();
        stray.meta_count = 0;
        image.layers.push(stray);

        assert!(matches!(
            GlobalFs::restore(config(), image, Arc::new(NoHooks)),
            Err(LayerFsError::InvalidImage(_))
        ));
    }
}
