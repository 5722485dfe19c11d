use crate::LayerHandle;

//--------------------------------------------------------------------------------------------------
// Traits
//--------------------------------------------------------------------------------------------------

/// Callbacks into the inode and page caches that live outside the core.
///
/// The core never looks inside those caches. It only asks whether a layer still has anything
/// cached before it removes the layer, and tells the caches once a layer is gone.
pub trait LayerHooks: Send + Sync {
    /// Returns `true` if the inode cache still holds inodes of `handle`.
    fn has_cached_inodes(&self, handle: LayerHandle) -> bool;

    /// Returns `true` if the page cache still holds pages of `handle`.
    fn has_cached_pages(&self, handle: LayerHandle) -> bool;

    /// Called after `handle` has been unlinked from the tree and its slot reclaimed.
    fn layer_removed(&self, _handle: LayerHandle) {}
}

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Hooks for a core running without inode or page caches.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl LayerHooks for NoHooks {
    fn has_cached_inodes(&self, _handle: LayerHandle) -> bool {
        false
    }

    fn has_cached_pages(&self, _handle: LayerHandle) -> bool {
        false
    }
}
