//! Inode numbers carry the handle of the layer that owns them.
//!
//! The upper bits hold the [`LayerHandle`], the lower [`INO_LOCAL_BITS`] bits hold the
//! layer-local inode number.

use crate::{LayerHandle, INO_LOCAL_BITS};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const LOCAL_MASK: u64 = (1 << INO_LOCAL_BITS) - 1;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Builds the inode number of `local` inside the layer `handle`.
#[inline]
pub fn encode(handle: LayerHandle, local: u64) -> u64 {
    (u64::from(handle.get()) << INO_LOCAL_BITS) | (local & LOCAL_MASK)
}

/// Returns the handle of the layer owning `ino`.
#[inline]
pub fn handle_of(ino: u64) -> LayerHandle {
    LayerHandle::new((ino >> INO_LOCAL_BITS) as u32)
}

/// Returns the layer-local part of `ino`.
#[inline]
pub fn local_of(ino: u64) -> u64 {
    ino & LOCAL_MASK
}

/// Returns `true` if `ino` belongs to the base layer, outside every derived layer.
#[inline]
pub fn is_global(ino: u64) -> bool {
    handle_of(ino).is_base()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
