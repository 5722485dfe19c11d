//! `layerfs` is the extent and layer-tree core of a layered copy-on-write file system.
//!
//! A base layer hosts any number of derived layers arranged in a snapshot tree. Each layer shares
//! unmodified blocks with its ancestors and only records the blocks it writes itself.

#![warn(missing_docs)]
#![allow(clippy::module_inception)]

mod defaults;
mod error;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod cli;
pub mod config;
pub mod extent;
pub mod gfs;
pub mod layer;

pub use defaults::*;
pub use error::*;
pub use extent::{Extent, ExtentKind, ExtentList, ExtentOwner, ExtentRecord};
pub use gfs::{FsImage, GlobalFs, GlobalStats, LayerOp};
pub use layer::{ino, Layer, LayerHandle, LayerHooks, LayerState, LayerStats, NoHooks};
