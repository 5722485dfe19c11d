//! The global registry: layers, the snapshot tree and the device's free space.

mod global;
mod image;
mod op;
mod tree;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use global::{GlobalFs, GlobalStats, TreeLinks};
pub use image::*;
pub use op::*;
