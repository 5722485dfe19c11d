//! Layers: the nodes of the snapshot tree.

mod dirty;
mod handle;
mod hooks;
mod layer;
mod stats;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub mod ino;

pub use dirty::*;
pub use handle::*;
pub use hooks::*;
pub use layer::*;
pub use stats::*;
