//! Argument types and script replay for the `layerfs` binary.

mod args;
mod replay;
mod styles;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use args::*;
pub use replay::*;
pub use styles::*;
