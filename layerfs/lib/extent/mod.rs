//! Extents and the ordered, coalescing lists that hold them.
//!
//! The same list type serves as a free-space list (the device-wide free list, or a layer's private
//! metadata free list) and as a layer's logical-to-physical block map.

mod extent;
mod list;

//--------------------------------------------------------------------------------------------------
// Exports
//--------------------------------------------------------------------------------------------------

pub use extent::*;
pub use list::*;
