use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The small integer identifying a layer (its `gindex`).
///
/// It is the layer's slot in the global registry and is encoded in the upper bits of every inode
/// number the layer owns. A handle stays valid for the whole lifetime of its layer.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct LayerHandle(u32);

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerHandle {
    /// The handle of the base layer.
    pub const BASE: LayerHandle = LayerHandle(0);

    /// Creates a handle from a raw slot index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw slot index.
    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns the slot index as a `usize`.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Returns `true` for the base layer.
    pub const fn is_base(self) -> bool {
        self.0 == 0
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for LayerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for LayerHandle {
    fn from(index: u32) -> Self {
        Self(index)
    }
}
