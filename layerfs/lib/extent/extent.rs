use std::fmt::{self, Display};

use getset::CopyGetters;
use serde::{Deserialize, Serialize};

use crate::LayerHandle;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What an extent describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtentKind {
    /// A run of free blocks. `block` is always `0`.
    Space,

    /// A run of logical blocks mapped onto a run of physical blocks.
    Emap,
}

/// Whose allocator an extent list's nodes are charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtentOwner {
    /// The device-wide free list.
    Global,

    /// A list private to one layer.
    Layer(LayerHandle),
}

/// One contiguous range of blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
pub struct Extent {
    /// Whether this is a free range or a block mapping
    kind: ExtentKind,

    /// First block covered (logical for emap extents)
    start: u64,

    /// First physical block, `0` for space extents
    block: u64,

    /// Number of blocks covered
    count: u64,
}

/// The persisted form of an extent: `(start, block, count, kind)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentRecord {
    /// First block covered
    pub start: u64,

    /// First physical block
    pub block: u64,

    /// Number of blocks covered
    pub count: u64,

    /// Kind of the extent
    pub kind: ExtentKind,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Extent {
    /// Creates a free-space extent.
    pub fn space(start: u64, count: u64) -> Self {
        Self {
            kind: ExtentKind::Space,
            start,
            block: 0,
            count,
        }
    }

    /// Creates a logical-to-physical mapping extent.
    pub fn emap(start: u64, block: u64, count: u64) -> Self {
        Self {
            kind: ExtentKind::Emap,
            start,
            block,
            count,
        }
    }

    /// One past the last block covered.
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.count
    }

    /// Returns `true` if `block` lies inside this extent.
    #[inline]
    pub fn contains(&self, block: u64) -> bool {
        block >= self.start && block < self.end()
    }

    /// Translates a logical block covered by this extent to its physical block.
    ///
    /// Space extents translate to themselves.
    pub fn translate(&self, block: u64) -> Option<u64> {
        if !self.contains(block) {
            return None;
        }

        match self.kind {
            ExtentKind::Space => Some(block),
            ExtentKind::Emap => Some(self.block + (block - self.start)),
        }
    }

    /// Returns `true` if a range beginning at `(start, block)` directly follows this extent.
    ///
    /// Space extents only need logical contiguity. Emap extents also need the physical
    /// ranges to be contiguous.
    #[inline]
    pub fn precedes(&self, start: u64, block: u64) -> bool {
        self.end() == start
            && match self.kind {
                ExtentKind::Space => true,
                ExtentKind::Emap => self.block + self.count == block,
            }
    }

    pub(crate) fn shift_start_back(&mut self, count: u64) {
        self.start -= count;
        if self.kind == ExtentKind::Emap {
            self.block -= count;
        }
        self.count += count;
    }

    pub(crate) fn advance_start(&mut self, count: u64) {
        self.start += count;
        if self.kind == ExtentKind::Emap {
            self.block += count;
        }
        self.count -= count;
    }

    pub(crate) fn grow(&mut self, count: u64) {
        self.count += count;
    }

    pub(crate) fn shrink(&mut self, count: u64) {
        self.count -= count;
    }

    pub(crate) fn set_count(&mut self, count: u64) {
        self.count = count;
    }

    /// Returns the persisted form of this extent.
    pub fn to_record(&self) -> ExtentRecord {
        ExtentRecord {
            start: self.start,
            block: self.block,
            count: self.count,
            kind: self.kind,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{},{},{}}}", self.start, self.block, self.count)
    }
}

impl Display for ExtentOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtentOwner::Global => write!(f, "global"),
            ExtentOwner::Layer(handle) => write!(f, "layer {handle}"),
        }
    }
}

impl From<ExtentRecord> for Extent {
    fn from(record: ExtentRecord) -> Self {
        Self {
            kind: record.kind,
            start: record.start,
            block: record.block,
            count: record.count,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extent_space_precedes_ignores_block() {
        let extent = Extent::space(100, 10);
        assert!(extent.precedes(110, 0));
        assert!(extent.precedes(110, 999));
        assert!(!extent.precedes(111, 0));
    }

    #[test]
    fn test_extent_emap_precedes_needs_physical_contiguity() {
        let extent = Extent::emap(10, 500, 4);
        assert!(extent.precedes(14, 504));
        assert!(!extent.precedes(14, 505));
        assert!(!extent.precedes(15, 504));
    }

    #[test]
    fn test_extent_translate() {
        let extent = Extent::emap(10, 500, 4);
        assert_eq!(extent.translate(10), Some(500));
        assert_eq!(extent.translate(13), Some(503));
        assert_eq!(extent.translate(14), None);
        assert_eq!(extent.translate(9), None);
    }

    #[test]
    fn test_extent_shift_and_advance_move_block_for_emap_only() {
        let mut emap = Extent::emap(10, 500, 4);
        emap.shift_start_back(2);
        assert_eq!((emap.start, emap.block, emap.count), (8, 498, 6));
        emap.advance_start(3);
        assert_eq!((emap.start, emap.block, emap.count), (11, 501, 3));

        let mut space = Extent::space(10, 4);
        space.shift_start_back(2);
        assert_eq!((space.start, space.block, space.count), (8, 0, 6));
    }
}
