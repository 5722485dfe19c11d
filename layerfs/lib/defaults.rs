//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default device size in blocks.
pub const DEFAULT_TOTAL_BLOCKS: u64 = 1 << 20;

/// The default number of leading blocks kept out of the free list.
///
/// Physical block 0 must stay reserved since it doubles as the space-extent sentinel.
pub const DEFAULT_RESERVED_BLOCKS: u64 = 1;

/// The default upper bound on a single allocation, in blocks.
pub const DEFAULT_MAX_ALLOC_BLOCKS: u64 = 4096;

/// The default number of blocks a layer reserves at once for its metadata.
pub const DEFAULT_META_CHUNK_BLOCKS: u64 = 64;

/// The default size of the layer table, which bounds every layer handle.
pub const DEFAULT_MAX_LAYERS: u32 = 4096;

/// The default number of inode-cache bucket locks per layer.
pub const DEFAULT_ICACHE_BUCKETS: usize = 64;

/// The number of low bits of an inode number that hold the layer-local inode.
pub const INO_LOCAL_BITS: u32 = 32;

/// The layer-local inode number of every layer root.
pub const ROOT_INODE: u64 = 2;

/// The base-layer local inode of the directory new layer roots hang off.
pub const SNAP_ROOT_INODE: u64 = 3;

/// The base-layer local inode of the directory scratch layers live in.
pub const TMP_ROOT_INODE: u64 = 4;
