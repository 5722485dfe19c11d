use std::path::Path;

use getset::CopyGetters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    LayerFsError, LayerFsResult, DEFAULT_ICACHE_BUCKETS, DEFAULT_MAX_ALLOC_BLOCKS,
    DEFAULT_MAX_LAYERS, DEFAULT_META_CHUNK_BLOCKS, DEFAULT_RESERVED_BLOCKS, DEFAULT_TOTAL_BLOCKS,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The device and allocator settings of a layered file system.
///
/// ## Example
///
/// ```
/// use layerfs::config::LayerFsConfig;
///
/// let config = LayerFsConfig::from_toml_str(
///     r#"
///     total_blocks = 4096
///     max_alloc_blocks = 128
///     "#,
/// )
/// .unwrap();
///
/// assert_eq!(config.get_total_blocks(), 4096);
/// assert_eq!(config.get_max_alloc_blocks(), 128);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, CopyGetters)]
#[getset(get_copy = "pub with_prefix")]
#[serde(default, deny_unknown_fields)]
pub struct LayerFsConfig {
    /// Size of the device in blocks (`sb_tblocks`)
    #[builder(default = DEFAULT_TOTAL_BLOCKS)]
    total_blocks: u64,

    /// Leading blocks that never enter the free list
    #[builder(default = DEFAULT_RESERVED_BLOCKS)]
    reserved_blocks: u64,

    /// Largest number of blocks a single allocation may ask for
    #[builder(default = DEFAULT_MAX_ALLOC_BLOCKS)]
    max_alloc_blocks: u64,

    /// Blocks a layer reserves at once for its metadata
    #[builder(default = DEFAULT_META_CHUNK_BLOCKS)]
    meta_chunk_blocks: u64,

    /// Inode-cache bucket locks per layer
    #[builder(default = DEFAULT_ICACHE_BUCKETS)]
    icache_buckets: usize,

    /// Size of the layer table; every handle is below it
    #[builder(default = DEFAULT_MAX_LAYERS)]
    max_layers: u32,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerFsConfig {
    /// Parses and validates a TOML configuration.
    pub fn from_toml_str(source: &str) -> LayerFsResult<Self> {
        let config: LayerFsConfig = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> LayerFsResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loading configuration");
        Self::from_toml_str(&source)
    }

    /// Checks that the settings describe a usable device.
    pub fn validate(&self) -> LayerFsResult<()> {
        if self.reserved_blocks == 0 {
            return Err(LayerFsError::InvalidConfig(
                "reserved_blocks must keep block 0 out of the free list".into(),
            ));
        }

        if self.total_blocks <= self.reserved_blocks {
            return Err(LayerFsError::InvalidConfig(format!(
                "total_blocks ({}) must exceed reserved_blocks ({})",
                self.total_blocks, self.reserved_blocks
            )));
        }

        if self.max_alloc_blocks == 0
            || self.meta_chunk_blocks == 0
            || self.icache_buckets == 0
            || self.max_layers == 0
        {
            return Err(LayerFsError::InvalidConfig(
                "max_alloc_blocks, meta_chunk_blocks, icache_buckets and max_layers must be non-zero"
                    .into(),
            ));
        }

        Ok(())
    }

    /// Number of blocks the free list starts with.
    pub fn usable_blocks(&self) -> u64 {
        self.total_blocks - self.reserved_blocks
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for LayerFsConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
