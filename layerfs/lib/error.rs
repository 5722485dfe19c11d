use std::io;

use thiserror::Error;

use crate::LayerHandle;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of a layer file system operation.
pub type LayerFsResult<T> = Result<T, LayerFsError>;

/// An error that occurred during a layer file system operation.
#[derive(pretty_error_debug::Debug, Error)]
pub enum LayerFsError {
    /// An extent list or layer tree invariant does not hold.
    #[error("file system corruption: {0}")]
    Corruption(String),

    /// No free extent is large enough for the request.
    #[error("out of space: no free extent of {requested} blocks")]
    OutOfSpace {
        /// The number of blocks requested
        requested: u64,
    },

    /// A single allocation asked for more blocks than the allocator hands out at once.
    #[error("allocation of {requested} blocks exceeds the limit of {limit} blocks")]
    AllocationTooLarge {
        /// The number of blocks requested
        requested: u64,

        /// The configured allocation limit
        limit: u64,
    },

    /// The inode number encodes a layer handle with no live layer behind it.
    #[error("unknown layer for inode {0:#x}")]
    UnknownLayer(u64),

    /// The layer has more than one child and cannot be removed from the tree.
    #[error("layer {0} has multiple children")]
    HasMultipleChildren(LayerHandle),

    /// The layer is a frozen snapshot and does not accept writes.
    #[error("layer {0} is read-only")]
    ReadOnlyLayer(LayerHandle),

    /// The base layer is the root of the tree and cannot be removed.
    #[error("the base layer cannot be deleted")]
    BaseLayer,

    /// The layer still has cached inodes, cached pages or dirty pages.
    #[error("layer {0} is busy")]
    Busy(LayerHandle),

    /// A persisted image cannot be turned back into a registry.
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// The caller asked for something meaningless, such as an empty allocation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The configuration is not usable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// IO error while loading configuration or images.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// TOML deserialization error.
    #[error("toml error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// JSON serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The class an error belongs to.
///
/// Corruption is never recoverable locally. Out-of-space, unknown-layer and invalid-topology
/// errors are ordinary returns that leave the file system untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// An invariant is broken.
    Corruption,

    /// The free-space list cannot satisfy a request.
    OutOfSpace,

    /// A stale or corrupted inode reference.
    UnknownLayer,

    /// The request is not allowed by the shape of the tree or the state of the layer.
    InvalidTopology,

    /// The layer is still in use.
    Busy,

    /// Anything outside the core taxonomy.
    Other,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl LayerFsError {
    /// Creates a corruption error and logs it.
    pub fn corruption(message: impl Into<String>) -> LayerFsError {
        let message = message.into();
        tracing::error!(%message, "corruption detected");
        LayerFsError::Corruption(message)
    }

    /// Returns the class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LayerFsError::Corruption(_) | LayerFsError::InvalidImage(_) => ErrorKind::Corruption,
            LayerFsError::OutOfSpace { .. } | LayerFsError::AllocationTooLarge { .. } => {
                ErrorKind::OutOfSpace
            }
            LayerFsError::UnknownLayer(_) => ErrorKind::UnknownLayer,
            LayerFsError::HasMultipleChildren(_)
            | LayerFsError::ReadOnlyLayer(_)
            | LayerFsError::BaseLayer => ErrorKind::InvalidTopology,
            LayerFsError::Busy(_) => ErrorKind::Busy,
            LayerFsError::InvalidRequest(_)
            | LayerFsError::InvalidConfig(_)
            | LayerFsError::Io(_)
            | LayerFsError::TomlDe(_)
            | LayerFsError::Json(_) => ErrorKind::Other,
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
