use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ErrorKind, FsImage, GlobalFs, GlobalStats, LayerFsResult, LayerHandle};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A sequence of layer operations read from TOML.
///
/// ## Example
///
/// ```toml
/// [[ops]]
/// op = "create"
/// parent = 0
///
/// [[ops]]
/// op = "write"
/// layer = 1
/// start = 0
/// count = 8
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Script {
    /// Operations in the order they run
    #[serde(default)]
    pub ops: Vec<ScriptOp>,
}

/// One scripted operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ScriptOp {
    /// Branch a layer off `parent`
    Create {
        /// Layer to branch from
        parent: LayerHandle,

        /// Start frozen
        #[serde(default)]
        read_only: bool,
    },

    /// Freeze a layer
    Commit {
        /// Layer to freeze
        layer: LayerHandle,
    },

    /// Remove a layer from the tree
    Delete {
        /// Layer to remove
        layer: LayerHandle,
    },

    /// Write logical blocks to fresh physical blocks
    Write {
        /// Layer written to
        layer: LayerHandle,

        /// First logical block
        start: u64,

        /// Number of blocks
        count: u64,
    },

    /// Unmap and free logical blocks
    Punch {
        /// Layer punched
        layer: LayerHandle,

        /// First logical block
        start: u64,

        /// Number of blocks
        count: u64,
    },

    /// Translate a logical block
    Lookup {
        /// Layer looked up in
        layer: LayerHandle,

        /// Logical block
        block: u64,
    },
}

/// What a scripted operation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    /// A layer was created
    Created {
        /// The new layer
        layer: LayerHandle,
    },

    /// A layer was frozen
    Committed {
        /// The frozen layer
        layer: LayerHandle,
    },

    /// A layer was removed
    Deleted {
        /// The removed layer
        layer: LayerHandle,
    },

    /// Blocks were written
    Written {
        /// First physical block
        block: u64,
    },

    /// Blocks were unmapped
    Punched {
        /// Logical blocks unmapped
        unmapped: u64,
    },

    /// A block was translated
    Found {
        /// Physical block, `None` when unmapped
        physical: Option<u64>,
    },

    /// The operation was rejected and left the file system untouched
    Rejected {
        /// Class of the error
        kind: String,

        /// Error message
        error: String,
    },
}

/// The result of replaying a script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayReport {
    /// One outcome per operation
    pub outcomes: Vec<Outcome>,

    /// Counters after the last operation
    pub stats: GlobalStats,

    /// The registry after the last operation
    pub image: FsImage,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl Script {
    /// Parses a TOML script.
    pub fn from_toml_str(source: &str) -> LayerFsResult<Self> {
        Ok(toml::from_str(source)?)
    }

    /// Reads a TOML script from `path`.
    pub fn load(path: impl AsRef<Path>) -> LayerFsResult<Self> {
        let source = std::fs::read_to_string(path.as_ref())?;
        tracing::debug!(path = %path.as_ref().display(), "loading script");
        Self::from_toml_str(&source)
    }

    /// Runs every operation against `gfs` and validates the result.
    ///
    /// Rejected operations are reported and the replay goes on. Corruption stops it.
    pub fn replay(&self, gfs: &GlobalFs) -> LayerFsResult<ReplayReport> {
        let mut outcomes = Vec::with_capacity(self.ops.len());
        for (index, op) in self.ops.iter().enumerate() {
            let outcome = match op.apply(gfs) {
                Ok(outcome) => outcome,
                Err(error) if error.kind() != ErrorKind::Corruption => {
                    tracing::info!(index, ?op, %error, "operation rejected");
                    Outcome::Rejected {
                        kind: format!("{:?}", error.kind()),
                        error: error.to_string(),
                    }
                }
                Err(error) => return Err(error),
            };
            outcomes.push(outcome);
        }

        gfs.validate()?;
        Ok(ReplayReport {
            outcomes,
            stats: gfs.stats(),
            image: gfs.image(),
        })
    }
}

impl ScriptOp {
    /// Runs the operation.
    pub fn apply(&self, gfs: &GlobalFs) -> LayerFsResult<Outcome> {
        match *self {
            ScriptOp::Create { parent, read_only } => gfs
                .create_layer(parent, read_only)
                .map(|layer| Outcome::Created { layer }),
            ScriptOp::Commit { layer } => gfs
                .commit_layer(layer)
                .map(|_| Outcome::Committed { layer }),
            ScriptOp::Delete { layer } => gfs
                .delete_layer(layer)
                .map(|_| Outcome::Deleted { layer }),
            ScriptOp::Write {
                layer,
                start,
                count,
            } => gfs
                .write(layer, start, count)
                .map(|block| Outcome::Written { block }),
            ScriptOp::Punch {
                layer,
                start,
                count,
            } => gfs
                .punch(layer, start, count)
                .map(|unmapped| Outcome::Punched { unmapped }),
            ScriptOp::Lookup { layer, block } => gfs
                .map_lookup(layer, block)
                .map(|physical| Outcome::Found { physical }),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
