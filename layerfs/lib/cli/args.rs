use std::path::PathBuf;

use clap::Parser;

use super::styles;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// `layerfs` replays layer operations against an in-memory registry and checks saved images
#[derive(Debug, Parser)]
#[command(name = "layerfs", author, version, styles=styles::styles())]
pub struct LayerFsArgs {
    /// The subcommand to run
    #[command(subcommand)]
    pub subcommand: Option<LayerFsSubcommand>,

    /// Enable verbose logging
    #[arg(short = 'V', long, global = true)]
    pub verbose: bool,
}

/// Available subcommands
#[derive(Debug, Parser)]
pub enum LayerFsSubcommand {
    /// Run a TOML script of layer operations on a freshly formatted file system
    #[command(name = "replay")]
    Replay {
        /// Path to the script
        #[arg()]
        script: PathBuf,

        /// Device configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Restore a JSON image and validate it
    #[command(name = "check")]
    Check {
        /// Path to the image
        #[arg()]
        image: PathBuf,

        /// Device configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parse_replay() {
        let args = LayerFsArgs::parse_from(["layerfs", "replay", "ops.toml", "-c", "fs.toml", "-V"]);
        assert!(args.verbose);
        match args.subcommand {
            Some(LayerFsSubcommand::Replay { script, config }) => {
                assert_eq!(script, PathBuf::from("ops.toml"));
                assert_eq!(config, Some(PathBuf::from("fs.toml")));
            }
            other => panic!("unexpected subcommand {other:?}"),
        }
    }

    #[test]
    fn test_args_parse_check() {
        let args = LayerFsArgs::parse_from(["layerfs", "check", "image.json"]);
        assert!(!args.verbose);
        assert!(matches!(
            args.subcommand,
            Some(LayerFsSubcommand::Check { config: None, .. })
        ));
    }
}
