use std::{path::PathBuf, sync::Arc};

use clap::{CommandFactory, Parser};
use layerfs::{
    cli::{LayerFsArgs, LayerFsSubcommand, Script},
    config::LayerFsConfig,
    FsImage, GlobalFs, NoHooks,
};
use tracing::Level;

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    let args = LayerFsArgs::parse();

    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose {
            Level::DEBUG
        } else {
            Level::INFO
        })
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match args.subcommand {
        Some(LayerFsSubcommand::Replay { script, config }) => {
            let config = load_config(config)?;
            let script = Script::load(&script)?;
            tracing::info!(ops = script.ops.len(), "replaying script");

            let gfs = GlobalFs::new(config)?;
            let report = script.replay(&gfs)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Some(LayerFsSubcommand::Check { image, config }) => {
            let config = load_config(config)?;
            let image = FsImage::load(&image)?;

            let gfs = GlobalFs::restore(config, image, Arc::new(NoHooks))?;
            println!("{}", serde_json::to_string_pretty(&gfs.stats())?);
            tracing::info!("image is consistent");
        }
        None => {
            LayerFsArgs::command().print_help()?;
        }
    }

    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Functions: *
//--------------------------------------------------------------------------------------------------

fn load_config(path: Option<PathBuf>) -> anyhow::Result<LayerFsConfig> {
    Ok(match path {
        Some(path) => LayerFsConfig::load(path)?,
        None => LayerFsConfig::default(),
    })
}
