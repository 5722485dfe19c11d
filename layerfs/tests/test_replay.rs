use std::sync::Arc;

use layerfs::{
    cli::{Outcome, Script},
    config::LayerFsConfig,
    GlobalFs, LayerHandle, NoHooks,
};
use tempfile::tempdir;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const CONFIG: &str = r#"
total_blocks = 2048
max_alloc_blocks = 256
meta_chunk_blocks = 16
"#;

const SCRIPT: &str = r#"
[[ops]]
op = "write"
layer = 0
start = 0
count = 16

[[ops]]
op = "create"
parent = 0

[[ops]]
op = "commit"
layer = 1

[[ops]]
op = "create"
parent = 1

[[ops]]
op = "create"
parent = 1

[[ops]]
op = "write"
layer = 3
start = 8
count = 4

[[ops]]
op = "delete"
layer = 1

[[ops]]
op = "delete"
layer = 2

[[ops]]
op = "delete"
layer = 1

[[ops]]
op = "lookup"
layer = 3
block = 9

[[ops]]
op = "punch"
layer = 3
start = 0
count = 32
"#;

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test]
fn test_replay_script_from_files_and_check_image() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let config_path = dir.path().join("layerfs.toml");
    let script_path = dir.path().join("ops.toml");
    std::fs::write(&config_path, CONFIG)?;
    std::fs::write(&script_path, SCRIPT)?;

    let config = LayerFsConfig::load(&config_path)?;
    assert_eq!(config.get_total_blocks(), 2048);

    let gfs = GlobalFs::new(config.clone())?;
    let report = Script::load(&script_path)?.replay(&gfs)?;

    let written = match report.outcomes[5] {
        Outcome::Written { block } => block,
        ref other => panic!("unexpected outcome {other:?}"),
    };
    assert!(matches!(
        &report.outcomes[6],
        Outcome::Rejected { kind, .. } if kind == "InvalidTopology"
    ));
    assert_eq!(
        report.outcomes[7],
        Outcome::Deleted {
            layer: LayerHandle::new(2)
        }
    );
    assert_eq!(
        report.outcomes[8],
        Outcome::Deleted {
            layer: LayerHandle::new(1)
        }
    );
    assert_eq!(
        report.outcomes[9],
        Outcome::Found {
            physical: Some(written + 1)
        }
    );
    assert_eq!(report.outcomes[10], Outcome::Punched { unmapped: 4 });

    assert_eq!(report.stats.layers, 2);
    assert_eq!(report.stats.clones, 3);
    assert_eq!(gfs.parent(LayerHandle::new(3))?, Some(LayerHandle::BASE));

    // The report's image restores to the same registry.
    let image_path = dir.path().join("image.json");
    std::fs::write(&image_path, report.image.to_json()?)?;
    let restored = GlobalFs::load(config.clone(), &image_path)?;
    assert_eq!(restored.image(), report.image);
    assert_eq!(restored.free_blocks(), gfs.free_blocks());

    let again = GlobalFs::restore(config, report.image, Arc::new(NoHooks))?;
    assert_eq!(again.stats(), restored.stats());
    Ok(())
}
