mod common;

use common::{arg_value, context, init_logging, scene, test_config, touch, ScriptedRunner};
use sardine_batch::core::{DeferredQueue, StageContext, TimescanStage, UnitState};
use sardine_batch::io::{FsCheckpointStore, MemoryCheckpointStore};
use sardine_batch::types::{Polarization, Track};
use sardine_batch::{build_processing_units, ProcessingUnit};
use std::sync::Arc;
use tempfile::TempDir;

fn units() -> Vec<ProcessingUnit> {
    build_processing_units(&[scene("a", 117, "20200103"), scene("b", 117, "20200127")])
}

/// Time series of VV for track 117 with gaps between the dates
fn timeseries(ctx: &StageContext) {
    let dir = ctx.layout.timeseries_dir(Track(117));
    touch(&ctx.layout.timeseries_vrt(Track(117), Polarization::VV));
    touch(&dir.join("3.20200208.bs.VV.tif"));
    touch(&dir.join("1.20200103.bs.VV.tif"));
    touch(&dir.join("2.20200127.bs.VV.tif"));
    // Other channel and non-layer files are ignored
    touch(&dir.join("1.20200103.bs.VH.tif"));
    touch(&dir.join("Timeseries.bs.VV.errLog"));
}

#[test]
fn test_timescan_uses_dates_present_on_disk() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.parameters.time_scan.metrics = vec!["avg".into(), "harmonics".into()];
    let runner = ScriptedRunner::succeeding();
    let ctx = context(config, runner.clone(), Arc::new(FsCheckpointStore::new()));
    timeseries(&ctx);

    let report = TimescanStage::new(&ctx).run(&units()).unwrap();

    // VH has layers but no stack, so only VV runs
    assert_eq!(runner.labels(), vec!["Timescan"]);
    assert_eq!(report.completed(), 1);

    let calls = runner.calls();
    let scan = &calls[0];
    assert_eq!(arg_value(scan, "--dates"), Some("20200103,20200127,20200208"));
    assert_eq!(arg_value(scan, "--metrics"), Some("avg,harmonics"));
    assert_eq!(
        arg_value(scan, "--prefix").map(std::path::PathBuf::from),
        Some(ctx.layout.timescan_prefix(Track(117), Polarization::VV))
    );
    assert!(ctx.layout.timescan_dir(Track(117)).join(".VV.processed").is_file());
}

#[test]
fn test_completed_channel_is_skipped_and_vrt_built() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let runner = ScriptedRunner::succeeding();
    let ctx = context(test_config(tmp.path()), runner.clone(), Arc::new(FsCheckpointStore::new()));
    timeseries(&ctx);

    let timescan_dir = ctx.layout.timescan_dir(Track(117));
    touch(&timescan_dir.join(".VV.processed"));
    touch(&timescan_dir.join("bs.VV.avg.tif"));
    touch(&timescan_dir.join("bs.VV.max.tif"));

    let report = TimescanStage::new(&ctx).run(&units()).unwrap();

    assert_eq!(report.units.len(), 1);
    assert_eq!(report.units[0].state, UnitState::Skipped);
    assert_eq!(runner.labels(), vec!["BuildVRT"]);

    let calls = runner.calls();
    let vrt = &calls[0];
    assert_eq!(vrt.output, ctx.layout.timescan_vrt(Track(117)));
    assert!(vrt.args.contains(&"-separate".to_string()));
    assert_eq!(vrt.args.iter().filter(|a| a.ends_with(".tif")).count(), 2);
}

#[test]
fn test_missing_timeseries_is_silent() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let runner = ScriptedRunner::succeeding();
    let ctx = context(test_config(tmp.path()), runner.clone(), Arc::new(MemoryCheckpointStore::new()));

    let report = TimescanStage::new(&ctx).run(&units()).unwrap();
    assert_eq!(runner.call_count(), 0);
    assert!(report.units.is_empty());
    assert!(!report.has_failures());
}

#[test]
fn test_rescaling_and_db_flags() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.parameters.time_series.to_db = true;
    config.parameters.time_series.dtype_output = sardine_batch::io::config::OutputDataType::Uint16;
    let runner = ScriptedRunner::succeeding();
    let ctx = context(config, runner.clone(), Arc::new(MemoryCheckpointStore::new()));
    timeseries(&ctx);

    TimescanStage::new(&ctx).run(&units()).unwrap();

    let calls = runner.calls();
    assert!(calls[0].args.contains(&"--to-db".to_string()));
    assert_eq!(arg_value(&calls[0], "--rescale"), Some("uint16"));
    assert!(!calls[0].args.contains(&"--remove-outliers".to_string()));
}

#[test]
fn test_deferred_timescan_skips_the_vrt() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let runner = ScriptedRunner::succeeding();
    let queue = Arc::new(DeferredQueue::new());
    let ctx = context(test_config(tmp.path()), runner.clone(), Arc::new(MemoryCheckpointStore::new()))
        .with_deferred(queue.clone());
    timeseries(&ctx);
    touch(&ctx.layout.timescan_dir(Track(117)).join("bs.VV.avg.tif"));

    let report = TimescanStage::new(&ctx).run(&units()).unwrap();

    assert_eq!(runner.call_count(), 0);
    assert_eq!(report.deferred(), 1);
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.commands()[0].label, "Timescan");
}
