mod common;

use common::{arg_value, context, init_logging, scene, test_config, touch, ScriptedRunner};
use sardine_batch::core::{
    ArdStage, ConversionRequest, DeferredQueue, EngineClient, FailurePolicy, ProductConverter, UnitState,
};
use sardine_batch::io::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore, StageOutput};
use sardine_batch::types::{SarResult, Track};
use sardine_batch::{build_processing_units, ProcessingConfig};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Converter recording its requests and returning a fixed code
struct RecordingConverter {
    code: i32,
    requests: Mutex<Vec<ConversionRequest>>,
}

impl RecordingConverter {
    fn new(code: i32) -> Arc<Self> {
        Arc::new(Self {
            code,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl ProductConverter for RecordingConverter {
    fn convert(&self, _engine: &EngineClient, _config: &ProcessingConfig, request: &ConversionRequest) -> SarResult<i32> {
        self.requests.lock().unwrap().push(request.clone());
        Ok(self.code)
    }
}

fn inventory() -> Vec<sardine_batch::SceneRecord> {
    vec![
        scene("S1A_IW_GRDH_1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE", 117, "20200103"),
        scene("S1A_IW_GRDH_1SDV_20200103T170842_20200103T170907_030639_0382D5_4A6B", 117, "20200103"),
        scene("S1A_IW_GRDH_1SDV_20200115T170814_20200115T170841_030814_0388F0_1D8E", 117, "20200115"),
        scene("S1A_IW_GRDH_1SDV_20200105T054406_20200105T054431_030662_03839F_6F1B", 15, "20200105"),
    ]
}

#[test]
fn test_second_run_is_a_no_op() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let ctx = context(
        test_config(tmp.path()),
        ScriptedRunner::succeeding(),
        Arc::new(FsCheckpointStore::new()),
    );
    let units = build_processing_units(&inventory());
    let converter = RecordingConverter::new(0);

    let first = ArdStage::with_converter(&ctx, converter.clone()).run(&units).unwrap();
    assert_eq!(converter.count(), 3);
    assert_eq!(first.completed(), 3);

    for (track, date) in [(117, "20200103"), (117, "20200115"), (15, "20200105")] {
        let dir = ctx.layout.acquisition_dir(Track(track), date);
        assert!(dir.join(".processed").is_file(), "missing marker in {}", dir.display());
    }

    let second = ArdStage::with_converter(&ctx, converter.clone()).run(&units).unwrap();
    assert_eq!(converter.count(), 3);
    assert_eq!(second.skipped(), 3);
    assert_eq!(second.completed(), 0);
}

#[test]
fn test_conversion_request_contents() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let config = test_config(tmp.path());
    let download = config.download_dir.clone();
    let ctx = context(config, ScriptedRunner::succeeding(), Arc::new(MemoryCheckpointStore::new()));

    // One archive in the canonical layout, the others missing
    let canonical = download
        .join("SAR/GRD/2020/01/03")
        .join("S1A_IW_GRDH_1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE.zip");
    touch(&canonical);

    let units = build_processing_units(&inventory());
    let converter = RecordingConverter::new(0);
    ArdStage::with_converter(&ctx, converter.clone()).run(&units).unwrap();

    let requests = converter.requests.lock().unwrap();
    let first = &requests[0];
    assert_eq!(first.file_id, "20200103_117");
    assert_eq!(first.inputs.len(), 2);
    assert_eq!(first.inputs[0], canonical);
    assert_eq!(first.out_dir, ctx.layout.acquisition_dir(Track(117), "20200103"));

    // A single scene is still a list
    assert_eq!(requests[1].inputs.len(), 1);
    assert_eq!(requests[2].file_id, "20200105_15");
}

#[test]
fn test_soft_conversion_failure_writes_no_marker() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let ctx = context(test_config(tmp.path()), ScriptedRunner::succeeding(), store.clone());
    let units = build_processing_units(&inventory());

    let report = ArdStage::with_converter(&ctx, RecordingConverter::new(1)).run(&units).unwrap();

    assert_eq!(report.failed_soft(), 3);
    assert_eq!(store.write_count(), 0);
}

#[test]
fn test_gpt_chain_with_all_steps() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.toolchain.graph_dir = Some(PathBuf::from("/opt/ost/graphs"));
    {
        let ard = &mut config.parameters.single_ard;
        ard.range_looks = 2;
        ard.azimuth_looks = 2;
        ard.remove_speckle = true;
        ard.create_ls_mask = true;
        ard.to_db = true;
    }
    let temp_root = config.temp_dir();
    let runner = ScriptedRunner::succeeding();
    let ctx = context(config, runner.clone(), Arc::new(MemoryCheckpointStore::new()));

    let units = build_processing_units(&inventory()[..2]);
    let report = ArdStage::new(&ctx).run(&units).unwrap();
    assert_eq!(report.completed(), 1);

    assert_eq!(
        runner.labels(),
        vec![
            "SliceAssembly",
            "Calibration",
            "Multilook",
            "Speckle-Filter",
            "Layover/Shadow mask",
            "LinearToFromdB",
            "Terrain-Correction",
        ]
    );

    let calls = runner.calls();
    let out_dir = ctx.layout.acquisition_dir(Track(117), "20200103");
    let tc = calls.last().unwrap();
    assert_eq!(tc.output, out_dir.join("20200103_117.bs.dim"));
    assert_eq!(tc.log_file, out_dir.join("20200103_117.tc.errLog"));
    assert_eq!(arg_value(tc, "-t"), Some(out_dir.join("20200103_117.bs.dim").to_str().unwrap()));

    let ls = &calls[4];
    assert_eq!(ls.args[0], "/opt/ost/graphs/S1_GRD2ARD/3_LSmap.xml");
    assert_eq!(ls.output, out_dir.join("20200103_117.LS.dim"));

    // Every step logs to its own file
    let mut logs: Vec<PathBuf> = calls.iter().map(|c| c.log_file.clone()).collect();
    logs.dedup();
    assert_eq!(logs.len(), calls.len());

    // Intermediates are cleaned up
    assert!(!temp_root.join("20200103_117").exists());
}

/// Calibration and multi-looking failures are soft (the unit is left unmarked and the
/// run goes on), while speckle filtering, dB conversion, terrain correction and
/// layover/shadow masking failures are hard. This asymmetry is deliberate.
#[test]
fn test_best_effort_and_critical_failure_asymmetry() {
    init_logging();
    let units = build_processing_units(&inventory()[2..3]);

    for soft in ["Calibration", "Multilook"] {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.parameters.single_ard.range_looks = 3;
        let store = Arc::new(MemoryCheckpointStore::new());
        let runner = ScriptedRunner::failing_on(soft, 1);
        let ctx = context(config, runner.clone(), store.clone()).with_policy(FailurePolicy::FailFast);

        let report = ArdStage::new(&ctx).run(&units).unwrap();
        assert_eq!(report.units[0].state, UnitState::FailedSoft { code: 1 }, "{} must be soft", soft);
        assert_eq!(runner.attempts_of(soft), 3);
        assert_eq!(runner.attempts_of("Terrain-Correction"), 0);
        assert_eq!(store.write_count(), 0);
    }

    for hard in ["Speckle-Filter", "LinearToFromdB", "Terrain-Correction", "Layover/Shadow mask"] {
        let tmp = TempDir::new().unwrap();
        let mut config = test_config(tmp.path());
        config.toolchain.graph_dir = Some(PathBuf::from("/opt/ost/graphs"));
        config.parameters.single_ard.remove_speckle = true;
        config.parameters.single_ard.to_db = true;
        config.parameters.single_ard.apply_ls_mask = true;
        let store = Arc::new(MemoryCheckpointStore::new());
        let runner = ScriptedRunner::failing_on(hard, 1);
        let ctx = context(config, runner.clone(), store.clone()).with_policy(FailurePolicy::FailFast);

        let err = ArdStage::new(&ctx).run(&units).unwrap_err();
        assert!(err.is_engine_failure(), "{} must be hard", hard);
        assert_eq!(runner.attempts_of(hard), 3);
        assert_eq!(store.write_count(), 0);
    }
}

#[test]
fn test_hard_failure_with_continue_policy_moves_on() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    // Terrain correction of the first unit fails three times, everything else succeeds
    let runner = ScriptedRunner::sequence(&[0, 0, 1, 1, 1]);
    let ctx = context(test_config(tmp.path()), runner.clone(), store.clone());
    let units = build_processing_units(&inventory());

    let report = ArdStage::new(&ctx).run(&units).unwrap();

    assert!(matches!(report.units[0].state, UnitState::FailedHard { .. }));
    assert_eq!(report.completed(), 2);
    assert_eq!(store.write_count(), 2);
    assert!(!store.is_complete(&StageOutput::directory(ctx.layout.acquisition_dir(Track(117), "20200103"))));
}

#[test]
fn test_deferred_units_invoke_the_cli() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.source = Some(tmp.path().join("processing.json"));
    let exec_file = tmp.path().join("ard.jsonl");

    let runner = ScriptedRunner::succeeding();
    let queue = Arc::new(DeferredQueue::with_exec_file(&exec_file));
    let ctx = context(config, runner.clone(), Arc::new(MemoryCheckpointStore::new())).with_deferred(queue.clone());
    let units = build_processing_units(&inventory());

    let report = ArdStage::new(&ctx).run(&units).unwrap();

    assert_eq!(runner.call_count(), 0);
    assert_eq!(report.deferred(), 3);
    assert_eq!(queue.len(), 3);
    assert!(!ctx.layout.acquisition_dir(Track(117), "20200103").exists());

    let commands = queue.commands();
    let first = &commands[0];
    assert_eq!(first.program, PathBuf::from("/usr/local/bin/sardine-batch"));
    assert_eq!(first.args[0], "unit-ard");
    assert_eq!(arg_value(first, "--track"), Some("117"));
    assert_eq!(arg_value(first, "--date"), Some("20200103"));
    assert_eq!(first.args.len(), 9);

    let lines = std::fs::read_to_string(&exec_file).unwrap();
    assert_eq!(lines.lines().count(), 3);
}

#[test]
fn test_deferred_without_config_file_fails() {
    let tmp = TempDir::new().unwrap();
    let ctx = context(
        test_config(tmp.path()),
        ScriptedRunner::succeeding(),
        Arc::new(MemoryCheckpointStore::new()),
    )
    .with_deferred(Arc::new(DeferredQueue::new()));
    let units = build_processing_units(&inventory());

    assert!(ArdStage::new(&ctx).run(&units).is_err());
}

#[cfg(feature = "parallel")]
#[test]
fn test_parallel_units_each_run_once() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(FsCheckpointStore::new());
    let ctx = context(test_config(tmp.path()), ScriptedRunner::succeeding(), store).with_jobs(4);

    let mut scenes = Vec::new();
    for day in 1..=20 {
        let date = format!("202001{:02}", day);
        scenes.push(scene(&format!("scene_{}", day), 117, &date));
    }
    let units = build_processing_units(&scenes);
    let converter = RecordingConverter::new(0);

    let report = ArdStage::with_converter(&ctx, converter.clone()).run(&units).unwrap();
    assert_eq!(report.completed(), 20);
    assert_eq!(converter.count(), 20);
}

/// Fails hard for one acquisition, slow for the others
#[cfg(feature = "parallel")]
struct FailingConverter {
    fail_on: &'static str,
    calls: Mutex<usize>,
}

#[cfg(feature = "parallel")]
impl ProductConverter for FailingConverter {
    fn convert(&self, _engine: &EngineClient, _config: &ProcessingConfig, request: &ConversionRequest) -> SarResult<i32> {
        *self.calls.lock().unwrap() += 1;
        if request.file_id == self.fail_on {
            return Err(sardine_batch::SarError::EngineFailure {
                operation: "Terrain correction".to_string(),
                code: 1,
                attempts: 3,
                log: request.step_log("tc"),
            });
        }
        std::thread::sleep(std::time::Duration::from_millis(20));
        Ok(0)
    }
}

#[cfg(feature = "parallel")]
#[test]
fn test_parallel_fail_fast_stops_starting_units() {
    init_logging();
    let tmp = TempDir::new().unwrap();
    let store = Arc::new(MemoryCheckpointStore::new());
    let ctx = context(test_config(tmp.path()), ScriptedRunner::succeeding(), store.clone())
        .with_policy(FailurePolicy::FailFast)
        .with_jobs(4);

    let mut scenes = Vec::new();
    for day in 1..=40 {
        let date = format!("2020{:02}{:02}", 1 + (day - 1) / 28, 1 + (day - 1) % 28);
        scenes.push(scene(&format!("scene_{}", day), 117, &date));
    }
    let units = build_processing_units(&scenes);
    let converter = Arc::new(FailingConverter {
        fail_on: "20200101_117",
        calls: Mutex::new(0),
    });

    let err = ArdStage::with_converter(&ctx, converter.clone()).run(&units).unwrap_err();

    assert!(err.is_engine_failure());
    let calls = *converter.calls.lock().unwrap();
    assert!(calls < 40, "{} conversions started after the failure", calls);
    assert!(store.write_count() < 39);
}
