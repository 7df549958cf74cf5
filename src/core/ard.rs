//! Acquisition-to-product stage: one analysis-ready product per track and acquisition date.

use crate::core::command::{CommandBuilder, CommandDescriptor, CommandFactory, FailureClass};
use crate::core::dispatch::{StageContext, StageReport, UnitState};
use crate::core::engine::EngineClient;
use crate::io::checkpoint::StageOutput;
use crate::io::config::ProcessingConfig;
use crate::io::inventory::resolve_archive;
use crate::types::{AcquisitionGroup, Polarization, ProcessingUnit, SarError, SarResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Inputs of one product conversion
#[derive(Debug, Clone)]
pub struct ConversionRequest {
    /// Source archives, one per scene of the acquisition
    pub inputs: Vec<PathBuf>,
    pub out_dir: PathBuf,
    /// `{date}_{track}`
    pub file_id: String,
    pub polarizations: Vec<Polarization>,
}

impl ConversionRequest {
    /// Per-step engine log `{out_dir}/{file_id}.{step}.errLog`
    pub fn step_log(&self, step: &str) -> PathBuf {
        self.out_dir.join(format!("{}.{}.errLog", self.file_id, step))
    }

    /// Final backscatter product
    pub fn product(&self) -> PathBuf {
        self.out_dir.join(format!("{}.bs.dim", self.file_id))
    }

    /// Layover/shadow product
    pub fn ls_product(&self) -> PathBuf {
        self.out_dir.join(format!("{}.LS.dim", self.file_id))
    }
}

/// Converts the scenes of one acquisition into a product.
///
/// Returns the code of the step that stopped the conversion, 0 when the product was written.
pub trait ProductConverter: Send + Sync {
    fn convert(&self, engine: &EngineClient, config: &ProcessingConfig, request: &ConversionRequest) -> SarResult<i32>;
}

/// Conversion through SNAP's graph processing tool
#[derive(Debug, Default, Clone)]
pub struct GptProductConverter;

impl GptProductConverter {
    pub fn new() -> Self {
        Self
    }

    fn run_chain(
        &self,
        engine: &EngineClient,
        config: &ProcessingConfig,
        request: &ConversionRequest,
        temp: &Path,
    ) -> SarResult<i32> {
        let commands = CommandFactory::new(config);
        let ard = &config.parameters.single_ard;
        let intermediate = |step: &str| temp.join(format!("{}.{}.dim", request.file_id, step));

        let mut current = match request.inputs.as_slice() {
            [single] => single.clone(),
            [] => {
                return Err(SarError::InvalidArgument(format!(
                    "No scenes to convert for {}",
                    request.file_id
                )))
            }
            several => {
                log::info!("Assembling {} slices for {}", several.len(), request.file_id);
                let out = intermediate("slice");
                engine.invoke(&commands.slice_assembly(several, &request.polarizations, &out, &request.step_log("slice"))?)?;
                out
            }
        };

        let out = intermediate("cal");
        let code = engine.invoke(&commands.calibration(&current, &out, &request.step_log("cal"))?)?;
        if code != 0 {
            return Ok(code);
        }
        current = out;

        if ard.range_looks > 1 || ard.azimuth_looks > 1 {
            let out = intermediate("ml");
            let code = engine.invoke(&commands.multi_look(&current, &out, &request.step_log("ml"))?)?;
            if code != 0 {
                return Ok(code);
            }
            current = out;
        }

        if ard.remove_speckle {
            let out = intermediate("spk");
            engine.invoke(&commands.speckle_filter(&current, &out, &request.step_log("spk"))?)?;
            current = out;
        }

        if ard.needs_ls_mask() {
            let out = request.ls_product();
            engine.invoke(&commands.ls_mask(&current, &out, &request.step_log("ls"))?)?;
        }

        if ard.to_db {
            let out = intermediate("db");
            engine.invoke(&commands.linear_to_db(&current, &out, &request.step_log("db"))?)?;
            current = out;
        }

        let product = request.product();
        engine.invoke(&commands.terrain_correction(&current, &product, &request.step_log("tc"))?)
    }
}

impl ProductConverter for GptProductConverter {
    fn convert(&self, engine: &EngineClient, config: &ProcessingConfig, request: &ConversionRequest) -> SarResult<i32> {
        let temp = config.temp_dir().join(&request.file_id);
        std::fs::create_dir_all(&temp)?;
        std::fs::create_dir_all(&request.out_dir)?;

        let result = self.run_chain(engine, config, request, &temp);

        if let Err(e) = std::fs::remove_dir_all(&temp) {
            log::warn!("Could not remove temporary directory {}: {}", temp.display(), e);
        }
        result
    }
}

/// Drives the product conversion for every acquisition group
pub struct ArdStage<'a> {
    ctx: &'a StageContext,
    converter: Arc<dyn ProductConverter>,
}

impl<'a> ArdStage<'a> {
    pub fn new(ctx: &'a StageContext) -> Self {
        Self::with_converter(ctx, Arc::new(GptProductConverter::new()))
    }

    pub fn with_converter(ctx: &'a StageContext, converter: Arc<dyn ProductConverter>) -> Self {
        Self { ctx, converter }
    }

    pub fn run(&self, units: &[ProcessingUnit]) -> SarResult<StageReport> {
        let groups: Vec<&AcquisitionGroup> = units.iter().flat_map(|u| u.groups.iter()).collect();
        log::info!("Processing {} acquisition(s) to ARD", groups.len());

        let results = if self.ctx.jobs > 1 && !self.ctx.is_deferred() {
            self.process_parallel(&groups)?
        } else {
            self.process_sequential(&groups)
        };

        let mut report = StageReport::new("ARD");
        for (group, result) in groups.iter().zip(results) {
            let output = StageOutput::directory(self.output_dir(group));
            report.record(&self.label(group), &output, result?);
        }

        log::info!("{}", report);
        Ok(report)
    }

    #[cfg(feature = "parallel")]
    fn process_parallel(&self, groups: &[&AcquisitionGroup]) -> SarResult<Vec<SarResult<UnitState>>> {
        use rayon::prelude::*;
        use std::sync::atomic::{AtomicBool, Ordering};

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.ctx.jobs)
            .build()
            .map_err(|e| SarError::Processing(format!("Failed to build worker pool: {}", e)))?;

        // Set by the first error; units not yet started stay pending, like the sequential break
        let halted = AtomicBool::new(false);

        log::info!("Running acquisitions on {} workers", self.ctx.jobs);
        Ok(pool.install(|| {
            groups
                .par_iter()
                .map(|group| {
                    if halted.load(Ordering::SeqCst) {
                        log::info!("{} not started, run halted", self.label(group));
                        return Ok(UnitState::Pending);
                    }
                    let result = self.process_group(group);
                    if result.is_err() {
                        halted.store(true, Ordering::SeqCst);
                    }
                    result
                })
                .collect()
        }))
    }

    #[cfg(not(feature = "parallel"))]
    fn process_parallel(&self, groups: &[&AcquisitionGroup]) -> SarResult<Vec<SarResult<UnitState>>> {
        log::warn!("Built without the parallel feature, processing acquisitions sequentially");
        Ok(self.process_sequential(groups))
    }

    /// Stops at the first error
    fn process_sequential(&self, groups: &[&AcquisitionGroup]) -> Vec<SarResult<UnitState>> {
        let mut results = Vec::with_capacity(groups.len());
        for group in groups {
            let result = self.process_group(group);
            let halt = result.is_err();
            results.push(result);
            if halt {
                break;
            }
        }
        results
    }

    fn label(&self, group: &AcquisitionGroup) -> String {
        format!("Track {} acquisition {}", group.track, group.date_token())
    }

    fn output_dir(&self, group: &AcquisitionGroup) -> PathBuf {
        self.ctx.layout.acquisition_dir(group.track, &group.date_token())
    }

    /// Convert one acquisition group unless its directory is already marked processed
    pub fn process_group(&self, group: &AcquisitionGroup) -> SarResult<UnitState> {
        let out_dir = self.output_dir(group);
        let output = StageOutput::directory(&out_dir);
        let label = self.label(group);

        self.ctx.process_unit(
            &label,
            &output,
            || self.deferred_command(group, &out_dir),
            || {
                let request = self.request(group, &out_dir);
                log::info!("Processing {} scene(s) of {} to {}", request.inputs.len(), label, out_dir.display());
                self.converter.convert(&self.ctx.engine, &self.ctx.config, &request)
            },
        )
    }

    fn request(&self, group: &AcquisitionGroup, out_dir: &Path) -> ConversionRequest {
        let mut polarizations: Vec<Polarization> = Vec::new();
        for pol in group.scenes.iter().flat_map(|s| s.polarizations.iter()) {
            if !polarizations.contains(pol) {
                polarizations.push(*pol);
            }
        }

        ConversionRequest {
            inputs: group
                .scenes
                .iter()
                .map(|s| resolve_archive(&self.ctx.config.download_dir, &s.identifier))
                .collect(),
            out_dir: out_dir.to_path_buf(),
            file_id: group.file_id(),
            polarizations,
        }
    }

    /// Self-invocation of the CLI converting just this group
    fn deferred_command(&self, group: &AcquisitionGroup, out_dir: &Path) -> SarResult<CommandDescriptor> {
        let config_file = self.ctx.config.source.as_ref().ok_or_else(|| {
            SarError::Config("deferred acquisition units need a configuration file".to_string())
        })?;

        let mut builder = CommandBuilder::new("ARD", &self.ctx.program)
            .arg("unit-ard")
            .path_option("--config", config_file)
            .option("--track", group.track)
            .option("--date", group.date_token());
        for id in group.identifiers() {
            builder = builder.arg(id);
        }

        builder
            .output(out_dir)
            .log_file(out_dir.join(format!("{}.errLog", group.file_id())))
            .class(FailureClass::Critical)
            .build()
    }
}
