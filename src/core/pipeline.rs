//! Pipeline orchestrator: runs the stages in dependency order over one inventory.

use crate::core::ard::{ArdStage, ProductConverter};
use crate::core::dispatch::{StageContext, StageReport};
use crate::core::grouping::build_processing_units;
use crate::core::mosaic::MosaicStage;
use crate::core::timescan::TimescanStage;
use crate::core::timeseries::TimeseriesStage;
use crate::types::{ProcessingUnit, SarError, SarResult, SceneRecord};
use std::str::FromStr;
use std::sync::Arc;

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Ard,
    Timeseries,
    Timescan,
    MosaicTimeseries,
    MosaicTimescan,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Ard,
        Stage::Timeseries,
        Stage::Timescan,
        Stage::MosaicTimeseries,
        Stage::MosaicTimescan,
    ];
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Ard => write!(f, "ard"),
            Stage::Timeseries => write!(f, "timeseries"),
            Stage::Timescan => write!(f, "timescan"),
            Stage::MosaicTimeseries => write!(f, "mosaic-timeseries"),
            Stage::MosaicTimescan => write!(f, "mosaic-timescan"),
        }
    }
}

impl FromStr for Stage {
    type Err = SarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ard" | "grd-to-ard" => Ok(Stage::Ard),
            "timeseries" => Ok(Stage::Timeseries),
            "timescan" => Ok(Stage::Timescan),
            "mosaic-timeseries" => Ok(Stage::MosaicTimeseries),
            "mosaic-timescan" => Ok(Stage::MosaicTimescan),
            _ => Err(SarError::InvalidArgument(format!("Unknown stage: {}", s))),
        }
    }
}

/// Reports of every stage that ran
#[derive(Debug, Clone, Default)]
pub struct PipelineReport {
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn has_failures(&self) -> bool {
        self.stages.iter().any(|s| s.has_failures())
    }

    pub fn stage(&self, name: &str) -> Option<&StageReport> {
        self.stages.iter().find(|s| s.stage == name)
    }
}

/// Groups the inventory once and drives the stages over it
pub struct Pipeline {
    ctx: StageContext,
    units: Vec<ProcessingUnit>,
    converter: Option<Arc<dyn ProductConverter>>,
}

impl Pipeline {
    pub fn new(ctx: StageContext, scenes: &[SceneRecord]) -> Self {
        let units = build_processing_units(scenes);
        log::info!(
            "Inventory of {} scenes in {} track(s)",
            scenes.len(),
            units.len()
        );

        Self {
            ctx,
            units,
            converter: None,
        }
    }

    /// Replace the default product conversion
    pub fn with_converter(mut self, converter: Arc<dyn ProductConverter>) -> Self {
        self.converter = Some(converter);
        self
    }

    pub fn context(&self) -> &StageContext {
        &self.ctx
    }

    pub fn units(&self) -> &[ProcessingUnit] {
        &self.units
    }

    pub fn run_stage(&self, stage: Stage) -> SarResult<StageReport> {
        log::info!("Starting stage {}", stage);
        match stage {
            Stage::Ard => match &self.converter {
                Some(converter) => ArdStage::with_converter(&self.ctx, Arc::clone(converter)).run(&self.units),
                None => ArdStage::new(&self.ctx).run(&self.units),
            },
            Stage::Timeseries => TimeseriesStage::new(&self.ctx).run(&self.units),
            Stage::Timescan => TimescanStage::new(&self.ctx).run(&self.units),
            Stage::MosaicTimeseries => MosaicStage::new(&self.ctx).run_timeseries(&self.units),
            Stage::MosaicTimescan => MosaicStage::new(&self.ctx).run_timescan(&self.units),
        }
    }

    /// Run `stages` in pipeline order; a hard failure under fail-fast ends the run
    pub fn run(&self, stages: &[Stage]) -> SarResult<PipelineReport> {
        let mut ordered = stages.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut report = PipelineReport::default();
        for stage in ordered {
            report.stages.push(self.run_stage(stage)?);
        }

        if report.has_failures() {
            log::warn!("Pipeline finished with failures; re-run to resume from the checkpoints");
        } else {
            log::info!("Pipeline finished");
        }
        Ok(report)
    }

    pub fn run_all(&self) -> SarResult<PipelineReport> {
        self.run(&Stage::ALL)
    }
}
