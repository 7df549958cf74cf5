//! Core batch modules: grouping, collaborator commands, engine client, stage drivers

pub mod grouping;
pub mod command;
pub mod engine;
pub mod dispatch;
pub mod ard;
pub mod timeseries;
pub mod timescan;
pub mod mosaic;
pub mod pipeline;

// Re-export main types
pub use grouping::build_processing_units;
pub use command::{CommandBuilder, CommandDescriptor, CommandFactory, FailureClass};
pub use engine::{CommandRunner, EngineClient, ProcessRunner, RetryPolicy};
pub use dispatch::{DeferredQueue, FailurePolicy, StageContext, StageReport, UnitState};
pub use ard::{ArdStage, ConversionRequest, GptProductConverter, ProductConverter};
pub use timeseries::TimeseriesStage;
pub use timescan::TimescanStage;
pub use mosaic::{expand_metrics, MosaicStage};
pub use pipeline::{Pipeline, PipelineReport, Stage};
