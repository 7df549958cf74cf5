//! sardine-batch: batch orchestration of Sentinel-1 GRD processing
//!
//! Groups a scene inventory into per-track acquisitions and drives them through
//! analysis-ready products, per-track time series, timescans and cross-track
//! mosaics. The heavy lifting is done by external tools (SNAP `gpt`, GDAL and a
//! raster helper); this crate decides which calls to make, skips work that is
//! already checkpointed, retries failed calls and can defer everything to an
//! external scheduler.

pub mod types;
pub mod io;
pub mod core;

#[cfg(feature = "python")]
mod python;

// Re-export main types and functions for easier access
pub use types::{
    AcquisitionGroup, Polarization, ProcessingUnit, SarError, SarResult, SceneRecord, Track,
};

pub use io::{load_inventory, CheckpointStore, FsCheckpointStore, ProcessingConfig, ProcessingLayout};

pub use crate::core::{
    build_processing_units, DeferredQueue, EngineClient, FailurePolicy, Pipeline, PipelineReport, Stage,
    StageContext,
};
