//! I/O modules: configuration, scene inventory, processing tree layout and checkpoints

pub mod config;
pub mod inventory;
pub mod layout;
pub mod checkpoint;

pub use config::ProcessingConfig;
pub use inventory::{load_inventory, SceneId};
pub use layout::{DateLabel, ProcessingLayout, TimescanFileName, TimeseriesFileName};
pub use checkpoint::{CheckpointStore, FsCheckpointStore, MemoryCheckpointStore, OutputLocks, StageOutput};
