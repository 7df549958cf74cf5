//! Processing configuration, loaded once per pipeline run.
//!
//! The document follows the JSON layout of the project files written by the
//! inventory/search tooling: directories at the top level and one parameter
//! block per stage under `processing parameters`.

use crate::types::{SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete configuration of a batch run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Root of the downloaded scene archives
    pub download_dir: PathBuf,

    /// Root of all intermediate and final products
    pub processing_dir: PathBuf,

    /// Scratch space for intermediate engine products (default: `{processing_dir}/temp`)
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,

    /// Area of interest vector file used when cropping mosaics
    #[serde(default)]
    pub aoi: Option<PathBuf>,

    /// Number of cores handed to the engine
    #[serde(default = "default_cpus")]
    pub cpus: usize,

    #[serde(rename = "processing parameters")]
    pub parameters: ProcessingParameters,

    #[serde(default)]
    pub toolchain: ToolchainConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    /// File this configuration was read from, used to re-invoke the CLI for deferred units
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

fn default_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Per-stage parameter groups
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingParameters {
    #[serde(rename = "single ARD", default)]
    pub single_ard: SingleArdParams,

    #[serde(rename = "time-series ARD", default)]
    pub time_series: TimeseriesParams,

    #[serde(rename = "time-scan ARD", default)]
    pub time_scan: TimescanParams,

    #[serde(default)]
    pub mosaic: MosaicParams,
}

/// Radiometric calibration target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationTarget {
    Sigma0,
    Beta0,
    Gamma0,
}

impl std::fmt::Display for CalibrationTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CalibrationTarget::Sigma0 => write!(f, "sigma0"),
            CalibrationTarget::Beta0 => write!(f, "beta0"),
            CalibrationTarget::Gamma0 => write!(f, "gamma0"),
        }
    }
}

/// Output numeric type of raster products
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputDataType {
    Float32,
    Uint16,
    Uint8,
}

impl std::fmt::Display for OutputDataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputDataType::Float32 => write!(f, "float32"),
            OutputDataType::Uint16 => write!(f, "uint16"),
            OutputDataType::Uint8 => write!(f, "uint8"),
        }
    }
}

/// Parameters of the single-acquisition (ARD) products
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SingleArdParams {
    /// Output pixel spacing in meters
    #[serde(default = "default_resolution")]
    pub resolution: u32,

    #[serde(rename = "calibrate to", default = "default_calibration")]
    pub calibrate_to: CalibrationTarget,

    #[serde(rename = "range looks", default = "default_looks")]
    pub range_looks: u32,

    #[serde(rename = "azimuth looks", default = "default_looks")]
    pub azimuth_looks: u32,

    #[serde(rename = "remove speckle", default)]
    pub remove_speckle: bool,

    #[serde(rename = "speckle filter", default)]
    pub speckle_filter: SpeckleFilterParams,

    #[serde(rename = "to db", default)]
    pub to_db: bool,

    #[serde(rename = "create ls mask", default)]
    pub create_ls_mask: bool,

    #[serde(rename = "apply ls mask", default)]
    pub apply_ls_mask: bool,

    #[serde(default)]
    pub dem: DemParams,
}

impl Default for SingleArdParams {
    fn default() -> Self {
        Self {
            resolution: default_resolution(),
            calibrate_to: default_calibration(),
            range_looks: 1,
            azimuth_looks: 1,
            remove_speckle: false,
            speckle_filter: SpeckleFilterParams::default(),
            to_db: false,
            create_ls_mask: false,
            apply_ls_mask: false,
            dem: DemParams::default(),
        }
    }
}

impl SingleArdParams {
    /// Whether any stage needs the layover/shadow products
    pub fn needs_ls_mask(&self) -> bool {
        self.create_ls_mask || self.apply_ls_mask
    }
}

fn default_resolution() -> u32 {
    20
}

fn default_calibration() -> CalibrationTarget {
    CalibrationTarget::Gamma0
}

fn default_looks() -> u32 {
    1
}

fn default_dtype() -> OutputDataType {
    OutputDataType::Float32
}

/// Speckle filter settings, passed through to the engine's Speckle-Filter operator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeckleFilterParams {
    #[serde(default = "default_filter")]
    pub filter: String,
    #[serde(rename = "ENL", default = "default_enl")]
    pub enl: u32,
    #[serde(rename = "estimate ENL", default = "default_true")]
    pub estimate_enl: bool,
    #[serde(default = "default_sigma")]
    pub sigma: f64,
    #[serde(rename = "filter x size", default = "default_filter_size")]
    pub filter_x_size: u32,
    #[serde(rename = "filter y size", default = "default_filter_size")]
    pub filter_y_size: u32,
    #[serde(rename = "window size", default = "default_window_size")]
    pub window_size: String,
    #[serde(rename = "target window size", default = "default_target_window_size")]
    pub target_window_size: String,
    #[serde(rename = "num of looks", default = "default_enl")]
    pub num_of_looks: u32,
    #[serde(default = "default_damping")]
    pub damping: u32,
    #[serde(rename = "pan size", default = "default_pan_size")]
    pub pan_size: u32,
}

impl Default for SpeckleFilterParams {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            enl: 1,
            estimate_enl: true,
            sigma: default_sigma(),
            filter_x_size: 3,
            filter_y_size: 3,
            window_size: default_window_size(),
            target_window_size: default_target_window_size(),
            num_of_looks: 1,
            damping: default_damping(),
            pan_size: default_pan_size(),
        }
    }
}

fn default_filter() -> String {
    "Refined Lee".to_string()
}

fn default_enl() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

fn default_sigma() -> f64 {
    0.9
}

fn default_filter_size() -> u32 {
    3
}

fn default_window_size() -> String {
    "7x7".to_string()
}

fn default_target_window_size() -> String {
    "3x3".to_string()
}

fn default_damping() -> u32 {
    2
}

fn default_pan_size() -> u32 {
    50
}

/// Elevation model used for terrain correction and layover/shadow masks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DemParams {
    #[serde(rename = "dem name", default = "default_dem_name")]
    pub dem_name: String,
    /// External DEM file, only used with `dem name` = "External DEM"
    #[serde(rename = "dem file", default)]
    pub dem_file: String,
    #[serde(rename = "dem nodata", default)]
    pub dem_nodata: f64,
    #[serde(rename = "dem resampling", default = "default_resampling")]
    pub dem_resampling: String,
    #[serde(rename = "image resampling", default = "default_resampling")]
    pub image_resampling: String,
    #[serde(rename = "egm correction", default = "default_true")]
    pub egm_correction: bool,
}

impl Default for DemParams {
    fn default() -> Self {
        Self {
            dem_name: default_dem_name(),
            dem_file: String::new(),
            dem_nodata: 0.0,
            dem_resampling: default_resampling(),
            image_resampling: default_resampling(),
            egm_correction: true,
        }
    }
}

fn default_dem_name() -> String {
    "SRTM 1Sec HGT".to_string()
}

fn default_resampling() -> String {
    "BILINEAR_INTERPOLATION".to_string()
}

/// Multi-temporal parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeseriesParams {
    #[serde(rename = "to db", default)]
    pub to_db: bool,

    #[serde(rename = "dtype output", default = "default_dtype")]
    pub dtype_output: OutputDataType,

    #[serde(rename = "remove mt speckle", default)]
    pub remove_mt_speckle: bool,
}

impl Default for TimeseriesParams {
    fn default() -> Self {
        Self {
            to_db: false,
            dtype_output: OutputDataType::Float32,
            remove_mt_speckle: false,
        }
    }
}

/// Timescan (temporal statistics) parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimescanParams {
    /// Requested metrics, e.g. `avg`, `max`, `min`, `std`, `cov`, `percentiles`, `harmonics`
    #[serde(default = "default_metrics")]
    pub metrics: Vec<String>,

    /// Percentiles produced for the `percentiles` metric
    #[serde(default = "default_percentiles")]
    pub percentiles: Vec<u8>,

    #[serde(rename = "remove outliers", default)]
    pub remove_outliers: bool,
}

impl Default for TimescanParams {
    fn default() -> Self {
        Self {
            metrics: default_metrics(),
            percentiles: default_percentiles(),
            remove_outliers: false,
        }
    }
}

fn default_metrics() -> Vec<String> {
    ["avg", "max", "min", "std", "cov"]
        .iter()
        .map(|m| m.to_string())
        .collect()
}

fn default_percentiles() -> Vec<u8> {
    vec![95, 5]
}

/// Cross-track mosaic parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MosaicParams {
    #[serde(rename = "cut to aoi", default)]
    pub cut_to_aoi: bool,
}

/// Executables of the external collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// SNAP graph processing tool; discovered when not set
    #[serde(default)]
    pub gpt: Option<PathBuf>,

    /// Directory holding the SNAP graph files (layover/shadow graph)
    #[serde(default)]
    pub graph_dir: Option<PathBuf>,

    #[serde(default = "default_gdalbuildvrt")]
    pub gdalbuildvrt: PathBuf,

    #[serde(default = "default_gdalwarp")]
    pub gdalwarp: PathBuf,

    /// Raster helper computing extents, layover masks, time series and timescans
    #[serde(default = "default_raster_helper")]
    pub raster_helper: PathBuf,
}

impl Default for ToolchainConfig {
    fn default() -> Self {
        Self {
            gpt: None,
            graph_dir: None,
            gdalbuildvrt: default_gdalbuildvrt(),
            gdalwarp: default_gdalwarp(),
            raster_helper: default_raster_helper(),
        }
    }
}

fn default_gdalbuildvrt() -> PathBuf {
    PathBuf::from("gdalbuildvrt")
}

fn default_gdalwarp() -> PathBuf {
    PathBuf::from("gdalwarp")
}

fn default_raster_helper() -> PathBuf {
    PathBuf::from("sardine-raster")
}

impl ToolchainConfig {
    /// Path of SNAP's `gpt` executable
    ///
    /// Order: configured path, `SNAP_GPT`, the default SNAP install locations, `gpt` on PATH.
    pub fn gpt_path(&self) -> PathBuf {
        if let Some(gpt) = &self.gpt {
            return gpt.clone();
        }

        if let Ok(gpt) = std::env::var("SNAP_GPT") {
            if !gpt.is_empty() {
                return PathBuf::from(gpt);
            }
        }

        let mut candidates = Vec::new();
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join("esa-snap").join("bin").join("gpt"));
            candidates.push(home.join("snap").join("bin").join("gpt"));
        }
        candidates.push(PathBuf::from("/usr/local/snap/bin/gpt"));
        candidates.push(PathBuf::from("/opt/snap/bin/gpt"));

        for candidate in candidates {
            if candidate.exists() {
                log::debug!("Using gpt from {}", candidate.display());
                return candidate;
            }
        }

        PathBuf::from("gpt")
    }

    /// Graph file computing the layover/shadow mask
    pub fn ls_mask_graph(&self) -> SarResult<PathBuf> {
        self.graph_dir
            .as_ref()
            .map(|dir| dir.join("S1_GRD2ARD").join("3_LSmap.xml"))
            .ok_or_else(|| {
                SarError::Config("toolchain.graph_dir is required for layover/shadow masks".to_string())
            })
    }
}

/// Engine retry budget
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(rename = "max attempts", default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Fixed delay between attempts in milliseconds
    #[serde(rename = "delay ms", default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn default_max_attempts() -> u32 {
    3
}

fn default_delay_ms() -> u64 {
    1
}

impl ProcessingConfig {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> SarResult<Self> {
        log::info!("Reading processing configuration: {}", path.as_ref().display());

        let contents = std::fs::read_to_string(&path)?;
        let mut config = Self::from_json(&contents)?;
        // Deferred commands re-read the file from another working directory
        config.source = Some(std::fs::canonicalize(&path)?);
        Ok(config)
    }

    /// Load configuration from a JSON string
    pub fn from_json(json: &str) -> SarResult<Self> {
        let config: ProcessingConfig = serde_json::from_str(json)?;
        Ok(config)
    }

    /// Minimal configuration with defaults for every parameter block
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(download_dir: P, processing_dir: Q) -> Self {
        Self {
            download_dir: download_dir.into(),
            processing_dir: processing_dir.into(),
            temp_dir: None,
            aoi: None,
            cpus: default_cpus(),
            parameters: ProcessingParameters::default(),
            toolchain: ToolchainConfig::default(),
            retry: RetryConfig::default(),
            source: None,
        }
    }

    /// Scratch directory for intermediate products
    pub fn temp_dir(&self) -> PathBuf {
        self.temp_dir
            .clone()
            .unwrap_or_else(|| self.processing_dir.join("temp"))
    }

    /// Decibel handling for temporal statistics: either the products or the time series are in dB
    pub fn timescan_to_db(&self) -> bool {
        self.parameters.single_ard.to_db || self.parameters.time_series.to_db
    }

    /// Rescaling target for timescans, `None` when the time series stays float32
    pub fn timescan_rescale(&self) -> Option<OutputDataType> {
        match self.parameters.time_series.dtype_output {
            OutputDataType::Float32 => None,
            other => Some(other),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> SarResult<()> {
        if self.download_dir.as_os_str().is_empty() {
            return Err(SarError::Config("download_dir must be set".to_string()));
        }

        if self.processing_dir.as_os_str().is_empty() {
            return Err(SarError::Config("processing_dir must be set".to_string()));
        }

        if self.retry.max_attempts == 0 {
            return Err(SarError::Config("retry.max attempts must be at least 1".to_string()));
        }

        if self.cpus == 0 {
            return Err(SarError::Config("cpus must be at least 1".to_string()));
        }

        if self.parameters.mosaic.cut_to_aoi && self.aoi.is_none() {
            return Err(SarError::Config("cut to aoi requires an aoi file".to_string()));
        }

        let ard = &self.parameters.single_ard;
        if ard.range_looks == 0 || ard.azimuth_looks == 0 {
            return Err(SarError::Config("number of looks must be at least 1".to_string()));
        }

        if ard.needs_ls_mask() {
            self.toolchain.ls_mask_graph()?;
        }

        let scan = &self.parameters.time_scan;
        if let Some(p) = scan.percentiles.iter().find(|p| **p > 100) {
            return Err(SarError::Config(format!("percentile {} is out of range", p)));
        }

        if scan.metrics.iter().any(|m| m == "percentiles") && scan.percentiles.is_empty() {
            return Err(SarError::Config(
                "metric 'percentiles' requested without any percentiles".to_string(),
            ));
        }

        Ok(())
    }
}
