//! Structured command lines for the external collaborators.
//!
//! Every invocation is built as a [`CommandDescriptor`]: program, argument vector,
//! the output it produces, its own log file and how an exhausted failure is treated.
//! Arguments are never joined into a shell string, so paths with spaces or quotes
//! pass through untouched.

use crate::io::config::{CalibrationTarget, OutputDataType, ProcessingConfig};
use crate::types::{Polarization, SarError, SarResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// What an exhausted retry budget means for the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureClass {
    /// Raise an engine failure (speckle filtering, dB conversion, terrain correction, masks, ...)
    Critical,
    /// Log and hand back the return code (calibration, multi-looking)
    BestEffort,
}

/// A fully materialised invocation of an external program
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// Operation name used in logs and errors
    pub label: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Output written by the command
    pub output: PathBuf,
    /// Per-invocation log receiving the program's stdout/stderr
    pub log_file: PathBuf,
    pub class: FailureClass,
}

impl CommandDescriptor {
    /// Reject descriptors that cannot be executed safely
    pub fn validate(&self) -> SarResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(SarError::InvalidArgument(format!("{}: empty program", self.label)));
        }

        for arg in &self.args {
            if arg.contains('\0') {
                return Err(SarError::InvalidArgument(format!(
                    "{}: argument contains a NUL byte: {:?}",
                    self.label, arg
                )));
            }
            if arg.starts_with("-P") && (arg.contains('\n') || arg.contains('\r')) {
                return Err(SarError::InvalidArgument(format!(
                    "{}: parameter spans several lines: {:?}",
                    self.label, arg
                )));
            }
        }

        if self.output.as_os_str().is_empty() {
            return Err(SarError::InvalidArgument(format!("{}: no output path", self.label)));
        }

        if self.log_file.as_os_str().is_empty() {
            return Err(SarError::InvalidArgument(format!("{}: no log file", self.label)));
        }

        Ok(())
    }
}

impl std::fmt::Display for CommandDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", quote(&self.program.to_string_lossy()))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

/// Quote for display only; execution never goes through a shell
fn quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,+@%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn path_arg(path: &Path) -> SarResult<String> {
    path.to_str()
        .map(str::to_string)
        .ok_or_else(|| SarError::InvalidArgument(format!("path is not valid UTF-8: {}", path.display())))
}

/// Incremental builder; errors are collected and reported by `build`
#[derive(Debug)]
pub struct CommandBuilder {
    label: String,
    program: PathBuf,
    args: Vec<String>,
    output: Option<PathBuf>,
    log_file: Option<PathBuf>,
    class: FailureClass,
    error: Option<SarError>,
}

impl CommandBuilder {
    pub fn new<P: Into<PathBuf>>(label: &str, program: P) -> Self {
        Self {
            label: label.to_string(),
            program: program.into(),
            args: Vec::new(),
            output: None,
            log_file: None,
            class: FailureClass::Critical,
            error: None,
        }
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path(mut self, path: &Path) -> Self {
        match path_arg(path) {
            Ok(arg) => self.args.push(arg),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn paths<'a, I: IntoIterator<Item = &'a PathBuf>>(mut self, paths: I) -> Self {
        for path in paths {
            self = self.path(path);
        }
        self
    }

    /// Flag followed by its value: `--flag value`
    pub fn option<S: std::fmt::Display>(self, flag: &str, value: S) -> Self {
        self.arg(flag).arg(value.to_string())
    }

    /// Flag followed by a path value
    pub fn path_option(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).path(path)
    }

    /// Engine operator parameter: `-P{key}={value}`
    pub fn param<S: std::fmt::Display>(self, key: &str, value: S) -> Self {
        self.arg(format!("-P{}={}", key, value))
    }

    /// Engine operator parameter holding a path
    pub fn path_param(mut self, key: &str, path: &Path) -> Self {
        match path_arg(path) {
            Ok(value) => self.args.push(format!("-P{}={}", key, value)),
            Err(e) => {
                self.error.get_or_insert(e);
            }
        }
        self
    }

    pub fn output<P: Into<PathBuf>>(mut self, output: P) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn log_file<P: Into<PathBuf>>(mut self, log_file: P) -> Self {
        self.log_file = Some(log_file.into());
        self
    }

    pub fn class(mut self, class: FailureClass) -> Self {
        self.class = class;
        self
    }

    pub fn build(self) -> SarResult<CommandDescriptor> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let descriptor = CommandDescriptor {
            label: self.label,
            program: self.program,
            args: self.args,
            output: self.output.unwrap_or_default(),
            log_file: self.log_file.unwrap_or_default(),
            class: self.class,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }
}

/// Inputs of a time-series assembly: one product per acquisition date
#[derive(Debug, Clone)]
pub struct TimeseriesRequest<'a> {
    pub channel: Polarization,
    /// `(YYYYMMDD, product)` ordered by date
    pub products: &'a [(String, PathBuf)],
    pub extent: &'a Path,
    pub ls_mask: Option<&'a Path>,
    pub output_dir: &'a Path,
    pub output: &'a Path,
}

/// Inputs of a timescan computation for one channel
#[derive(Debug, Clone)]
pub struct TimescanRequest<'a> {
    pub timeseries: &'a Path,
    /// Output layers are written as `{prefix}.{metric}.tif`; also the command's output
    pub prefix: &'a Path,
    pub metrics: &'a [String],
    pub dates: &'a [String],
}

/// Builds the command lines of all collaborators from one configuration
#[derive(Debug, Clone, Copy)]
pub struct CommandFactory<'a> {
    config: &'a ProcessingConfig,
}

impl<'a> CommandFactory<'a> {
    pub fn new(config: &'a ProcessingConfig) -> Self {
        Self { config }
    }

    fn gpt(&self, operator: &str) -> CommandBuilder {
        CommandBuilder::new(operator, self.config.toolchain.gpt_path())
            .arg(operator)
            .arg("-x")
            .option("-q", self.config.cpus)
    }

    /// Merge co-temporal adjacent scenes into one product
    pub fn slice_assembly(
        &self,
        inputs: &[PathBuf],
        polarizations: &[Polarization],
        outfile: &Path,
        log_file: &Path,
    ) -> SarResult<CommandDescriptor> {
        let pols: Vec<String> = polarizations.iter().map(|p| p.to_string()).collect();
        let mut builder = self.gpt("SliceAssembly");
        if !pols.is_empty() {
            builder = builder.param("selectedPolarisations", pols.join(","));
        }
        builder
            .arg("-t")
            .path(outfile)
            .paths(inputs)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    pub fn calibration(&self, infile: &Path, outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        let target = self.config.parameters.single_ard.calibrate_to;
        log::info!("Calibrating the product to {}.", target);

        self.gpt("Calibration")
            .param("outputBetaBand", target == CalibrationTarget::Beta0)
            .param("outputGammaBand", target == CalibrationTarget::Gamma0)
            .param("outputSigmaBand", target == CalibrationTarget::Sigma0)
            .arg("-t")
            .path(outfile)
            .path(infile)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::BestEffort)
            .build()
    }

    pub fn multi_look(&self, infile: &Path, outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        let ard = &self.config.parameters.single_ard;
        log::info!(
            "Multi-looking the image with {} looks in azimuth and {} looks in range.",
            ard.azimuth_looks,
            ard.range_looks
        );

        self.gpt("Multilook")
            .param("nAzLooks", ard.azimuth_looks)
            .param("nRgLooks", ard.range_looks)
            .arg("-t")
            .path(outfile)
            .path(infile)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::BestEffort)
            .build()
    }

    pub fn speckle_filter(&self, infile: &Path, outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        let speckle = &self.config.parameters.single_ard.speckle_filter;

        self.gpt("Speckle-Filter")
            .param("estimateENL", speckle.estimate_enl)
            .param("anSize", speckle.pan_size)
            .param("dampingFactor", speckle.damping)
            .param("enl", speckle.enl)
            .param("filter", &speckle.filter)
            .param("filterSizeX", speckle.filter_x_size)
            .param("filterSizeY", speckle.filter_y_size)
            .param("numLooksStr", speckle.num_of_looks)
            .param("sigmaStr", speckle.sigma)
            .param("targetWindowSizeStr", &speckle.target_window_size)
            .param("windowSize", &speckle.window_size)
            .arg("-t")
            .path(outfile)
            .path(infile)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    pub fn linear_to_db(&self, infile: &Path, outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        self.gpt("LinearToFromdB")
            .arg("-t")
            .path(outfile)
            .path(infile)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    pub fn terrain_correction(&self, infile: &Path, outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        let ard = &self.config.parameters.single_ard;
        let dem = &ard.dem;

        self.gpt("Terrain-Correction")
            .param("demName", &dem.dem_name)
            .param("demResamplingMethod", &dem.dem_resampling)
            .param("externalDEMFile", &dem.dem_file)
            .param("externalDEMNoDataValue", dem.dem_nodata)
            .param("externalDEMApplyEGM", dem.egm_correction)
            .param("imgResamplingMethod", &dem.image_resampling)
            .param("pixelSpacingInMeter", ard.resolution)
            .arg("-t")
            .path(outfile)
            .path(infile)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    /// Layover/shadow mask through the engine graph
    pub fn ls_mask(&self, infile: &Path, outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        let ard = &self.config.parameters.single_ard;
        let dem = &ard.dem;
        let graph = self.config.toolchain.ls_mask_graph()?;
        log::info!("Creating the Layover/Shadow mask");

        CommandBuilder::new("Layover/Shadow mask", self.config.toolchain.gpt_path())
            .path(&graph)
            .arg("-x")
            .option("-q", self.config.cpus)
            .path_param("input", infile)
            .param("resol", ard.resolution)
            .param("dem", &dem.dem_name)
            .param("dem_file", &dem.dem_file)
            .param("dem_nodata", dem.dem_nodata)
            .param("dem_resampling", &dem.dem_resampling)
            .param("image_resampling", &dem.image_resampling)
            .param("egm_correction", dem.egm_correction)
            .path_param("output", outfile)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    /// Cross-track mosaic, optionally cropped to the area of interest
    pub fn mosaic(&self, inputs: &[PathBuf], outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        let mut builder = CommandBuilder::new("Mosaic", &self.config.toolchain.gdalwarp)
            .arg("-overwrite")
            .option("-srcnodata", 0)
            .option("-dstnodata", 0)
            .option("-co", "COMPRESS=DEFLATE")
            .option("-co", "TILED=YES")
            .option("-co", "BIGTIFF=IF_SAFER");

        if self.config.parameters.mosaic.cut_to_aoi {
            let aoi = self
                .config
                .aoi
                .as_ref()
                .ok_or_else(|| SarError::Config("cut to aoi requires an aoi file".to_string()))?;
            builder = builder.path_option("-cutline", aoi).arg("-crop_to_cutline");
        }

        builder
            .paths(inputs)
            .path(outfile)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    /// Virtual band stack over `inputs`
    pub fn build_vrt(&self, inputs: &[PathBuf], outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        CommandBuilder::new("BuildVRT", &self.config.toolchain.gdalbuildvrt)
            .arg("-overwrite")
            .arg("-separate")
            .option("-srcnodata", 0)
            .path(outfile)
            .paths(inputs)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    /// Common valid-data extent of a track's acquisitions
    pub fn extent(&self, inputs: &[PathBuf], outfile: &Path, log_file: &Path) -> SarResult<CommandDescriptor> {
        CommandBuilder::new("Extent", &self.config.toolchain.raster_helper)
            .arg("extent")
            .arg("--buffer=-0.0018")
            .path_option("--temp-dir", &self.config.temp_dir())
            .path_option("--output", outfile)
            .paths(inputs)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    /// Combined layover/shadow mask of a track, cut to its extent
    pub fn combine_ls_masks(
        &self,
        inputs: &[PathBuf],
        extent: &Path,
        outfile: &Path,
        log_file: &Path,
    ) -> SarResult<CommandDescriptor> {
        let mut builder = CommandBuilder::new("Layover/Shadow combination", &self.config.toolchain.raster_helper)
            .arg("ls-mask")
            .path_option("--extent", extent)
            .path_option("--temp-dir", &self.config.temp_dir())
            .path_option("--output", outfile);

        if self.config.parameters.single_ard.apply_ls_mask {
            builder = builder.arg("--apply");
        }

        builder
            .paths(inputs)
            .output(outfile)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    /// Time-series stack of one channel
    pub fn timeseries(&self, request: &TimeseriesRequest<'_>, log_file: &Path) -> SarResult<CommandDescriptor> {
        let ts = &self.config.parameters.time_series;
        let dates: Vec<&str> = request.products.iter().map(|(d, _)| d.as_str()).collect();
        let products: Vec<PathBuf> = request.products.iter().map(|(_, p)| p.clone()).collect();

        let mut builder = CommandBuilder::new("Timeseries", &self.config.toolchain.raster_helper)
            .arg("timeseries")
            .option("--channel", request.channel)
            .option("--product", crate::io::layout::BACKSCATTER)
            .option("--dates", dates.join(","))
            .path_option("--extent", request.extent);

        if let Some(mask) = request.ls_mask {
            builder = builder.path_option("--ls-mask", mask);
        }
        if ts.to_db {
            builder = builder.arg("--to-db");
        }
        if ts.dtype_output != OutputDataType::Float32 {
            builder = builder.option("--dtype", ts.dtype_output);
        }
        if ts.remove_mt_speckle {
            builder = builder.arg("--remove-mt-speckle");
        }

        builder
            .path_option("--temp-dir", &self.config.temp_dir())
            .path_option("--output-dir", request.output_dir)
            .paths(&products)
            .output(request.output)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }

    /// Temporal statistics of one channel's time series
    pub fn timescan(&self, request: &TimescanRequest<'_>, log_file: &Path) -> SarResult<CommandDescriptor> {
        let scan = &self.config.parameters.time_scan;
        let percentiles: Vec<String> = scan.percentiles.iter().map(|p| p.to_string()).collect();

        let mut builder = CommandBuilder::new("Timescan", &self.config.toolchain.raster_helper)
            .arg("timescan")
            .path_option("--input", request.timeseries)
            .path_option("--prefix", request.prefix)
            .option("--metrics", request.metrics.join(","))
            .option("--dates", request.dates.join(","));

        if request.metrics.iter().any(|m| m == "percentiles") {
            builder = builder.option("--percentiles", percentiles.join(","));
        }
        if self.config.timescan_to_db() {
            builder = builder.arg("--to-db");
        }
        if let Some(dtype) = self.config.timescan_rescale() {
            builder = builder.option("--rescale", dtype);
        }
        if scan.remove_outliers {
            builder = builder.arg("--remove-outliers");
        }

        builder
            .output(request.prefix)
            .log_file(log_file)
            .class(FailureClass::Critical)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ProcessingConfig {
        let mut config = ProcessingConfig::new("/data/download", "/data/processing");
        config.cpus = 4;
        config.toolchain.gpt = Some(PathBuf::from("/opt/snap/bin/gpt"));
        config
    }

    #[test]
    fn test_calibration_command_is_best_effort() {
        let config = config();
        let cmd = CommandFactory::new(&config)
            .calibration(Path::new("/in/scene.zip"), Path::new("/tmp/cal"), Path::new("/tmp/cal.errLog"))
            .unwrap();

        assert_eq!(cmd.class, FailureClass::BestEffort);
        assert_eq!(cmd.program, PathBuf::from("/opt/snap/bin/gpt"));
        assert_eq!(
            cmd.args,
            vec![
                "Calibration", "-x", "-q", "4",
                "-PoutputBetaBand=false",
                "-PoutputGammaBand=true",
                "-PoutputSigmaBand=false",
                "-t", "/tmp/cal", "/in/scene.zip",
            ]
        );
    }

    #[test]
    fn test_critical_engine_steps() {
        let config = config();
        let factory = CommandFactory::new(&config);
        let (i, o, l) = (Path::new("/i"), Path::new("/o"), Path::new("/l"));

        assert_eq!(factory.speckle_filter(i, o, l).unwrap().class, FailureClass::Critical);
        assert_eq!(factory.linear_to_db(i, o, l).unwrap().class, FailureClass::Critical);
        assert_eq!(factory.terrain_correction(i, o, l).unwrap().class, FailureClass::Critical);
        assert_eq!(factory.multi_look(i, o, l).unwrap().class, FailureClass::BestEffort);
    }

    #[test]
    fn test_paths_with_spaces_stay_single_arguments() {
        let config = config();
        let inputs = vec![PathBuf::from("/data/my tracks/117/bs.VV.avg.tif"), PathBuf::from("/data/it's/44/bs.VV.avg.tif")];
        let cmd = CommandFactory::new(&config)
            .mosaic(&inputs, Path::new("/data/out/bs.VV.avg.tif"), Path::new("/data/out/bs.VV.avg.errLog"))
            .unwrap();

        assert!(cmd.args.contains(&"/data/my tracks/117/bs.VV.avg.tif".to_string()));
        assert!(cmd.args.contains(&"/data/it's/44/bs.VV.avg.tif".to_string()));
        assert!(cmd.to_string().contains("'/data/my tracks/117/bs.VV.avg.tif'"));
    }

    #[test]
    fn test_mosaic_cutline() {
        let mut config = config();
        config.parameters.mosaic.cut_to_aoi = true;
        let factory = CommandFactory::new(&config);
        assert!(factory.mosaic(&[], Path::new("/o.tif"), Path::new("/o.errLog")).is_err());

        config.aoi = Some(PathBuf::from("/data/aoi.gpkg"));
        let cmd = CommandFactory::new(&config)
            .mosaic(&[], Path::new("/o.tif"), Path::new("/o.errLog"))
            .unwrap();
        let pos = cmd.args.iter().position(|a| a == "-cutline").unwrap();
        assert_eq!(cmd.args[pos + 1], "/data/aoi.gpkg");
        assert_eq!(cmd.args[pos + 2], "-crop_to_cutline");
    }

    #[test]
    fn test_validation_rejects_nul_and_multiline_params() {
        let nul = CommandBuilder::new("X", "prog")
            .arg("a\0b")
            .output("/o")
            .log_file("/l")
            .build();
        assert!(matches!(nul, Err(SarError::InvalidArgument(_))));

        let multiline = CommandBuilder::new("X", "prog")
            .param("filter", "Lee\nSigma")
            .output("/o")
            .log_file("/l")
            .build();
        assert!(multiline.is_err());

        let no_output = CommandBuilder::new("X", "prog").log_file("/l").build();
        assert!(no_output.is_err());
    }

    #[test]
    fn test_timescan_flags_follow_config() {
        let mut config = config();
        config.parameters.single_ard.to_db = true;
        config.parameters.time_series.dtype_output = OutputDataType::Uint8;
        config.parameters.time_scan.remove_outliers = true;

        let metrics = vec!["avg".to_string(), "percentiles".to_string()];
        let dates = vec!["20200101".to_string(), "20200113".to_string()];
        let request = TimescanRequest {
            timeseries: Path::new("/p/117/Timeseries/Timeseries.bs.VV.vrt"),
            prefix: Path::new("/p/117/Timescan/bs.VV"),
            metrics: &metrics,
            dates: &dates,
        };
        let cmd = CommandFactory::new(&config)
            .timescan(&request, Path::new("/p/117/Timescan/bs.VV.errLog"))
            .unwrap();

        assert!(cmd.args.contains(&"--to-db".to_string()));
        assert!(cmd.args.contains(&"--remove-outliers".to_string()));
        assert!(cmd.args.windows(2).any(|w| w[0] == "--rescale" && w[1] == "uint8"));
        assert!(cmd.args.windows(2).any(|w| w[0] == "--percentiles" && w[1] == "95,5"));
        assert!(cmd.args.windows(2).any(|w| w[0] == "--dates" && w[1] == "20200101,20200113"));
        assert_eq!(cmd.output, Path::new("/p/117/Timescan/bs.VV"));
    }
}
