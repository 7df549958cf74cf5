//! Cross-track mosaics of time-series slots and timescan metrics.

use crate::core::dispatch::{StageContext, StageReport};
use crate::io::checkpoint::StageOutput;
use crate::io::layout::{DateLabel, TimescanFileName, TimeseriesFileName};
use crate::types::{Polarization, ProcessingUnit, SarResult, Track};
use std::path::{Path, PathBuf};

/// Minimum number of tracks contributing to a timescan mosaic
pub const MIN_MOSAIC_TRACKS: usize = 2;

/// Replace composite metrics by the layers they produce.
///
/// `harmonics` becomes `amplitude`, `phase`, `residuals`; `percentiles` becomes one
/// `p{x}` per configured percentile. Other metrics keep their position.
pub fn expand_metrics(metrics: &[String], percentiles: &[u8]) -> Vec<String> {
    let mut expanded: Vec<String> = metrics
        .iter()
        .filter(|m| *m != "harmonics" && *m != "percentiles")
        .cloned()
        .collect();

    if metrics.iter().any(|m| m == "harmonics") {
        expanded.extend(["amplitude", "phase", "residuals"].iter().map(|m| m.to_string()));
    }

    if metrics.iter().any(|m| m == "percentiles") {
        expanded.extend(percentiles.iter().map(|p| format!("p{}", p)));
    }

    expanded
}

fn is_mosaic_output(path: &Path) -> bool {
    path.components().any(|c| c.as_os_str() == "Mosaic")
}

pub struct MosaicStage<'a> {
    ctx: &'a StageContext,
}

impl<'a> MosaicStage<'a> {
    pub fn new(ctx: &'a StageContext) -> Self {
        Self { ctx }
    }

    fn tracks(units: &[ProcessingUnit]) -> Vec<Track> {
        units.iter().map(|u| u.track).collect()
    }

    /// Mosaic every time-series slot across tracks, then stack each channel virtually
    pub fn run_timeseries(&self, units: &[ProcessingUnit]) -> SarResult<StageReport> {
        let mut report = StageReport::new("Timeseries mosaic");
        let layout = &self.ctx.layout;
        let mosaic_dir = layout.mosaic_timeseries_dir();
        let tracks = Self::tracks(units);

        let Some(reference) = tracks.first().copied() else {
            return Ok(report);
        };

        for channel in Polarization::PROCESSING_ORDER {
            let slots = layout.timeseries_layers(reference, channel)?.len();
            if slots == 0 {
                continue;
            }

            let mut outfiles = Vec::new();
            for slot in 1..=slots {
                let mut files = Vec::new();
                let mut dates = Vec::new();
                for track in &tracks {
                    for (name, path) in layout.timeseries_layers(*track, channel)? {
                        if name.index == slot && !is_mosaic_output(&path) {
                            dates.push(name.dates.start().to_string());
                            dates.push(name.dates.end().to_string());
                            files.push(path);
                        }
                    }
                }

                let Some(label) = DateLabel::from_tokens(&dates) else {
                    log::info!("No files for time-series slot {} of {}, skipping", slot, channel);
                    continue;
                };

                let name = TimeseriesFileName::new(slot, label, channel).to_string();
                let outfile = mosaic_dir.join(&name);
                let output = StageOutput::file(&outfile);
                outfiles.push(outfile.clone());

                let unit_label = format!("Mosaic layer {}", name);
                let log_file = mosaic_dir.join(format!("{}.errLog", name.trim_end_matches(".tif")));
                let state = self.ctx.run_command(&unit_label, &output, || {
                    log::info!("Mosaicking layer {} from {} track(s)", name, files.len());
                    self.ctx.commands().mosaic(&files, &outfile, &log_file)
                })?;
                report.record(&unit_label, &output, state);
            }

            if !self.ctx.is_deferred() && !outfiles.is_empty() {
                let vrt = mosaic_dir.join(format!("Timeseries.{}.vrt", channel));
                let command = self.ctx.commands().build_vrt(
                    &outfiles,
                    &vrt,
                    &mosaic_dir.join(format!("Timeseries.{}.vrt.errLog", channel)),
                )?;
                self.ctx.run_untracked(&command)?;
            }
        }

        log::info!("{}", report);
        Ok(report)
    }

    /// Mosaic every timescan metric found in at least two tracks
    pub fn run_timescan(&self, units: &[ProcessingUnit]) -> SarResult<StageReport> {
        let mut report = StageReport::new("Timescan mosaic");
        let layout = &self.ctx.layout;
        let mosaic_dir = layout.mosaic_timescan_dir();
        let tracks = Self::tracks(units);
        let scan = &self.ctx.config.parameters.time_scan;
        let metrics = expand_metrics(&scan.metrics, &scan.percentiles);

        let mut outfiles: Vec<PathBuf> = Vec::new();
        for channel in Polarization::MOSAIC_ORDER {
            for metric in &metrics {
                let name = TimescanFileName::new(channel, metric).to_string();
                let files: Vec<PathBuf> = tracks
                    .iter()
                    .map(|t| layout.timescan_dir(*t).join(&name))
                    .filter(|p| p.is_file())
                    .collect();

                if files.len() < MIN_MOSAIC_TRACKS {
                    log::debug!("{} found in {} track(s), no mosaic", name, files.len());
                    continue;
                }

                let outfile = mosaic_dir.join(&name);
                let output = StageOutput::file(&outfile);
                outfiles.push(outfile.clone());

                let unit_label = format!("Mosaic layer {}", name);
                let log_file = mosaic_dir.join(format!("{}.errLog", name.trim_end_matches(".tif")));
                let state = self.ctx.run_command(&unit_label, &output, || {
                    log::info!("Mosaicking layer {} from {} tracks", name, files.len());
                    self.ctx.commands().mosaic(&files, &outfile, &log_file)
                })?;
                report.record(&unit_label, &output, state);
            }
        }

        if !self.ctx.is_deferred() && !outfiles.is_empty() {
            let command = self.ctx.commands().build_vrt(
                &outfiles,
                &mosaic_dir.join("Timescan.vrt"),
                &mosaic_dir.join("Timescan.vrt.errLog"),
            )?;
            self.ctx.run_untracked(&command)?;
        }

        log::info!("{}", report);
        Ok(report)
    }
}
