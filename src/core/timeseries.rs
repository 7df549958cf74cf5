//! Product-to-time-series stage: common extent, layover/shadow mask and one stack per channel.

use crate::core::command::TimeseriesRequest;
use crate::core::dispatch::{StageContext, StageReport};
use crate::io::checkpoint::StageOutput;
use crate::io::layout::{list_entries, BACKSCATTER};
use crate::types::{Polarization, ProcessingUnit, SarResult, Track};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Minimum number of acquisitions for a time series
pub const MIN_TIMESERIES_DATES: usize = 2;

fn band_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:Sigma0|Gamma0|Beta0)_(VV|VH|HV|HH)(?:_db)?\.img$").expect("valid band pattern")
    })
}

/// Channel of a calibrated backscatter band file, `None` for anything else
pub fn band_channel(file_name: &str) -> Option<Polarization> {
    let caps = band_pattern().captures(file_name)?;
    caps[1].parse().ok()
}

fn is_layover(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().to_lowercase().contains("layover"))
        .unwrap_or(false)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

pub struct TimeseriesStage<'a> {
    ctx: &'a StageContext,
}

impl<'a> TimeseriesStage<'a> {
    pub fn new(ctx: &'a StageContext) -> Self {
        Self { ctx }
    }

    pub fn run(&self, units: &[ProcessingUnit]) -> SarResult<StageReport> {
        let mut report = StageReport::new("Timeseries");

        for unit in units {
            log::info!("Entering track {}", unit.track);
            self.process_track(unit.track, &mut report)?;
        }

        log::info!("{}", report);
        Ok(report)
    }

    fn process_track(&self, track: Track, report: &mut StageReport) -> SarResult<()> {
        let layout = &self.ctx.layout;
        let commands = self.ctx.commands();
        let ard = &self.ctx.config.parameters.single_ard;

        let (layover, scenes): (Vec<PathBuf>, Vec<PathBuf>) = layout
            .acquisition_rasters(track)?
            .into_iter()
            .partition(|p| is_layover(p));

        if scenes.is_empty() {
            log::info!("No products found for track {}, skipping time series", track);
            return Ok(());
        }

        let extent = layout.extent_file(track);
        let label = format!("Track {} common extent", track);
        let output = StageOutput::file(&extent);
        let state = self.ctx.run_command(&label, &output, || {
            log::info!("Creating common extent mask for track {}", track);
            commands.extent(&scenes, &extent, &layout.track_dir(track).join(format!("{}.extent.errLog", track)))
        })?;
        let extent_failed = state.is_failure();
        report.record(&label, &output, state);

        if extent_failed {
            log::warn!("No common extent for track {}, skipping its time series", track);
            return Ok(());
        }

        if ard.needs_ls_mask() {
            let mask = layout.ls_mask_file(track);
            let label = format!("Track {} layover/shadow mask", track);
            let output = StageOutput::file(&mask);

            if layover.is_empty() {
                log::warn!("No layover/shadow rasters found for track {}", track);
            } else {
                let state = self.ctx.run_command(&label, &output, || {
                    log::info!("Creating common Layover/Shadow mask for track {}", track);
                    commands.combine_ls_masks(
                        &layover,
                        &extent,
                        &mask,
                        &layout.track_dir(track).join(format!("{}.ls_mask.errLog", track)),
                    )
                })?;
                report.record(&label, &output, state);
            }
        }

        let ls_mask = layout.ls_mask_file(track);
        let ls_mask = (ard.apply_ls_mask && (self.ctx.is_deferred() || ls_mask.exists())).then_some(ls_mask);

        for channel in Polarization::PROCESSING_ORDER {
            let products = self.channel_products(track, channel)?;
            if products.len() < MIN_TIMESERIES_DATES {
                log::info!(
                    "Track {} channel {}: {} acquisition(s), not enough for a time series",
                    track,
                    channel,
                    products.len()
                );
                continue;
            }

            let output_dir = layout.timeseries_dir(track);
            let vrt = layout.timeseries_vrt(track, channel);
            let label = format!("Track {} time series {}", track, channel);
            let output = StageOutput::file(&vrt);
            let log_file = output_dir.join(format!("Timeseries.{}.{}.errLog", BACKSCATTER, channel));

            let state = self.ctx.run_command(&label, &output, || {
                log::info!("Creating time series of {} with {} acquisitions for track {}", channel, products.len(), track);
                let request = TimeseriesRequest {
                    channel,
                    products: &products,
                    extent: &extent,
                    ls_mask: ls_mask.as_deref(),
                    output_dir: &output_dir,
                    output: &vrt,
                };
                commands.timeseries(&request, &log_file)
            })?;
            report.record(&label, &output, state);
        }

        Ok(())
    }

    /// `(YYYYMMDD, backscatter product)` of every acquisition carrying `channel`, by date
    pub fn channel_products(&self, track: Track, channel: Polarization) -> SarResult<Vec<(String, PathBuf)>> {
        let mut products = Vec::new();

        for date_dir in list_entries(&self.ctx.layout.track_dir(track))? {
            let date = file_name(&date_dir);
            if !date_dir.is_dir() || date.len() != 8 || !date.starts_with("20") {
                continue;
            }

            let entries = list_entries(&date_dir)?;
            let mut has_channel = false;
            for data_dir in entries.iter().filter(|p| p.is_dir() && file_name(p).contains("data")) {
                has_channel |= list_entries(data_dir)?
                    .iter()
                    .any(|f| band_channel(&file_name(f)) == Some(channel));
            }
            if !has_channel {
                continue;
            }

            let product = entries.iter().find(|p| {
                let name = file_name(p);
                name.contains(BACKSCATTER) && name.ends_with(".dim")
            });

            match product {
                Some(product) => products.push((date, product.clone())),
                None => log::warn!(
                    "Track {} acquisition {} has {} bands but no backscatter product",
                    track,
                    date,
                    channel
                ),
            }
        }

        Ok(products)
    }
}
