//! Time-series-to-timescan stage: temporal statistics per track and channel.

use crate::core::command::TimescanRequest;
use crate::core::dispatch::{StageContext, StageReport, UnitState};
use crate::io::checkpoint::StageOutput;
use crate::io::layout::{list_entries, TimescanFileName, RASTER_EXT};
use crate::types::{Polarization, ProcessingUnit, SarResult, Track};
use std::path::PathBuf;

pub struct TimescanStage<'a> {
    ctx: &'a StageContext,
}

impl<'a> TimescanStage<'a> {
    pub fn new(ctx: &'a StageContext) -> Self {
        Self { ctx }
    }

    pub fn run(&self, units: &[ProcessingUnit]) -> SarResult<StageReport> {
        let mut report = StageReport::new("Timescan");

        for unit in units {
            log::info!("Entering track {}", unit.track);
            self.process_track(unit.track, &mut report)?;
        }

        log::info!("{}", report);
        Ok(report)
    }

    fn process_track(&self, track: Track, report: &mut StageReport) -> SarResult<()> {
        let layout = &self.ctx.layout;
        let timescan_dir = layout.timescan_dir(track);
        let metrics = &self.ctx.config.parameters.time_scan.metrics;

        for channel in Polarization::PROCESSING_ORDER {
            let label = format!("Track {} timescan {}", track, channel);
            let output = StageOutput::named(&timescan_dir, &channel.to_string());

            if self.ctx.store.is_complete(&output) {
                log::info!("Timescans of {} for track {} already processed", channel, track);
                report.record(&label, &output, UnitState::Skipped);
                continue;
            }

            let timeseries = layout.timeseries_vrt(track, channel);
            if !timeseries.exists() {
                log::debug!("No {} time series for track {}", channel, track);
                continue;
            }

            let mut dates: Vec<String> = layout
                .timeseries_layers(track, channel)?
                .into_iter()
                .map(|(name, _)| name.dates.start().to_string())
                .collect();
            dates.sort();
            dates.dedup();
            if dates.is_empty() {
                log::warn!("Time series of {} for track {} has no layers, skipping", channel, track);
                continue;
            }

            let prefix = layout.timescan_prefix(track, channel);
            let log_file = timescan_dir.join(format!("{}.errLog", channel));

            let state = self.ctx.run_command(&label, &output, || {
                log::info!("Processing timescans of {} for track {} over {} dates", channel, track, dates.len());
                let request = TimescanRequest {
                    timeseries: &timeseries,
                    prefix: &prefix,
                    metrics,
                    dates: &dates,
                };
                self.ctx.commands().timescan(&request, &log_file)
            })?;
            report.record(&label, &output, state);
        }

        if !self.ctx.is_deferred() {
            self.build_track_vrt(track)?;
        }

        Ok(())
    }

    /// Virtual stack over every timescan layer of a track
    fn build_track_vrt(&self, track: Track) -> SarResult<()> {
        let layout = &self.ctx.layout;
        let timescan_dir = layout.timescan_dir(track);

        let layers: Vec<PathBuf> = list_entries(&timescan_dir)?
            .into_iter()
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .and_then(|n| TimescanFileName::parse(n).ok())
                    .map(|n| n.extension == RASTER_EXT)
                    .unwrap_or(false)
            })
            .collect();

        if layers.is_empty() {
            log::debug!("No timescan layers for track {}", track);
            return Ok(());
        }

        log::info!("Creating timescan VRT for track {}", track);
        let command = self.ctx.commands().build_vrt(
            &layers,
            &layout.timescan_vrt(track),
            &timescan_dir.join("Timescan.vrt.errLog"),
        )?;
        self.ctx.run_untracked(&command)?;
        Ok(())
    }
}
