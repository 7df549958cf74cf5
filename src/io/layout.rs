//! Directory layout of the processing tree and the output filename grammar.
//!
//! ```text
//! {processing_dir}/{track}/{YYYYMMDD}/          acquisition products
//! {processing_dir}/{track}/Timeseries/          {index}.{date}.bs.{CH}.tif
//! {processing_dir}/{track}/Timescan/            bs.{CH}.{metric}.tif
//! {processing_dir}/Mosaic/Timeseries/           {index}.{date|start-end}.bs.{CH}.tif
//! {processing_dir}/Mosaic/Timescan/             bs.{CH}.{metric}.tif
//! ```

use crate::types::{Polarization, SarError, SarResult, Track};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Product token of backscatter outputs
pub const BACKSCATTER: &str = "bs";

/// Extension of the raster outputs
pub const RASTER_EXT: &str = "tif";

const TIMESERIES_DIR: &str = "Timeseries";
const TIMESCAN_DIR: &str = "Timescan";
const MOSAIC_DIR: &str = "Mosaic";

/// Paths of the processing tree rooted at `processing_dir`
#[derive(Debug, Clone)]
pub struct ProcessingLayout {
    root: PathBuf,
}

impl ProcessingLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn track_dir(&self, track: Track) -> PathBuf {
        self.root.join(track.to_string())
    }

    /// `{processing_dir}/{track}/{YYYYMMDD}`
    pub fn acquisition_dir(&self, track: Track, date_token: &str) -> PathBuf {
        self.track_dir(track).join(date_token)
    }

    pub fn timeseries_dir(&self, track: Track) -> PathBuf {
        self.track_dir(track).join(TIMESERIES_DIR)
    }

    pub fn timescan_dir(&self, track: Track) -> PathBuf {
        self.track_dir(track).join(TIMESCAN_DIR)
    }

    pub fn mosaic_timeseries_dir(&self) -> PathBuf {
        self.root.join(MOSAIC_DIR).join(TIMESERIES_DIR)
    }

    pub fn mosaic_timescan_dir(&self) -> PathBuf {
        self.root.join(MOSAIC_DIR).join(TIMESCAN_DIR)
    }

    /// Common valid-data extent of all acquisitions of a track
    pub fn extent_file(&self, track: Track) -> PathBuf {
        self.track_dir(track).join(format!("{}.extent.shp", track))
    }

    /// Combined layover/shadow mask of a track
    pub fn ls_mask_file(&self, track: Track) -> PathBuf {
        self.track_dir(track).join(format!("{}.ls_mask.tif", track))
    }

    /// Virtual stack of a channel's time series
    pub fn timeseries_vrt(&self, track: Track, channel: Polarization) -> PathBuf {
        self.timeseries_dir(track)
            .join(format!("Timeseries.{}.{}.vrt", BACKSCATTER, channel))
    }

    /// Prefix `{track}/Timescan/bs.{CH}` completed by `.{metric}.tif`
    pub fn timescan_prefix(&self, track: Track, channel: Polarization) -> PathBuf {
        self.timescan_dir(track)
            .join(format!("{}.{}", BACKSCATTER, channel))
    }

    pub fn timescan_vrt(&self, track: Track) -> PathBuf {
        self.timescan_dir(track).join("Timescan.vrt")
    }

    /// Raster files (`*.img`) inside the `*.data` folders of all acquisitions of a track
    pub fn acquisition_rasters(&self, track: Track) -> SarResult<Vec<PathBuf>> {
        let mut rasters = Vec::new();

        for date_dir in list_entries(&self.track_dir(track))? {
            let is_acquisition = date_dir
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("20"))
                .unwrap_or(false);
            if !is_acquisition || !date_dir.is_dir() {
                continue;
            }

            for data_dir in list_entries(&date_dir)? {
                let is_data = data_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.contains("data"))
                    .unwrap_or(false);
                if !is_data || !data_dir.is_dir() {
                    continue;
                }

                rasters.extend(
                    list_entries(&data_dir)?
                        .into_iter()
                        .filter(|p| p.extension().map(|e| e == "img").unwrap_or(false)),
                );
            }
        }

        rasters.sort();
        Ok(rasters)
    }

    /// Parsed time-series layers of one track and channel, ordered by date
    pub fn timeseries_layers(
        &self,
        track: Track,
        channel: Polarization,
    ) -> SarResult<Vec<(TimeseriesFileName, PathBuf)>> {
        let mut layers: Vec<(TimeseriesFileName, PathBuf)> = list_entries(&self.timeseries_dir(track))?
            .into_iter()
            .filter_map(|path| {
                let name = TimeseriesFileName::parse(path.file_name()?.to_str()?).ok()?;
                (name.channel == channel && name.extension == RASTER_EXT).then_some((name, path))
            })
            .collect();

        layers.sort_by(|a, b| a.0.dates.start().cmp(b.0.dates.start()).then(a.0.index.cmp(&b.0.index)));
        Ok(layers)
    }
}

/// Sorted entries of a directory; a missing directory has no entries
pub fn list_entries(dir: &Path) -> SarResult<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        entries.push(entry?.path());
    }
    entries.sort();
    Ok(entries)
}

/// Date part of a time-series filename: one date or a `start-end` range
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DateLabel {
    Single(String),
    Range(String, String),
}

impl DateLabel {
    /// Label covering all given `YYYYMMDD` tokens, `None` when there are none
    pub fn from_tokens<S: AsRef<str>>(tokens: &[S]) -> Option<Self> {
        let mut sorted: Vec<&str> = tokens.iter().map(|t| t.as_ref()).collect();
        sorted.sort_unstable();

        let start = *sorted.first()?;
        let end = *sorted.last()?;
        if start == end {
            Some(DateLabel::Single(start.to_string()))
        } else {
            Some(DateLabel::Range(start.to_string(), end.to_string()))
        }
    }

    pub fn start(&self) -> &str {
        match self {
            DateLabel::Single(d) => d,
            DateLabel::Range(start, _) => start,
        }
    }

    pub fn end(&self) -> &str {
        match self {
            DateLabel::Single(d) => d,
            DateLabel::Range(_, end) => end,
        }
    }
}

impl std::fmt::Display for DateLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DateLabel::Single(d) => write!(f, "{}", d),
            DateLabel::Range(start, end) => write!(f, "{}-{}", start, end),
        }
    }
}

fn timeseries_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(\d+)\.(\d{8})(?:-(\d{8}))?\.([A-Za-z0-9_]+)\.(VV|VH|HV|HH)\.([A-Za-z0-9]+)$")
            .expect("valid time-series filename pattern")
    })
}

fn timescan_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^([A-Za-z0-9_]+)\.(VV|VH|HV|HH)\.([A-Za-z0-9_]+)\.([A-Za-z0-9]+)$")
            .expect("valid timescan filename pattern")
    })
}

/// `{index}.{date|start-end}.{product}.{channel}.{ext}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeseriesFileName {
    pub index: usize,
    pub dates: DateLabel,
    pub product: String,
    pub channel: Polarization,
    pub extension: String,
}

impl TimeseriesFileName {
    pub fn new(index: usize, dates: DateLabel, channel: Polarization) -> Self {
        Self {
            index,
            dates,
            product: BACKSCATTER.to_string(),
            channel,
            extension: RASTER_EXT.to_string(),
        }
    }

    pub fn parse(name: &str) -> SarResult<Self> {
        let caps = timeseries_pattern()
            .captures(name)
            .ok_or_else(|| SarError::InvalidFormat(format!("Not a time-series filename: {}", name)))?;

        let index = caps[1]
            .parse::<usize>()
            .map_err(|_| SarError::InvalidFormat(format!("Invalid slot index in {}", name)))?;
        let dates = match caps.get(3) {
            Some(end) => DateLabel::Range(caps[2].to_string(), end.as_str().to_string()),
            None => DateLabel::Single(caps[2].to_string()),
        };

        Ok(Self {
            index,
            dates,
            product: caps[4].to_string(),
            channel: caps[5].parse()?,
            extension: caps[6].to_string(),
        })
    }
}

impl std::fmt::Display for TimeseriesFileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}.{}",
            self.index, self.dates, self.product, self.channel, self.extension
        )
    }
}

/// `{product}.{channel}.{metric}.{ext}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimescanFileName {
    pub product: String,
    pub channel: Polarization,
    pub metric: String,
    pub extension: String,
}

impl TimescanFileName {
    pub fn new(channel: Polarization, metric: &str) -> Self {
        Self {
            product: BACKSCATTER.to_string(),
            channel,
            metric: metric.to_string(),
            extension: RASTER_EXT.to_string(),
        }
    }

    pub fn parse(name: &str) -> SarResult<Self> {
        let caps = timescan_pattern()
            .captures(name)
            .ok_or_else(|| SarError::InvalidFormat(format!("Not a timescan filename: {}", name)))?;

        Ok(Self {
            product: caps[1].to_string(),
            channel: caps[2].parse()?,
            metric: caps[3].to_string(),
            extension: caps[4].to_string(),
        })
    }
}

impl std::fmt::Display for TimescanFileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}", self.product, self.channel, self.metric, self.extension)
    }
}
