use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Date format used for acquisition directories and filename date tokens
pub const DATE_FORMAT: &str = "%Y%m%d";

/// Polarization modes for Sentinel-1
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Polarization {
    VV,
    VH,
    HV,
    HH,
}

impl Polarization {
    /// Channels checked by the time-series and timescan stages, in processing order
    pub const PROCESSING_ORDER: [Polarization; 4] = [
        Polarization::VV,
        Polarization::VH,
        Polarization::HH,
        Polarization::HV,
    ];

    /// Channels checked by the timescan mosaic (co-polarized first)
    pub const MOSAIC_ORDER: [Polarization; 4] = [
        Polarization::VV,
        Polarization::HH,
        Polarization::VH,
        Polarization::HV,
    ];

    /// Parse an inventory polarisation mode such as `"VV VH"`, `"VV+VH"` or `"HH"`
    pub fn parse_mode(mode: &str) -> SarResult<Vec<Polarization>> {
        let mut pols = Vec::new();
        for token in mode.split(|c: char| c == ' ' || c == '+' || c == ',' || c == '/') {
            if token.is_empty() {
                continue;
            }
            let pol = token.parse::<Polarization>()?;
            if !pols.contains(&pol) {
                pols.push(pol);
            }
        }
        Ok(pols)
    }
}

impl std::fmt::Display for Polarization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Polarization::VV => write!(f, "VV"),
            Polarization::VH => write!(f, "VH"),
            Polarization::HV => write!(f, "HV"),
            Polarization::HH => write!(f, "HH"),
        }
    }
}

impl FromStr for Polarization {
    type Err = SarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "VV" => Ok(Polarization::VV),
            "VH" => Ok(Polarization::VH),
            "HV" => Ok(Polarization::HV),
            "HH" => Ok(Polarization::HH),
            _ => Err(SarError::InvalidFormat(format!("Invalid polarization: {}", s))),
        }
    }
}

/// Relative orbit number (the satellite ground track)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Track(pub u32);

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Track {
    type Err = SarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(Track)
            .map_err(|_| SarError::InvalidFormat(format!("Invalid relative orbit: {}", s)))
    }
}

/// One scene of the inventory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneRecord {
    pub identifier: String,
    pub track: Track,
    pub acquisition_date: NaiveDate,
    pub polarizations: Vec<Polarization>,
}

/// Scenes of one track acquired on the same date
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcquisitionGroup {
    pub track: Track,
    pub scenes: Vec<SceneRecord>,
}

impl AcquisitionGroup {
    /// Acquisition date, taken from the first scene of the group
    pub fn date(&self) -> NaiveDate {
        self.scenes
            .first()
            .map(|scene| scene.acquisition_date)
            .unwrap_or(NaiveDate::MIN)
    }

    /// `YYYYMMDD` token used for directories and file identifiers
    pub fn date_token(&self) -> String {
        self.date().format(DATE_FORMAT).to_string()
    }

    /// File identifier `{date}_{track}` handed to the product conversion
    pub fn file_id(&self) -> String {
        format!("{}_{}", self.date_token(), self.track)
    }

    pub fn identifiers(&self) -> Vec<&str> {
        self.scenes.iter().map(|s| s.identifier.as_str()).collect()
    }
}

/// All acquisition groups of one track
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingUnit {
    pub track: Track,
    pub groups: Vec<AcquisitionGroup>,
}

/// Error types for batch processing
#[derive(Debug, thiserror::Error)]
pub enum SarError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid command argument: {0}")]
    InvalidArgument(String),

    #[error("{operation} exited with code {code} after {attempts} attempt(s); see {} for engine output", .log.display())]
    EngineFailure {
        operation: String,
        code: i32,
        attempts: u32,
        log: PathBuf,
    },

    #[error("Processing error: {0}")]
    Processing(String),
}

impl SarError {
    /// True for the error raised when a critical engine step exhausted its retries
    pub fn is_engine_failure(&self) -> bool {
        matches!(self, SarError::EngineFailure { .. })
    }
}

/// Result type for batch operations
pub type SarResult<T> = Result<T, SarError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_polarisation_modes() {
        assert_eq!(
            Polarization::parse_mode("VV VH").unwrap(),
            vec![Polarization::VV, Polarization::VH]
        );
        assert_eq!(
            Polarization::parse_mode("hh+hv").unwrap(),
            vec![Polarization::HH, Polarization::HV]
        );
        assert_eq!(Polarization::parse_mode("VV").unwrap(), vec![Polarization::VV]);
        assert!(Polarization::parse_mode("XX").is_err());
    }

    #[test]
    fn test_group_identifiers() {
        let scene = SceneRecord {
            identifier: "S1A_IW_GRDH_1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE".into(),
            track: Track(117),
            acquisition_date: NaiveDate::from_ymd_opt(2020, 1, 3).unwrap(),
            polarizations: vec![Polarization::VV, Polarization::VH],
        };
        let group = AcquisitionGroup { track: Track(117), scenes: vec![scene] };

        assert_eq!(group.date_token(), "20200103");
        assert_eq!(group.file_id(), "20200103_117");
    }
}
