//! Scene inventory: Sentinel-1 identifiers, archive locations and inventory files.

use crate::types::{Polarization, SarError, SarResult, SceneRecord, Track};
use chrono::NaiveDate;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Number of relative orbits in the Sentinel-1 repeat cycle
const ORBITS_PER_CYCLE: i64 = 175;

/// Fields encoded in a Sentinel-1 product identifier
///
/// Example: `S1A_IW_GRDH_1SDV_20200103T170815_20200103T170842_030639_0382D5_DADE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneId {
    pub identifier: String,
    pub mission: String,
    pub mode: String,
    pub product_type: String,
    pub start_date: NaiveDate,
    pub absolute_orbit: u32,
    pub polarizations: Vec<Polarization>,
}

impl SceneId {
    pub fn parse(identifier: &str) -> SarResult<Self> {
        let parts: Vec<&str> = identifier.split('_').collect();
        if parts.len() < 8 || !parts[0].starts_with("S1") {
            return Err(SarError::InvalidFormat(format!(
                "Not a Sentinel-1 product identifier: {}",
                identifier
            )));
        }

        // Product type is the leading part of e.g. "GRDH"
        let product_type: String = parts[2].chars().take(3).collect();

        // Start time YYYYMMDDTHHMMSS, only the date is needed
        let start_date = parts[4]
            .get(0..8)
            .and_then(|d| NaiveDate::parse_from_str(d, "%Y%m%d").ok())
            .ok_or_else(|| {
                SarError::InvalidFormat(format!("Invalid start time in identifier: {}", identifier))
            })?;

        let absolute_orbit = parts[6].parse::<u32>().map_err(|_| {
            SarError::InvalidFormat(format!("Invalid absolute orbit in identifier: {}", identifier))
        })?;

        // Class code like "1SDV": S(ingle)/D(ual) + H/V
        let class_code = parts[3];
        let polarizations = match class_code.get(2..4) {
            Some("DV") => vec![Polarization::VV, Polarization::VH],
            Some("DH") => vec![Polarization::HH, Polarization::HV],
            Some("SV") => vec![Polarization::VV],
            Some("SH") => vec![Polarization::HH],
            _ => Vec::new(),
        };

        Ok(Self {
            identifier: identifier.to_string(),
            mission: parts[0].to_string(),
            mode: parts[1].to_string(),
            product_type,
            start_date,
            absolute_orbit,
            polarizations,
        })
    }

    /// Relative orbit derived from the absolute orbit
    pub fn relative_orbit(&self) -> SarResult<Track> {
        let offset = match self.mission.as_str() {
            "S1A" => 73,
            "S1B" => 27,
            other => {
                return Err(SarError::InvalidFormat(format!(
                    "Cannot derive relative orbit for mission {}",
                    other
                )))
            }
        };

        let relative = (self.absolute_orbit as i64 - offset).rem_euclid(ORBITS_PER_CYCLE) + 1;
        Ok(Track(relative as u32))
    }

    /// Canonical archive location below the download directory
    pub fn download_path(&self, download_dir: &Path) -> PathBuf {
        download_dir
            .join("SAR")
            .join(&self.product_type)
            .join(self.start_date.format("%Y").to_string())
            .join(self.start_date.format("%m").to_string())
            .join(self.start_date.format("%d").to_string())
            .join(format!("{}.zip", self.identifier))
    }

    /// Locate the scene archive: canonical layout first, then a flat download directory
    pub fn archive_path(&self, download_dir: &Path) -> PathBuf {
        let canonical = self.download_path(download_dir);
        if canonical.exists() {
            return canonical;
        }

        let flat = download_dir.join(format!("{}.zip", self.identifier));
        if flat.exists() {
            return flat;
        }

        log::warn!(
            "Archive for scene {} not found, expecting it at {}",
            self.identifier,
            canonical.display()
        );
        canonical
    }

    /// Inventory record derived from the identifier alone
    pub fn to_record(&self) -> SarResult<SceneRecord> {
        Ok(SceneRecord {
            identifier: self.identifier.clone(),
            track: self.relative_orbit()?,
            acquisition_date: self.start_date,
            polarizations: self.polarizations.clone(),
        })
    }
}

/// Source archive of a scene; identifiers that do not parse are looked up flat in `download_dir`
pub fn resolve_archive(download_dir: &Path, identifier: &str) -> PathBuf {
    match SceneId::parse(identifier) {
        Ok(id) => id.archive_path(download_dir),
        Err(_) => {
            log::warn!("Cannot parse scene identifier {}, looking for a flat archive", identifier);
            download_dir.join(format!("{}.zip", identifier))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum TrackValue {
    Number(u32),
    Text(String),
}

/// One row of an inventory file, column names as written by the search step
#[derive(Debug, Deserialize)]
struct InventoryEntry {
    identifier: String,
    #[serde(default, alias = "track")]
    relativeorbit: Option<TrackValue>,
    #[serde(default)]
    acquisitiondate: Option<String>,
    #[serde(default, alias = "polarisation")]
    polarisationmode: Option<String>,
}

fn parse_date(value: &str) -> SarResult<NaiveDate> {
    let value = value.trim();
    let date_part = value.get(0..10).unwrap_or(value);
    NaiveDate::parse_from_str(date_part, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(value.get(0..8).unwrap_or(value), "%Y%m%d"))
        .map_err(|_| SarError::InvalidFormat(format!("Invalid acquisition date: {}", value)))
}

impl InventoryEntry {
    fn into_record(self) -> SarResult<SceneRecord> {
        // Identifier-derived values fill in whatever the row leaves out
        let parsed = SceneId::parse(&self.identifier);

        let track = match self.relativeorbit {
            Some(TrackValue::Number(n)) => Track(n),
            Some(TrackValue::Text(s)) => s.parse::<Track>()?,
            None => match &parsed {
                Ok(id) => id.relative_orbit()?,
                Err(_) => {
                    return Err(SarError::InvalidFormat(format!(
                        "No relative orbit for scene {}",
                        self.identifier
                    )))
                }
            },
        };

        let acquisition_date = match &self.acquisitiondate {
            Some(date) => parse_date(date)?,
            None => match &parsed {
                Ok(id) => id.start_date,
                Err(_) => {
                    return Err(SarError::InvalidFormat(format!(
                        "No acquisition date for scene {}",
                        self.identifier
                    )))
                }
            },
        };

        let polarizations = match &self.polarisationmode {
            Some(mode) => Polarization::parse_mode(mode)?,
            None => parsed.map(|id| id.polarizations).unwrap_or_default(),
        };

        Ok(SceneRecord {
            identifier: self.identifier,
            track,
            acquisition_date,
            polarizations,
        })
    }
}

/// Parse an inventory from a JSON array of scene rows
pub fn parse_inventory(json: &str) -> SarResult<Vec<SceneRecord>> {
    let entries: Vec<InventoryEntry> = serde_json::from_str(json)?;
    entries.into_iter().map(InventoryEntry::into_record).collect()
}

/// Load an inventory file
pub fn load_inventory<P: AsRef<Path>>(path: P) -> SarResult<Vec<SceneRecord>> {
    log::info!("Reading scene inventory: {}", path.as_ref().display());
    let contents = std::fs::read_to_string(&path)?;
    let records = parse_inventory(&contents)?;
    log::info!("Inventory holds {} scenes", records.len());
    Ok(records)
}
