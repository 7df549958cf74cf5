//! Partition the scene inventory into per-track processing units.

use crate::types::{AcquisitionGroup, ProcessingUnit, SceneRecord};
use std::collections::HashSet;

/// Build one processing unit per track, with one acquisition group per date.
///
/// Tracks and dates keep the order in which they first appear in the inventory.
/// A scene listed twice is kept once. An empty inventory yields no units.
pub fn build_processing_units(scenes: &[SceneRecord]) -> Vec<ProcessingUnit> {
    let mut units: Vec<ProcessingUnit> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for scene in scenes {
        if !seen.insert(scene.identifier.as_str()) {
            log::debug!("Scene {} listed more than once, ignoring duplicate", scene.identifier);
            continue;
        }

        let unit = match units.iter().position(|u| u.track == scene.track) {
            Some(i) => &mut units[i],
            None => {
                units.push(ProcessingUnit {
                    track: scene.track,
                    groups: Vec::new(),
                });
                let last = units.len() - 1;
                &mut units[last]
            }
        };

        match unit
            .groups
            .iter_mut()
            .find(|g| g.date() == scene.acquisition_date)
        {
            Some(group) => group.scenes.push(scene.clone()),
            None => unit.groups.push(AcquisitionGroup {
                track: scene.track,
                scenes: vec![scene.clone()],
            }),
        }
    }

    for unit in &units {
        log::debug!("Track {}: {} acquisition(s)", unit.track, unit.groups.len());
    }

    units
}
