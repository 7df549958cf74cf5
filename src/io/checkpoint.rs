//! Completion markers for units of work.
//!
//! A unit is complete when its marker exists; the marker content is informational only.
//! Acquisition directories carry `.processed` inside them, named outputs carry a
//! sibling `.{base}.processed` where `base` is the file name without its extension.

use crate::types::{SarError, SarResult};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Condvar, Mutex};

const MARKER_SUFFIX: &str = "processed";

/// An output of a unit of work and the marker that vouches for it
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StageOutput {
    path: PathBuf,
    marker: PathBuf,
}

impl StageOutput {
    /// Output directory, marked by `{dir}/.processed`
    pub fn directory<P: Into<PathBuf>>(dir: P) -> Self {
        let path = dir.into();
        let marker = path.join(format!(".{}", MARKER_SUFFIX));
        Self { path, marker }
    }

    /// Output file, marked by `.{stem}.processed` next to it
    pub fn file<P: Into<PathBuf>>(file: P) -> Self {
        let path = file.into();
        let base = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let marker = parent.join(format!(".{}.{}", base, MARKER_SUFFIX));
        Self { path, marker }
    }

    /// Logical output `name` inside `dir`, marked by `{dir}/.{name}.processed`
    pub fn named<P: Into<PathBuf>>(dir: P, name: &str) -> Self {
        let dir = dir.into();
        let marker = dir.join(format!(".{}.{}", name, MARKER_SUFFIX));
        Self { path: dir.join(name), marker }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn marker(&self) -> &Path {
        &self.marker
    }
}

/// Persistent record of completed units
pub trait CheckpointStore: Send + Sync {
    /// True when the output has been completed by an earlier run
    fn is_complete(&self, output: &StageOutput) -> bool;

    /// Record completion; only call after the output was fully written
    fn mark_complete(&self, output: &StageOutput) -> SarResult<()>;
}

/// Marker files on the local filesystem
#[derive(Debug, Default, Clone)]
pub struct FsCheckpointStore;

impl FsCheckpointStore {
    pub fn new() -> Self {
        Self
    }
}

impl CheckpointStore for FsCheckpointStore {
    fn is_complete(&self, output: &StageOutput) -> bool {
        output.marker().is_file()
    }

    fn mark_complete(&self, output: &StageOutput) -> SarResult<()> {
        let marker = output.marker();
        let dir = marker.parent().ok_or_else(|| {
            SarError::Processing(format!("Marker {} has no parent directory", marker.display()))
        })?;
        std::fs::create_dir_all(dir)?;

        // Write next to the marker and rename, so readers never see a partial marker
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        writeln!(tmp, "{}", chrono::Utc::now().to_rfc3339())?;
        tmp.persist(marker).map_err(|e| SarError::Io(e.error))?;

        log::debug!("Marked complete: {}", output.path().display());
        Ok(())
    }
}

/// In-memory store for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    markers: Mutex<HashSet<PathBuf>>,
    writes: Mutex<usize>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `mark_complete` calls
    pub fn write_count(&self) -> usize {
        self.writes.lock().map(|w| *w).unwrap_or(0)
    }

    pub fn completed(&self) -> Vec<PathBuf> {
        let mut markers: Vec<PathBuf> = self
            .markers
            .lock()
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();
        markers.sort();
        markers
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn is_complete(&self, output: &StageOutput) -> bool {
        self.markers
            .lock()
            .map(|m| m.contains(output.marker()))
            .unwrap_or(false)
    }

    fn mark_complete(&self, output: &StageOutput) -> SarResult<()> {
        let mut markers = self
            .markers
            .lock()
            .map_err(|_| SarError::Processing("checkpoint store lock poisoned".to_string()))?;
        markers.insert(output.marker().to_path_buf());

        if let Ok(mut writes) = self.writes.lock() {
            *writes += 1;
        }
        Ok(())
    }
}

/// Per-output mutual exclusion: one worker per output path at a time
#[derive(Debug, Default)]
pub struct OutputLocks {
    busy: Mutex<HashSet<PathBuf>>,
    released: Condvar,
}

impl OutputLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until no other worker holds `path`, then hold it until the guard drops
    pub fn acquire(&self, path: &Path) -> SarResult<OutputGuard<'_>> {
        let mut busy = self
            .busy
            .lock()
            .map_err(|_| SarError::Processing("output lock poisoned".to_string()))?;

        while busy.contains(path) {
            log::debug!("Waiting for another worker on {}", path.display());
            busy = self
                .released
                .wait(busy)
                .map_err(|_| SarError::Processing("output lock poisoned".to_string()))?;
        }
        busy.insert(path.to_path_buf());

        Ok(OutputGuard {
            locks: self,
            path: path.to_path_buf(),
        })
    }
}

/// Releases its output path on drop
#[derive(Debug)]
pub struct OutputGuard<'a> {
    locks: &'a OutputLocks,
    path: PathBuf,
}

impl Drop for OutputGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut busy) = self.locks.busy.lock() {
            busy.remove(&self.path);
        }
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_marker_naming() {
        let dir = StageOutput::directory("/proc/117/20200103");
        assert_eq!(dir.marker(), Path::new("/proc/117/20200103/.processed"));

        let file = StageOutput::file("/proc/Mosaic/Timescan/bs.VV.avg.tif");
        assert_eq!(file.marker(), Path::new("/proc/Mosaic/Timescan/.bs.VV.avg.processed"));

        let named = StageOutput::named("/proc/117/Timescan", "VV");
        assert_eq!(named.marker(), Path::new("/proc/117/Timescan/.VV.processed"));
    }

    #[test]
    fn test_fs_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = FsCheckpointStore::new();
        let output = StageOutput::file(tmp.path().join("Mosaic").join("1.20200101.bs.VV.tif"));

        assert!(!store.is_complete(&output));
        store.mark_complete(&output).unwrap();
        assert!(store.is_complete(&output));
        assert!(output.marker().is_file());

        // Marking again replaces the marker in place
        store.mark_complete(&output).unwrap();
        assert!(store.is_complete(&output));
    }

    #[test]
    fn test_marker_presence_not_content_counts() {
        let tmp = TempDir::new().unwrap();
        let output = StageOutput::directory(tmp.path());
        std::fs::write(output.marker(), b"").unwrap();
        assert!(FsCheckpointStore::new().is_complete(&output));
    }

    #[test]
    fn test_memory_store_counts_writes() {
        let store = MemoryCheckpointStore::new();
        let output = StageOutput::directory("/proc/117/20200103");
        store.mark_complete(&output).unwrap();
        assert!(store.is_complete(&output));
        assert_eq!(store.write_count(), 1);
        assert_eq!(store.completed(), vec![PathBuf::from("/proc/117/20200103/.processed")]);
    }

    #[test]
    fn test_output_lock_released_on_drop() {
        let locks = Arc::new(OutputLocks::new());
        let path = PathBuf::from("/proc/117/20200103");

        let guard = locks.acquire(&path).unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            let path = path.clone();
            std::thread::spawn(move || {
                let _guard = locks.acquire(&path).unwrap();
                true
            })
        };

        drop(guard);
        assert!(waiter.join().unwrap());

        // Released again once the waiter's guard dropped
        let _again = locks.acquire(&path).unwrap();
    }
}
