//! Persistence for completed calibrations, keyed by subject.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use crate::calibration::Calibration;
use crate::error::StoreError;

/// Name of the on-disk calibration file inside the data directory.
const STORE_FILE_NAME: &str = "calibrations.json";

/// Persistence collaborator for calibrations. One record per subject;
/// saving overwrites that subject's previous record only.
#[cfg_attr(test, mockall::automock)]
pub trait CalibrationStore: Send + Sync {
    fn load(&self, subject_id: &str) -> Result<Option<Calibration>, StoreError>;
    fn save(&self, subject_id: &str, calibration: &Calibration) -> Result<(), StoreError>;
}

/// JSON-file-backed store: a single map of subject id to calibration in the
/// platform data directory.
pub struct FileCalibrationStore {
    path: PathBuf,
}

impl FileCalibrationStore {
    /// Store under the platform data directory
    /// (e.g. `~/.local/share/aquasense/calibrations.json`).
    pub fn with_default_path() -> Result<Self, StoreError> {
        let base = dirs_next::data_dir().ok_or(StoreError::NoDataDir)?;
        Ok(Self {
            path: base.join("aquasense").join(STORE_FILE_NAME),
        })
    }

    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn read_all(&self) -> Result<HashMap<String, Calibration>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_all(&self, records: &HashMap<String, Calibration>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(records)?;
        // Write-then-rename so a crash mid-write cannot truncate the store.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn load(&self, subject_id: &str) -> Result<Option<Calibration>, StoreError> {
        let records = self.read_all()?;
        Ok(records.get(subject_id).cloned())
    }

    fn save(&self, subject_id: &str, calibration: &Calibration) -> Result<(), StoreError> {
        let mut records = self.read_all()?;
        records.insert(subject_id.to_string(), calibration.clone());
        self.write_all(&records)?;
        log::debug!(
            "Saved calibration for subject {} to {:?}",
            subject_id,
            self.path
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn calibration(empty_mm: f64) -> Calibration {
        Calibration {
            empty_baseline_mm: empty_mm,
            full_baseline_mm: 20.0,
            bottle_capacity_ml: 750,
            calibrated_at: Utc::now(),
            is_complete: true,
        }
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let dir = tempdir().unwrap();
        let store = FileCalibrationStore::with_path(dir.path().join("calibrations.json"));
        assert_eq!(store.load("alice").unwrap(), None);
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileCalibrationStore::with_path(dir.path().join("calibrations.json"));
        let cal = calibration(140.0);
        store.save("alice", &cal).unwrap();
        assert_eq!(store.load("alice").unwrap(), Some(cal));
        assert_eq!(store.load("bob").unwrap(), None);
    }

    #[test]
    fn test_save_is_scoped_per_subject() {
        let dir = tempdir().unwrap();
        let store = FileCalibrationStore::with_path(dir.path().join("calibrations.json"));
        store.save("alice", &calibration(140.0)).unwrap();
        store.save("bob", &calibration(150.0)).unwrap();
        store.save("alice", &calibration(130.0)).unwrap();
        assert_eq!(store.load("alice").unwrap().unwrap().empty_baseline_mm, 130.0);
        assert_eq!(store.load("bob").unwrap().unwrap().empty_baseline_mm, 150.0);
    }

    #[test]
    fn test_save_creates_parent_directories() {
        let dir = tempdir().unwrap();
        let store =
            FileCalibrationStore::with_path(dir.path().join("nested").join("calibrations.json"));
        store.save("alice", &calibration(140.0)).unwrap();
        assert!(store.path().exists());
    }

    #[test]
    fn test_corrupt_file_surfaces_serialization_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("calibrations.json");
        fs::write(&path, "not json").unwrap();
        let store = FileCalibrationStore::with_path(path);
        assert!(matches!(
            store.load("alice"),
            Err(StoreError::Serialization(_))
        ));
    }
}
