//! Per-team persisted state.
//!
//! Layout under `<data_dir>/<team_id>/`:
//!
//! ```text
//! offline_queue.json   pending changes, in order
//! runners.json         last synced roster
//! legs.json            last synced legs
//! renames.json         local runner id -> last known name
//! meta.json            setup lock flag and last sync time
//! ```
//!
//! Missing files load as empty values.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use baton_core::{Error, Leg, Result, Runner, RunnerId, TeamId};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::offline_queue::OfflineChange;

const QUEUE_FILE: &str = "offline_queue.json";
const RUNNERS_FILE: &str = "runners.json";
const LEGS_FILE: &str = "legs.json";
const RENAMES_FILE: &str = "renames.json";
const META_FILE: &str = "meta.json";
const MAX_TEAM_ID_LEN: usize = 128;

/// Local runner id to the name the remote last knew it by.
pub type RenameMap = BTreeMap<RunnerId, String>;

/// Small sync bookkeeping persisted next to the snapshots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMeta {
    #[serde(default)]
    pub setup_locked: bool,
    #[serde(default)]
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// JSON files for one team.
#[derive(Debug, Clone)]
pub struct TeamStorage {
    dir: PathBuf,
}

impl TeamStorage {
    /// Open (creating if needed) the directory for `team_id`.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidRecord` for a team id that is not a single safe
    /// path component, and `Error::DirectoryCreationFailed` if the directory
    /// cannot be created.
    pub fn open(data_dir: &Path, team_id: &TeamId) -> Result<Self> {
        check_team_id(team_id)?;
        let dir = data_dir.join(team_id.as_str());
        fs::create_dir_all(&dir)
            .map_err(|e| Error::directory_creation_failed(&dir, e.to_string()))?;
        debug!(dir = %dir.display(), "Opened team storage");
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_queue(&self) -> Result<Vec<OfflineChange>> {
        self.read(QUEUE_FILE)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_queue(&self, changes: &[OfflineChange]) -> Result<()> {
        self.write(QUEUE_FILE, &changes)
    }

    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_runners(&self) -> Result<Vec<Runner>> {
        self.read(RUNNERS_FILE)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_runners(&self, runners: &[Runner]) -> Result<()> {
        self.write(RUNNERS_FILE, &runners)
    }

    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_legs(&self) -> Result<Vec<Leg>> {
        self.read(LEGS_FILE)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_legs(&self, legs: &[Leg]) -> Result<()> {
        self.write(LEGS_FILE, &legs)
    }

    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_renames(&self) -> Result<RenameMap> {
        self.read(RENAMES_FILE)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_renames(&self, renames: &RenameMap) -> Result<()> {
        self.write(RENAMES_FILE, renames)
    }

    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_meta(&self) -> Result<PersistedMeta> {
        self.read(META_FILE)
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_meta(&self, meta: &PersistedMeta) -> Result<()> {
        self.write(META_FILE, meta)
    }

    fn read<T: DeserializeOwned + Default>(&self, name: &str) -> Result<T> {
        let path = self.dir.join(name);
        if !path.exists() {
            return Ok(T::default());
        }
        let content =
            fs::read_to_string(&path).map_err(|e| Error::file_read_failed(&path, e.to_string()))?;
        serde_json::from_str(&content)
            .map_err(|e| Error::json_parse_failed(format!("{}: {e}", path.display())))
    }

    fn write<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<()> {
        let path = self.dir.join(name);
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| Error::invalid_record(e.to_string()))?;
        fs::write(&path, content).map_err(|e| Error::file_write_failed(&path, e.to_string()))
    }
}

/// ASCII letters, digits, `-` and `_` only, so the id stays one directory
/// below the data dir.
fn check_team_id(team_id: &TeamId) -> Result<()> {
    let id = team_id.as_str();
    let safe = !id.is_empty()
        && id.len() <= MAX_TEAM_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if safe {
        Ok(())
    } else {
        Err(Error::invalid_record(format!(
            "team id '{id}' must be 1..={MAX_TEAM_ID_LEN} ASCII letters, digits, '-' or '_'"
        )))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use baton_core::default_runners;

    use super::*;

    #[test]
    fn should_load_empty_values_when_nothing_was_saved() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = TeamStorage::open(tmp.path(), &TeamId::from("team-a")).unwrap();

        assert!(storage.load_queue().unwrap().is_empty());
        assert!(storage.load_runners().unwrap().is_empty());
        assert!(storage.load_renames().unwrap().is_empty());
        assert_eq!(storage.load_meta().unwrap(), PersistedMeta::default());
    }

    #[test]
    fn should_keep_teams_apart() {
        let tmp = tempfile::tempdir().unwrap();
        let a = TeamStorage::open(tmp.path(), &TeamId::from("a")).unwrap();
        let b = TeamStorage::open(tmp.path(), &TeamId::from("b")).unwrap();

        a.save_runners(&default_runners()).unwrap();

        assert_eq!(a.load_runners().unwrap().len(), 12);
        assert!(b.load_runners().unwrap().is_empty());
    }

    #[test]
    fn should_reject_team_ids_that_leave_the_data_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = tmp.path().join("data");

        for id in ["../x", "a/b", "..", "", "a\\b", "team id"] {
            let err = TeamStorage::open(&data_dir, &TeamId::from(id)).unwrap_err();
            assert!(matches!(err, Error::InvalidRecord { .. }), "{id:?} was accepted");
        }
        assert!(!tmp.path().join("x").exists());
        assert!(TeamStorage::open(&data_dir, &TeamId::from("falcons_2024-b")).is_ok());
    }

    #[test]
    fn should_report_corrupt_file() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = TeamStorage::open(tmp.path(), &TeamId::from("t")).unwrap();
        fs::write(storage.dir().join(META_FILE), "{not json").unwrap();

        let err = storage.load_meta().unwrap_err();
        assert!(matches!(err, Error::JsonParseFailed { .. }));
    }
}
