//! # Snapshot persistence
//!
//! Keeps a JSON copy of the latest [`MeshSnapshot`] on disk for dashboards and for the
//! `status` command. Every write goes to a unique temp file in the same directory and
//! is renamed over the destination, so readers never observe a partial document.
//!
//! ```json
//! {
//!   "self": { "id": "001", "x": 55.755864, "y": 37.617698 },
//!   "neighbors": [
//!     { "id": "002", "x": 55.8, "y": 37.7, "timestamp": 1714564800.25, "dBm": -67.0 }
//!   ]
//! }
//! ```

pub mod lock;

use crate::mesh::{MeshSnapshot, SnapshotPersister};
use anyhow::{anyhow, Result};
use log::debug;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Atomic JSON file holding the latest mesh snapshot.
#[derive(Debug, Clone)]
pub struct SnapshotFile {
    path: PathBuf,
}

impl SnapshotFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<MeshSnapshot> {
        let content = fs::read_to_string(&self.path)
            .map_err(|e| anyhow!("Failed to read snapshot {}: {}", self.path.display(), e))?;
        // Guard against accidental leading NULs from previous partial writes
        let cleaned = content.trim_start_matches('\0');
        let snapshot = serde_json::from_str(cleaned)
            .map_err(|e| anyhow!("Failed to parse snapshot {}: {}", self.path.display(), e))?;
        Ok(snapshot)
    }

    pub fn save(&self, snapshot: &MeshSnapshot) -> Result<()> {
        let content = serde_json::to_string_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let base = self
            .path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("mesh_snapshot.json");
        let mut counter = 0u32;
        let tmp_path = loop {
            let candidate = dir.join(format!(".{}.tmp-{}-{}", base, std::process::id(), counter));
            match OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&candidate)
            {
                Ok(mut tmp) => {
                    tmp.write_all(content.as_bytes())?;
                    tmp.flush()?;
                    let _ = tmp.sync_all();
                    break candidate;
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    counter = counter.saturating_add(1);
                    continue;
                }
                Err(e) => {
                    return Err(anyhow!(
                        "Failed to create temp file for atomic write: {}",
                        e
                    ))
                }
            }
        };

        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        if let Ok(dir_file) = File::open(dir) {
            let _ = dir_file.sync_all();
        }
        debug!(
            "Saved mesh snapshot ({} neighbors) to {}",
            snapshot.neighbors.len(),
            self.path.display()
        );
        Ok(())
    }
}

impl SnapshotPersister for SnapshotFile {
    fn persist(&self, snapshot: &MeshSnapshot) -> Result<()> {
        self.save(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{PeerState, SelfState};
    use chrono::DateTime;
    use tempfile::tempdir;

    fn sample() -> MeshSnapshot {
        MeshSnapshot {
            self_state: SelfState::new("001", 55.755864, 37.617698),
            neighbors: vec![PeerState {
                id: "002".into(),
                x: 55.8,
                y: 37.7,
                updated_at: DateTime::from_timestamp_micros(1_714_564_800_250_000).unwrap(),
                signal_strength: Some(-67.0),
            }],
        }
    }

    #[test]
    fn save_then_load_returns_same_snapshot() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("nested/mesh.json"));
        let snap = sample();
        file.save(&snap).unwrap();
        assert_eq!(file.load().unwrap(), snap);
    }

    #[test]
    fn save_overwrites_and_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("mesh.json"));
        file.save(&sample()).unwrap();
        let mut second = sample();
        second.neighbors.clear();
        file.persist(&second).unwrap();

        assert!(file.load().unwrap().neighbors.is_empty());
        let entries: Vec<_> = fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn written_document_uses_viewer_field_names() {
        let dir = tempdir().unwrap();
        let file = SnapshotFile::new(dir.path().join("mesh.json"));
        file.save(&sample()).unwrap();
        let raw = fs::read_to_string(file.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["self"]["id"], "001");
        assert_eq!(value["neighbors"][0]["dBm"], -67.0);
        assert_eq!(value["neighbors"][0]["timestamp"], 1714564800.25);
    }
}
