use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::RAG_DIR_NAME;

pub const MANIFEST_VERSION: &str = "1.0";

/// Per-file bookkeeping used for change detection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileRecord {
    /// Hex SHA-256 of the file content.
    pub hash: String,
    pub size: u64,
    /// Modification time, float seconds since the Unix epoch.
    pub mtime: f64,
    /// Number of chunks this file produced (0 means no rows in the store).
    pub chunks: usize,
    pub indexed_at: String,
    pub language: String,
    pub encoding: String,
}

/// Per-project index manifest, persisted as `.mini-rag/manifest.json`.
///
/// Keys in `files` are project-relative, forward-slash paths. A `BTreeMap`
/// keeps the serialized key order stable across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub indexed_at: Option<String>,
    pub file_count: usize,
    pub chunk_count: usize,
    pub files: BTreeMap<String, FileRecord>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            indexed_at: None,
            file_count: 0,
            chunk_count: 0,
            files: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn path_for(project_path: &Path) -> PathBuf {
        project_path.join(RAG_DIR_NAME).join("manifest.json")
    }

    /// Load the manifest, or start fresh if it is missing or corrupt.
    pub fn load(project_path: &Path) -> Self {
        let path = Self::path_for(project_path);
        if !path.exists() {
            return Self::default();
        }
        match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("corrupt manifest at {}: {e}; starting fresh", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                warn!("unreadable manifest at {}: {e}; starting fresh", path.display());
                Self::default()
            }
        }
    }

    pub fn save(&self, project_path: &Path) -> Result<()> {
        let path = Self::path_for(project_path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    /// Recompute the aggregate counters from the per-file records.
    pub fn refresh_totals(&mut self) {
        self.file_count = self.files.len();
        self.chunk_count = self.files.values().map(|f| f.chunks).sum();
    }

    pub fn stamp(&mut self) {
        self.indexed_at = Some(chrono::Local::now().to_rfc3339());
        self.refresh_totals();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(chunks: usize) -> FileRecord {
        FileRecord {
            hash: "abc123".to_string(),
            size: 42,
            mtime: 1_700_000_000.25,
            chunks,
            indexed_at: "2024-01-01T00:00:00Z".to_string(),
            language: "python".to_string(),
            encoding: "utf-8".to_string(),
        }
    }

    #[test]
    fn round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let mut manifest = Manifest::default();
        manifest.files.insert("src/a.py".to_string(), record(3));
        manifest.files.insert("README.md".to_string(), record(2));
        manifest.stamp();
        manifest.save(dir.path()).unwrap();

        let loaded = Manifest::load(dir.path());
        assert_eq!(loaded.version, MANIFEST_VERSION);
        assert_eq!(loaded.file_count, 2);
        assert_eq!(loaded.chunk_count, 5);
        assert_eq!(loaded.files["src/a.py"], record(3));
        // mtime survives the JSON round trip exactly
        assert_eq!(loaded.files["README.md"].mtime, 1_700_000_000.25);
    }

    #[test]
    fn corrupt_manifest_degrades_to_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = Manifest::path_for(dir.path());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let loaded = Manifest::load(dir.path());
        assert!(loaded.files.is_empty());
        assert_eq!(loaded.indexed_at, None);
    }

    #[test]
    fn missing_manifest_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Manifest::load(dir.path());
        assert_eq!(loaded.file_count, 0);
        assert!(loaded.files.is_empty());
    }
}
