// Copyright (c) 2024-2025 Federico G. Schwindt

use serde::{Deserialize, Serialize};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;
use tokio::fs;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Failed to serialize hash index: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("Failed to write hash index to {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Locations owning one content hash. A single entry fans out to a set only
/// when distinct (series, period) keys stored byte-identical payloads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Locations {
    Single(String),
    Many(BTreeSet<String>),
}

impl Locations {
    fn contains(&self, location: &str) -> bool {
        match self {
            Locations::Single(path) => path == location,
            Locations::Many(paths) => paths.contains(location),
        }
    }
}

/// Persisted sha256 -> location(s) mapping used for payload deduplication.
///
/// The index is a rebuildable cache of what is on disk, not a source of
/// truth: a lost or corrupt index file only costs dedup accuracy until the
/// artifacts are rehashed. Keys and location sets are kept sorted so the
/// serialized file diffs reproducibly.
#[derive(Default, Serialize, Deserialize)]
pub struct HashIndex {
    #[serde(flatten)]
    entries: BTreeMap<String, Locations>,
    #[serde(skip)]
    path: PathBuf,
}

impl HashIndex {
    /// Loads the index from `path`. A missing or unreadable file yields an
    /// empty index; an unparsable one is discarded with a warning since it
    /// can be rebuilt from the artifacts.
    pub async fn load(path: &PathBuf) -> Self {
        let entries = match fs::read_to_string(path).await {
            Ok(content) => match serde_json::from_str::<HashIndex>(&content) {
                Ok(index) => index.entries,
                Err(err) => {
                    tracing::warn!("Discarding unparsable hash index {}: {err}", path.display());
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self {
            entries,
            path: path.to_path_buf(),
        }
    }

    pub async fn save(&self) -> Result<(), IndexError> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(&self.path, content)
            .await
            .map_err(|source| IndexError::Write {
                path: self.path.display().to_string(),
                source,
            })?;
        Ok(())
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.entries.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Binds `location` to `hash`, widening the entry to a set when the hash
    /// already maps to a different location.
    pub fn insert(&mut self, hash: &str, location: &str) {
        match self.entries.entry(hash.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(Locations::Single(location.to_string()));
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if entry.contains(location) {
                    return;
                }
                match entry {
                    Locations::Single(existing) => {
                        let paths =
                            BTreeSet::from([std::mem::take(existing), location.to_string()]);
                        *entry = Locations::Many(paths);
                    }
                    Locations::Many(paths) => {
                        paths.insert(location.to_string());
                    }
                }
            }
        }
    }

    /// Removes `location` from the entry under `hash`, dropping the entry
    /// once its last location is gone.
    pub fn remove_location(&mut self, hash: &str, location: &str) {
        let remove_entry = match self.entries.get_mut(hash) {
            None => false,
            Some(Locations::Single(existing)) => existing == location,
            Some(Locations::Many(paths)) => {
                paths.remove(location);
                paths.len() <= 1
            }
        };
        if remove_entry {
            if let Some(Locations::Many(paths)) = self.entries.get(hash) {
                // Collapse a one-element set back to the single form.
                if let Some(only) = paths.iter().next().cloned() {
                    self.entries.insert(hash.to_string(), Locations::Single(only));
                    return;
                }
            }
            self.entries.remove(hash);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let index = HashIndex::load(&dir.path().join("hash_index.json")).await;
        assert_eq!(index.len(), 0);
    }

    #[tokio::test]
    async fn round_trips_single_and_many() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hash_index.json");

        let mut index = HashIndex::load(&path).await;
        index.insert("aa11", "series_a_2024_01.csv");
        index.insert("bb22", "series_a_2024_02.csv");
        index.insert("bb22", "series_b_2024_02.csv");
        index.save().await.unwrap();

        let reloaded = HashIndex::load(&path).await;
        assert_eq!(reloaded.len(), 2);
        assert!(reloaded.contains("aa11"));
        assert_eq!(
            reloaded.entries.get("bb22"),
            Some(&Locations::Many(BTreeSet::from([
                "series_a_2024_02.csv".to_string(),
                "series_b_2024_02.csv".to_string(),
            ])))
        );
    }

    #[tokio::test]
    async fn serialized_form_is_a_flat_object() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hash_index.json");

        let mut index = HashIndex::load(&path).await;
        index.insert("cc33", "series_a_2024_03.csv");
        index.save().await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["cc33"], "series_a_2024_03.csv");
    }

    #[tokio::test]
    async fn insert_is_idempotent_per_location() {
        let dir = TempDir::new().unwrap();
        let mut index = HashIndex::load(&dir.path().join("i.json")).await;
        index.insert("dd44", "one.csv");
        index.insert("dd44", "one.csv");
        assert_eq!(
            index.entries.get("dd44"),
            Some(&Locations::Single("one.csv".to_string()))
        );
    }

    #[tokio::test]
    async fn remove_location_collapses_and_drops() {
        let dir = TempDir::new().unwrap();
        let mut index = HashIndex::load(&dir.path().join("i.json")).await;
        index.insert("ee55", "one.csv");
        index.insert("ee55", "two.csv");

        index.remove_location("ee55", "two.csv");
        assert_eq!(
            index.entries.get("ee55"),
            Some(&Locations::Single("one.csv".to_string()))
        );

        index.remove_location("ee55", "one.csv");
        assert!(!index.contains("ee55"));
    }

    #[tokio::test]
    async fn unparsable_index_is_discarded() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hash_index.json");
        std::fs::write(&path, "not json").unwrap();

        let index = HashIndex::load(&path).await;
        assert_eq!(index.len(), 0);
    }
}
