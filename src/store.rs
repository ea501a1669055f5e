// Copyright (c) 2024-2025 Federico G. Schwindt <fgsch@lodoss.net>
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt as _, sync::Mutex};

use crate::calendar::Cadence;
use crate::gaps;
use crate::index::HashIndex;

const METADATA_DIR: &str = ".metadata";
const HASH_INDEX_FILENAME: &str = "hash_index.json";
const DATA_EXTENSION: &str = "csv";

/// Upstream payloads are Shift_JIS CSV; the store treats them as opaque
/// bytes and never transcodes.
pub const PAYLOAD_ENCODING: &str = "shift_jis";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("invalid series name {name:?}: only alphanumerics and underscores are allowed")]
    InvalidIdentifier { name: String },
    #[error("{operation} on {path} failed: {source}")]
    Io {
        operation: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode metadata for {path}: {source}")]
    Metadata {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Side-record stored next to each artifact, under the metadata directory.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    pub filename: String,
    pub data_type: String,
    pub year: i32,
    pub period: u32,
    pub period_type: String,
    pub timestamp: DateTime<Utc>,
    pub file_size: u64,
    pub sha256_hash: String,
    pub encoding: String,
    pub file_path: String,
    pub force_overwrite: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug)]
pub struct SaveOutcome {
    pub path: Option<PathBuf>,
    pub metadata_path: Option<PathBuf>,
    pub duplicate: bool,
    pub is_new_file: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct StoreStats {
    pub total_files: u64,
    pub total_bytes: u64,
    pub per_series: BTreeMap<String, u64>,
    pub per_year: BTreeMap<i32, u64>,
    pub index_size: usize,
}

struct TempFileGuard<'a> {
    path: &'a Path,
    delete_on_drop: bool,
}

impl Drop for TempFileGuard<'_> {
    fn drop(&mut self) {
        if self.delete_on_drop {
            let _ = std::fs::remove_file(self.path);
        }
    }
}

/// Content-addressed artifact store over a flat directory.
///
/// Artifacts live directly under the base directory with deterministic
/// names; side-records and the hash index live under `.metadata/`. Index
/// mutation is serialized by an in-process mutex; the store assumes a
/// single writer per base directory and does not guard against concurrent
/// external writers.
pub struct Store {
    base_dir: PathBuf,
    metadata_dir: PathBuf,
    index: Mutex<HashIndex>,
}

fn validate_identifier(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(StoreError::InvalidIdentifier {
            name: name.to_string(),
        });
    }
    Ok(())
}

fn io_error(operation: &'static str, path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.display().to_string();
    move |source| StoreError::Io {
        operation,
        path,
        source,
    }
}

/// Writes `payload` to a sibling `.part` file and renames it into place.
/// On any failure the temp file is removed and nothing appears at
/// `final_path` that was not already there.
async fn write_atomic(payload: &[u8], final_path: &Path) -> Result<(), StoreError> {
    let part_path = final_path.with_extension("part");
    let mut guard = TempFileGuard {
        path: part_path.as_path(),
        delete_on_drop: true,
    };

    let mut file = fs::File::create(&part_path)
        .await
        .map_err(io_error("create", &part_path))?;
    file.write_all(payload)
        .await
        .map_err(io_error("write", &part_path))?;
    file.shutdown()
        .await
        .map_err(io_error("flush", &part_path))?;

    match fs::remove_file(final_path).await {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(StoreError::Io {
                operation: "replace",
                path: final_path.display().to_string(),
                source,
            })
        }
    }
    fs::rename(&part_path, final_path)
        .await
        .map_err(io_error("rename", final_path))?;
    guard.delete_on_drop = false;
    Ok(())
}

impl Store {
    pub async fn open(base_dir: &Path) -> Result<Self, StoreError> {
        let metadata_dir = base_dir.join(METADATA_DIR);
        fs::create_dir_all(&metadata_dir)
            .await
            .map_err(io_error("create", &metadata_dir))?;

        let index = HashIndex::load(&metadata_dir.join(HASH_INDEX_FILENAME)).await;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            metadata_dir,
            index: Mutex::new(index),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn artifact_name(series_name: &str, year: i32, period: u32) -> String {
        format!("{series_name}_{year:04}_{period:02}.{DATA_EXTENSION}")
    }

    fn metadata_name(series_name: &str, year: i32, period: u32) -> String {
        format!("{series_name}_{year:04}_{period:02}.json")
    }

    /// Persists `payload` under its deterministic name, deduplicating by
    /// content hash. `force_overwrite` bypasses dedup and replaces whatever
    /// currently holds the (series, year, period) key, keeping the index
    /// consistent with the displaced file.
    #[allow(clippy::too_many_arguments)]
    pub async fn save(
        &self,
        series_name: &str,
        year: i32,
        period: u32,
        cadence: Cadence,
        payload: &[u8],
        extra: serde_json::Map<String, serde_json::Value>,
        force_overwrite: bool,
    ) -> Result<SaveOutcome, StoreError> {
        validate_identifier(series_name)?;

        let hash = hex::encode(Sha256::digest(payload));
        let mut index = self.index.lock().await;

        if !force_overwrite && index.contains(&hash) {
            tracing::info!("Duplicate payload for {series_name} {year}/{period:02} (hash {}...)", &hash[..16]);
            return Ok(SaveOutcome {
                path: None,
                metadata_path: None,
                duplicate: true,
                is_new_file: false,
            });
        }

        let filename = Self::artifact_name(series_name, year, period);
        let final_path = self.base_dir.join(&filename);
        let is_new_file = !fs::try_exists(&final_path).await.unwrap_or(false);

        if force_overwrite && !is_new_file {
            // Unbind the displaced file's hash before the overwrite so the
            // index never points at bytes that are gone.
            let old_payload = fs::read(&final_path)
                .await
                .map_err(io_error("read", &final_path))?;
            let old_hash = hex::encode(Sha256::digest(&old_payload));
            index.remove_location(&old_hash, &filename);
        }

        write_atomic(payload, &final_path).await?;

        let metadata = ArtifactMetadata {
            filename: filename.clone(),
            data_type: series_name.to_string(),
            year,
            period,
            period_type: cadence.label().to_string(),
            timestamp: Utc::now(),
            file_size: payload.len() as u64,
            sha256_hash: hash.clone(),
            encoding: PAYLOAD_ENCODING.to_string(),
            file_path: filename.clone(),
            force_overwrite,
            extra,
        };
        let metadata_path = self
            .metadata_dir
            .join(Self::metadata_name(series_name, year, period));
        let encoded = serde_json::to_vec_pretty(&metadata).map_err(|source| {
            StoreError::Metadata {
                path: metadata_path.display().to_string(),
                source,
            }
        })?;
        fs::write(&metadata_path, encoded)
            .await
            .map_err(io_error("write", &metadata_path))?;

        index.insert(&hash, &filename);
        if let Err(err) = index.save().await {
            // The index is a rebuildable cache; the artifact stays.
            tracing::warn!("Failed to persist hash index: {err}");
        }

        tracing::info!("Saved {}", final_path.display());
        Ok(SaveOutcome {
            path: Some(final_path),
            metadata_path: Some(metadata_path),
            duplicate: false,
            is_new_file,
        })
    }

    /// Pure index lookup.
    pub async fn check_duplicate(&self, hash: &str) -> bool {
        self.index.lock().await.contains(hash)
    }

    /// Stored artifact paths, optionally narrowed to a series (substring
    /// match on the filename) and a year (parsed from the filename, not
    /// from any directory structure). Sorted for stable output.
    pub async fn list_existing(
        &self,
        series_name: Option<&str>,
        year: Option<i32>,
    ) -> Result<Vec<PathBuf>, StoreError> {
        let mut entries = fs::read_dir(&self.base_dir)
            .await
            .map_err(io_error("read", &self.base_dir))?;
        let mut files = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(io_error("read", &self.base_dir))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(DATA_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some(series) = series_name {
                if !stem.contains(series) {
                    continue;
                }
            }
            if let Some(want_year) = year {
                match gaps::parse_year_period(stem) {
                    Some((file_year, _)) if file_year == want_year => {}
                    _ => continue,
                }
            }
            files.push(path);
        }

        files.sort();
        Ok(files)
    }

    /// Loads the side-record for an artifact path, if one exists.
    pub async fn get_metadata(&self, path: &Path) -> Option<ArtifactMetadata> {
        let stem = path.file_stem()?.to_str()?;
        let metadata_path = self.metadata_dir.join(format!("{stem}.json"));
        let content = fs::read_to_string(&metadata_path).await.ok()?;
        match serde_json::from_str(&content) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                tracing::warn!("Failed to parse metadata {}: {err}", metadata_path.display());
                None
            }
        }
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let mut stats = StoreStats::default();
        for path in self.list_existing(None, None).await? {
            let size = fs::metadata(&path)
                .await
                .map_err(io_error("stat", &path))?
                .len();
            stats.total_files += 1;
            stats.total_bytes += size;

            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            for kind in crate::series::SeriesKind::ALL {
                if stem.starts_with(kind.name()) {
                    *stats.per_series.entry(kind.name().to_string()).or_default() += 1;
                    break;
                }
            }
            if let Some((year, _)) = gaps::parse_year_period(stem) {
                *stats.per_year.entry(year).or_default() += 1;
            }
        }
        stats.index_size = self.index.lock().await.len();
        Ok(stats)
    }

    /// Age-based retention sweep: deletes artifacts whose side-record
    /// timestamp is older than the cutoff, removing the side-record and the
    /// index binding alongside. Returns the number of artifacts deleted.
    pub async fn cleanup_old_files(&self, days_to_keep: u32) -> Result<u64, StoreError> {
        let cutoff = Utc::now() - Duration::days(days_to_keep as i64);
        let mut deleted = 0;
        let mut index = self.index.lock().await;

        for path in self.list_existing(None, None).await? {
            let Some(metadata) = self.get_metadata(&path).await else {
                continue;
            };
            if metadata.timestamp >= cutoff {
                continue;
            }

            fs::remove_file(&path)
                .await
                .map_err(io_error("remove", &path))?;
            index.remove_location(&metadata.sha256_hash, &metadata.filename);

            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                let metadata_path = self.metadata_dir.join(format!("{stem}.json"));
                match fs::remove_file(&metadata_path).await {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(source) => {
                        return Err(StoreError::Io {
                            operation: "remove",
                            path: metadata_path.display().to_string(),
                            source,
                        })
                    }
                }
            }

            deleted += 1;
            tracing::info!("Deleted expired artifact {}", path.display());
        }

        if deleted > 0 {
            if let Err(err) = index.save().await {
                tracing::warn!("Failed to persist hash index: {err}");
            }
        }
        tracing::info!("Retention sweep removed {deleted} artifacts");
        Ok(deleted)
    }
}
