// Sunkfin Core - offline downloads for the Sunkfin media client
// Copyright (C) 2025 Sunkfin contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Metadata store: the on-disk record of what is downloaded
//!
//! Each persisted item is a file pair in the storage area:
//! - `{id}.{payload_extension}` - the media payload
//! - `{id}.{metadata_extension}` - JSON sidecar holding the `MediaItem`
//!
//! An item counts as downloaded only when both files are present. `save`
//! writes the payload before the sidecar, so an interrupted save leaves at
//! worst an orphaned payload, which `load` ignores.
//!
//! In-flight payloads live in the staging area as
//! `{id}.{session}.part` until they are committed.

use crate::download::config::DownloadConfig;
use crate::error::{Result, SunkfinError};
use crate::file::FileManager;
use crate::media::MediaItem;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A completed download known to the store
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersistedDownload {
    pub id: String,
    pub metadata: MediaItem,
    pub payload_path: PathBuf,
    pub payload_bytes: u64,
    pub downloaded_at: DateTime<Utc>,
}

/// One file that could not be removed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeletionFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Result of a best-effort delete
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeletionReport {
    pub id: String,
    pub failures: Vec<DeletionFailure>,
}

impl DeletionReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Check that an item identifier is usable as a file name stem
pub fn validate_item_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() {
        Some("identifier is empty")
    } else if id == "." || id == ".." {
        Some("identifier is a relative path component")
    } else if id.contains(['/', '\\']) {
        Some("identifier contains a path separator")
    } else if id.contains('\0') {
        Some("identifier contains a NUL byte")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SunkfinError::InvalidItemId {
            id: id.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Sidecar + payload storage for completed downloads
#[derive(Debug, Clone)]
pub struct MetadataStore {
    files: FileManager,
    staging_dir: PathBuf,
    payload_extension: String,
    metadata_extension: String,
}

impl MetadataStore {
    pub fn new(config: &DownloadConfig) -> Self {
        Self {
            files: FileManager::new(config.storage_dir.clone()),
            staging_dir: config.staging_dir(),
            payload_extension: config.payload_extension.clone(),
            metadata_extension: config.metadata_extension.clone(),
        }
    }

    pub fn storage_dir(&self) -> &Path {
        self.files.root()
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub fn payload_path(&self, id: &str) -> PathBuf {
        self.storage_dir()
            .join(format!("{}.{}", id, self.payload_extension))
    }

    pub fn metadata_path(&self, id: &str) -> PathBuf {
        self.storage_dir()
            .join(format!("{}.{}", id, self.metadata_extension))
    }

    /// Staging file for one transfer session of `id`
    pub fn staging_path(&self, id: &str, session: Uuid) -> PathBuf {
        self.staging_dir
            .join(format!("{}.{}.part", id, session.as_simple()))
    }

    /// Scan the storage area for complete file pairs
    ///
    /// Sidecars without a payload, undecodable sidecars and sidecars named
    /// with an invalid identifier are skipped. A missing storage area is empty.
    pub async fn load(&self) -> Result<Vec<PersistedDownload>> {
        let dir = self.storage_dir();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(SunkfinError::FileIoError(format!(
                    "Failed to read storage directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut loaded = Vec::new();
        while let Some(entry) = listed(entries.next_entry().await, dir) {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(self.metadata_extension.as_str()) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if id.starts_with('.') || validate_item_id(id).is_err() {
                continue;
            }
            if !FileManager::file_exists(&path).await {
                continue;
            }

            match self.load_entry(id, &path).await {
                Ok(Some(entry)) => loaded.push(entry),
                Ok(None) => debug!(item_id = %id, "skipping sidecar without payload"),
                Err(e) => warn!(item_id = %id, error = %e, "skipping unreadable sidecar"),
            }
        }

        loaded.sort_by(|a, b| a.id.cmp(&b.id));
        info!(count = loaded.len(), dir = %dir.display(), "loaded persisted downloads");
        Ok(loaded)
    }

    async fn load_entry(&self, id: &str, sidecar: &Path) -> Result<Option<PersistedDownload>> {
        let payload_path = self.payload_path(id);
        let payload_meta = match fs::metadata(&payload_path).await {
            Ok(meta) if meta.is_file() => meta,
            _ => return Ok(None),
        };

        let raw = fs::read(sidecar).await.map_err(|e| SunkfinError::DecodeFailed {
            path: sidecar.display().to_string(),
            reason: e.to_string(),
        })?;
        let metadata: MediaItem =
            serde_json::from_slice(&raw).map_err(|e| SunkfinError::DecodeFailed {
                path: sidecar.display().to_string(),
                reason: e.to_string(),
            })?;

        let downloaded_at = payload_meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(PersistedDownload {
            id: id.to_string(),
            metadata,
            payload_path,
            payload_bytes: payload_meta.len(),
            downloaded_at,
        }))
    }

    /// Commit a finished transfer
    ///
    /// Moves the staged payload into place, then writes the sidecar. If the
    /// sidecar cannot be written the payload is removed again, so a failed
    /// save never leaves a half-valid entry behind.
    pub async fn save(&self, id: &str, metadata: &MediaItem, staged: &Path) -> Result<PersistedDownload> {
        validate_item_id(id)?;

        let payload_path = self.payload_path(id);
        let sidecar_path = self.metadata_path(id);

        let sidecar = serde_json::to_vec_pretty(metadata).map_err(|e| {
            SunkfinError::commit_failed(id, format!("could not encode metadata: {}", e))
        });
        let sidecar = match sidecar {
            Ok(bytes) => bytes,
            Err(e) => {
                let _ = self.files.safe_delete(staged).await;
                return Err(e);
            }
        };

        if let Err(e) = self.files.ensure_directory_exists(self.storage_dir()).await {
            let _ = self.files.safe_delete(staged).await;
            return Err(SunkfinError::commit_failed(id, e.to_string()));
        }

        if let Err(e) = self.files.safe_move(staged, &payload_path).await {
            let _ = self.files.safe_delete(staged).await;
            let _ = self.files.safe_delete(&payload_path).await;
            return Err(SunkfinError::commit_failed(
                id,
                format!("could not move payload: {}", e),
            ));
        }

        if let Err(e) = self.files.atomic_write(&sidecar_path, &sidecar).await {
            if let Err(cleanup) = self.files.safe_delete(&payload_path).await {
                warn!(item_id = %id, error = %cleanup, "could not remove payload after failed commit");
            }
            return Err(SunkfinError::commit_failed(
                id,
                format!("could not write metadata: {}", e),
            ));
        }

        let payload_bytes = FileManager::get_file_size(&payload_path).await.unwrap_or(0);
        debug!(item_id = %id, bytes = payload_bytes, "committed download");

        Ok(PersistedDownload {
            id: id.to_string(),
            metadata: metadata.clone(),
            payload_path,
            payload_bytes,
            downloaded_at: Utc::now(),
        })
    }

    /// Remove both files of `id`; each removal is attempted independently
    ///
    /// The sidecar goes first, so a partial delete leaves an orphaned
    /// payload rather than a dangling entry.
    pub async fn delete(&self, id: &str) -> DeletionReport {
        let mut report = DeletionReport {
            id: id.to_string(),
            failures: Vec::new(),
        };

        if let Err(e) = validate_item_id(id) {
            report.failures.push(DeletionFailure {
                path: self.storage_dir().to_path_buf(),
                error: e.to_string(),
            });
            return report;
        }

        for path in [self.metadata_path(id), self.payload_path(id)] {
            if let Err(e) = self.files.safe_delete(&path).await {
                warn!(item_id = %id, path = %path.display(), error = %e, "delete failed");
                report.failures.push(DeletionFailure {
                    path,
                    error: e.to_string(),
                });
            }
        }

        debug!(item_id = %id, complete = report.is_complete(), "deleted download files");
        report
    }

    /// Remove leftover partial payloads from earlier runs
    pub async fn purge_staging(&self) -> Result<usize> {
        let removed = self.files.clear_directory(&self.staging_dir).await?;
        if removed > 0 {
            info!(count = removed, "purged stale partial payloads");
        }
        Ok(removed)
    }
}

/// Next entry of a directory listing; a listing error ends the scan
fn listed<T>(next: std::io::Result<Option<T>>, dir: &Path) -> Option<T> {
    match next {
        Ok(entry) => entry,
        Err(e) => {
            warn!(dir = %dir.display(), error = %e, "storage listing interrupted");
            None
        }
    }
}
