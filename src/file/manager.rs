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


//! File operations for the download storage area
//!
//! # Key Operations
//! - Safe moves (atomic rename when possible, copy fallback, with retry)
//! - Best-effort deletes (missing files are not errors)
//! - Atomic writes (temp file, fsync, rename)
//! - Sweeping a scratch directory

use crate::error::{Result, SunkfinError};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Maximum retry attempts for file operations
const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Delay between retry attempts
const RETRY_DELAY: Duration = Duration::from_millis(100);

/// File manager rooted at the download storage area
#[derive(Debug, Clone)]
pub struct FileManager {
    root: PathBuf,
}

impl FileManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Move `source` to `destination`, replacing whatever is there
    ///
    /// 1. Source must exist
    /// 2. Delete destination if it exists
    /// 3. Create destination directory
    /// 4. Rename (atomic on the same filesystem), else copy and remove
    /// 5. Retry up to 3 times on failure
    pub async fn safe_move(&self, source: &Path, destination: &Path) -> Result<()> {
        if !Self::file_exists(source).await {
            return Err(SunkfinError::FileNotFound(source.display().to_string()));
        }

        let mut attempts = 0;
        loop {
            attempts += 1;

            match self.try_move(source, destination).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(SunkfinError::FileIoError(format!(
                        "Failed to move file after {} attempts: {} -> {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        source.display(),
                        destination.display(),
                        e
                    )));
                }
                Err(e) => {
                    debug!(error = %e, attempt = attempts, "move failed, retrying");
                    sleep(RETRY_DELAY).await;
                }
            }
        }
    }

    async fn try_move(&self, source: &Path, destination: &Path) -> Result<()> {
        if Self::file_exists(destination).await {
            Self::delete_once(destination).await?;
        }

        if let Some(parent) = destination.parent() {
            self.ensure_directory_exists(parent).await?;
        }

        if fs::rename(source, destination).await.is_ok() {
            return Ok(());
        }

        // Different filesystem: copy, then drop the source
        fs::copy(source, destination).await.map_err(|e| {
            SunkfinError::FileIoError(format!(
                "Move failed: {} -> {}: {}",
                source.display(),
                destination.display(),
                e
            ))
        })?;
        if let Err(e) = fs::remove_file(source).await {
            warn!(path = %source.display(), error = %e, "moved file but could not remove source");
        }

        Ok(())
    }

    /// Delete a file with retry; a missing file is not an error
    pub async fn safe_delete(&self, path: &Path) -> Result<()> {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match Self::delete_once(path).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts >= MAX_RETRY_ATTEMPTS => {
                    return Err(SunkfinError::FileIoError(format!(
                        "Failed to delete file after {} attempts: {}: {}",
                        MAX_RETRY_ATTEMPTS,
                        path.display(),
                        e
                    )));
                }
                Err(_) => sleep(RETRY_DELAY).await,
            }
        }
    }

    async fn delete_once(path: &Path) -> Result<()> {
        match fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SunkfinError::FileIoError(format!(
                "Delete failed: {}: {}",
                path.display(),
                e
            ))),
        }
    }

    /// Ensure directory exists, creating parent directories as needed
    pub async fn ensure_directory_exists(&self, path: &Path) -> Result<()> {
        if fs::try_exists(path).await.unwrap_or(false) {
            return Ok(());
        }

        fs::create_dir_all(path).await.map_err(|e| {
            SunkfinError::FileIoError(format!(
                "Failed to create directory {}: {}",
                path.display(),
                e
            ))
        })
    }

    /// Check that a regular file exists at `path`
    pub async fn file_exists(path: &Path) -> bool {
        match fs::metadata(path).await {
            Ok(metadata) => metadata.is_file(),
            Err(_) => false,
        }
    }

    /// Get file size in bytes
    pub async fn get_file_size(path: &Path) -> Result<u64> {
        let metadata = fs::metadata(path).await.map_err(|e| {
            SunkfinError::FileIoError(format!("Failed to get file size {}: {}", path.display(), e))
        })?;

        Ok(metadata.len())
    }

    /// Atomic write: write to temp file, sync, then rename over `path`
    pub async fn atomic_write(&self, path: &Path, contents: &[u8]) -> Result<()> {
        let file_name = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("file");
        let temp_path = match path.parent() {
            Some(parent) => parent.join(format!(".{}.tmp", file_name)),
            None => PathBuf::from(format!(".{}.tmp", file_name)),
        };

        let result = Self::write_and_rename(&temp_path, path, contents).await;
        if result.is_err() {
            let _ = Self::delete_once(&temp_path).await;
        }
        result
    }

    async fn write_and_rename(temp_path: &Path, path: &Path, contents: &[u8]) -> Result<()> {
        let mut file = fs::File::create(temp_path).await.map_err(|e| {
            SunkfinError::FileIoError(format!(
                "Failed to create temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        file.write_all(contents).await.map_err(|e| {
            SunkfinError::FileIoError(format!(
                "Failed to write temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;

        file.sync_all().await.map_err(|e| {
            SunkfinError::FileIoError(format!(
                "Failed to sync temp file {}: {}",
                temp_path.display(),
                e
            ))
        })?;
        drop(file);

        fs::rename(temp_path, path).await.map_err(|e| {
            SunkfinError::FileIoError(format!(
                "Failed to rename temp file {} to {}: {}",
                temp_path.display(),
                path.display(),
                e
            ))
        })
    }

    /// Remove every regular file directly inside `dir`
    ///
    /// Returns the number of files removed. A missing directory counts as empty.
    pub async fn clear_directory(&self, dir: &Path) -> Result<usize> {
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(SunkfinError::FileIoError(format!(
                    "Failed to read directory {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        let mut count = 0;
        while let Some(entry) = entries.next_entry().await.map_err(|e| {
            SunkfinError::FileIoError(format!(
                "Failed to read directory entry in {}: {}",
                dir.display(),
                e
            ))
        })? {
            let path = entry.path();
            if !Self::file_exists(&path).await {
                continue;
            }
            match Self::delete_once(&path).await {
                Ok(()) => count += 1,
                Err(e) => warn!(error = %e, "could not remove leftover file"),
            }
        }

        Ok(count)
    }
}
