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


//! Download configuration
//!
//! The app shell hands this over as JSON when it creates the manager; every
//! field has a default so an empty object is a valid configuration.

use crate::error::{Result, SunkfinError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Download manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Directory holding persisted payloads and their metadata sidecars
    pub storage_dir: PathBuf,

    /// Directory for in-flight partial payloads (default: `{storage_dir}/.staging`)
    pub staging_dir: Option<PathBuf>,

    /// Payload file extension, without the dot
    pub payload_extension: String,

    /// Sidecar file extension, without the dot
    pub metadata_extension: String,

    /// Maximum simultaneous transfers (`None` = unlimited)
    pub max_concurrent_downloads: Option<usize>,

    /// Minimum interval between progress publications for one transfer
    pub progress_interval_ms: u64,

    /// Samples closer together than this don't produce a speed reading
    pub speed_sample_min_ms: u64,

    /// Exponential smoothing factor for download speed, in (0, 1]
    pub speed_smoothing: f64,

    /// HTTP connect timeout
    pub request_timeout_secs: u64,

    /// How long cancellation waits for a transfer to clean up
    pub cancel_grace_ms: u64,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("downloads"),
            staging_dir: None,
            payload_extension: "mp4".to_string(),
            metadata_extension: "json".to_string(),
            max_concurrent_downloads: None,
            progress_interval_ms: 200,
            speed_sample_min_ms: 50,
            speed_smoothing: 0.3,
            request_timeout_secs: 30,
            cancel_grace_ms: 2_000,
        }
    }
}

impl DownloadConfig {
    /// Config rooted at `storage_dir` with everything else defaulted
    pub fn new(storage_dir: impl Into<PathBuf>) -> Self {
        Self {
            storage_dir: storage_dir.into(),
            ..Default::default()
        }
    }

    /// Parse from the JSON handed over by the app shell
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, ext) in [
            ("payload_extension", &self.payload_extension),
            ("metadata_extension", &self.metadata_extension),
        ] {
            if ext.is_empty() || ext.contains(['/', '\\', '.', '\0']) {
                return Err(SunkfinError::InvalidConfiguration(format!(
                    "{} must be a bare extension, got '{}'",
                    name, ext
                )));
            }
        }
        if self.payload_extension == self.metadata_extension {
            return Err(SunkfinError::InvalidConfiguration(
                "payload and metadata extensions must differ".to_string(),
            ));
        }
        if !(self.speed_smoothing > 0.0 && self.speed_smoothing <= 1.0) {
            return Err(SunkfinError::InvalidConfiguration(format!(
                "speed_smoothing must be in (0, 1], got {}",
                self.speed_smoothing
            )));
        }
        if self.max_concurrent_downloads == Some(0) {
            return Err(SunkfinError::InvalidConfiguration(
                "max_concurrent_downloads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.storage_dir.join(".staging"))
    }

    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn speed_sample_min(&self) -> Duration {
        Duration::from_millis(self.speed_sample_min_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
