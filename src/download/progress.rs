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


//! Download record state and progress math
//!
//! # Progress Information
//! - Item identifier and (optional) metadata snapshot
//! - Bytes downloaded / total bytes (0 = unknown)
//! - Smoothed speed in bytes per second
//! - Estimated time remaining
//! - Status (pending, transferring)
//!
//! Byte counts are formatted in binary units: `format_bytes(1536)` is
//! `"1.50 KB"`, `format_rate(1_048_576.0)` is `"1.0 MB/s"`.

use crate::media::MediaItem;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const KB: f64 = 1024.0;
const MB: f64 = KB * 1024.0;
const GB: f64 = MB * 1024.0;

/// Status of an active download
///
/// Terminal states are not represented: a record leaves the active mapping
/// when it completes, fails or is cancelled. Cancellation removes the record
/// in the same step that signals the session, so there is no observable
/// cancelling state; observers see a `Cancelled` event instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    /// Created; transfer not yet acknowledged (or queued behind the concurrency cap)
    Pending,
    /// Byte stream active
    Transferring,
    /// All bytes received; payload and sidecar being written
    Committing,
}

/// Smoothed transfer-rate estimator
///
/// Each sample is the cumulative byte count at an instant. Samples closer
/// than `min_interval` to the last accepted one are folded into the next
/// reading instead of producing a spike.
#[derive(Debug, Clone)]
pub struct SpeedEstimator {
    last_sample: Option<(Instant, u64)>,
    speed: f64,
    min_interval: Duration,
    smoothing: f64,
}

impl SpeedEstimator {
    pub fn new(min_interval: Duration, smoothing: f64) -> Self {
        Self {
            last_sample: None,
            speed: 0.0,
            min_interval,
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
        }
    }

    /// Record a cumulative position and return the current speed
    pub fn add_sample(&mut self, at: Instant, position: u64) -> f64 {
        let Some((last_at, last_position)) = self.last_sample else {
            self.last_sample = Some((at, position));
            return self.speed;
        };

        let elapsed = at.saturating_duration_since(last_at);
        if elapsed < self.min_interval {
            return self.speed;
        }

        let delta = position.saturating_sub(last_position) as f64;
        let instantaneous = delta / elapsed.as_secs_f64();
        self.speed = if self.speed > 0.0 {
            self.smoothing * instantaneous + (1.0 - self.smoothing) * self.speed
        } else {
            instantaneous
        };
        self.last_sample = Some((at, position));
        self.speed
    }

    pub fn speed(&self) -> f64 {
        self.speed
    }
}

impl Default for SpeedEstimator {
    fn default() -> Self {
        Self::new(Duration::from_millis(50), 0.3)
    }
}

/// Observable state of one in-flight download
#[derive(Debug, Clone, Serialize)]
pub struct DownloadRecord {
    pub id: String,

    /// Metadata captured when the download was started
    pub metadata: Option<MediaItem>,

    pub bytes_downloaded: u64,

    /// Total size in bytes; 0 if the server didn't say
    pub total_bytes: u64,

    /// Fraction complete in [0, 1]
    pub progress: f64,

    /// Smoothed bytes per second
    pub download_speed: f64,

    /// Seconds remaining, when both speed and total are known
    pub estimated_time_remaining: Option<f64>,

    pub status: DownloadStatus,

    pub started_at: DateTime<Utc>,

    #[serde(skip)]
    pub(crate) session: Uuid,

    #[serde(skip)]
    estimator: SpeedEstimator,
}

impl DownloadRecord {
    pub fn new(id: String, metadata: Option<MediaItem>, estimator: SpeedEstimator) -> Self {
        Self {
            id,
            metadata,
            bytes_downloaded: 0,
            total_bytes: 0,
            progress: 0.0,
            download_speed: 0.0,
            estimated_time_remaining: None,
            status: DownloadStatus::Pending,
            started_at: Utc::now(),
            session: Uuid::new_v4(),
            estimator,
        }
    }

    pub fn session(&self) -> Uuid {
        self.session
    }

    /// Transfer acknowledged by the network layer
    pub fn mark_transferring(&mut self, total_bytes: Option<u64>, at: Instant) {
        self.status = DownloadStatus::Transferring;
        if let Some(total) = total_bytes {
            self.total_bytes = total;
        }
        self.estimator.add_sample(at, self.bytes_downloaded);
        self.recalculate();
    }

    /// Apply a cumulative progress reading
    pub fn apply_progress(&mut self, bytes_downloaded: u64, total_bytes: Option<u64>, at: Instant) {
        self.status = DownloadStatus::Transferring;
        if let Some(total) = total_bytes {
            self.total_bytes = total;
        }
        self.bytes_downloaded = if self.total_bytes > 0 {
            bytes_downloaded.min(self.total_bytes)
        } else {
            bytes_downloaded
        };
        self.download_speed = self.estimator.add_sample(at, self.bytes_downloaded);
        self.recalculate();
    }

    /// Transfer finished; the files are being written
    pub fn mark_committing(&mut self) {
        self.status = DownloadStatus::Committing;
        self.download_speed = 0.0;
        self.estimated_time_remaining = None;
    }

    fn recalculate(&mut self) {
        self.progress = if self.total_bytes > 0 {
            (self.bytes_downloaded as f64 / self.total_bytes as f64).clamp(0.0, 1.0)
        } else {
            0.0
        };

        self.estimated_time_remaining = if self.download_speed > 0.0 && self.total_bytes > 0 {
            let remaining = self.total_bytes.saturating_sub(self.bytes_downloaded);
            Some(remaining as f64 / self.download_speed)
        } else {
            None
        };
    }

    /// Name to show in the downloads list
    pub fn display_name(&self) -> &str {
        self.metadata
            .as_ref()
            .map(|m| m.display_name())
            .unwrap_or("Downloading...")
    }

    /// e.g. "2.5 MB/s"
    pub fn speed_string(&self) -> String {
        format_rate(self.download_speed)
    }

    /// e.g. "5m 30s"
    pub fn eta_string(&self) -> String {
        match self.estimated_time_remaining {
            Some(seconds) => format_eta(seconds),
            None => "calculating...".to_string(),
        }
    }

    /// e.g. "45.20 MB / 1.00 GB"
    pub fn bytes_string(&self) -> String {
        if self.total_bytes > 0 {
            format!(
                "{} / {}",
                format_bytes(self.bytes_downloaded),
                format_bytes(self.total_bytes)
            )
        } else {
            format_bytes(self.bytes_downloaded)
        }
    }
}

fn scale(value: f64) -> (f64, &'static str) {
    if value >= GB {
        (value / GB, "GB")
    } else if value >= MB {
        (value / MB, "MB")
    } else if value >= KB {
        (value / KB, "KB")
    } else {
        (value, "B")
    }
}

/// Absolute size with two decimals, binary units
pub fn format_bytes(bytes: u64) -> String {
    let (value, unit) = scale(bytes as f64);
    format!("{:.2} {}", value, unit)
}

/// Transfer rate with one decimal, binary units
pub fn format_rate(bytes_per_second: f64) -> String {
    let (value, unit) = scale(bytes_per_second.max(0.0));
    format!("{:.1} {}/s", value, unit)
}

/// Remaining time as "1h 5m", "5m 30s" or "42s"
pub fn format_eta(seconds: f64) -> String {
    let total = seconds.max(0.0).round() as u64;
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;

    if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}
