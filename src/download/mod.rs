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


//! Offline downloads
//!
//! - [`manager`] - orchestrator owning active and persisted state
//! - [`progress`] - per-download record, speed/ETA and byte formatting
//! - [`transfer`] - one cancellable byte transfer into the staging area
//! - [`store`] - payload + sidecar persistence
//! - [`config`] - tunables loaded from the app shell

pub mod config;
pub mod manager;
pub mod progress;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use config::DownloadConfig;
pub use manager::{DownloadEvent, DownloadManager, DownloadSnapshot, StartOutcome};
pub use progress::{format_bytes, format_eta, format_rate, DownloadRecord, DownloadStatus};
pub use store::{DeletionReport, MetadataStore, PersistedDownload};
pub use transfer::{ByteSource, ByteStream, HttpSource, TransferRequest};
