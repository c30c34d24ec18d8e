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


//! Sunkfin Core - offline downloads for the Sunkfin media client
//!
//! Owns everything about taking a media item offline: transferring its bytes,
//! tracking progress, committing the payload with its metadata, and knowing
//! on the next launch what is already on the device.
//!
//! # Modules
//! - [`download`] - download manager, records, transfer sessions, storage
//! - [`media`] - media item metadata as served by the catalog
//! - [`server`] - server endpoint and credential
//! - [`file`] - safe file operations
//! - [`logging`] - tracing setup
//! - [`error`] - error types

uniffi::setup_scaffolding!();

pub mod download;
pub mod error;
pub mod file;
pub mod logging;
pub mod media;
pub mod server;

// C FFI bridge for the iOS shell
pub mod ios_bridge;

pub use download::{
    DeletionReport, DownloadConfig, DownloadEvent, DownloadManager, DownloadRecord,
    DownloadSnapshot, DownloadStatus, PersistedDownload, StartOutcome,
};
pub use error::{Result, SunkfinError};
pub use media::{ItemKind, MediaItem};
pub use server::{Credential, ServerEndpoint};

/// Human-readable byte count, e.g. "1.50 KB"
#[uniffi::export]
pub fn format_bytes(bytes: u64) -> String {
    download::format_bytes(bytes)
}
