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


//! Transfer session: one cancellable byte transfer for one item
//!
//! # Flow
//! 1. Open the item's byte resource through a [`ByteSource`]
//! 2. Report `Started` with the declared length (the acknowledgment)
//! 3. Stream chunks into a per-session staging file, reporting throttled
//!    `Progress` with cumulative byte counts
//! 4. Finish with exactly one [`TransferOutcome`]
//!
//! Cancellation is checked before every chunk. A cancelled or failed session
//! removes its staging file before returning, and reports nothing after its
//! outcome.

use crate::error::{Result, SunkfinError};
use crate::server::{Credential, ServerEndpoint};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const WRITE_BUFFER_SIZE: usize = 64 * 1024;

/// What to fetch and how to authorize it
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub item_id: String,
    pub endpoint: ServerEndpoint,
    pub credential: Credential,
}

impl TransferRequest {
    pub fn download_url(&self) -> Result<url::Url> {
        self.endpoint.download_url(&self.item_id, &self.credential)
    }
}

/// An opened byte resource
pub struct ByteStream {
    /// Declared length, if the server sent one
    pub content_length: Option<u64>,
    pub chunks: BoxStream<'static, Result<Bytes>>,
}

/// Network collaborator yielding an item's media bytes
#[async_trait]
pub trait ByteSource: Send + Sync {
    async fn open(&self, request: &TransferRequest) -> Result<ByteStream>;
}

/// `ByteSource` over HTTP(S) using the server's download endpoint
#[derive(Debug, Clone)]
pub struct HttpSource {
    client: Client,
}

impl HttpSource {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        // No overall timeout: media files can take hours
        let client = Client::builder().connect_timeout(connect_timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ByteSource for HttpSource {
    async fn open(&self, request: &TransferRequest) -> Result<ByteStream> {
        let url = request.download_url()?;

        // reqwest errors carry the URL, which holds the api key
        let response = self.client.get(url).send().await.map_err(|e| {
            SunkfinError::network_error(format!("Request failed: {}", e.without_url()), true)
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, &request.endpoint, &request.item_id));
        }

        let content_length = response.content_length().filter(|len| *len > 0);
        let chunks = response
            .bytes_stream()
            .map(|chunk| {
                chunk.map_err(|e| {
                    SunkfinError::network_error(format!("Stream error: {}", e.without_url()), true)
                })
            })
            .boxed();

        Ok(ByteStream {
            content_length,
            chunks,
        })
    }
}

/// Map a non-success status; the URL is rebuilt without the credential
fn status_error(status: StatusCode, endpoint: &ServerEndpoint, item_id: &str) -> SunkfinError {
    let url = endpoint
        .item_resource_url(item_id, &["Download"], None)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| endpoint.to_string());
    SunkfinError::UnexpectedStatusCode {
        status_code: status.as_u16(),
        url,
    }
}

/// Non-terminal session events
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    /// Server accepted the request
    Started { total_bytes: Option<u64> },
    /// Cumulative bytes written so far
    Progress {
        bytes_downloaded: u64,
        total_bytes: Option<u64>,
        at: Instant,
    },
}

/// Terminal session result
#[derive(Debug)]
pub enum TransferOutcome {
    Completed { payload_path: PathBuf, bytes: u64 },
    Failed(SunkfinError),
    Cancelled,
}

/// One transfer of one item into a staging file
pub struct TransferSession {
    source: Arc<dyn ByteSource>,
    request: TransferRequest,
    staging_path: PathBuf,
    cancel: CancellationToken,
    progress_interval: Duration,
}

impl TransferSession {
    pub fn new(
        source: Arc<dyn ByteSource>,
        request: TransferRequest,
        staging_path: PathBuf,
        cancel: CancellationToken,
        progress_interval: Duration,
    ) -> Self {
        Self {
            source,
            request,
            staging_path,
            cancel,
            progress_interval,
        }
    }

    pub fn staging_path(&self) -> &Path {
        &self.staging_path
    }

    /// Run to completion, reporting events through `on_event`
    pub async fn run<F>(self, mut on_event: F) -> TransferOutcome
    where
        F: FnMut(TransferEvent) + Send,
    {
        let result = self.transfer(&mut on_event).await;

        match result {
            Ok(bytes) if !self.cancel.is_cancelled() => TransferOutcome::Completed {
                payload_path: self.staging_path,
                bytes,
            },
            Ok(_) | Err(SunkfinError::Cancelled) => {
                self.discard_staging().await;
                TransferOutcome::Cancelled
            }
            Err(e) => {
                self.discard_staging().await;
                TransferOutcome::Failed(e)
            }
        }
    }

    async fn transfer<F>(&self, on_event: &mut F) -> Result<u64>
    where
        F: FnMut(TransferEvent) + Send,
    {
        let opened = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(SunkfinError::Cancelled),
            opened = self.source.open(&self.request) => opened?,
        };

        let total = opened.content_length;
        on_event(TransferEvent::Started { total_bytes: total });

        if let Some(parent) = self.staging_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                SunkfinError::FileIoError(format!(
                    "Failed to create staging directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
        let file = File::create(&self.staging_path).await.map_err(|e| {
            SunkfinError::FileIoError(format!(
                "Failed to create staging file {}: {}",
                self.staging_path.display(),
                e
            ))
        })?;
        let mut writer = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);

        let mut chunks = opened.chunks;
        let mut written: u64 = 0;
        let mut last_report = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SunkfinError::Cancelled),
                next = chunks.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk?;

            written += chunk.len() as u64;
            if let Some(total) = total {
                if written > total {
                    return Err(SunkfinError::WritePositionExceedsLength {
                        position: written,
                        content_length: total,
                    });
                }
            }
            writer.write_all(&chunk).await?;

            let now = Instant::now();
            if now.duration_since(last_report) >= self.progress_interval {
                last_report = now;
                on_event(TransferEvent::Progress {
                    bytes_downloaded: written,
                    total_bytes: total,
                    at: now,
                });
            }
        }

        writer.flush().await?;
        writer.into_inner().sync_all().await?;

        if let Some(total) = total {
            if written < total {
                return Err(SunkfinError::IncompleteTransfer {
                    received: written,
                    expected: total,
                });
            }
        }

        if self.cancel.is_cancelled() {
            return Err(SunkfinError::Cancelled);
        }

        on_event(TransferEvent::Progress {
            bytes_downloaded: written,
            total_bytes: total,
            at: Instant::now(),
        });
        debug!(item_id = %self.request.item_id, bytes = written, "transfer finished");

        Ok(written)
    }

    async fn discard_staging(&self) {
        match fs::remove_file(&self.staging_path).await {
            Ok(()) => debug!(path = %self.staging_path.display(), "discarded partial payload"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.staging_path.display(),
                error = %e,
                "could not discard partial payload"
            ),
        }
    }
}
