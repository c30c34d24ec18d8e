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


//! Download manager: the single owner of download state
//!
//! # Responsibilities
//! - Active downloads (item id -> `DownloadRecord`) and persisted downloads
//!   (item id -> `PersistedDownload`), never holding the same id in both
//! - Spawning one `TransferSession` per started item and folding its events
//!   into the record
//! - Committing finished transfers through the `MetadataStore`
//! - Publishing a full `DownloadSnapshot` after every mutation, plus discrete
//!   `DownloadEvent`s so observers can tell a cancellation from a failure
//!
//! All state lives behind one lock that is never held across an await.
//! Every spawned transfer carries a session id; anything reported by a
//! session that is no longer the current one for its item is dropped.
//!
//! # Lifecycle of one item
//! ```text
//! start ──> pending ──> transferring ──> committing ──> persisted
//!              │             │               │
//!              └─────────────┴───────────────┴──> removed (cancelled / failed)
//! ```

use crate::download::config::DownloadConfig;
use crate::download::progress::{DownloadRecord, SpeedEstimator};
use crate::download::store::{validate_item_id, DeletionReport, MetadataStore, PersistedDownload};
use crate::download::transfer::{
    ByteSource, HttpSource, TransferEvent, TransferOutcome, TransferRequest, TransferSession,
};
use crate::error::{Result, SunkfinError};
use crate::media::MediaItem;
use crate::server::{Credential, ServerEndpoint};
use futures_util::future::{join, join_all, BoxFuture, Shared};
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Resolves once a spawned transfer task has fully finished
type SessionDone = Shared<BoxFuture<'static, ()>>;

/// Consistent view of both mappings at one point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadSnapshot {
    pub active: BTreeMap<String, DownloadRecord>,
    pub persisted: BTreeMap<String, PersistedDownload>,
}

impl DownloadSnapshot {
    pub fn has_active_downloads(&self) -> bool {
        !self.active.is_empty()
    }

    pub fn total_persisted_bytes(&self) -> u64 {
        self.persisted.values().map(|p| p.payload_bytes).sum()
    }
}

/// Discrete lifecycle notifications
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DownloadEvent {
    Started { id: String },
    Completed { id: String },
    Failed {
        id: String,
        reason: String,
        retryable: bool,
    },
    Cancelled { id: String },
    Deleted { id: String },
}

/// What `start_download` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    /// A transfer for this item is already running; nothing changed
    AlreadyActive,
    /// The item is already persisted; nothing changed
    AlreadyDownloaded,
}

struct ActiveDownload {
    record: DownloadRecord,
    cancel: CancellationToken,
    done: SessionDone,
}

/// Work on an item's files that a new transfer must wait for: a cancelled
/// session still cleaning up, or a pending file removal
struct InFlight {
    ticket: Uuid,
    done: SessionDone,
}

#[derive(Default)]
struct ManagerState {
    active: BTreeMap<String, ActiveDownload>,
    persisted: BTreeMap<String, PersistedDownload>,
    draining: HashMap<String, InFlight>,
    deleting: HashMap<String, InFlight>,
}

impl ManagerState {
    fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            active: self
                .active
                .iter()
                .map(|(id, a)| (id.clone(), a.record.clone()))
                .collect(),
            persisted: self.persisted.clone(),
        }
    }

    fn is_current(&self, id: &str, session: Uuid) -> bool {
        self.active
            .get(id)
            .map_or(false, |a| a.record.session() == session)
    }

    /// Register a file removal for `id`; the sender resolves it
    ///
    /// Overlapping removals of the same id chain, so waiting on the latest
    /// covers all of them.
    fn begin_deletion(&mut self, id: &str) -> (Uuid, oneshot::Sender<()>) {
        let (tx, rx) = oneshot::channel::<()>();
        let ticket = Uuid::new_v4();
        let own = rx.map(|_| ());
        let done = match self.deleting.remove(id) {
            Some(earlier) => join(earlier.done, own).map(|_| ()).boxed().shared(),
            None => own.boxed().shared(),
        };
        self.deleting
            .insert(id.to_string(), InFlight { ticket, done });
        (ticket, tx)
    }
}

struct ManagerInner {
    config: DownloadConfig,
    store: MetadataStore,
    source: Arc<dyn ByteSource>,
    runtime: Handle,
    limiter: Option<Arc<Semaphore>>,
    state: Mutex<ManagerState>,
    snapshot_tx: watch::Sender<DownloadSnapshot>,
    events_tx: broadcast::Sender<DownloadEvent>,
}

/// Download manager
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct DownloadManager {
    inner: Arc<ManagerInner>,
}

impl DownloadManager {
    /// Create a manager downloading over HTTP
    pub async fn new(config: DownloadConfig) -> Result<Self> {
        config.validate()?;
        let source = HttpSource::new(config.request_timeout())?;
        Self::with_source(config, Arc::new(source)).await
    }

    /// Create a manager with a custom byte source
    ///
    /// Clears leftover partial payloads, then loads every complete file pair
    /// from the storage area into the persisted mapping.
    pub async fn with_source(config: DownloadConfig, source: Arc<dyn ByteSource>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current()
            .map_err(|e| SunkfinError::internal(format!("No Tokio runtime available: {}", e)))?;
        let store = MetadataStore::new(&config);

        if let Err(e) = store.purge_staging().await {
            warn!(error = %e, "could not purge staging area");
        }

        let persisted: BTreeMap<String, PersistedDownload> = store
            .load()
            .await?
            .into_iter()
            .map(|entry| (entry.id.clone(), entry))
            .collect();

        let state = ManagerState {
            persisted,
            ..Default::default()
        };
        let (snapshot_tx, _) = watch::channel(state.snapshot());
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let limiter = config
            .max_concurrent_downloads
            .map(|n| Arc::new(Semaphore::new(n)));

        info!(
            storage = %store.storage_dir().display(),
            persisted = state.persisted.len(),
            "download manager ready"
        );

        Ok(Self {
            inner: Arc::new(ManagerInner {
                config,
                store,
                source,
                runtime,
                limiter,
                state: Mutex::new(state),
                snapshot_tx,
                events_tx,
            }),
        })
    }

    pub fn config(&self) -> &DownloadConfig {
        &self.inner.config
    }

    /// Begin downloading `item`; returns without waiting for the network
    ///
    /// A second call for an item that is active or already persisted is a
    /// no-op. The metadata is captured as given and committed unchanged.
    pub fn start_download(
        &self,
        item: MediaItem,
        endpoint: ServerEndpoint,
        credential: Credential,
    ) -> Result<StartOutcome> {
        let id = match item.id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(SunkfinError::MissingRequiredField("Id".to_string())),
        };
        validate_item_id(&id)?;

        let inner = &self.inner;
        let mut state = inner.state.lock();

        if state.active.contains_key(&id) {
            debug!(item_id = %id, "download already active");
            return Ok(StartOutcome::AlreadyActive);
        }
        if state.persisted.contains_key(&id) {
            debug!(item_id = %id, "item already downloaded");
            return Ok(StartOutcome::AlreadyDownloaded);
        }

        let estimator = SpeedEstimator::new(
            inner.config.speed_sample_min(),
            inner.config.speed_smoothing,
        );
        let record = DownloadRecord::new(id.clone(), Some(item), estimator);
        let session = record.session();
        let cancel = CancellationToken::new();
        // Wait for the files of this id to settle before writing new ones
        let previous: Vec<SessionDone> = state
            .draining
            .remove(&id)
            .map(|d| d.done)
            .into_iter()
            .chain(state.deleting.get(&id).map(|d| d.done.clone()))
            .collect();

        let job = TransferJob {
            inner: Arc::clone(inner),
            id: id.clone(),
            session,
            cancel: cancel.clone(),
            request: TransferRequest {
                item_id: id.clone(),
                endpoint,
                credential,
            },
            staging_path: inner.store.staging_path(&id, session),
            previous,
        };
        let done = inner
            .runtime
            .spawn(job.run())
            .map(|_| ())
            .boxed()
            .shared();

        state.active.insert(
            id.clone(),
            ActiveDownload {
                record,
                cancel,
                done,
            },
        );
        inner.publish(&state);
        inner.emit(DownloadEvent::Started { id: id.clone() });
        drop(state);

        info!(item_id = %id, %session, "download started");
        Ok(StartOutcome::Started)
    }

    /// Abort an active transfer
    ///
    /// The record leaves the active mapping immediately and the partial
    /// payload is discarded. Waits up to `cancel_grace` for the session to
    /// finish cleaning up. Returns `false` if nothing was active for `id`.
    pub async fn cancel_download(&self, id: &str) -> bool {
        let done = {
            let mut state = self.inner.state.lock();
            let Some(done) = Self::begin_cancel(&mut state, id) else {
                return false;
            };
            self.inner.publish(&state);
            done
        };

        info!(item_id = %id, "download cancelled");
        self.inner.emit(DownloadEvent::Cancelled { id: id.to_string() });
        self.inner.await_sessions(vec![done]).await;
        true
    }

    /// Remove the record and signal its session; caller publishes
    fn begin_cancel(state: &mut ManagerState, id: &str) -> Option<SessionDone> {
        let active = state.active.remove(id)?;
        active.cancel.cancel();
        state.draining.insert(
            id.to_string(),
            InFlight {
                ticket: active.record.session(),
                done: active.done.clone(),
            },
        );
        Some(active.done)
    }

    /// Delete a persisted item's files
    ///
    /// The mapping is updated first; file removal is best-effort and its
    /// failures come back in the report. An id that is not in the mapping
    /// still gets its files removed, so an earlier partial delete can be
    /// retried. Files of an item that is currently active are left alone.
    ///
    /// A download of the same id started while the removal runs waits for
    /// it before touching the files.
    pub async fn delete_downloaded_item(&self, id: &str) -> DeletionReport {
        let (removed, deletion) = {
            let mut state = self.inner.state.lock();
            let removed = state.persisted.remove(id).is_some();
            if removed {
                self.inner.publish(&state);
            }
            let deletion = if state.active.contains_key(id) {
                None
            } else {
                Some(state.begin_deletion(id))
            };
            (removed, deletion)
        };

        let Some((ticket, finished)) = deletion else {
            debug!(item_id = %id, "skipping file removal for active download");
            return DeletionReport {
                id: id.to_string(),
                failures: Vec::new(),
            };
        };

        let report = self.inner.store.delete(id).await;
        self.inner.finish_deletion(id, ticket, finished);
        if removed {
            info!(item_id = %id, complete = report.is_complete(), "download deleted");
            self.inner.emit(DownloadEvent::Deleted { id: id.to_string() });
        }
        report
    }

    /// Cancel everything and delete every persisted item (logout)
    pub async fn remove_all_downloads(&self) -> Vec<DeletionReport> {
        let (cancelled, persisted) = {
            let mut state = self.inner.state.lock();
            let ids: Vec<String> = state.active.keys().cloned().collect();
            let cancelled: Vec<(String, SessionDone)> = ids
                .into_iter()
                .filter_map(|id| Self::begin_cancel(&mut state, &id).map(|done| (id, done)))
                .collect();
            let persisted: Vec<(String, Uuid, oneshot::Sender<()>)> =
                std::mem::take(&mut state.persisted)
                    .into_keys()
                    .map(|id| {
                        let (ticket, finished) = state.begin_deletion(&id);
                        (id, ticket, finished)
                    })
                    .collect();
            self.inner.publish(&state);
            (cancelled, persisted)
        };

        info!(
            cancelled = cancelled.len(),
            deleted = persisted.len(),
            "removing all downloads"
        );

        let mut pending = Vec::with_capacity(cancelled.len());
        for (id, done) in cancelled {
            self.inner.emit(DownloadEvent::Cancelled { id });
            pending.push(done);
        }

        let mut reports = Vec::with_capacity(persisted.len());
        for (id, ticket, finished) in persisted {
            let report = self.inner.store.delete(&id).await;
            self.inner.finish_deletion(&id, ticket, finished);
            self.inner.emit(DownloadEvent::Deleted { id });
            reports.push(report);
        }

        self.inner.await_sessions(pending).await;
        reports
    }

    /// Cancel all transfers and wait for them; persisted items are kept
    pub async fn shutdown(&self) {
        let cancelled = {
            let mut state = self.inner.state.lock();
            let ids: Vec<String> = state.active.keys().cloned().collect();
            let cancelled: Vec<(String, SessionDone)> = ids
                .into_iter()
                .filter_map(|id| Self::begin_cancel(&mut state, &id).map(|done| (id, done)))
                .collect();
            self.inner.publish(&state);
            cancelled
        };

        let mut pending = Vec::with_capacity(cancelled.len());
        for (id, done) in cancelled {
            self.inner.emit(DownloadEvent::Cancelled { id });
            pending.push(done);
        }
        self.inner.await_sessions(pending).await;
        info!("download manager shut down");
    }

    /// Current state of both mappings
    pub fn snapshot(&self) -> DownloadSnapshot {
        self.inner.snapshot_tx.borrow().clone()
    }

    /// Receiver that sees a new snapshot after every mutation
    pub fn subscribe(&self) -> watch::Receiver<DownloadSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    /// Receiver for lifecycle events from now on
    pub fn events(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn has_active_downloads(&self) -> bool {
        !self.inner.state.lock().active.is_empty()
    }

    pub fn total_persisted_bytes(&self) -> u64 {
        self.inner
            .state
            .lock()
            .persisted
            .values()
            .map(|p| p.payload_bytes)
            .sum()
    }

    pub fn is_downloaded(&self, id: &str) -> bool {
        self.inner.state.lock().persisted.contains_key(id)
    }

    /// Items in either mapping whose name matches `query` (case-insensitive)
    pub fn search(&self, query: &str) -> DownloadSnapshot {
        let mut snapshot = self.inner.state.lock().snapshot();
        snapshot.active.retain(|_, record| {
            record
                .metadata
                .as_ref()
                .map_or(false, |m| m.matches_query(query))
        });
        snapshot
            .persisted
            .retain(|_, entry| entry.metadata.matches_query(query));
        snapshot
    }
}

impl ManagerInner {
    /// Publish while the caller still holds the lock, so snapshots are
    /// delivered in mutation order
    fn publish(&self, state: &ManagerState) {
        self.snapshot_tx.send_replace(state.snapshot());
    }

    fn emit(&self, event: DownloadEvent) {
        // No receivers is fine
        let _ = self.events_tx.send(event);
    }

    async fn await_sessions(&self, sessions: Vec<SessionDone>) {
        if sessions.is_empty() {
            return;
        }
        let grace = self.config.cancel_grace();
        if tokio::time::timeout(grace, join_all(sessions)).await.is_err() {
            warn!(grace_ms = grace.as_millis() as u64, "cancelled transfers still winding down");
        }
    }

    fn on_transfer_event(&self, id: &str, session: Uuid, event: TransferEvent) {
        let mut state = self.state.lock();
        let Some(active) = state.active.get_mut(id) else {
            return;
        };
        if active.record.session() != session {
            return;
        }

        match event {
            TransferEvent::Started { total_bytes } => {
                active.record.mark_transferring(total_bytes, Instant::now());
            }
            TransferEvent::Progress {
                bytes_downloaded,
                total_bytes,
                at,
            } => {
                active
                    .record
                    .apply_progress(bytes_downloaded, total_bytes, at);
            }
        }
        self.publish(&state);
    }

    async fn finish(&self, id: &str, session: Uuid, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Completed {
                payload_path,
                bytes,
            } => self.commit(id, session, payload_path, bytes).await,
            TransferOutcome::Failed(e) => {
                let removed = {
                    let mut state = self.state.lock();
                    let current = state.is_current(id, session);
                    if current {
                        state.active.remove(id);
                        self.publish(&state);
                    }
                    current
                };
                if removed {
                    warn!(item_id = %id, error = %e, "download failed");
                    self.emit(DownloadEvent::Failed {
                        id: id.to_string(),
                        reason: e.user_message(),
                        retryable: e.is_retryable(),
                    });
                }
            }
            TransferOutcome::Cancelled => {
                // Cancelled through the token without going through cancel_download
                let removed = {
                    let mut state = self.state.lock();
                    let current = state.is_current(id, session);
                    if current {
                        state.active.remove(id);
                        self.publish(&state);
                    }
                    current
                };
                if removed {
                    self.emit(DownloadEvent::Cancelled { id: id.to_string() });
                }
                debug!(item_id = %id, %session, "transfer session cancelled");
            }
        }
    }

    /// Persist a finished transfer and promote the item
    async fn commit(&self, id: &str, session: Uuid, staged: PathBuf, bytes: u64) {
        let metadata = {
            let mut state = self.state.lock();
            let metadata = state
                .active
                .get_mut(id)
                .filter(|a| a.record.session() == session)
                .map(|a| {
                    a.record.mark_committing();
                    a.record.metadata.clone()
                });
            if metadata.is_some() {
                self.publish(&state);
            }
            metadata
        };

        let Some(metadata) = metadata else {
            // Cancelled after the last byte arrived
            if let Err(e) = tokio::fs::remove_file(&staged).await {
                debug!(item_id = %id, error = %e, "staged payload already gone");
            }
            return;
        };
        let metadata = metadata.unwrap_or_else(|| MediaItem {
            id: Some(id.to_string()),
            ..Default::default()
        });

        let saved = self.store.save(id, &metadata, &staged).await;

        match saved {
            Ok(entry) => {
                let promoted = {
                    let mut state = self.state.lock();
                    let current = state.is_current(id, session);
                    if current {
                        state.active.remove(id);
                        state.persisted.insert(id.to_string(), entry);
                        self.publish(&state);
                    }
                    current
                };

                if promoted {
                    info!(item_id = %id, bytes, "download completed");
                    self.emit(DownloadEvent::Completed { id: id.to_string() });
                } else {
                    // Cancelled while the files were being written
                    let report = self.store.delete(id).await;
                    debug!(item_id = %id, complete = report.is_complete(), "rolled back commit");
                }
            }
            Err(e) => {
                error!(item_id = %id, error = %e, "failed to commit download");
                let removed = {
                    let mut state = self.state.lock();
                    let current = state.is_current(id, session);
                    if current {
                        state.active.remove(id);
                        self.publish(&state);
                    }
                    current
                };
                if removed {
                    self.emit(DownloadEvent::Failed {
                        id: id.to_string(),
                        reason: e.user_message(),
                        retryable: e.is_retryable(),
                    });
                }
            }
        }
    }

    fn clear_draining(&self, id: &str, session: Uuid) {
        let mut state = self.state.lock();
        if state
            .draining
            .get(id)
            .map_or(false, |d| d.ticket == session)
        {
            state.draining.remove(id);
        }
    }

    fn finish_deletion(&self, id: &str, ticket: Uuid, finished: oneshot::Sender<()>) {
        let _ = finished.send(());
        let mut state = self.state.lock();
        if state
            .deleting
            .get(id)
            .map_or(false, |d| d.ticket == ticket)
        {
            state.deleting.remove(id);
        }
    }
}

/// Everything one spawned transfer needs
struct TransferJob {
    inner: Arc<ManagerInner>,
    id: String,
    session: Uuid,
    cancel: CancellationToken,
    request: TransferRequest,
    staging_path: PathBuf,
    previous: Vec<SessionDone>,
}

impl TransferJob {
    async fn run(self) {
        let TransferJob {
            inner,
            id,
            session,
            cancel,
            request,
            staging_path,
            previous,
        } = self;

        // A restart waits for the cancelled session's cleanup and any
        // pending removal of the same files
        if !previous.is_empty() {
            join_all(previous).await;
        }

        let _permit = match &inner.limiter {
            Some(limiter) => {
                let acquired = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    permit = Arc::clone(limiter).acquire_owned() => permit.ok(),
                };
                if acquired.is_none() {
                    inner.finish(&id, session, TransferOutcome::Cancelled).await;
                    inner.clear_draining(&id, session);
                    return;
                }
                acquired
            }
            None => None,
        };

        let transfer = TransferSession::new(
            Arc::clone(&inner.source),
            request,
            staging_path,
            cancel,
            inner.config.progress_interval(),
        );

        let events = Arc::clone(&inner);
        let event_id = id.clone();
        let outcome = transfer
            .run(move |event| events.on_transfer_event(&event_id, session, event))
            .await;

        inner.finish(&id, session, outcome).await;
        inner.clear_draining(&id, session);
    }
}
