//! Integration tests for DownloadManager
//!
//! Drives the manager end to end against a scripted in-memory byte source
//! and a temporary storage area.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sunkfin_core::download::{ByteSource, ByteStream, TransferRequest};
use sunkfin_core::{
    Credential, DownloadConfig, DownloadEvent, DownloadManager, DownloadSnapshot, DownloadStatus,
    ItemKind, MediaItem, Result, ServerEndpoint, StartOutcome, SunkfinError,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

enum Script {
    /// Fixed chunks, then end of stream
    Bytes {
        chunks: Vec<&'static str>,
        declared: Option<u64>,
    },
    /// Chunks pushed by the test; stream ends when the sender is dropped
    Gated {
        declared: u64,
        rx: mpsc::UnboundedReceiver<Result<Bytes>>,
    },
    /// Opening the resource fails
    Fail { transient: bool },
}

#[derive(Default)]
struct ScriptedSource {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    opens: AtomicUsize,
}

impl ScriptedSource {
    fn push(&self, id: &str, script: Script) {
        self.scripts
            .lock()
            .entry(id.to_string())
            .or_default()
            .push_back(script);
    }

    fn bytes(&self, id: &str, chunks: Vec<&'static str>) {
        let declared = chunks.iter().map(|c| c.len() as u64).sum();
        self.push(
            id,
            Script::Bytes {
                chunks,
                declared: Some(declared),
            },
        );
    }

    fn gated(&self, id: &str, declared: u64) -> mpsc::UnboundedSender<Result<Bytes>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(id, Script::Gated { declared, rx });
        tx
    }

    fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ByteSource for ScriptedSource {
    async fn open(&self, request: &TransferRequest) -> Result<ByteStream> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .get_mut(&request.item_id)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| SunkfinError::internal("no script for item"))?;

        match script {
            Script::Bytes { chunks, declared } => {
                let chunks: Vec<Result<Bytes>> =
                    chunks.into_iter().map(|c| Ok(Bytes::from_static(c.as_bytes()))).collect();
                Ok(ByteStream {
                    content_length: declared,
                    chunks: stream::iter(chunks).boxed(),
                })
            }
            Script::Gated { declared, rx } => Ok(ByteStream {
                content_length: Some(declared),
                chunks: stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|chunk| (chunk, rx))
                })
                .boxed(),
            }),
            Script::Fail { transient } => Err(SunkfinError::network_error("connection reset", transient)),
        }
    }
}

struct Harness {
    _dir: TempDir,
    storage: std::path::PathBuf,
    source: Arc<ScriptedSource>,
    manager: DownloadManager,
}

impl Harness {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(adjust: impl FnOnce(&mut DownloadConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let storage = dir.path().join("downloads");
        let mut config = DownloadConfig::new(&storage);
        config.progress_interval_ms = 0;
        adjust(&mut config);

        let source = Arc::new(ScriptedSource::default());
        let manager = DownloadManager::with_source(config, source.clone())
            .await
            .unwrap();

        Self {
            _dir: dir,
            storage,
            source,
            manager,
        }
    }

    /// A second manager over the same storage area, as after an app relaunch
    async fn relaunch(&self) -> DownloadManager {
        let mut config = DownloadConfig::new(&self.storage);
        config.progress_interval_ms = 0;
        DownloadManager::with_source(config, self.source.clone())
            .await
            .unwrap()
    }

    fn start(&self, id: &str) -> StartOutcome {
        self.manager
            .start_download(movie(id), endpoint(), Credential::new("secret"))
            .unwrap()
    }

    async fn wait_until(&self, check: impl FnMut(&DownloadSnapshot) -> bool) -> DownloadSnapshot {
        let mut rx = self.manager.subscribe();
        let snapshot = tokio::time::timeout(Duration::from_secs(5), rx.wait_for(check))
            .await
            .expect("timed out waiting for download state")
            .expect("manager dropped")
            .clone();
        snapshot
    }

    fn staging_files(&self) -> usize {
        std::fs::read_dir(self.storage.join(".staging"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

fn movie(id: &str) -> MediaItem {
    let mut item = MediaItem::new(id, format!("Movie {}", id), ItemKind::Movie);
    item.production_year = Some(2021);
    item.run_time_ticks = Some(3_900 * 10_000_000);
    item
}

fn endpoint() -> ServerEndpoint {
    ServerEndpoint::parse("https://media.example.com").unwrap()
}

fn write_pair(storage: &Path, id: &str, sidecar: &[u8], payload: Option<&[u8]>) {
    std::fs::create_dir_all(storage).unwrap();
    std::fs::write(storage.join(format!("{}.json", id)), sidecar).unwrap();
    if let Some(payload) = payload {
        std::fs::write(storage.join(format!("{}.mp4", id)), payload).unwrap();
    }
}

async fn next_event(rx: &mut tokio::sync::broadcast::Receiver<DownloadEvent>) -> DownloadEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_happy_path_then_delete() {
    let h = Harness::new().await;
    h.source.bytes("X", vec!["abc", "defgh"]);
    let mut events = h.manager.events();

    assert_eq!(h.start("X"), StartOutcome::Started);
    let snapshot = h.wait_until(|s| s.persisted.contains_key("X")).await;

    assert!(!snapshot.active.contains_key("X"));
    let entry = &snapshot.persisted["X"];
    assert_eq!(entry.metadata, movie("X"));
    assert_eq!(entry.payload_bytes, 8);
    assert_eq!(entry.payload_path, h.storage.join("X.mp4"));
    assert_eq!(std::fs::read(h.storage.join("X.mp4")).unwrap(), b"abcdefgh");

    let sidecar: MediaItem =
        serde_json::from_slice(&std::fs::read(h.storage.join("X.json")).unwrap()).unwrap();
    assert_eq!(sidecar, movie("X"));

    assert_eq!(next_event(&mut events).await, DownloadEvent::Started { id: "X".into() });
    assert_eq!(next_event(&mut events).await, DownloadEvent::Completed { id: "X".into() });
    assert_eq!(h.staging_files(), 0);
    assert!(h.manager.is_downloaded("X"));
    assert_eq!(h.manager.total_persisted_bytes(), 8);

    let report = h.manager.delete_downloaded_item("X").await;
    assert!(report.is_complete());
    assert!(!h.storage.join("X.mp4").exists());
    assert!(!h.storage.join("X.json").exists());
    assert!(!h.manager.snapshot().persisted.contains_key("X"));
    assert_eq!(next_event(&mut events).await, DownloadEvent::Deleted { id: "X".into() });
}

#[tokio::test]
async fn test_relaunch_restores_persisted_downloads() {
    let h = Harness::new().await;
    h.source.bytes("X", vec!["payload"]);
    h.start("X");
    h.wait_until(|s| s.persisted.contains_key("X")).await;

    let relaunched = h.relaunch().await;
    let snapshot = relaunched.snapshot();
    assert!(snapshot.active.is_empty());
    assert_eq!(snapshot.persisted["X"].metadata, movie("X"));
    assert_eq!(snapshot.persisted["X"].payload_bytes, 7);
}

#[tokio::test]
async fn test_reconciliation_skips_orphans_and_corrupt_sidecars() {
    let dir = TempDir::new().unwrap();
    let storage = dir.path().join("downloads");
    let good = serde_json::to_vec(&movie("W")).unwrap();
    write_pair(&storage, "W", &good, Some(&b"w"[..]));
    write_pair(&storage, "Y", &serde_json::to_vec(&movie("Y")).unwrap(), None);
    write_pair(&storage, "Z", b"{ truncated", Some(&b"z"[..]));
    // Orphaned payload from an interrupted commit
    std::fs::write(storage.join("V.mp4"), b"v").unwrap();
    // Leftover partial payload from a crash
    std::fs::create_dir_all(storage.join(".staging")).unwrap();
    std::fs::write(storage.join(".staging").join("Q.part"), b"q").unwrap();

    let manager = DownloadManager::with_source(
        DownloadConfig::new(&storage),
        Arc::new(ScriptedSource::default()),
    )
    .await
    .unwrap();

    let snapshot = manager.snapshot();
    assert_eq!(snapshot.persisted.keys().collect::<Vec<_>>(), vec!["W"]);
    assert!(!storage.join(".staging").join("Q.part").exists());
}

#[tokio::test]
async fn test_progress_is_reflected_in_record() {
    let h = Harness::new().await;
    let tx = h.source.gated("A", 10);

    h.start("A");
    assert_eq!(h.manager.snapshot().active["A"].status, DownloadStatus::Pending);

    tx.send(Ok(Bytes::from_static(b"1234"))).unwrap();
    let snapshot = h
        .wait_until(|s| s.active.get("A").map_or(false, |r| r.bytes_downloaded == 4))
        .await;

    let record = &snapshot.active["A"];
    assert_eq!(record.status, DownloadStatus::Transferring);
    assert_eq!(record.total_bytes, 10);
    assert!((record.progress - 0.4).abs() < 1e-9);
    assert_eq!(record.display_name(), "Movie A");
    assert_eq!(record.bytes_string(), "4.00 B / 10.00 B");
    assert!(h.manager.has_active_downloads());

    tx.send(Ok(Bytes::from_static(b"567890"))).unwrap();
    drop(tx);
    h.wait_until(|s| s.persisted.contains_key("A")).await;
    assert!(!h.manager.has_active_downloads());
}

#[tokio::test]
async fn test_start_twice_yields_one_transfer() {
    let h = Harness::new().await;
    let tx = h.source.gated("A", 2);

    assert_eq!(h.start("A"), StartOutcome::Started);
    assert_eq!(h.start("A"), StartOutcome::AlreadyActive);
    assert_eq!(h.manager.snapshot().active.len(), 1);

    tx.send(Ok(Bytes::from_static(b"ok"))).unwrap();
    drop(tx);
    h.wait_until(|s| s.persisted.contains_key("A")).await;

    assert_eq!(h.source.opens(), 1);
    assert_eq!(h.start("A"), StartOutcome::AlreadyDownloaded);
}

#[tokio::test]
async fn test_cancel_is_final_and_discards_partial_payload() {
    let h = Harness::new().await;
    let tx = h.source.gated("A", 100);
    let mut events = h.manager.events();

    h.start("A");
    tx.send(Ok(Bytes::from_static(b"partial"))).unwrap();
    h.wait_until(|s| s.active.get("A").map_or(false, |r| r.bytes_downloaded > 0))
        .await;
    assert_eq!(h.staging_files(), 1);

    assert!(h.manager.cancel_download("A").await);

    // Late bytes must not resurrect the record
    let _ = tx.send(Ok(Bytes::from_static(b"late")));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let snapshot = h.manager.snapshot();
    assert!(!snapshot.active.contains_key("A"));
    assert!(!snapshot.persisted.contains_key("A"));
    assert_eq!(h.staging_files(), 0);
    assert!(!h.storage.join("A.mp4").exists());

    assert_eq!(next_event(&mut events).await, DownloadEvent::Started { id: "A".into() });
    assert_eq!(next_event(&mut events).await, DownloadEvent::Cancelled { id: "A".into() });
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_restart_after_cancel_downloads_from_scratch() {
    let h = Harness::new().await;
    let tx = h.source.gated("A", 100);
    h.source.bytes("A", vec!["fresh"]);

    h.start("A");
    tx.send(Ok(Bytes::from_static(b"old"))).unwrap();
    h.wait_until(|s| s.active.get("A").map_or(false, |r| r.bytes_downloaded == 3))
        .await;
    h.manager.cancel_download("A").await;

    assert_eq!(h.start("A"), StartOutcome::Started);
    let snapshot = h.wait_until(|s| s.persisted.contains_key("A")).await;

    assert_eq!(snapshot.persisted["A"].payload_bytes, 5);
    assert_eq!(std::fs::read(h.storage.join("A.mp4")).unwrap(), b"fresh");
    assert_eq!(h.source.opens(), 2);
}

#[tokio::test]
async fn test_network_failure_discards_record_without_retry() {
    let h = Harness::new().await;
    h.source.push("A", Script::Fail { transient: true });
    let mut events = h.manager.events();

    h.start("A");
    next_event(&mut events).await;
    let failed = next_event(&mut events).await;

    match failed {
        DownloadEvent::Failed { id, retryable, .. } => {
            assert_eq!(id, "A");
            assert!(retryable);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    let snapshot = h.manager.snapshot();
    assert!(snapshot.active.is_empty());
    assert!(snapshot.persisted.is_empty());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.source.opens(), 1);
}

#[tokio::test]
async fn test_truncated_stream_is_a_failure() {
    let h = Harness::new().await;
    h.source.push(
        "A",
        Script::Bytes {
            chunks: vec!["abc"],
            declared: Some(10),
        },
    );
    let mut events = h.manager.events();

    h.start("A");
    next_event(&mut events).await;
    assert!(matches!(
        next_event(&mut events).await,
        DownloadEvent::Failed { retryable: true, .. }
    ));
    assert_eq!(h.staging_files(), 0);
    assert!(!h.storage.join("A.mp4").exists());
}

#[tokio::test]
async fn test_commit_failure_leaves_no_artifacts() {
    let h = Harness::new().await;
    // A directory squatting on the sidecar path makes the metadata write fail
    std::fs::create_dir_all(h.storage.join("X.json").join("occupied")).unwrap();
    h.source.bytes("X", vec!["payload"]);
    let mut events = h.manager.events();

    h.start("X");
    next_event(&mut events).await;
    assert!(matches!(
        next_event(&mut events).await,
        DownloadEvent::Failed { retryable: false, .. }
    ));

    assert!(!h.storage.join("X.mp4").exists());
    assert!(!h.manager.is_downloaded("X"));
    assert!(!h.relaunch().await.is_downloaded("X"));
}

#[tokio::test]
async fn test_active_and_persisted_never_overlap() {
    let h = Harness::new().await;
    let violated = Arc::new(AtomicBool::new(false));
    let mut rx = h.manager.subscribe();
    let flag = violated.clone();
    let watcher = tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.active.keys().any(|id| snapshot.persisted.contains_key(id)) {
                flag.store(true, Ordering::SeqCst);
            }
            if snapshot.persisted.len() == 3 {
                break;
            }
        }
    });

    for id in ["A", "B", "C"] {
        h.source.bytes(id, vec!["one", "two"]);
        h.start(id);
    }
    h.wait_until(|s| s.persisted.len() == 3 && s.active.is_empty()).await;
    tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .unwrap()
        .unwrap();

    assert!(!violated.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_concurrency_cap_queues_in_pending() {
    let h = Harness::with_config(|c| c.max_concurrent_downloads = Some(1)).await;
    let tx = h.source.gated("A", 2);
    h.source.bytes("B", vec!["bb"]);

    h.start("A");
    h.start("B");
    tx.send(Ok(Bytes::from_static(b"a"))).unwrap();
    let snapshot = h
        .wait_until(|s| s.active.get("A").map_or(false, |r| r.bytes_downloaded == 1))
        .await;
    assert_eq!(snapshot.active["B"].status, DownloadStatus::Pending);
    assert_eq!(h.source.opens(), 1);

    tx.send(Ok(Bytes::from_static(b"a"))).unwrap();
    drop(tx);
    h.wait_until(|s| s.persisted.len() == 2).await;
}

#[tokio::test]
async fn test_remove_all_downloads_clears_everything() {
    let h = Harness::new().await;
    h.source.bytes("done", vec!["bytes"]);
    h.start("done");
    h.wait_until(|s| s.persisted.contains_key("done")).await;

    let _tx = h.source.gated("running", 100);
    h.start("running");

    let reports = h.manager.remove_all_downloads().await;
    assert_eq!(reports.len(), 1);
    assert!(reports.iter().all(|r| r.is_complete()));

    let snapshot = h.manager.snapshot();
    assert!(snapshot.active.is_empty());
    assert!(snapshot.persisted.is_empty());
    assert!(!h.storage.join("done.mp4").exists());
    assert!(!h.storage.join("done.json").exists());
    assert_eq!(h.staging_files(), 0);

    // Safe with nothing left
    assert!(h.manager.remove_all_downloads().await.is_empty());
}

#[tokio::test]
async fn test_delete_unknown_item_retries_file_removal() {
    let h = Harness::new().await;
    // Leftover payload from an earlier partial delete
    std::fs::create_dir_all(&h.storage).unwrap();
    std::fs::write(h.storage.join("gone.mp4"), b"x").unwrap();

    let report = h.manager.delete_downloaded_item("gone").await;
    assert!(report.is_complete());
    assert!(!h.storage.join("gone.mp4").exists());
}

#[tokio::test]
async fn test_shutdown_keeps_persisted_items() {
    let h = Harness::new().await;
    h.source.bytes("kept", vec!["bytes"]);
    h.start("kept");
    h.wait_until(|s| s.persisted.contains_key("kept")).await;
    let _tx = h.source.gated("running", 100);
    h.start("running");

    h.manager.shutdown().await;

    let snapshot = h.manager.snapshot();
    assert!(snapshot.active.is_empty());
    assert!(snapshot.persisted.contains_key("kept"));
    assert!(h.storage.join("kept.mp4").exists());
}

#[tokio::test]
async fn test_cancel_while_committing_rolls_back() {
    let h = Harness::new().await;
    h.source.bytes("X", vec!["payload"]);
    let mut events = h.manager.events();

    h.start("X");
    h.wait_until(|s| {
        s.active
            .get("X")
            .map_or(false, |r| r.status == DownloadStatus::Committing)
    })
    .await;
    assert!(h.manager.cancel_download("X").await);

    let snapshot = h.manager.snapshot();
    assert!(!snapshot.active.contains_key("X"));
    assert!(!snapshot.persisted.contains_key("X"));
    assert!(!h.storage.join("X.mp4").exists());
    assert!(!h.storage.join("X.json").exists());
    assert_eq!(h.staging_files(), 0);
    assert!(!h.relaunch().await.is_downloaded("X"));

    assert_eq!(next_event(&mut events).await, DownloadEvent::Started { id: "X".into() });
    assert_eq!(next_event(&mut events).await, DownloadEvent::Cancelled { id: "X".into() });
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_failed_file_removal_is_reported() {
    let h = Harness::new().await;
    h.source.bytes("X", vec!["payload"]);
    h.start("X");
    h.wait_until(|s| s.persisted.contains_key("X")).await;

    // A non-empty directory where the payload should be cannot be unlinked
    std::fs::remove_file(h.storage.join("X.mp4")).unwrap();
    std::fs::create_dir_all(h.storage.join("X.mp4").join("occupied")).unwrap();

    let report = h.manager.delete_downloaded_item("X").await;
    assert!(!report.is_complete());
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].path, h.storage.join("X.mp4"));
    assert!(!h.storage.join("X.json").exists());
    assert!(!h.manager.is_downloaded("X"));
    assert!(!h.relaunch().await.is_downloaded("X"));
}

/// Yield until `check` holds, letting spawned tasks make progress
async fn settle(mut check: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if check() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never held");
}

#[tokio::test]
async fn test_restart_during_delete_keeps_fresh_files() {
    let h = Harness::new().await;
    h.source.bytes("X", vec!["stale"]);
    h.start("X");
    h.wait_until(|s| s.persisted.contains_key("X")).await;

    let manager = h.manager.clone();
    let deleting = tokio::spawn(async move { manager.delete_downloaded_item("X").await });
    settle(|| !h.manager.is_downloaded("X")).await;

    h.source.bytes("X", vec!["fresh"]);
    assert_eq!(h.start("X"), StartOutcome::Started);

    assert!(deleting.await.unwrap().is_complete());
    let snapshot = h.wait_until(|s| s.persisted.contains_key("X")).await;

    assert_eq!(snapshot.persisted["X"].payload_bytes, 5);
    assert_eq!(std::fs::read(h.storage.join("X.mp4")).unwrap(), b"fresh");
    assert!(h.storage.join("X.json").exists());
    assert!(h.relaunch().await.is_downloaded("X"));
}

#[tokio::test]
async fn test_restart_during_remove_all_keeps_fresh_files() {
    let h = Harness::new().await;
    for id in ["A", "B", "X"] {
        h.source.bytes(id, vec!["stale"]);
        h.start(id);
    }
    h.wait_until(|s| s.persisted.len() == 3).await;

    let manager = h.manager.clone();
    let removing = tokio::spawn(async move { manager.remove_all_downloads().await });
    settle(|| h.manager.snapshot().persisted.is_empty()).await;

    h.source.bytes("X", vec!["fresh"]);
    assert_eq!(h.start("X"), StartOutcome::Started);

    let reports = removing.await.unwrap();
    assert_eq!(reports.len(), 3);
    let snapshot = h.wait_until(|s| s.persisted.contains_key("X")).await;

    assert_eq!(snapshot.persisted.keys().collect::<Vec<_>>(), vec!["X"]);
    assert_eq!(std::fs::read(h.storage.join("X.mp4")).unwrap(), b"fresh");
    assert!(h.storage.join("X.json").exists());
    assert!(!h.storage.join("A.mp4").exists());
    assert!(h.relaunch().await.is_downloaded("X"));
}
