use crate::domain::{
    IndexedMetadata, SessionContentUpdateData, StreamEvent, scan_session_file, session_channel,
};
use crate::infra::projects::list_session_files;
use crate::infra::reader::read_entries;
use crate::infra::store::{SessionStore, StoreResult};
use crate::infra::watch::{WatchSignal, watch_projects_dir};
use crate::server::broadcast::Broadcaster;
use crate::util::{log_event, now_iso, now_unix_ms, system_time_to_unix_ms};
use notify::RecommendedWatcher;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;

const DEBOUNCE: Duration = Duration::from_millis(200);
const SCAN_BATCH_SIZE: usize = 50;
const MTIME_SLACK_MS: i64 = 1_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ScanReport {
    pub indexed: usize,
    pub skipped: usize,
    pub warnings: usize,
}

/// Keeps the metadata store in step with the on-disk archive: one full scan
/// at startup, then per-file re-indexing driven by filesystem events with a
/// 200 ms debounce. Never deletes rows, never crashes the process.
pub struct HistoryIndexer {
    inner: Arc<IndexerInner>,
}

struct IndexerInner {
    store: Arc<SessionStore>,
    broadcaster: Arc<Broadcaster>,
    projects_dir: PathBuf,
    running: AtomicBool,
    should_stop: AtomicBool,
    watcher: Mutex<Option<RecommendedWatcher>>,
    debounce: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    /// Batch that failed to commit; re-attempted on the next flush.
    pending: Mutex<Vec<IndexedMetadata>>,
}

impl HistoryIndexer {
    pub fn new(
        store: Arc<SessionStore>,
        broadcaster: Arc<Broadcaster>,
        projects_dir: PathBuf,
    ) -> Self {
        Self {
            inner: Arc::new(IndexerInner {
                store,
                broadcaster,
                projects_dir,
                running: AtomicBool::new(false),
                should_stop: AtomicBool::new(false),
                watcher: Mutex::new(None),
                debounce: Mutex::new(HashMap::new()),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Idempotent. The scan runs in the background so startup never blocks
    /// on it; the watcher is installed after the scan completes, and files
    /// touched mid-scan are re-observed through the mtime comparison.
    pub fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            log_event("indexer.already_running", serde_json::json!({}));
            return;
        }
        self.inner.should_stop.store(false, Ordering::SeqCst);

        let inner = self.inner.clone();
        tokio::spawn(async move {
            let scan_inner = inner.clone();
            let scan = tokio::task::spawn_blocking(move || scan_inner.run_full_scan()).await;
            match scan {
                Ok(report) => log_event(
                    "indexer.scan_done",
                    serde_json::json!({
                        "indexed": report.indexed,
                        "skipped": report.skipped,
                        "warnings": report.warnings,
                    }),
                ),
                Err(error) => log_event(
                    "indexer.scan_panicked",
                    serde_json::json!({"error": error.to_string()}),
                ),
            }

            if inner.should_stop.load(Ordering::SeqCst) {
                return;
            }

            let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
            match watch_projects_dir(&inner.projects_dir, tx) {
                Ok(watcher) => {
                    *inner.watcher.lock() = Some(watcher);
                }
                Err(error) => {
                    log_event(
                        "indexer.watch_failed",
                        serde_json::json!({
                            "path": inner.projects_dir.display().to_string(),
                            "error": error.to_string(),
                        }),
                    );
                    return;
                }
            }
            log_event(
                "indexer.watching",
                serde_json::json!({"path": inner.projects_dir.display().to_string()}),
            );

            while let Some(signal) = rx.recv().await {
                if inner.should_stop.load(Ordering::SeqCst) {
                    break;
                }
                match signal {
                    WatchSignal::Changed(path) => IndexerInner::debounce_file(&inner, path),
                    WatchSignal::Error(message) => {
                        log_event("indexer.watch_error", serde_json::json!({"error": message}));
                    }
                }
            }
        });
    }

    /// Cancels pending debounce timers and closes the watcher. A mid-flight
    /// scan finishes its current file and stops at the next file boundary.
    pub fn stop(&self) {
        self.inner.should_stop.store(true, Ordering::SeqCst);
        *self.inner.watcher.lock() = None;
        for (_, handle) in self.inner.debounce.lock().drain() {
            handle.abort();
        }
        self.inner.running.store(false, Ordering::SeqCst);
        log_event("indexer.stopped", serde_json::json!({}));
    }

    /// Synchronous full scan; exposed so callers (and tests) can run one
    /// without the watcher machinery.
    pub fn run_full_scan(&self) -> ScanReport {
        self.inner.run_full_scan()
    }

    /// Re-index a single file now, as the debounce timer would. A path that
    /// no longer exists is dropped without error.
    pub async fn index_file(&self, path: &Path) {
        let inner = self.inner.clone();
        let path = path.to_path_buf();
        let _ = tokio::task::spawn_blocking(move || inner.reindex_file(&path)).await;
    }
}

impl IndexerInner {
    fn run_full_scan(&self) -> ScanReport {
        let mut report = ScanReport::default();

        let watermarks = match self.store.scan_watermarks() {
            Ok(watermarks) => watermarks,
            Err(error) => {
                log_event(
                    "indexer.scan_failed",
                    serde_json::json!({"error": error.to_string()}),
                );
                report.warnings += 1;
                return report;
            }
        };

        let listing = list_session_files(&self.projects_dir);
        report.warnings += listing.warnings;

        let mut batch: Vec<IndexedMetadata> = Vec::new();
        for path in listing.files {
            if self.should_stop.load(Ordering::SeqCst) {
                break;
            }

            let Ok(file_meta) = fs::metadata(&path) else {
                report.warnings += 1;
                continue;
            };
            let mtime_ms = file_meta
                .modified()
                .ok()
                .and_then(system_time_to_unix_ms)
                .unwrap_or_else(now_unix_ms);

            let session_id = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .unwrap_or_default();
            if let Some(scanned_at) = watermarks.get(session_id)
                && *scanned_at >= mtime_ms - MTIME_SLACK_MS
            {
                report.skipped += 1;
                continue;
            }

            match scan_session_file(&path, mtime_ms) {
                Ok(Some(metadata)) => {
                    batch.push(metadata);
                    report.indexed += 1;
                }
                Ok(None) => {}
                Err(error) => {
                    report.warnings += 1;
                    log_event(
                        "indexer.file_error",
                        serde_json::json!({
                            "path": path.display().to_string(),
                            "error": error.to_string(),
                        }),
                    );
                }
            }

            if batch.len() >= SCAN_BATCH_SIZE {
                self.flush(std::mem::take(&mut batch));
            }
        }
        self.flush(batch);

        report
    }

    /// Commit a batch, retrying anything a previous flush failed to land.
    /// A store error stashes the whole batch for the next attempt; the scan
    /// itself carries on.
    fn flush(&self, mut batch: Vec<IndexedMetadata>) {
        {
            let mut pending = self.pending.lock();
            if !pending.is_empty() {
                let mut merged = std::mem::take(&mut *pending);
                merged.append(&mut batch);
                batch = merged;
            }
        }
        if batch.is_empty() {
            return;
        }
        if let Err(error) = self.try_flush(&batch) {
            log_event(
                "indexer.batch_error",
                serde_json::json!({
                    "size": batch.len(),
                    "error": error.to_string(),
                }),
            );
            self.pending.lock().extend(batch);
        }
    }

    fn try_flush(&self, batch: &[IndexedMetadata]) -> StoreResult<usize> {
        self.store.upsert_indexed_batch(batch)
    }

    fn debounce_file(inner: &Arc<Self>, path: PathBuf) {
        let mut debounce = inner.debounce.lock();
        if let Some(handle) = debounce.remove(&path) {
            handle.abort();
        }

        let task_inner = inner.clone();
        let task_path = path.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DEBOUNCE).await;
            task_inner.debounce.lock().remove(&task_path);
            if task_inner.should_stop.load(Ordering::SeqCst) {
                return;
            }
            let blocking_inner = task_inner.clone();
            let blocking_path = task_path.clone();
            let _ =
                tokio::task::spawn_blocking(move || blocking_inner.reindex_file(&blocking_path))
                    .await;
        });
        debounce.insert(path, handle);
    }

    fn reindex_file(&self, path: &Path) {
        let Ok(file_meta) = fs::metadata(path) else {
            // Deleted between the event and the timer firing.
            return;
        };
        let mtime_ms = file_meta
            .modified()
            .ok()
            .and_then(system_time_to_unix_ms)
            .unwrap_or_else(now_unix_ms);

        let metadata = match scan_session_file(path, mtime_ms) {
            Ok(Some(metadata)) => metadata,
            Ok(None) => return,
            Err(error) => {
                log_event(
                    "indexer.file_error",
                    serde_json::json!({
                        "path": path.display().to_string(),
                        "error": error.to_string(),
                    }),
                );
                return;
            }
        };

        let session_id = metadata.session_id.clone();
        let previous_count = self
            .store
            .get(&session_id)
            .ok()
            .flatten()
            .map(|record| record.message_count)
            .unwrap_or(0);

        if let Err(error) = self.try_flush(std::slice::from_ref(&metadata)) {
            log_event(
                "indexer.batch_error",
                serde_json::json!({"size": 1usize, "error": error.to_string()}),
            );
            self.pending.lock().push(metadata);
            return;
        }

        self.broadcaster.publish_global(StreamEvent::IndexUpdate {
            session_id: session_id.clone(),
            timestamp: now_iso(),
        });
        self.push_session_content(&session_id, path, previous_count);
    }

    /// Push messages appended since the last index state onto the session's
    /// own channel, if anyone is listening there.
    fn push_session_content(&self, session_id: &str, path: &Path, previous_count: u64) {
        let channel = session_channel(session_id);
        if !self.broadcaster.has_clients(&channel) {
            return;
        }

        let Ok(entries) = read_entries(path) else {
            return;
        };
        let appended: Vec<_> = entries
            .into_iter()
            .filter(|entry| !entry.is_sidechain)
            .skip(previous_count as usize)
            .collect();
        if appended.is_empty() {
            return;
        }

        self.broadcaster.broadcast(
            &channel,
            StreamEvent::SessionContentUpdate {
                data: SessionContentUpdateData { messages: appended },
            },
        );
    }
}

impl Drop for IndexerInner {
    fn drop(&mut self) {
        for (_, handle) in self.debounce.lock().drain() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ListQuery;
    use std::fs::{self, File, FileTimes};
    use std::time::{Duration as StdDuration, SystemTime};
    use tempfile::tempdir;

    fn fixture(projects_dir: &Path, session_id: &str, lines: &[String]) -> PathBuf {
        let key_dir = projects_dir.join("-home-me-proj");
        fs::create_dir_all(&key_dir).expect("create");
        let path = key_dir.join(format!("{session_id}.jsonl"));
        fs::write(&path, lines.join("\n")).expect("write");
        path
    }

    fn user_line(uuid: &str, ts: &str, text: &str) -> String {
        serde_json::json!({
            "type": "user",
            "uuid": uuid,
            "timestamp": ts,
            "cwd": "/p",
            "message": {"content": text},
            "durationMs": 100,
        })
        .to_string()
    }

    fn assistant_line(uuid: &str, parent: &str, ts: &str) -> String {
        serde_json::json!({
            "type": "assistant",
            "uuid": uuid,
            "parentUuid": parent,
            "timestamp": ts,
            "message": {"model": "m-1", "content": "ok"},
            "durationMs": 200,
        })
        .to_string()
    }

    fn bump_mtime(path: &Path, ahead: StdDuration) {
        let file = File::options().append(true).open(path).expect("open");
        let when = SystemTime::now() + ahead;
        file.set_times(FileTimes::new().set_modified(when))
            .expect("set mtime");
    }

    fn indexer(projects_dir: &Path) -> (HistoryIndexer, Arc<SessionStore>, Arc<Broadcaster>) {
        let store = Arc::new(SessionStore::open_in_memory().expect("open store"));
        let broadcaster = Arc::new(Broadcaster::new());
        let indexer = HistoryIndexer::new(
            store.clone(),
            broadcaster.clone(),
            projects_dir.to_path_buf(),
        );
        (indexer, store, broadcaster)
    }

    #[test]
    fn full_scan_indexes_fresh_sessions() {
        let dir = tempdir().expect("tempdir");
        let projects_dir = dir.path().join("projects");
        fixture(
            &projects_dir,
            "a",
            &[
                user_line("u1", "2024-01-01T00:00:00Z", "hi"),
                assistant_line("a1", "u1", "2024-01-01T00:00:01Z"),
            ],
        );

        let (indexer, store, _) = indexer(&projects_dir);
        let report = indexer.run_full_scan();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.skipped, 0);

        let record = store.get("a").expect("get").expect("row");
        assert_eq!(record.message_count, 2);
        assert_eq!(record.total_duration_ms, 300);
        assert_eq!(record.model, "m-1");
        assert_eq!(record.summary.as_deref(), Some("hi"));
        assert_eq!(record.created_at, "2024-01-01T00:00:00Z");
        assert_eq!(record.updated_at, "2024-01-01T00:00:01Z");
    }

    #[test]
    fn unchanged_files_are_skipped_on_rescan() {
        let dir = tempdir().expect("tempdir");
        let projects_dir = dir.path().join("projects");
        fixture(
            &projects_dir,
            "a",
            &[user_line("u1", "2024-01-01T00:00:00Z", "hi")],
        );

        let (indexer, store, _) = indexer(&projects_dir);
        assert_eq!(indexer.run_full_scan().indexed, 1);
        let first = store.get("a").expect("get").expect("row");

        let report = indexer.run_full_scan();
        assert_eq!(report.indexed, 0);
        assert_eq!(report.skipped, 1);
        let second = store.get("a").expect("get").expect("row");
        assert_eq!(second, first);
    }

    #[test]
    fn agent_and_sidechain_only_logs_write_nothing() {
        let dir = tempdir().expect("tempdir");
        let projects_dir = dir.path().join("projects");
        fixture(
            &projects_dir,
            "agent-sub",
            &[user_line("u1", "2024-01-01T00:00:00Z", "internal")],
        );
        let sidechain = serde_json::json!({
            "type": "user",
            "uuid": "u1",
            "isSidechain": true,
            "timestamp": "2024-01-01T00:00:00Z",
            "message": {"content": "chatter"},
        })
        .to_string();
        fixture(&projects_dir, "quiet", &[sidechain]);

        let (indexer, store, _) = indexer(&projects_dir);
        let report = indexer.run_full_scan();
        assert_eq!(report.indexed, 0);
        let (_, total) = store.list(&ListQuery::default()).expect("list");
        assert_eq!(total, 0);
    }

    #[test]
    fn custom_name_survives_a_rescan_of_a_touched_file() {
        let dir = tempdir().expect("tempdir");
        let projects_dir = dir.path().join("projects");
        let path = fixture(
            &projects_dir,
            "a",
            &[
                user_line("u1", "2024-01-01T00:00:00Z", "hi"),
                assistant_line("a1", "u1", "2024-01-01T00:00:01Z"),
            ],
        );

        let (indexer, store, _) = indexer(&projects_dir);
        indexer.run_full_scan();

        store
            .upsert_user_fields(
                "a",
                &crate::domain::SessionInfoUpdate {
                    custom_name: Some("demo".to_string()),
                    ..Default::default()
                },
            )
            .expect("rename");

        // Push the mtime past the slack window so the rescan really runs.
        bump_mtime(&path, StdDuration::from_secs(5));
        let report = indexer.run_full_scan();
        assert_eq!(report.indexed, 1);

        let record = store.get("a").expect("get").expect("row");
        assert_eq!(record.custom_name, "demo");
        assert_eq!(record.message_count, 2);
    }

    #[tokio::test]
    async fn index_file_publishes_a_global_index_update() {
        let dir = tempdir().expect("tempdir");
        let projects_dir = dir.path().join("projects");
        let path = fixture(
            &projects_dir,
            "a",
            &[user_line("u1", "2024-01-01T00:00:00Z", "hi")],
        );

        let (indexer, store, broadcaster) = indexer(&projects_dir);
        let mut client = broadcaster.add_client("some-viewer");
        // Consume the handshake.
        let _ = client.rx.recv().await;

        indexer.index_file(&path).await;

        assert!(store.get("a").expect("get").is_some());
        match client.rx.recv().await {
            Some(crate::server::broadcast::StreamFrame::Event(StreamEvent::IndexUpdate {
                session_id,
                ..
            })) => assert_eq!(session_id, "a"),
            other => panic!("expected index_update, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn index_file_pushes_appended_messages_to_session_channel() {
        let dir = tempdir().expect("tempdir");
        let projects_dir = dir.path().join("projects");
        let path = fixture(
            &projects_dir,
            "a",
            &[user_line("u1", "2024-01-01T00:00:00Z", "hi")],
        );

        let (indexer, _store, broadcaster) = indexer(&projects_dir);
        indexer.index_file(&path).await;

        let mut client = broadcaster.add_client(&session_channel("a"));
        let _ = client.rx.recv().await; // handshake

        let mut lines = fs::read_to_string(&path).expect("read");
        lines.push('\n');
        lines.push_str(&assistant_line("a1", "u1", "2024-01-01T00:00:05Z"));
        fs::write(&path, lines).expect("append");
        bump_mtime(&path, StdDuration::from_secs(5));

        indexer.index_file(&path).await;

        loop {
            match client.rx.recv().await {
                Some(crate::server::broadcast::StreamFrame::Event(
                    StreamEvent::SessionContentUpdate { data },
                )) => {
                    assert_eq!(data.messages.len(), 1);
                    assert_eq!(data.messages[0].uuid, "a1");
                    break;
                }
                Some(_) => continue,
                None => panic!("stream ended before content update"),
            }
        }
    }

    #[tokio::test]
    async fn index_file_on_a_missing_path_is_a_noop() {
        let dir = tempdir().expect("tempdir");
        let projects_dir = dir.path().join("projects");
        let (indexer, store, _) = indexer(&projects_dir);

        indexer.index_file(&projects_dir.join("k/ghost.jsonl")).await;
        let (_, total) = store.list(&ListQuery::default()).expect("list");
        assert_eq!(total, 0);
    }
}
