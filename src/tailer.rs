//! Incremental JSONL file tailing with directory-level change watches.
//!
//! Each watched session file has a byte-offset [`IncrementalReader`] that only
//! ever reads content appended since the last read. The watch subscribes to
//! the *parent directories* of the watched files so create/delete/rename of
//! the files themselves are visible.
//!
//! Change events are debounced (~100 ms) and fan out to the orchestrator via
//! two channels: record batches and deletion signals.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Debounce window for filesystem events.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(100);

/// A batch of freshly parsed records for one session.
#[derive(Debug)]
pub struct LineBatch {
    pub session_id: String,
    pub records: Vec<Value>,
}

/// Incrementally reads new lines from a JSONL file.
///
/// Tracks a byte position and reads only content past it. A trailing segment
/// without a newline is a partial record and is left unconsumed; the next read
/// re-examines it. Truncation (position beyond file size) resets to 0.
#[derive(Debug)]
pub struct IncrementalReader {
    path: PathBuf,
    position: u64,
}

/// Outcome of a single [`IncrementalReader::read_new`] call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// New complete records (possibly empty) and the advanced position.
    Records(Vec<Value>),
    /// The file no longer exists.
    Deleted,
}

impl IncrementalReader {
    pub fn new(path: PathBuf, position: u64) -> Self {
        Self { path, position }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    /// Read and parse everything appended since the last call.
    ///
    /// - Missing file → [`ReadOutcome::Deleted`], position untouched.
    /// - Position beyond file size → truncation: reset to 0 and re-read.
    /// - Undecodable chunk → skip to end of file, no records.
    /// - Trailing partial line → not consumed; position stops before it.
    /// - Malformed JSON lines → logged and skipped, position still advances.
    pub async fn read_new(&mut self) -> ReadOutcome {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ReadOutcome::Deleted,
            Err(e) => {
                warn!("stat failed for {}: {e}", self.path.display());
                return ReadOutcome::Records(Vec::new());
            }
        };

        if self.position > size {
            warn!(
                "file truncated: {} (position {} > size {size}), resetting to 0",
                self.path.display(),
                self.position
            );
            self.position = 0;
        }

        if self.position >= size {
            return ReadOutcome::Records(Vec::new());
        }

        let raw = match read_range(&self.path, self.position, size).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return ReadOutcome::Deleted,
            Err(e) => {
                warn!("read failed for {}: {e}", self.path.display());
                return ReadOutcome::Records(Vec::new());
            }
        };

        let Ok(text) = std::str::from_utf8(&raw) else {
            warn!("undecodable chunk in {}, skipping", self.path.display());
            self.position = size;
            return ReadOutcome::Records(Vec::new());
        };

        // A buffer not ending in LF carries a partial final record that must
        // not be consumed yet.
        let consumed = if text.is_empty() || text.ends_with('\n') {
            raw.len() as u64
        } else {
            let partial = text.rsplit('\n').next().unwrap_or(text);
            (raw.len() - partial.len()) as u64
        };

        let mut records = Vec::new();
        for line in text[..consumed as usize].split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(line) {
                Ok(value) => records.push(value),
                Err(e) => warn!("malformed record in {}: {e}", self.path.display()),
            }
        }

        self.position += consumed;
        ReadOutcome::Records(records)
    }

    /// Reposition to the start of the n-th-from-last complete non-empty line.
    ///
    /// Returns the new position; 0 when the file has `n` or fewer lines.
    pub async fn seek_to_last_n_lines(&mut self, n: usize) -> u64 {
        let content = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(_) => return 0,
        };
        let Ok(text) = std::str::from_utf8(&content) else {
            self.position = content.len() as u64;
            return self.position;
        };

        let mut offsets = Vec::new();
        let mut pos = 0u64;
        let segments: Vec<&str> = text.split('\n').collect();
        for (i, segment) in segments.iter().enumerate() {
            if !segment.trim().is_empty() {
                offsets.push(pos);
            }
            pos += segment.len() as u64;
            if i < segments.len() - 1 {
                pos += 1;
            }
        }

        if offsets.len() <= n {
            self.position = 0;
            return 0;
        }
        self.position = offsets[offsets.len() - n];
        self.position
    }
}

async fn read_range(path: &Path, from: u64, to: u64) -> std::io::Result<Vec<u8>> {
    use tokio::io::{AsyncReadExt, AsyncSeekExt};

    let mut file = tokio::fs::File::open(path).await?;
    file.seek(std::io::SeekFrom::Start(from)).await?;
    let mut buf = Vec::with_capacity((to - from) as usize);
    file.take(to - from).read_to_end(&mut buf).await?;
    Ok(buf)
}

// ─── Tailer ──────────────────────────────────────────────────────────────────

struct WatchedFile {
    session_id: String,
    reader: IncrementalReader,
}

#[derive(Default)]
struct TailerInner {
    /// session_id → watched file + reader.
    watched: HashMap<String, WatchedFile>,
    /// canonical file path → session_id.
    by_path: HashMap<PathBuf, String>,
    /// watched parent directory → refcount.
    dirs: HashMap<PathBuf, usize>,
}

/// Watches multiple session files and reads new JSONL records incrementally.
///
/// Cloneable — all clones share the same watch state. Consumers receive
/// [`LineBatch`]es and deletion signals from the channels handed to
/// [`Tailer::new`].
#[derive(Clone)]
pub struct Tailer {
    inner: Arc<Mutex<TailerInner>>,
    /// The OS watcher; present while the watch loop is running.
    watcher: Arc<std::sync::Mutex<Option<RecommendedWatcher>>>,
    batches_tx: mpsc::Sender<LineBatch>,
    deleted_tx: mpsc::Sender<String>,
}

impl Tailer {
    /// Create a tailer delivering batches and deletion signals to the given
    /// channel senders.
    pub fn new(batches_tx: mpsc::Sender<LineBatch>, deleted_tx: mpsc::Sender<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TailerInner::default())),
            watcher: Arc::new(std::sync::Mutex::new(None)),
            batches_tx,
            deleted_tx,
        }
    }

    /// Register a file. `start_position` may be the current size
    /// (attach-at-live) or a checkpointed offset.
    pub async fn add(&self, session_id: &str, path: &Path, start_position: u64) {
        let canonical = canonicalize_lenient(path);
        let mut inner = self.inner.lock().await;

        inner.watched.insert(
            session_id.to_string(),
            WatchedFile {
                session_id: session_id.to_string(),
                reader: IncrementalReader::new(path.to_path_buf(), start_position),
            },
        );
        inner.by_path.insert(canonical, session_id.to_string());

        if let Some(parent) = path.parent() {
            let count = inner.dirs.entry(parent.to_path_buf()).or_insert(0);
            *count += 1;
            if *count == 1 {
                self.watch_dir(parent);
            }
        }
        debug!("tailing {} for session {session_id}", path.display());
    }

    /// Unregister a session. Stops watching its directory when no other
    /// watched file lives there.
    pub async fn remove(&self, session_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(watched) = inner.watched.remove(session_id) else {
            return;
        };
        let path = watched.reader.path.clone();
        let canonical = canonicalize_lenient(&path);
        inner.by_path.remove(&canonical);

        if let Some(parent) = path.parent() {
            if let Some(count) = inner.dirs.get_mut(parent) {
                *count -= 1;
                if *count == 0 {
                    inner.dirs.remove(parent);
                    self.unwatch_dir(parent);
                }
            }
        }
        debug!("stopped tailing session {session_id}");
    }

    /// Current byte position for a session, if watched.
    pub async fn position(&self, session_id: &str) -> Option<u64> {
        let inner = self.inner.lock().await;
        inner
            .watched
            .get(session_id)
            .map(|w| w.reader.position())
    }

    pub async fn watched_sessions(&self) -> Vec<String> {
        let inner = self.inner.lock().await;
        inner.watched.keys().cloned().collect()
    }

    pub async fn is_watching(&self, session_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner.watched.contains_key(session_id)
    }

    /// Reposition to the start of the n-th-from-last complete record.
    /// Returns the new position (0 when the file has `n` or fewer records).
    pub async fn seek_tail(&self, session_id: &str, n: usize) -> u64 {
        let mut inner = self.inner.lock().await;
        match inner.watched.get_mut(session_id) {
            Some(watched) => watched.reader.seek_to_last_n_lines(n).await,
            None => 0,
        }
    }

    /// Reposition to the n-th-from-last record and return the records from
    /// there to EOF. Used for attach-time replay.
    pub async fn replay_last(&self, session_id: &str, n: usize) -> Vec<Value> {
        let mut inner = self.inner.lock().await;
        let Some(watched) = inner.watched.get_mut(session_id) else {
            return Vec::new();
        };
        watched.reader.seek_to_last_n_lines(n).await;
        match watched.reader.read_new().await {
            ReadOutcome::Records(records) => records,
            ReadOutcome::Deleted => Vec::new(),
        }
    }

    /// Start the watch loop. Filesystem events flow through an internal
    /// channel, get debounced, and produce batches / deletion signals until
    /// the token is cancelled.
    pub fn start(&self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        let (fs_tx, fs_rx) = mpsc::unbounded_channel::<notify::Event>();

        let watcher = RecommendedWatcher::new(
            move |res: Result<notify::Event, notify::Error>| match res {
                Ok(event) => {
                    let _ = fs_tx.send(event);
                }
                Err(e) => warn!("watch error: {e}"),
            },
            notify::Config::default(),
        );

        match watcher {
            Ok(w) => {
                let mut slot = self
                    .watcher
                    .lock()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                *slot = Some(w);
            }
            Err(e) => error!("failed to initialise file watcher: {e}"),
        }

        let tailer = self.clone();
        tokio::spawn(async move {
            // Pick up directories added before the watcher existed.
            {
                let inner = tailer.inner.lock().await;
                let dirs: Vec<PathBuf> = inner.dirs.keys().cloned().collect();
                drop(inner);
                for dir in dirs {
                    tailer.watch_dir(&dir);
                }
            }
            tailer.watch_loop(fs_rx, cancel).await;
        })
    }

    async fn watch_loop(
        &self,
        mut fs_rx: mpsc::UnboundedReceiver<notify::Event>,
        cancel: CancellationToken,
    ) {
        info!("file watcher started");
        loop {
            let first = tokio::select! {
                () = cancel.cancelled() => break,
                event = fs_rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            // Debounce: keep collecting events for a short window so bursts
            // of appends produce a single read.
            let mut pending = vec![first];
            let deadline = tokio::time::Instant::now() + WATCH_DEBOUNCE;
            loop {
                tokio::select! {
                    () = cancel.cancelled() => return,
                    () = tokio::time::sleep_until(deadline) => break,
                    event = fs_rx.recv() => match event {
                        Some(event) => pending.push(event),
                        None => break,
                    },
                }
            }

            self.handle_changes(pending).await;
        }
        info!("file watcher stopped");
    }

    async fn handle_changes(&self, events: Vec<notify::Event>) {
        let mut touched: Vec<String> = Vec::new();
        let mut deleted: Vec<String> = Vec::new();

        {
            let inner = self.inner.lock().await;
            for event in &events {
                let removing = matches!(event.kind, EventKind::Remove(_));
                for path in &event.paths {
                    let canonical = canonicalize_lenient(path);
                    let Some(session_id) = inner.by_path.get(&canonical) else {
                        continue;
                    };
                    if removing {
                        if !deleted.contains(session_id) {
                            deleted.push(session_id.clone());
                        }
                    } else if !touched.contains(session_id) {
                        touched.push(session_id.clone());
                    }
                }
            }
        }

        // Deletions first, mirroring the change-event grouping order.
        for session_id in deleted {
            self.remove(&session_id).await;
            touched.retain(|s| s != &session_id);
            if self.deleted_tx.send(session_id).await.is_err() {
                return;
            }
        }

        for session_id in touched {
            self.process_session(&session_id).await;
        }
    }

    async fn process_session(&self, session_id: &str) {
        let outcome = {
            let mut inner = self.inner.lock().await;
            let Some(watched) = inner.watched.get_mut(session_id) else {
                return;
            };
            watched.reader.read_new().await
        };

        match outcome {
            ReadOutcome::Records(records) => {
                if records.is_empty() {
                    return;
                }
                let batch = LineBatch {
                    session_id: session_id.to_string(),
                    records,
                };
                if self.batches_tx.send(batch).await.is_err() {
                    warn!("batch receiver gone, dropping records for {session_id}");
                }
            }
            ReadOutcome::Deleted => {
                self.remove(session_id).await;
                let _ = self.deleted_tx.send(session_id.to_string()).await;
            }
        }
    }

    fn watch_dir(&self, dir: &Path) {
        let mut slot = self
            .watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(watcher) = slot.as_mut() {
            if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
                warn!("failed to watch {}: {e}", dir.display());
            }
        }
    }

    fn unwatch_dir(&self, dir: &Path) {
        let mut slot = self
            .watcher
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(watcher) = slot.as_mut() {
            let _ = watcher.unwatch(dir);
        }
    }
}

/// Canonicalise when possible; deleted files can't be canonicalised so fall
/// back to the path as given (watch events carry the same form).
fn canonicalize_lenient(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_file(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(content).unwrap();
        path
    }

    #[tokio::test]
    async fn test_read_new_complete_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", b"{\"a\":1}\n{\"a\":2}\n");
        let mut reader = IncrementalReader::new(path, 0);
        match reader.read_new().await {
            ReadOutcome::Records(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[1]["a"], 2);
            }
            ReadOutcome::Deleted => panic!("unexpected deletion"),
        }
        assert_eq!(reader.position(), 16);
    }

    #[tokio::test]
    async fn test_read_new_holds_back_partial_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", b"{\"a\":1}\n{\"a\":");
        let mut reader = IncrementalReader::new(path.clone(), 0);
        match reader.read_new().await {
            ReadOutcome::Records(records) => assert_eq!(records.len(), 1),
            ReadOutcome::Deleted => panic!("unexpected deletion"),
        }
        // Position stops right after the newline, before the partial record.
        assert_eq!(reader.position(), 8);

        // Complete the record; the next read picks it up from the held
        // position.
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        f.write_all(b"2}\n").unwrap();
        match reader.read_new().await {
            ReadOutcome::Records(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0]["a"], 2);
            }
            ReadOutcome::Deleted => panic!("unexpected deletion"),
        }
        assert_eq!(reader.position(), 16);
    }

    #[tokio::test]
    async fn test_read_new_skips_malformed_but_advances() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", b"not json\n{\"ok\":true}\n");
        let mut reader = IncrementalReader::new(path, 0);
        match reader.read_new().await {
            ReadOutcome::Records(records) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0]["ok"], true);
            }
            ReadOutcome::Deleted => panic!("unexpected deletion"),
        }
        assert_eq!(reader.position(), 21);
    }

    #[tokio::test]
    async fn test_read_new_truncation_resets() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", b"{\"a\":1}\n");
        let mut reader = IncrementalReader::new(path, 100);
        match reader.read_new().await {
            ReadOutcome::Records(records) => assert_eq!(records.len(), 1),
            ReadOutcome::Deleted => panic!("unexpected deletion"),
        }
        assert_eq!(reader.position(), 8);
    }

    #[tokio::test]
    async fn test_read_new_deleted_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gone.jsonl");
        let mut reader = IncrementalReader::new(path, 0);
        assert!(matches!(reader.read_new().await, ReadOutcome::Deleted));
    }

    #[tokio::test]
    async fn test_read_new_invalid_utf8_skips_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", &[0xff, 0xfe, b'\n']);
        let mut reader = IncrementalReader::new(path, 0);
        match reader.read_new().await {
            ReadOutcome::Records(records) => assert!(records.is_empty()),
            ReadOutcome::Deleted => panic!("unexpected deletion"),
        }
        assert_eq!(reader.position(), 3);
    }

    #[tokio::test]
    async fn test_seek_to_last_n_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", b"{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n");
        let mut reader = IncrementalReader::new(path, 0);
        let pos = reader.seek_to_last_n_lines(2).await;
        assert_eq!(pos, 8);
        match reader.read_new().await {
            ReadOutcome::Records(records) => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[0]["n"], 2);
            }
            ReadOutcome::Deleted => panic!("unexpected deletion"),
        }
    }

    #[tokio::test]
    async fn test_seek_to_last_n_lines_fewer_lines_returns_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", b"{\"n\":1}\n");
        let mut reader = IncrementalReader::new(path, 0);
        assert_eq!(reader.seek_to_last_n_lines(5).await, 0);
    }

    #[tokio::test]
    async fn test_tailer_add_remove_position() {
        let (batches_tx, _batches_rx) = mpsc::channel(8);
        let (deleted_tx, _deleted_rx) = mpsc::channel(8);
        let tailer = Tailer::new(batches_tx, deleted_tx);

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", b"{\"a\":1}\n");

        tailer.add("sess-1", &path, 8).await;
        assert_eq!(tailer.position("sess-1").await, Some(8));
        assert!(tailer.is_watching("sess-1").await);

        tailer.remove("sess-1").await;
        assert_eq!(tailer.position("sess-1").await, None);
    }

    #[tokio::test]
    async fn test_tailer_replay_last() {
        let (batches_tx, _batches_rx) = mpsc::channel(8);
        let (deleted_tx, _deleted_rx) = mpsc::channel(8);
        let tailer = Tailer::new(batches_tx, deleted_tx);

        let dir = tempfile::tempdir().unwrap();
        let path = write_file(&dir, "s.jsonl", b"{\"n\":1}\n{\"n\":2}\n{\"n\":3}\n");

        // Attach at live (EOF), then replay the last two records.
        tailer.add("sess-1", &path, 24).await;
        let records = tailer.replay_last("sess-1", 2).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["n"], 2);
        assert_eq!(tailer.position("sess-1").await, Some(24));
    }
}
