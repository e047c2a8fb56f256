//! Append-only log for RedVault
//!
//! Durable commands are appended in their wire encoding. Appends only reach
//! the OS page cache; a background task fsyncs the file on a fixed interval.
//! On startup the file is replayed through the command registry, and it can be
//! rewritten into the minimal set of `SET`/`HSET` records describing the
//! current store.

use crate::error::{RedVaultError, Result};
use crate::protocol::{RespReader, Value};
use crate::store::Entry;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Default interval between background fsyncs.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

/// Lifecycle of the log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Opened, replay may run, not yet serving clients
    Loading,
    /// Accepting appends
    Active,
    /// Compaction in progress
    Rewriting,
    /// File handle released
    Closed,
}

struct LogInner {
    file: Option<File>,
    state: LogState,
}

/// Append-only command log backed by a single file
pub struct AppendOnlyLog {
    inner: Mutex<LogInner>,
    path: PathBuf,
}

impl AppendOnlyLog {
    /// Open or create the log file. Does not replay.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = open_for_append(&path)?;

        Ok(Self {
            inner: Mutex::new(LogInner {
                file: Some(file),
                state: LogState::Loading,
            }),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn state(&self) -> LogState {
        self.inner.lock().await.state
    }

    /// Mark the log as serving appends.
    pub async fn activate(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.state == LogState::Closed {
            return Err(RedVaultError::Aof("log is closed".to_string()));
        }
        inner.state = LogState::Active;
        Ok(())
    }

    /// Decode every record from the start of the file and hand it to `apply`.
    ///
    /// Stops cleanly at end of file. A malformed or truncated record aborts
    /// the replay with an error. Returns the number of records applied.
    pub async fn replay<F>(&self, mut apply: F) -> Result<usize>
    where
        F: FnMut(Value),
    {
        let _guard = self.inner.lock().await;

        let file = tokio::fs::File::open(&self.path).await?;
        let mut reader = RespReader::new(tokio::io::BufReader::new(file));
        let mut applied = 0;

        while let Some(record) = reader.read_value().await? {
            if !matches!(record, Value::Array(_)) {
                return Err(RedVaultError::Aof(format!(
                    "record {} is not a command array",
                    applied + 1
                )));
            }
            apply(record);
            applied += 1;
        }

        debug!(path = %self.path.display(), records = applied, "replayed append-only log");
        Ok(applied)
    }

    /// Append one command record. Not fsynced; see [`AppendOnlyLog::flush`].
    pub async fn append(&self, command: &Value) -> Result<()> {
        let bytes = command.to_bytes();
        let mut inner = self.inner.lock().await;
        let file = inner
            .file
            .as_mut()
            .ok_or_else(|| RedVaultError::Aof("log is closed".to_string()))?;
        write_record(file, &bytes)
    }

    /// Append `command` and run `apply` while still holding the log lock, so
    /// the order of records in the file matches the order in which their
    /// effects hit the store. `apply` runs even if the write fails.
    pub async fn append_with<T, F>(&self, command: &Value, apply: F) -> (Result<()>, T)
    where
        F: FnOnce() -> T,
    {
        let bytes = command.to_bytes();
        let mut inner = self.inner.lock().await;
        let written = match inner.file.as_mut() {
            Some(file) => write_record(file, &bytes),
            None => Err(RedVaultError::Aof("log is closed".to_string())),
        };
        let output = apply();
        (written, output)
    }

    /// Force buffered writes to stable storage.
    pub async fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        if let Some(file) = inner.file.as_ref() {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Replace the log with one record per string key and one `HSET` record
    /// per hash field of the store.
    ///
    /// `snapshot` is called once the log lock is held, so no append can slip
    /// between the snapshot and the rewrite. The new content is written and
    /// fsynced to a sibling temp file before it is renamed over the log, so a
    /// crash at any point leaves a loadable log. Returns the number of records
    /// written.
    pub async fn compact<F>(&self, snapshot: F) -> Result<usize>
    where
        F: FnOnce() -> Vec<Entry>,
    {
        let mut inner = self.inner.lock().await;
        if inner.state == LogState::Closed {
            return Err(RedVaultError::Aof("log is closed".to_string()));
        }

        let previous = inner.state;
        inner.state = LogState::Rewriting;

        let entries = snapshot();
        let temp_path = self.rewrite_path();
        let result = write_snapshot(&temp_path, &entries).and_then(|written| {
            fs::rename(&temp_path, &self.path)?;
            sync_parent_dir(&self.path);
            Ok(written)
        });

        let written = match result {
            Ok(written) => written,
            Err(e) => {
                let _ = fs::remove_file(&temp_path);
                inner.state = previous;
                return Err(e);
            }
        };

        if let Err(e) = reopen(&mut inner, &self.path) {
            inner.state = previous;
            return Err(e);
        }
        inner.state = if previous == LogState::Loading {
            LogState::Loading
        } else {
            LogState::Active
        };

        info!(path = %self.path.display(), records = written, "compacted append-only log");
        Ok(written)
    }

    /// Flush and release the file handle. Closing twice is a no-op.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(file) = inner.file.take() {
            file.sync_all()?;
        }
        inner.state = LogState::Closed;
        Ok(())
    }

    fn rewrite_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".rewrite");
        PathBuf::from(name)
    }
}

fn open_for_append(path: &Path) -> Result<File> {
    Ok(OpenOptions::new().create(true).append(true).open(path)?)
}

// The old handle points at the replaced file. If the new one cannot be
// opened, appends must fail instead of landing in the unlinked file.
fn reopen(inner: &mut LogInner, path: &Path) -> Result<()> {
    inner.file = None;
    inner.file = Some(open_for_append(path)?);
    Ok(())
}

/// A log file that can be cut back to an earlier length.
trait RecordSink: Write {
    fn end(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

impl RecordSink for File {
    fn end(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write one whole record. A write that fails partway is cut back off so
/// the file never ends in a torn record.
fn write_record<S: RecordSink>(sink: &mut S, bytes: &[u8]) -> Result<()> {
    let start = sink.end()?;
    if let Err(e) = sink.write_all(bytes) {
        if let Err(cut) = sink.truncate(start) {
            error!(error = %cut, "failed to remove partial record from log");
        }
        return Err(e.into());
    }
    Ok(())
}

/// Records reconstructing `snapshot`, in snapshot order.
pub fn snapshot_records(snapshot: &[Entry]) -> Vec<Value> {
    let mut records = Vec::new();
    for entry in snapshot {
        match entry {
            Entry::String { key, value } => {
                records.push(Value::command(&["SET", key.as_str(), value.as_str()]));
            }
            Entry::Hash { name, fields } => {
                for (field, value) in fields {
                    records.push(Value::command(&["HSET", name.as_str(), field.as_str(), value.as_str()]));
                }
            }
        }
    }
    records
}

fn write_snapshot(temp_path: &Path, snapshot: &[Entry]) -> Result<usize> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(temp_path)?;
    let mut writer = BufWriter::new(file);

    let records = snapshot_records(snapshot);
    for record in &records {
        writer.write_all(&record.to_bytes())?;
    }

    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(records.len())
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        warn!(dir = %parent.display(), error = %e, "failed to fsync log directory");
    }
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) {}

/// Handle to the periodic fsync task
pub struct FlushTask {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl FlushTask {
    /// Start fsyncing `log` every `period`.
    pub fn spawn(log: Arc<AppendOnlyLog>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            info!(interval_secs = period.as_secs(), "background flush started");
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = log.flush().await {
                            error!(error = %e, "failed to flush append-only log");
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
            debug!("background flush stopped");
        });

        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    /// Stop the task and wait for it to exit.
    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        if let Err(e) = self.handle.await {
            warn!(error = %e, "background flush task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, Store};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn log_path(dir: &TempDir) -> PathBuf {
        dir.path().join("test.aof")
    }

    async fn collect(log: &AppendOnlyLog) -> Vec<Value> {
        let mut records = Vec::new();
        log.replay(|record| records.push(record)).await.unwrap();
        records
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let log = AppendOnlyLog::open(log_path(&dir)).unwrap();
        assert_eq!(log.state().await, LogState::Loading);

        let cmd1 = Value::command(&["SET", "key1", "value1"]);
        let cmd2 = Value::command(&["HSET", "h", "f", "v"]);
        log.append(&cmd1).await.unwrap();
        log.append(&cmd2).await.unwrap();

        assert_eq!(collect(&log).await, vec![cmd1.clone(), cmd2]);

        let bytes = fs::read(log_path(&dir)).unwrap();
        assert!(bytes.starts_with(&cmd1.to_bytes()));
    }

    #[tokio::test]
    async fn test_replay_empty_file() {
        let dir = TempDir::new().unwrap();
        let log = AppendOnlyLog::open(log_path(&dir)).unwrap();
        assert!(collect(&log).await.is_empty());
    }

    #[tokio::test]
    async fn test_replay_truncated_record_fails() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let mut bytes = Value::command(&["SET", "a", "1"]).to_bytes();
        bytes.extend_from_slice(b"*3\r\n$3\r\nSET\r\n$1\r\nb");
        fs::write(&path, bytes).unwrap();

        let log = AppendOnlyLog::open(&path).unwrap();
        let mut applied = 0;
        let result = log.replay(|_| applied += 1).await;
        assert!(matches!(result, Err(RedVaultError::Protocol(_))));
        assert_eq!(applied, 1);
    }

    #[tokio::test]
    async fn test_replay_rejects_non_array_record() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        fs::write(&path, b"+OK\r\n").unwrap();

        let log = AppendOnlyLog::open(&path).unwrap();
        assert!(matches!(log.replay(|_| {}).await, Err(RedVaultError::Aof(_))));
    }

    #[tokio::test]
    async fn test_compact_writes_set_and_hset_records() {
        let dir = TempDir::new().unwrap();
        let log = AppendOnlyLog::open(log_path(&dir)).unwrap();
        log.activate().await.unwrap();

        for i in 0..10 {
            log.append(&Value::command(&["SET", "k", i.to_string().as_str()])).await.unwrap();
        }

        let mut fields = BTreeMap::new();
        fields.insert("f1".to_string(), "v1".to_string());
        fields.insert("f2".to_string(), "v2".to_string());
        let snapshot = vec![
            Entry::String { key: "k".to_string(), value: "9".to_string() },
            Entry::Hash { name: "h".to_string(), fields },
        ];

        assert_eq!(log.compact(|| snapshot).await.unwrap(), 3);
        assert_eq!(log.state().await, LogState::Active);
        assert_eq!(
            collect(&log).await,
            vec![
                Value::command(&["SET", "k", "9"]),
                Value::command(&["HSET", "h", "f1", "v1"]),
                Value::command(&["HSET", "h", "f2", "v2"]),
            ]
        );

        // Appends after compaction land in the new file.
        log.append(&Value::command(&["DEL", "k"])).await.unwrap();
        assert_eq!(collect(&log).await.len(), 4);
        assert!(!log.rewrite_path().exists());
    }

    #[tokio::test]
    async fn test_compaction_reproduces_store() {
        let dir = TempDir::new().unwrap();
        let store = MemoryStore::new();
        store.set("a".to_string(), "1".to_string());
        store.set("b".to_string(), "2".to_string());
        store.hset("h".to_string(), "x".to_string(), "10".to_string());
        store.hset("h".to_string(), "y".to_string(), "20".to_string());
        store.delete(&["b".to_string()]);

        let log = AppendOnlyLog::open(log_path(&dir)).unwrap();
        log.compact(|| store.snapshot()).await.unwrap();

        let reloaded = MemoryStore::new();
        log.replay(|record| {
            let Value::Array(items) = record else { return };
            let parts: Vec<String> = items
                .iter()
                .filter_map(|v| v.as_bulk().map(str::to_owned))
                .collect();
            match parts[0].as_str() {
                "SET" => reloaded.set(parts[1].clone(), parts[2].clone()),
                "HSET" => reloaded.hset(parts[1].clone(), parts[2].clone(), parts[3].clone()),
                other => panic!("unexpected record {}", other),
            }
        })
        .await
        .unwrap();

        assert_eq!(reloaded.keys("*"), store.keys("*"));
        assert_eq!(reloaded.get("a"), Some("1".to_string()));
        assert_eq!(reloaded.get("b"), None);
        assert_eq!(reloaded.hget("h", "y"), Some("20".to_string()));
    }

    #[tokio::test]
    async fn test_failed_compaction_keeps_old_log() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let log = AppendOnlyLog::open(&path).unwrap();
        log.activate().await.unwrap();
        log.append(&Value::command(&["SET", "a", "1"])).await.unwrap();

        // A directory in the temp file's place makes the rewrite fail.
        fs::create_dir(log.rewrite_path()).unwrap();
        let snapshot = vec![Entry::String { key: "b".to_string(), value: "2".to_string() }];
        assert!(log.compact(|| snapshot).await.is_err());
        assert_eq!(log.state().await, LogState::Active);

        log.append(&Value::command(&["SET", "c", "3"])).await.unwrap();
        assert_eq!(
            collect(&log).await,
            vec![Value::command(&["SET", "a", "1"]), Value::command(&["SET", "c", "3"])]
        );
    }

    #[tokio::test]
    async fn test_failed_reopen_drops_stale_handle() {
        let dir = TempDir::new().unwrap();
        let log = AppendOnlyLog::open(log_path(&dir)).unwrap();
        log.activate().await.unwrap();

        {
            let mut inner = log.inner.lock().await;
            // A directory cannot be opened for append.
            assert!(reopen(&mut inner, dir.path()).is_err());
            assert!(inner.file.is_none());
        }

        assert!(log.append(&Value::command(&["SET", "a", "1"])).await.is_err());
        let (written, applied) = log
            .append_with(&Value::command(&["SET", "b", "2"]), || true)
            .await;
        assert!(written.is_err());
        assert!(applied);
    }

    /// Accepts `budget` bytes, then fails every write.
    struct ShortWrite {
        file: File,
        budget: usize,
    }

    impl Write for ShortWrite {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            let n = buf.len().min(self.budget);
            let n = self.file.write(&buf[..n])?;
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.file.flush()
        }
    }

    impl RecordSink for ShortWrite {
        fn end(&self) -> io::Result<u64> {
            self.file.end()
        }

        fn truncate(&mut self, len: u64) -> io::Result<()> {
            self.file.truncate(len)
        }
    }

    #[tokio::test]
    async fn test_partial_write_is_cut_from_log() {
        let dir = TempDir::new().unwrap();
        let path = log_path(&dir);
        let log = AppendOnlyLog::open(&path).unwrap();
        let first = Value::command(&["SET", "a", "1"]);
        log.append(&first).await.unwrap();

        let mut sink = ShortWrite {
            file: open_for_append(&path).unwrap(),
            budget: 7,
        };
        let torn = Value::command(&["SET", "b", "2"]);
        assert!(write_record(&mut sink, &torn.to_bytes()).is_err());
        assert_eq!(fs::metadata(&path).unwrap().len(), first.to_bytes().len() as u64);

        // The log stays replayable and later appends follow the last whole record.
        let next = Value::command(&["SET", "c", "3"]);
        log.append(&next).await.unwrap();
        assert_eq!(collect(&log).await, vec![first, next]);
    }

    #[tokio::test]
    async fn test_append_with_applies_even_when_closed() {
        let dir = TempDir::new().unwrap();
        let log = AppendOnlyLog::open(log_path(&dir)).unwrap();
        let store = MemoryStore::new();

        let (written, _) = log
            .append_with(&Value::command(&["SET", "a", "1"]), || {
                store.set("a".to_string(), "1".to_string())
            })
            .await;
        assert!(written.is_ok());

        log.close().await.unwrap();
        let (written, _) = log
            .append_with(&Value::command(&["SET", "b", "2"]), || {
                store.set("b".to_string(), "2".to_string())
            })
            .await;
        assert!(written.is_err());
        assert_eq!(store.get("b"), Some("2".to_string()));

        let reopened = AppendOnlyLog::open(log_path(&dir)).unwrap();
        assert_eq!(collect(&reopened).await, vec![Value::command(&["SET", "a", "1"])]);
    }

    #[tokio::test]
    async fn test_close() {
        let dir = TempDir::new().unwrap();
        let log = AppendOnlyLog::open(log_path(&dir)).unwrap();
        log.append(&Value::command(&["SET", "a", "1"])).await.unwrap();
        log.flush().await.unwrap();

        log.close().await.unwrap();
        log.close().await.unwrap();
        assert_eq!(log.state().await, LogState::Closed);
        assert!(log.append(&Value::command(&["SET", "b", "2"])).await.is_err());
        assert!(log.compact(Vec::new).await.is_err());

        let reopened = AppendOnlyLog::open(log_path(&dir)).unwrap();
        assert_eq!(collect(&reopened).await.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_task_stops() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(AppendOnlyLog::open(log_path(&dir)).unwrap());
        let task = FlushTask::spawn(Arc::clone(&log), Duration::from_millis(10));

        log.append(&Value::command(&["SET", "a", "1"])).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop().await;

        assert_eq!(collect(&log).await.len(), 1);
    }
}
