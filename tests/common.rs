#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use repohost::{
    CreateRecordInput, Database, Did, FirehoseSubscription, Frame, HostConfig, MemoryKeystore,
    PutRecordInput, RepoHost, SequencedEvent, WriterConfig,
};
use rusqlite::{Connection, OpenFlags};
use serde_json::{json, Value};

pub const POST: &str = "app.example.post";

pub fn create_temp_db_file(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    let _ = Database::open(&path).expect("initialize database");
    (dir, path)
}

pub fn open_read_only(path: &Path) -> Connection {
    Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .expect("open read-only connection")
}

pub fn open_read_write(path: &Path) -> Connection {
    Connection::open(path).expect("open read-write connection")
}

pub async fn eventually<T>(
    timeout: Duration,
    interval: Duration,
    mut f: impl FnMut() -> Option<T>,
) -> T {
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f() {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

pub fn writer_config_with_batch_timeout(batch_timeout: Duration) -> WriterConfig {
    WriterConfig {
        batch_timeout,
        ..WriterConfig::default()
    }
}

/// Host config with a short group-commit window and a small reader pool.
pub fn test_config() -> HostConfig {
    HostConfig {
        writer: writer_config_with_batch_timeout(Duration::from_millis(1)),
        reader_threads: 2,
        ..HostConfig::default()
    }
}

/// A host on a temp database. Keep the `TempDir` alive for the test.
pub struct TestHost {
    pub host: RepoHost,
    pub keystore: Arc<MemoryKeystore>,
    pub path: PathBuf,
    pub dir: tempfile::TempDir,
}

impl TestHost {
    pub async fn start() -> Self {
        Self::start_with(test_config()).await
    }

    pub async fn start_with(config: HostConfig) -> Self {
        let (dir, path) = create_temp_db_file("host.db");
        let keystore = Arc::new(MemoryKeystore::new());
        let host = RepoHost::open(&path, keystore.clone(), config)
            .await
            .expect("open host");
        Self {
            host,
            keystore,
            path,
            dir,
        }
    }

    /// Shuts the host down and opens a new one on the same file and keys.
    pub async fn restart(self) -> Self {
        self.restart_with(test_config()).await
    }

    pub async fn restart_with(self, config: HostConfig) -> Self {
        self.host.shutdown().await;
        let host = RepoHost::open(&self.path, self.keystore.clone(), config)
            .await
            .expect("reopen host");
        Self { host, ..self }
    }
}

pub fn did(name: &str) -> Did {
    Did::parse(format!("did:example:{name}")).expect("valid did")
}

pub fn post(text: &str) -> Value {
    json!({ "text": text })
}

pub fn create_input(repo: &Did, rkey: Option<&str>, record: Value) -> CreateRecordInput {
    CreateRecordInput {
        repo: repo.clone(),
        collection: POST.to_string(),
        rkey: rkey.map(str::to_string),
        record,
        swap_commit: None,
        validate: None,
    }
}

pub fn put_input(repo: &Did, rkey: &str, record: Value) -> PutRecordInput {
    PutRecordInput {
        repo: repo.clone(),
        collection: POST.to_string(),
        rkey: rkey.to_string(),
        record,
        swap_commit: None,
        swap_record: None,
        validate: None,
    }
}

/// Next event frame, skipping info frames. Panics after one second.
pub async fn next_event(subscription: &mut FirehoseSubscription) -> Arc<SequencedEvent> {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(1), subscription.next_frame())
            .await
            .expect("timed out waiting for frame")
            .expect("subscription ended")
            .expect("subscription failed");
        if let Frame::Event(event) = frame {
            return event;
        }
    }
}

/// Asserts nothing arrives within `wait`.
pub async fn assert_quiet(subscription: &mut FirehoseSubscription, wait: Duration) {
    if let Ok(Some(frame)) = tokio::time::timeout(wait, subscription.next_frame()).await {
        panic!("unexpected frame: {frame:?}");
    }
}

/// Sequence numbers stored in the log, ascending.
pub fn stored_seqs(path: &Path) -> Vec<u64> {
    let conn = open_read_only(path);
    let mut stmt = conn
        .prepare("SELECT seq FROM repo_seq ORDER BY seq")
        .expect("prepare");
    stmt.query_map([], |row| row.get::<_, i64>(0))
        .expect("query")
        .map(|r| r.expect("row") as u64)
        .collect()
}
