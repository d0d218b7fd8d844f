//! # Configuration
//!
//! Plain structs with `Default` impls. Every knob has a `DEFAULT_*` constant so
//! tests and callers can refer to the stock value without constructing a
//! config first.
//!
//! [`HostConfig::from_env`] layers a handful of `REPOHOST_*` environment
//! overrides on top of the defaults; everything else is set in code.

use std::time::Duration;

use tracing::warn;

// =============================================================================
// Defaults
// =============================================================================

/// Group-commit window of the writer actor.
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_millis(5);

/// Requests drained from the writer queue per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 1000;

/// Maximum writes in one `applyWrites` batch.
pub const MAX_WRITES_PER_BATCH: usize = 200;

/// How long a write waits for its repository before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Largest canonical record encoding accepted.
pub const DEFAULT_MAX_RECORD_BYTES: usize = 1024 * 1024;

/// Live events buffered per subscriber before it is considered too slow.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 10_000;

/// Events read from storage per backfill round trip.
pub const DEFAULT_BACKFILL_PAGE_SIZE: usize = 500;

/// Frames queued between a subscriber's producer task and its consumer.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// Pending account-root updates before new ones are dropped.
pub const DEFAULT_ROOT_QUEUE_SIZE: usize = 1024;

/// Entries kept in the account-root cache.
pub const DEFAULT_ROOT_CACHE_CAPACITY: usize = 10_000;

/// Repositories whose head and record index stay cached between writes.
pub const DEFAULT_REPO_CACHE_CAPACITY: usize = 1024;

/// Age after which a cached account root is re-read from storage.
pub const DEFAULT_ROOT_CACHE_TTL: Duration = Duration::from_secs(60);

/// Upper bound on reader threads when the count is derived from the machine.
const MAX_DEFAULT_READER_THREADS: usize = 8;

// =============================================================================
// Writer
// =============================================================================

/// Configuration for the writer actor.
///
/// # Systems Concept: Group Commit
///
/// Requests arriving within `batch_timeout` of each other are executed in one
/// SQLite transaction, so one fsync covers many commits.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// How long to wait for more requests before committing a batch.
    pub batch_timeout: Duration,
    /// Maximum requests per batch.
    pub batch_max_size: usize,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            batch_max_size: DEFAULT_BATCH_MAX_SIZE,
        }
    }
}

// =============================================================================
// Outbox
// =============================================================================

/// Configuration for subscribers.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Capacity of the live broadcast ring. A subscriber more than this many
    /// events behind the live tail is disconnected.
    pub broadcast_capacity: usize,
    /// Events per backfill page.
    pub backfill_page_size: usize,
    /// Frames buffered per subscriber between producer and consumer.
    pub subscriber_buffer: usize,
    /// When set, cursors older than this window are moved forward to the start
    /// of the window and the subscriber is told with an `OutdatedCursor` frame.
    pub backfill_window: Option<Duration>,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
            backfill_page_size: DEFAULT_BACKFILL_PAGE_SIZE,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
            backfill_window: None,
        }
    }
}

// =============================================================================
// Account Root Updater
// =============================================================================

/// Configuration for the best-effort account root updater.
#[derive(Debug, Clone)]
pub struct RootUpdaterConfig {
    pub queue_size: usize,
    pub cache_capacity: usize,
    pub cache_ttl: Duration,
}

impl Default for RootUpdaterConfig {
    fn default() -> Self {
        Self {
            queue_size: DEFAULT_ROOT_QUEUE_SIZE,
            cache_capacity: DEFAULT_ROOT_CACHE_CAPACITY,
            cache_ttl: DEFAULT_ROOT_CACHE_TTL,
        }
    }
}

// =============================================================================
// Host
// =============================================================================

/// Top-level configuration passed to [`RepoHost::open`](crate::RepoHost::open).
#[derive(Debug, Clone)]
pub struct HostConfig {
    pub writer: WriterConfig,
    pub outbox: OutboxConfig,
    pub root_updater: RootUpdaterConfig,
    /// Maximum writes per batch; larger batches fail with `TooManyWrites`.
    pub max_writes_per_batch: usize,
    /// Deadline for acquiring a repository before a write gives up.
    pub lock_timeout: Duration,
    /// Number of reader threads (each holds one read-only connection).
    pub reader_threads: usize,
    /// Largest accepted canonical record size in bytes.
    pub max_record_bytes: usize,
    /// Repositories whose committed snapshot is kept in memory between writes.
    pub repo_cache_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        let reader_threads = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4)
            .min(MAX_DEFAULT_READER_THREADS);

        Self {
            writer: WriterConfig::default(),
            outbox: OutboxConfig::default(),
            root_updater: RootUpdaterConfig::default(),
            max_writes_per_batch: MAX_WRITES_PER_BATCH,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            reader_threads,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            repo_cache_capacity: DEFAULT_REPO_CACHE_CAPACITY,
        }
    }
}

impl HostConfig {
    /// Environment variable overriding the writer's group-commit window (ms).
    pub const BATCH_TIMEOUT_ENV: &'static str = "REPOHOST_BATCH_TIMEOUT_MS";
    /// Environment variable overriding the per-batch write limit.
    pub const MAX_WRITES_ENV: &'static str = "REPOHOST_MAX_WRITES";
    /// Environment variable overriding the repository lock deadline (ms).
    pub const LOCK_TIMEOUT_ENV: &'static str = "REPOHOST_LOCK_TIMEOUT_MS";
    /// Environment variable overriding the reader thread count.
    pub const READER_THREADS_ENV: &'static str = "REPOHOST_READER_THREADS";
    /// Environment variable enabling the backfill window (seconds).
    pub const BACKFILL_WINDOW_ENV: &'static str = "REPOHOST_BACKFILL_WINDOW_SECS";

    /// Returns the defaults with any `REPOHOST_*` overrides applied.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads from an arbitrary source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let read = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse::<u64>() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!(key, value = %raw, "ignoring unparsable configuration override");
                    None
                }
            }
        };

        if let Some(ms) = read(Self::BATCH_TIMEOUT_ENV) {
            config.writer.batch_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = read(Self::MAX_WRITES_ENV) {
            config.max_writes_per_batch = n as usize;
        }
        if let Some(ms) = read(Self::LOCK_TIMEOUT_ENV) {
            config.lock_timeout = Duration::from_millis(ms);
        }
        if let Some(n) = read(Self::READER_THREADS_ENV) {
            config.reader_threads = (n as usize).max(1);
        }
        if let Some(secs) = read(Self::BACKFILL_WINDOW_ENV) {
            config.outbox.backfill_window = Some(Duration::from_secs(secs));
        }
        config
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_defaults() {
        let config = HostConfig::default();
        assert_eq!(config.max_writes_per_batch, 200);
        assert_eq!(config.writer.batch_timeout, DEFAULT_BATCH_TIMEOUT);
        assert!(config.reader_threads >= 1 && config.reader_threads <= 8);
        assert!(config.outbox.backfill_window.is_none());
    }

    #[test]
    fn test_overrides_applied() {
        let env: HashMap<&str, &str> = [
            (HostConfig::BATCH_TIMEOUT_ENV, "2"),
            (HostConfig::MAX_WRITES_ENV, "50"),
            (HostConfig::READER_THREADS_ENV, "0"),
            (HostConfig::BACKFILL_WINDOW_ENV, "3600"),
        ]
        .into_iter()
        .collect();

        let config = HostConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.writer.batch_timeout, Duration::from_millis(2));
        assert_eq!(config.max_writes_per_batch, 50);
        assert_eq!(config.reader_threads, 1);
        assert_eq!(config.outbox.backfill_window, Some(Duration::from_secs(3600)));
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }

    #[test]
    fn test_unparsable_override_ignored() {
        let config = HostConfig::from_lookup(|k| {
            (k == HostConfig::LOCK_TIMEOUT_ENV).then(|| "soon".to_string())
        });
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
    }
}
