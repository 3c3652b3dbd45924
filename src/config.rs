use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

/// Smallest chunk size the configuration will accept (64 KiB).
const CHUNK_SIZE_MIN_LIMIT: u64 = 64 * 1024;

/// Default maximum size of a single chunk file (50 MB).
const DEFAULT_MAX_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// Default maximum size of a journal before oldest chunks are rotated out (1 TiB).
const DEFAULT_MAX_JOURNAL_SIZE: u64 = 1 << 40;

/// Default period of the size-based rotation loop.
const DEFAULT_ROTATION_PERIOD_SECS: u64 = 300;

/// Default time-to-live for idle cursors in the registry.
const DEFAULT_CURSOR_TTL_SECS: u64 = 300;

/// Default cap on the number of journals one query may select.
const DEFAULT_MAX_CURSOR_SOURCES: usize = 50;

/// Default size of the fill buffer a journal reader works with.
const DEFAULT_READ_BUF_SIZE: usize = 16 * 1024;

/// Default grace period for shutdown of long-running tasks.
const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 5;

/// Position of a record within a journal.
///
/// Chunk ids are strictly increasing within a journal (the first chunk is 1),
/// and the offset is the byte position of the record frame within its chunk
/// file. The derived ordering compares chunk id first, then offset, which is
/// the total order of records in a journal.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RecordId {
    #[serde(rename = "chunkId")]
    pub chunk_id: u32,
    pub offset: i64,
}

impl RecordId {
    /// Sentinel pointing before the first record of any journal.
    pub const MIN: RecordId = RecordId {
        chunk_id: 0,
        offset: 0,
    };

    /// Sentinel pointing after the last record of any journal.
    pub const MAX: RecordId = RecordId {
        chunk_id: u32::MAX,
        offset: i64::MAX,
    };

    #[inline]
    pub const fn new(chunk_id: u32, offset: i64) -> Self {
        Self { chunk_id, offset }
    }
}

impl Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.chunk_id, self.offset)
    }
}

/// Configuration surface of the engine.
///
/// All values are normalized before use, see [`Config::normalized`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory that holds journal shard directories and `tidx.state`.
    pub journals_dir: PathBuf,

    /// Upper bound for a single chunk file. A journal seals the active chunk
    /// and starts a new one when an append would cross this size.
    pub max_chunk_size: u64,

    /// Upper bound for the total size of one journal. The rotation loop
    /// removes oldest chunks while a journal is above this size.
    pub max_journal_size: u64,

    /// Whether a journal with a torn tail record is truncated back to the
    /// last intact record on open. When false such a journal is marked
    /// errored and every operation on it fails fast.
    pub recover_on_error: bool,

    /// How often the rotation loop wakes up to enforce `max_journal_size`.
    pub rotation_period: Duration,

    /// How long an untouched cursor survives in the registry.
    pub cursor_ttl: Duration,

    /// Maximum number of journals a single query may select.
    pub max_cursor_sources: usize,

    /// Size of the fill buffer used by journal readers.
    pub read_buf_size: usize,

    /// Grace period long-running tasks get to observe cancellation.
    pub shutdown_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            journals_dir: PathBuf::from("./data/journals"),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_journal_size: DEFAULT_MAX_JOURNAL_SIZE,
            recover_on_error: true,
            rotation_period: Duration::from_secs(DEFAULT_ROTATION_PERIOD_SECS),
            cursor_ttl: Duration::from_secs(DEFAULT_CURSOR_TTL_SECS),
            max_cursor_sources: DEFAULT_MAX_CURSOR_SOURCES,
            read_buf_size: DEFAULT_READ_BUF_SIZE,
            shutdown_timeout: Duration::from_secs(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
        }
    }
}

impl Config {
    /// Returns a copy of the configuration with every value forced into its
    /// valid range. Zero sizes fall back to defaults, the chunk size is
    /// clamped to its floor, and a journal cap that leaves room for fewer
    /// than two chunks is reported since rotation cannot keep such a journal
    /// under its limit without deleting the active chunk.
    pub fn normalized(mut self) -> Self {
        if self.max_chunk_size == 0 {
            self.max_chunk_size = DEFAULT_MAX_CHUNK_SIZE;
        }
        self.max_chunk_size = self.max_chunk_size.max(CHUNK_SIZE_MIN_LIMIT);

        if self.max_journal_size == 0 {
            self.max_journal_size = DEFAULT_MAX_JOURNAL_SIZE;
        }
        if self.max_journal_size <= 2 * self.max_chunk_size {
            warn!(
                max_journal_size = self.max_journal_size,
                max_chunk_size = self.max_chunk_size,
                "max_journal_size should exceed twice the chunk size, rotation may thrash"
            );
        }

        if self.rotation_period.is_zero() {
            self.rotation_period = Duration::from_secs(DEFAULT_ROTATION_PERIOD_SECS);
        }
        if self.cursor_ttl.is_zero() {
            self.cursor_ttl = Duration::from_secs(DEFAULT_CURSOR_TTL_SECS);
        }
        if self.max_cursor_sources == 0 {
            self.max_cursor_sources = DEFAULT_MAX_CURSOR_SOURCES;
        }
        if self.read_buf_size == 0 {
            self.read_buf_size = DEFAULT_READ_BUF_SIZE;
        }
        self
    }
}
