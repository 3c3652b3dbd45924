use std::collections::BTreeMap;
use std::fmt::{self, Display};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::codec::LogEvent;
use crate::config::Config;
use crate::cursor::{Cursor, CursorSettings};
use crate::error::{Error, Result};
use crate::index::TagIndex;
use crate::kql::{Formatter, Query};
use crate::pool::BufPool;
use crate::tags::TagLine;
use crate::wire::{validate_source_id, WritePacket};

use super::iterator::JournalIterator;
use super::journal::Journal;
use super::reader::JournalReader;

/// How many times a write is retried against a journal that went into an
/// error state and was re-opened.
const WRITE_RETRIES: usize = 2;

/// Descriptive snapshot of one journal.
#[derive(Debug, Clone)]
pub struct JournalInfo {
    pub created: SystemTime,
    pub modified: SystemTime,
    pub size: u64,
    pub path: PathBuf,
    pub chunks: usize,
    pub tags: Vec<TagLine>,
}

/// Outcome of one size-based truncation.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncateResult {
    pub size_before: u64,
    pub size_after: u64,
    pub chunks_removed: usize,
}

impl Display for TruncateResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{before: {} B, after: {} B, chunks removed: {}}}",
            self.size_before, self.size_after, self.chunks_removed
        )
    }
}

struct JournalSlot {
    jid: String,
    dir: PathBuf,
    cell: OnceCell<Arc<Journal>>,
}

struct Inner {
    cfg: Config,
    index: Arc<TagIndex>,
    pool: Arc<BufPool>,
    slots: Mutex<BTreeMap<String, Arc<JournalSlot>>>,
    shutdown: CancellationToken,
    closed: AtomicBool,
}

/// Owns the set of journals: opens them lazily, routes writes, serves
/// readers and keeps every journal under its size cap.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<Inner>,
}

impl Controller {
    /// Creates the controller and registers every journal found under the
    /// base directory. Nothing is opened yet; journals open on first use
    /// or during the index synchronization pass.
    pub fn new(cfg: Config, index: Arc<TagIndex>) -> Result<Controller> {
        let cfg = cfg.normalized();
        std::fs::create_dir_all(&cfg.journals_dir)?;
        info!(
            dir = %cfg.journals_dir.display(),
            max_chunk_size = cfg.max_chunk_size,
            max_journal_size = cfg.max_journal_size,
            "journal controller starting"
        );

        let pool = Arc::new(BufPool::new(cfg.read_buf_size, 64));
        let ctrl = Controller {
            inner: Arc::new(Inner {
                cfg,
                index,
                pool,
                slots: Mutex::new(BTreeMap::new()),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        };

        let found = scan_for_journals(&ctrl.inner.cfg.journals_dir)?;
        info!(count = found.len(), "journals found by the startup scan");
        {
            let mut slots = ctrl.inner.slots.lock();
            for jid in found {
                let dir = journal_dir(&ctrl.inner.cfg.journals_dir, &jid);
                slots.insert(
                    jid.clone(),
                    Arc::new(JournalSlot {
                        jid,
                        dir,
                        cell: OnceCell::new(),
                    }),
                );
            }
        }
        Ok(ctrl)
    }

    pub fn config(&self) -> &Config {
        &self.inner.cfg
    }

    pub fn index(&self) -> &Arc<TagIndex> {
        &self.inner.index
    }

    pub(crate) fn pool(&self) -> &Arc<BufPool> {
        &self.inner.pool
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    fn fail_if_closed(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    /// Ids of every known journal, sorted.
    pub fn journal_list(&self) -> Vec<String> {
        self.inner.slots.lock().keys().cloned().collect()
    }

    fn slot(&self, jid: &str, create: bool) -> Result<Arc<JournalSlot>> {
        let mut slots = self.inner.slots.lock();
        if let Some(slot) = slots.get(jid) {
            return Ok(slot.clone());
        }
        if !create {
            return Err(Error::not_found(format!("journal '{jid}'")));
        }
        validate_source_id(jid)?;
        let slot = Arc::new(JournalSlot {
            jid: jid.to_string(),
            dir: journal_dir(&self.inner.cfg.journals_dir, jid),
            cell: OnceCell::new(),
        });
        slots.insert(jid.to_string(), slot.clone());
        Ok(slot)
    }

    /// The journal behind a slot, opened on first use. Callers racing the
    /// open wait on the same cell.
    async fn journal_for_slot(&self, slot: &Arc<JournalSlot>) -> Result<Arc<Journal>> {
        let cfg = &self.inner.cfg;
        let journal = slot
            .cell
            .get_or_try_init(|| {
                let jid = slot.jid.clone();
                let dir = slot.dir.clone();
                let max_chunk = cfg.max_chunk_size;
                let recover = cfg.recover_on_error;
                async move {
                    tokio::task::spawn_blocking(move || {
                        Journal::open(&dir, &jid, max_chunk, recover).map(Arc::new)
                    })
                    .await
                    .map_err(|err| Error::conflict(format!("journal open task failed: {err}")))?
                }
            })
            .await?;
        Ok(journal.clone())
    }

    pub async fn journal(&self, jid: &str) -> Result<Arc<Journal>> {
        self.fail_if_closed()?;
        let slot = self.slot(jid, false)?;
        self.journal_for_slot(&slot).await
    }

    async fn journal_or_create(&self, jid: &str) -> Result<Arc<Journal>> {
        self.fail_if_closed()?;
        let slot = self.slot(jid, true)?;
        self.journal_for_slot(&slot).await
    }

    /// Drops the slot of an errored journal so the next access re-opens
    /// it from disk.
    fn reset_slot(&self, jid: &str) {
        let removed = self.inner.slots.lock().remove(jid);
        if let Some(slot) = removed {
            if let Some(journal) = slot.cell.get() {
                let _ = journal.close();
            }
            warn!(journal = jid, "journal slot reset after an error");
        }
    }

    /// Writes a packet: resolves the journal, assigns the tag group,
    /// stamps every record, appends, and reports the written positions to
    /// the tag index. A failed append leaves the index untouched; the
    /// synchronizer re-derives its state from the chunks on restart.
    pub async fn write(&self, packet: &mut WritePacket) -> Result<()> {
        let jid = packet.source_id().to_string();
        let mut attempt = 0;
        loop {
            let journal = self.journal_or_create(&jid).await?;
            if journal.is_errored() && attempt < WRITE_RETRIES {
                attempt += 1;
                self.reset_slot(&jid);
                continue;
            }

            let tags = self.inner.index.upsert_tags(packet.tag_line())?;
            for rec in packet.records_mut() {
                LogEvent::stamp_tgid(rec, tags.gid())?;
            }

            let refs: Vec<&[u8]> = packet.records().iter().map(|r| &r[..]).collect();
            match journal.append(&refs) {
                Ok(touched) => {
                    for rid in &touched {
                        self.inner.index.on_records(tags.gid(), &jid, *rid)?;
                        journal.note_chunk_write(packet.tag_line(), *rid);
                    }
                    return Ok(());
                }
                // no retry here: part of the batch may already be on disk
                // and the synchronizer reconciles the index from the chunks
                Err(Error::Conflict(msg)) if attempt < WRITE_RETRIES => {
                    attempt += 1;
                    self.reset_slot(&jid);
                    debug!(journal = %jid, attempt, %msg, "retrying write on an errored journal");
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn journal_info(&self, jid: &str) -> Result<JournalInfo> {
        let journal = self.journal(jid).await?;
        Ok(JournalInfo {
            created: journal.created_at(),
            modified: journal.modified_at(),
            size: journal.size(),
            path: journal.dir().to_path_buf(),
            chunks: journal.chunk_count(),
            tags: journal.known_tags(),
        })
    }

    /// A positioned reader over the journal. Like the write path, reading
    /// a journal that does not exist yet creates it empty, so a cursor
    /// can tail a source before its first record arrives.
    pub async fn reader(&self, jid: &str) -> Result<JournalReader> {
        let journal = self.journal_or_create(jid).await?;
        Ok(JournalReader::new(journal, self.inner.pool.clone()))
    }

    /// Removes oldest chunks until the journal fits `max_size`, keeping
    /// the tag index in sync.
    pub async fn truncate(&self, jid: &str, max_size: u64) -> Result<TruncateResult> {
        if max_size == 0 {
            return Err(Error::invalid_input("max_size must be positive"));
        }
        let journal = self.journal(jid).await?;
        let mut res = TruncateResult {
            size_before: journal.size(),
            size_after: journal.size(),
            chunks_removed: 0,
        };
        while res.size_after > max_size {
            match journal.truncate_oldest()? {
                Some(chunk_id) => {
                    self.inner.index.on_delete(jid, chunk_id);
                    res.chunks_removed += 1;
                    res.size_after = journal.size();
                }
                None => break,
            }
        }
        if res.chunks_removed > 0 {
            info!(journal = jid, result = %res, "journal truncated");
        } else {
            debug!(journal = jid, result = %res, "journal truncation was a no-op");
        }
        Ok(res)
    }

    /// Spawns the rotation loop enforcing the configured journal size cap
    /// until shutdown.
    pub fn start_rotation(&self) {
        let ctrl = self.clone();
        let period = ctrl.inner.cfg.rotation_period;
        tokio::spawn(async move {
            info!("rotation loop running");
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = ctrl.inner.shutdown.cancelled() => {
                        info!("rotation loop done");
                        return;
                    }
                }
                ctrl.rotate_once().await;
            }
        });
    }

    async fn rotate_once(&self) {
        let max = self.inner.cfg.max_journal_size;
        let mut removed = 0usize;
        let mut affected = 0usize;
        let mut before = 0u64;
        let mut after = 0u64;
        let jids = self.journal_list();
        for jid in &jids {
            match self.truncate(jid, max).await {
                Ok(res) => {
                    removed += res.chunks_removed;
                    before += res.size_before;
                    after += res.size_after;
                    if res.chunks_removed > 0 {
                        affected += 1;
                    }
                }
                Err(err) => warn!(journal = %jid, %err, "rotation could not truncate journal"),
            }
        }
        if removed == 0 {
            info!(journals = jids.len(), total_size = before, "no data rotation needed");
        } else {
            info!(
                journals = jids.len(),
                affected,
                chunks_removed = removed,
                bytes_removed = before - after,
                "data rotation finished"
            );
        }
    }

    /// Builds a cursor over the given source journals.
    pub async fn new_cursor(&self, settings: CursorSettings) -> Result<Cursor> {
        self.fail_if_closed()?;
        if settings.sources.len() > self.inner.cfg.max_cursor_sources {
            return Err(Error::TooManySources {
                selected: settings.sources.len(),
                limit: self.inner.cfg.max_cursor_sources,
            });
        }
        let mut iterators = Vec::with_capacity(settings.sources.len());
        for jid in &settings.sources {
            let reader = self.reader(jid).await?;
            iterators.push(JournalIterator::new(jid.clone(), reader));
        }
        Cursor::build(
            settings.id,
            iterators,
            settings.formatter,
            self.inner.index.clone(),
        )
    }

    /// Builds a cursor for a compiled query and applies the query to it.
    pub async fn cursor_for_query(&self, id: &str, query: &Arc<Query>) -> Result<Cursor> {
        query.check_source_limit(self.inner.cfg.max_cursor_sources)?;
        if query.sources().is_empty() {
            return Err(Error::not_found(
                "no journals match the query".to_string(),
            ));
        }
        let formatter = match query.format() {
            Some(template) => Some(Formatter::compile(template)?),
            None => None,
        };
        let mut cursor = self
            .new_cursor(CursorSettings {
                id: id.to_string(),
                sources: query.sources().to_vec(),
                formatter,
            })
            .await?;
        cursor.apply_query(query)?;
        Ok(cursor)
    }

    /// Cancels background loops and closes every open journal, writing
    /// their sidecars.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            warn!("journal controller was already shut down");
            return;
        }
        self.inner.shutdown.cancel();
        let slots: Vec<Arc<JournalSlot>> = self.inner.slots.lock().values().cloned().collect();
        for slot in slots {
            if let Some(journal) = slot.cell.get() {
                if let Err(err) = journal.close() {
                    warn!(journal = %slot.jid, %err, "journal close failed");
                }
            }
        }
        info!("journal controller shut down");
    }
}

/// `<base>/<last two characters of the id>/<id>`
pub(crate) fn journal_dir(base: &Path, jid: &str) -> PathBuf {
    let shard: String = jid.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
    base.join(shard).join(jid)
}

/// Finds journal directories by the two-character shard convention.
fn scan_for_journals(base: &Path) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for shard in std::fs::read_dir(base)? {
        let shard = shard?;
        if !shard.file_type()?.is_dir() {
            continue;
        }
        let shard_name = shard.file_name();
        let Some(shard_name) = shard_name.to_str() else {
            continue;
        };
        if shard_name.chars().count() != 2 {
            continue;
        }
        for entry in std::fs::read_dir(shard.path())? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(jid) = entry.file_name().to_str() {
                if jid.ends_with(shard_name) {
                    found.push(jid.to_string());
                }
            }
        }
    }
    found.sort_unstable();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn journal_dir_uses_the_last_two_characters() {
        let dir = journal_dir(Path::new("/base"), "svc-a");
        assert_eq!(dir, PathBuf::from("/base/-a/svc-a"));
        let dir = journal_dir(Path::new("/base"), "ab");
        assert_eq!(dir, PathBuf::from("/base/ab/ab"));
    }

    #[test]
    fn scan_finds_sharded_journals() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("-a/svc-a")).unwrap();
        std::fs::create_dir_all(tmp.path().join("b1/app-b1")).unwrap();
        // not a journal: shard name does not match the suffix
        std::fs::create_dir_all(tmp.path().join("zz/other")).unwrap();
        // not a shard: wrong name length
        std::fs::create_dir_all(tmp.path().join("abc/zzabc")).unwrap();

        let found = scan_for_journals(tmp.path()).unwrap();
        assert_eq!(found, vec!["app-b1".to_string(), "svc-a".to_string()]);
    }
}
