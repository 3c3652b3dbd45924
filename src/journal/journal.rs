use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RecordId;
use crate::error::{Error, Result};
use crate::tags::TagLine;

use super::chunk::{parse_chunk_file_name, Chunk, CHUNK_HEADER_SIZE};

pub(crate) const META_FILE_NAME: &str = "journal.meta";

/// Sidecar state of one chunk: the last record known to the journal and
/// the tag lines met in it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkMeta {
    #[serde(rename = "lastRecord")]
    pub last_record: RecordId,
    pub tags: BTreeSet<TagLine>,
}

/// The `journal.meta` sidecar. It is a cache: when its view of the chunks
/// disagrees with the files on disk, the chunk synchronizer rebuilds it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JournalMeta {
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    pub chunks: BTreeMap<u32, ChunkMeta>,
}

/// An append-only log stored as a directory of size-bounded chunks.
pub struct Journal {
    id: String,
    dir: PathBuf,
    max_chunk_size: u64,
    chunks: RwLock<Vec<Arc<Chunk>>>,
    /// Serializes appends. Never held across anything but the chunk write.
    write_lock: Mutex<()>,
    meta: Mutex<JournalMeta>,
    data_ready: Notify,
    errored: AtomicBool,
    created_at: SystemTime,
}

impl Journal {
    /// Opens the journal in `dir`, scanning the tail of its last chunk.
    /// `recover` decides whether a torn tail is truncated or fatal.
    pub fn open(dir: &Path, id: &str, max_chunk_size: u64, recover: bool) -> Result<Journal> {
        std::fs::create_dir_all(dir)?;

        let mut ids = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(cid) = entry.file_name().to_str().and_then(parse_chunk_file_name) {
                ids.push(cid);
            }
        }
        ids.sort_unstable();

        let mut chunks = Vec::with_capacity(ids.len());
        for (i, cid) in ids.iter().enumerate() {
            let path = dir.join(super::chunk::chunk_file_name(*cid));
            // only the last chunk can carry a torn tail
            let scan = i + 1 == ids.len();
            let chunk = Chunk::open(&path, scan, recover)?;
            if chunk.id() != *cid {
                return Err(Error::corruption(format!(
                    "chunk file {} carries id {}",
                    path.display(),
                    chunk.id()
                )));
            }
            chunks.push(Arc::new(chunk));
        }

        let meta = Self::load_meta(dir).unwrap_or_default();
        let created_at = if meta.created_at > 0 {
            SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(meta.created_at as u64)
        } else {
            chunks
                .first()
                .map(|c| c.created_at())
                .unwrap_or_else(SystemTime::now)
        };

        debug!(journal = id, chunks = chunks.len(), "journal opened");
        Ok(Journal {
            id: id.to_string(),
            dir: dir.to_path_buf(),
            max_chunk_size,
            chunks: RwLock::new(chunks),
            write_lock: Mutex::new(()),
            meta: Mutex::new(meta),
            data_ready: Notify::new(),
            errored: AtomicBool::new(false),
            created_at,
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[inline]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub fn modified_at(&self) -> SystemTime {
        let chunks = self.chunks.read();
        chunks
            .last()
            .map(|c| c.modified_at())
            .unwrap_or(self.created_at)
    }

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    fn fail_fast(&self) -> Result<()> {
        if self.is_errored() {
            return Err(Error::conflict(format!(
                "journal '{}' is in an error state",
                self.id
            )));
        }
        Ok(())
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().len()
    }

    /// Total size of all chunk files.
    pub fn size(&self) -> u64 {
        self.chunks.read().iter().map(|c| c.len()).sum()
    }

    /// Appends a batch of marshaled records. All records of the batch land
    /// in the active chunk; when the chunk would grow past its limit the
    /// journal seals it and continues in a fresh one, so a batch can touch
    /// two chunks. Returns the id of the last record per touched chunk, in
    /// chunk order.
    pub fn append(&self, records: &[&[u8]]) -> Result<Vec<RecordId>> {
        self.fail_fast()?;
        if records.is_empty() {
            return Err(Error::invalid_input("empty record batch"));
        }

        let _guard = self.write_lock.lock();
        let mut touched = Vec::with_capacity(2);
        let mut rest = records;
        while !rest.is_empty() {
            let chunk = self.writable_chunk()?;
            let room = self.max_chunk_size.saturating_sub(chunk.len());

            // take the longest prefix that still fits; an oversized record
            // is accepted alone in an otherwise empty chunk
            let mut take = 0;
            let mut used = 0;
            for payload in rest {
                let framed = payload.len() as u64 + super::chunk::FRAME_META_SIZE;
                if take > 0 && used + framed > room {
                    break;
                }
                if take == 0 && framed > room && chunk.len() > CHUNK_HEADER_SIZE {
                    break;
                }
                used += framed;
                take += 1;
            }
            if take == 0 {
                self.seal_and_roll(&chunk)?;
                continue;
            }

            let batch = &rest[..take];
            let offsets = match chunk.append_frames(batch) {
                Ok(offsets) => offsets,
                Err(err) => {
                    self.errored.store(true, Ordering::Release);
                    return Err(err);
                }
            };
            touched.push(RecordId::new(chunk.id(), *offsets.last().unwrap() as i64));
            rest = &rest[take..];

            if chunk.len() >= self.max_chunk_size && !rest.is_empty() {
                self.seal_and_roll(&chunk)?;
            }
        }

        self.data_ready.notify_waiters();
        Ok(touched)
    }

    fn writable_chunk(&self) -> Result<Arc<Chunk>> {
        if let Some(chunk) = self.chunks.read().last() {
            if chunk.len() < self.max_chunk_size {
                return Ok(chunk.clone());
            }
        }
        let mut chunks = self.chunks.write();
        if let Some(chunk) = chunks.last() {
            if chunk.len() < self.max_chunk_size {
                return Ok(chunk.clone());
            }
        }
        let next_id = chunks.last().map(|c| c.id() + 1).unwrap_or(1);
        let chunk = Arc::new(Chunk::create(&self.dir, next_id)?);
        debug!(journal = %self.id, chunk = next_id, "opened a new chunk");
        chunks.push(chunk.clone());
        Ok(chunk)
    }

    fn seal_and_roll(&self, active: &Arc<Chunk>) -> Result<()> {
        active.sync()?;
        let mut chunks = self.chunks.write();
        if chunks.last().map(|c| c.id()) == Some(active.id()) {
            let next_id = active.id() + 1;
            let chunk = Arc::new(Chunk::create(&self.dir, next_id)?);
            debug!(journal = %self.id, chunk = next_id, "sealed chunk, rolling over");
            chunks.push(chunk);
        }
        Ok(())
    }

    /// Removes the lowest-numbered chunk and returns its id. The active
    /// chunk is never removed.
    pub fn truncate_oldest(&self) -> Result<Option<u32>> {
        self.fail_fast()?;
        let removed = {
            let mut chunks = self.chunks.write();
            if chunks.len() <= 1 {
                return Ok(None);
            }
            chunks.remove(0)
        };
        removed.remove_file()?;
        self.meta.lock().chunks.remove(&removed.id());
        info!(journal = %self.id, chunk = removed.id(), "removed oldest chunk");
        Ok(Some(removed.id()))
    }

    /// Id of the last record in the journal, None when empty.
    pub fn last_record_id(&self) -> Result<Option<RecordId>> {
        let chunks = self.chunks.read();
        for chunk in chunks.iter().rev() {
            if let Some(off) = chunk.last_frame_offset()? {
                return Ok(Some(RecordId::new(chunk.id(), off as i64)));
            }
        }
        Ok(None)
    }

    pub(crate) fn chunk_by_id(&self, id: u32) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read();
        chunks
            .binary_search_by_key(&id, |c| c.id())
            .ok()
            .map(|i| chunks[i].clone())
    }

    /// The chunk with the smallest id not below `id`.
    pub(crate) fn chunk_at_or_after(&self, id: u32) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read();
        chunks.iter().find(|c| c.id() >= id).cloned()
    }

    /// The chunk with the largest id strictly below `id`.
    pub(crate) fn chunk_before(&self, id: u32) -> Option<Arc<Chunk>> {
        let chunks = self.chunks.read();
        chunks.iter().rev().find(|c| c.id() < id).cloned()
    }

    pub(crate) fn first_chunk(&self) -> Option<Arc<Chunk>> {
        self.chunks.read().first().cloned()
    }

    pub(crate) fn last_chunk(&self) -> Option<Arc<Chunk>> {
        self.chunks.read().last().cloned()
    }

    /// True when a record exists at or after `pos`.
    fn has_data_at(&self, pos: RecordId) -> bool {
        let chunks = self.chunks.read();
        for chunk in chunks.iter() {
            if chunk.id() > pos.chunk_id {
                if chunk.len() > CHUNK_HEADER_SIZE {
                    return true;
                }
            } else if chunk.id() == pos.chunk_id && chunk.len() > pos.offset.max(0) as u64 {
                return true;
            }
        }
        false
    }

    /// End-of-data position: one past the last record of the last chunk.
    fn end_pos(&self) -> RecordId {
        let chunks = self.chunks.read();
        match chunks.last() {
            Some(c) => RecordId::new(c.id(), c.len() as i64),
            None => RecordId::MIN,
        }
    }

    /// Blocks until a record appears at or after `pos`, the token fires, or
    /// the journal goes into an error state. The tail sentinel waits for
    /// anything appended from now on.
    pub async fn wait_new_data(&self, pos: RecordId, cancel: &CancellationToken) -> Result<()> {
        let pos = if pos == RecordId::MAX { self.end_pos() } else { pos };
        loop {
            let notified = self.data_ready.notified();
            if self.has_data_at(pos) {
                return Ok(());
            }
            self.fail_fast()?;
            tokio::select! {
                _ = notified => {}
                _ = cancel.cancelled() => return Err(Error::Closed),
            }
        }
    }

    /// Records the tags and last record of a chunk in the sidecar state.
    pub(crate) fn note_chunk_write(&self, tag_line: &TagLine, last: RecordId) {
        let mut meta = self.meta.lock();
        let entry = meta.chunks.entry(last.chunk_id).or_default();
        entry.last_record = last;
        if !tag_line.is_empty() {
            entry.tags.insert(tag_line.clone());
        }
    }

    pub(crate) fn replace_meta(&self, new_meta: JournalMeta) {
        *self.meta.lock() = new_meta;
    }

    pub fn meta_snapshot(&self) -> JournalMeta {
        self.meta.lock().clone()
    }

    /// All tag lines the sidecar knows about.
    pub fn known_tags(&self) -> Vec<TagLine> {
        let meta = self.meta.lock();
        let mut set = BTreeSet::new();
        for cm in meta.chunks.values() {
            set.extend(cm.tags.iter().cloned());
        }
        set.into_iter().collect()
    }

    /// The sidecar is trustworthy only when it describes every chunk and
    /// its last-record offset matches what the chunk file actually ends
    /// with.
    pub fn is_meta_consistent(&self) -> Result<bool> {
        let meta = self.meta.lock();
        let chunks = self.chunks.read();
        for chunk in chunks.iter() {
            let last = chunk.last_frame_offset()?;
            match (meta.chunks.get(&chunk.id()), last) {
                (Some(cm), Some(off)) => {
                    if cm.last_record.offset != off as i64 {
                        return Ok(false);
                    }
                }
                (None, Some(_)) => return Ok(false),
                // an empty chunk needs no sidecar entry
                (_, None) => {}
            }
        }
        Ok(true)
    }

    pub fn save_meta(&self) -> Result<()> {
        let meta = {
            let mut meta = self.meta.lock();
            meta.created_at = self
                .created_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs() as i64;
            meta.clone()
        };
        let data = serde_json::to_vec(&meta)
            .map_err(|err| Error::corruption(format!("cannot encode journal meta: {err}")))?;
        std::fs::write(self.dir.join(META_FILE_NAME), data)?;
        Ok(())
    }

    fn load_meta(dir: &Path) -> Option<JournalMeta> {
        let raw = std::fs::read(dir.join(META_FILE_NAME)).ok()?;
        match serde_json::from_slice(&raw) {
            Ok(meta) => Some(meta),
            Err(err) => {
                warn!(dir = %dir.display(), %err, "unreadable journal meta, ignoring it");
                None
            }
        }
    }

    pub fn close(&self) -> Result<()> {
        if let Some(chunk) = self.last_chunk() {
            let _ = chunk.sync();
        }
        let res = self.save_meta();
        // wake any waiter so it can observe cancellation
        self.data_ready.notify_waiters();
        res
    }
}
