use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::codec::FrameBufWriter;
use crate::config::RecordId;
use crate::error::{Error, Result};
use crate::pool::BufPool;

use super::chunk::{Chunk, CHUNK_HEADER_SIZE, FRAME_META_SIZE};
use super::journal::Journal;

/// A positioned reader over one journal.
///
/// `read_forward` and `read_back` fill the caller's frame buffer with a
/// batch of record payloads and return the id of the batch's first record;
/// the reader's own position advances past the batch so consecutive calls
/// stream through the journal. Batches never cross a chunk boundary, which
/// keeps the caller's offset arithmetic within one chunk.
pub struct JournalReader {
    journal: Arc<Journal>,
    pos: RecordId,
    batch_budget: usize,
    scratch: Vec<u8>,
    pool: Option<Arc<BufPool>>,
}

impl JournalReader {
    pub fn new(journal: Arc<Journal>, pool: Arc<BufPool>) -> JournalReader {
        let scratch = pool.get();
        JournalReader {
            journal,
            pos: RecordId::MIN,
            batch_budget: pool.buf_size(),
            scratch,
            pool: Some(pool),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_budget(journal: Arc<Journal>, batch_budget: usize) -> JournalReader {
        JournalReader {
            journal,
            pos: RecordId::MIN,
            batch_budget,
            scratch: Vec::new(),
            pool: None,
        }
    }

    pub fn journal(&self) -> &Arc<Journal> {
        &self.journal
    }

    pub fn pos(&self) -> RecordId {
        self.pos
    }

    pub fn set_pos(&mut self, pos: RecordId) {
        self.pos = pos;
    }

    /// Reads a batch of records starting at the current position, moving
    /// forward. Returns the id of the first record in the batch.
    pub fn read_forward(&mut self, dst: &mut FrameBufWriter) -> Result<RecordId> {
        let (chunk, mut off) = self.resolve_forward()?;
        let first = RecordId::new(chunk.id(), off as i64);

        let mut total = 0usize;
        let mut frames = 0usize;
        loop {
            match chunk.read_frame(off, &mut self.scratch) {
                Ok((len, frame)) => {
                    dst.push(&self.scratch[..len]);
                    off += frame;
                    total += len + FRAME_META_SIZE as usize;
                    frames += 1;
                }
                Err(Error::Eof) => break,
                Err(err) => return Err(err),
            }
            if total >= self.batch_budget {
                break;
            }
        }
        if frames == 0 {
            return Err(Error::corruption(format!(
                "chunk {} holds a sub-frame tail at offset {}",
                chunk.id(),
                off
            )));
        }
        self.pos = RecordId::new(chunk.id(), off as i64);
        Ok(first)
    }

    /// Reads a batch of records walking backward from the current position,
    /// the current record first. Returns the id of that record. The
    /// reader's position moves to the predecessor of the batch's last
    /// record, or before the beginning of data.
    pub fn read_back(&mut self, dst: &mut FrameBufWriter) -> Result<RecordId> {
        let (chunk, start) = self.resolve_backward()?;
        let first = RecordId::new(chunk.id(), start as i64);

        let mut off = start;
        let mut total = 0usize;
        loop {
            let (len, _) = chunk.read_frame(off, &mut self.scratch)?;
            dst.push(&self.scratch[..len]);
            total += len + FRAME_META_SIZE as usize;

            match chunk.prev_frame_offset(off)? {
                Some(prev) if total < self.batch_budget => off = prev,
                Some(prev) => {
                    self.pos = RecordId::new(chunk.id(), prev as i64);
                    return Ok(first);
                }
                None => {
                    // before the first record of this chunk
                    self.pos = RecordId::new(chunk.id(), 0);
                    return Ok(first);
                }
            }
        }
    }

    /// Suspends until the journal holds a record at or after the current
    /// position.
    pub async fn wait_new_data(&self, cancel: &CancellationToken) -> Result<()> {
        self.journal.wait_new_data(self.pos, cancel).await
    }

    /// Maps the current position to a concrete chunk and offset for forward
    /// reading, skipping chunks that were rotated away.
    fn resolve_forward(&self) -> Result<(Arc<Chunk>, u64)> {
        if self.pos == RecordId::MAX {
            return Err(Error::Eof);
        }
        let mut chunk = self
            .journal
            .chunk_at_or_after(self.pos.chunk_id)
            .ok_or(Error::Eof)?;
        let mut off = if chunk.id() == self.pos.chunk_id {
            (self.pos.offset.max(0) as u64).max(CHUNK_HEADER_SIZE)
        } else {
            CHUNK_HEADER_SIZE
        };
        // step over exhausted chunks
        while off >= chunk.len() {
            chunk = self.journal.chunk_at_or_after(chunk.id() + 1).ok_or(Error::Eof)?;
            off = CHUNK_HEADER_SIZE;
        }
        Ok((chunk, off))
    }

    /// Maps the current position for backward reading. The tail sentinel
    /// resolves to the journal's last record; a position before a chunk's
    /// first record steps into the preceding chunk.
    fn resolve_backward(&self) -> Result<(Arc<Chunk>, u64)> {
        if self.pos == RecordId::MAX {
            let chunk = self.journal.last_chunk().ok_or(Error::Eof)?;
            return match chunk.last_frame_offset()? {
                Some(off) => Ok((chunk, off)),
                None => match self.journal.chunk_before(chunk.id()) {
                    Some(prev) => match prev.last_frame_offset()? {
                        Some(off) => Ok((prev, off)),
                        None => Err(Error::Eof),
                    },
                    None => Err(Error::Eof),
                },
            };
        }

        if self.pos.offset >= CHUNK_HEADER_SIZE as i64 {
            if let Some(chunk) = self.journal.chunk_by_id(self.pos.chunk_id) {
                let off = self.pos.offset as u64;
                if off >= chunk.len() {
                    // clamped to the last record of the chunk
                    return match chunk.last_frame_offset()? {
                        Some(last) => Ok((chunk, last)),
                        None => Err(Error::Eof),
                    };
                }
                return Ok((chunk, off));
            }
        }

        // before the first record of the chunk, or the chunk is gone:
        // continue in the closest earlier chunk
        let prev = self
            .journal
            .chunk_before(self.pos.chunk_id)
            .ok_or(Error::Eof)?;
        match prev.last_frame_offset()? {
            Some(off) => Ok((prev, off)),
            None => Err(Error::Eof),
        }
    }

    pub fn close(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.put(std::mem::take(&mut self.scratch));
        }
    }
}

impl Drop for JournalReader {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{FrameBufReader, LogEvent};
    use tempfile::TempDir;

    fn fill_journal(dir: &std::path::Path, n: i64) -> Arc<Journal> {
        let j = Arc::new(Journal::open(dir, "jr", 1 << 20, true).unwrap());
        for i in 1..=n {
            let rec = LogEvent::new(i, format!("rec-{i}").into_bytes())
                .to_bytes()
                .to_vec();
            j.append(&[&rec]).unwrap();
        }
        j
    }

    fn drain(dst: &mut FrameBufWriter) -> Vec<i64> {
        let mut rd = FrameBufReader::default();
        rd.reset(dst.take());
        let mut out = Vec::new();
        while !rd.end() {
            let mut payload = rd.get().unwrap();
            out.push(LogEvent::unmarshal(&mut payload).unwrap().ts);
            rd.next();
        }
        out
    }

    #[test]
    fn forward_reads_in_append_order() {
        let dir = TempDir::new().unwrap();
        let j = fill_journal(dir.path(), 5);
        let mut r = JournalReader::with_budget(j, 1 << 16);
        let mut buf = FrameBufWriter::default();
        let first = r.read_forward(&mut buf).unwrap();
        assert_eq!(first, RecordId::new(1, CHUNK_HEADER_SIZE as i64));
        assert_eq!(drain(&mut buf), vec![1, 2, 3, 4, 5]);
        assert!(matches!(r.read_forward(&mut buf), Err(Error::Eof)));
    }

    #[test]
    fn small_budget_batches_still_cover_everything() {
        let dir = TempDir::new().unwrap();
        let j = fill_journal(dir.path(), 10);
        let mut r = JournalReader::with_budget(j, 1);
        let mut seen = Vec::new();
        let mut buf = FrameBufWriter::default();
        loop {
            match r.read_forward(&mut buf) {
                Ok(_) => seen.extend(drain(&mut buf)),
                Err(Error::Eof) => break,
                Err(err) => panic!("{err}"),
            }
        }
        assert_eq!(seen, (1..=10).collect::<Vec<_>>());
    }

    #[test]
    fn backward_from_tail_reverses_forward() {
        let dir = TempDir::new().unwrap();
        let j = fill_journal(dir.path(), 5);
        let mut r = JournalReader::with_budget(j, 1 << 16);
        r.set_pos(RecordId::MAX);
        let mut buf = FrameBufWriter::default();
        r.read_back(&mut buf).unwrap();
        assert_eq!(drain(&mut buf), vec![5, 4, 3, 2, 1]);
        assert!(matches!(r.read_back(&mut buf), Err(Error::Eof)));
    }

    #[test]
    fn backward_batches_step_across_calls() {
        let dir = TempDir::new().unwrap();
        let j = fill_journal(dir.path(), 6);
        let mut r = JournalReader::with_budget(j, 1);
        r.set_pos(RecordId::MAX);
        let mut seen = Vec::new();
        let mut buf = FrameBufWriter::default();
        loop {
            match r.read_back(&mut buf) {
                Ok(_) => seen.extend(drain(&mut buf)),
                Err(Error::Eof) => break,
                Err(err) => panic!("{err}"),
            }
        }
        assert_eq!(seen, vec![6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn forward_skips_truncated_chunks() {
        let dir = TempDir::new().unwrap();
        let j = Arc::new(Journal::open(dir.path(), "jt", 64 * 1024, true).unwrap());
        let big = LogEvent::new(1, "z".repeat(60 * 1024).into_bytes())
            .to_bytes()
            .to_vec();
        j.append(&[&big]).unwrap();
        let small = LogEvent::new(2, b"tail".to_vec()).to_bytes().to_vec();
        j.append(&[&small]).unwrap();
        assert_eq!(j.chunk_count(), 2);

        let mut r = JournalReader::with_budget(j.clone(), 1 << 16);
        r.set_pos(RecordId::new(1, CHUNK_HEADER_SIZE as i64));
        j.truncate_oldest().unwrap();

        let mut buf = FrameBufWriter::default();
        r.read_forward(&mut buf).unwrap();
        assert_eq!(drain(&mut buf), vec![2]);
    }
}
