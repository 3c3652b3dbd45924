use std::sync::Arc;

use crate::codec::{FrameBufReader, FrameBufWriter, LogEvent};
use crate::config::RecordId;
use crate::error::{Error, Result};
use crate::stream::{FilterFn, IteratorPos};

use super::chunk::FRAME_META_SIZE;
use super::journal::Journal;
use super::reader::JournalReader;

/// A bidirectional, filtered cursor over one journal reader.
///
/// The iterator keeps a buffered batch of frames and decodes the current
/// record lazily. Its position only moves when a record is actually
/// consumed, so filtered-over records never surface as a position the
/// caller could observe.
pub struct JournalIterator {
    id: String,
    filter: Option<FilterFn>,
    reader: JournalReader,
    fwd: bool,
    frames: FrameBufWriter,
    batch: FrameBufReader,
    /// Current position. Updated by `get`, never by buffer refills alone.
    pos: RecordId,
    cur: Option<LogEvent>,
    err: Option<Error>,
}

impl JournalIterator {
    pub fn new(id: impl Into<String>, reader: JournalReader) -> JournalIterator {
        JournalIterator {
            id: id.into(),
            filter: None,
            reader,
            fwd: true,
            frames: FrameBufWriter::default(),
            batch: FrameBufReader::default(),
            pos: RecordId::MIN,
            cur: None,
            err: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn set_filter(&mut self, filter: Option<FilterFn>) {
        self.filter = filter;
        // a new predicate invalidates the buffered record
        self.drop_buf_to_pos();
    }

    pub fn end(&mut self) -> bool {
        self.cur.is_none() && self.ensure_current().is_err()
    }

    /// Copies the current record into `out`, first advancing over records
    /// the filter rejects.
    pub fn get(&mut self, out: &mut LogEvent) -> Result<()> {
        let ev = self.ensure_current()?;
        *out = ev.clone();
        Ok(())
    }

    /// Moves to the next record in the current direction.
    pub fn next(&mut self) {
        self.step();
        let _ = self.ensure_current();
    }

    pub fn backward(&mut self, bkwd: bool) {
        if self.fwd != !bkwd {
            self.fwd = !bkwd;
            self.drop_buf_to_pos();
        }
    }

    pub fn is_forward(&self) -> bool {
        self.fwd
    }

    pub fn pos(&self) -> RecordId {
        self.pos
    }

    pub fn set_pos(&mut self, pos: RecordId) {
        if self.pos != pos {
            self.pos = pos;
            self.drop_buf_to_pos();
        }
    }

    pub fn iterator_pos(&self) -> IteratorPos {
        IteratorPos {
            journal: self.id.clone(),
            pos: self.pos,
        }
    }

    /// Resets the reader to the current position so a later wait observes
    /// appends past it, and hands out what the wait needs. The caller
    /// awaits outside any lock held on the iterator.
    pub fn wait_handle(&mut self) -> (Arc<Journal>, RecordId) {
        self.drop_buf_to_pos();
        (self.reader.journal().clone(), self.pos)
    }

    pub fn close(&mut self) {
        self.reader.close();
        self.batch.reset_empty();
        self.cur = None;
    }

    fn ensure_current(&mut self) -> Result<&LogEvent> {
        if self.cur.is_some() {
            return Ok(self.cur.as_ref().unwrap());
        }

        loop {
            if !self.fill_buf() {
                return Err(self.take_err());
            }

            let mut payload = match self.batch.get() {
                Ok(p) => p,
                Err(err) => {
                    self.batch.reset_empty();
                    self.err = Some(clone_err(&err));
                    return Err(err);
                }
            };
            let ev = match LogEvent::unmarshal(&mut payload) {
                Ok(ev) => ev,
                Err(err) => {
                    self.batch.reset_empty();
                    self.err = Some(clone_err(&err));
                    return Err(err);
                }
            };

            let rejected = match &self.filter {
                Some(filter) => filter(&ev),
                None => false,
            };
            if rejected {
                self.step();
                continue;
            }

            self.cur = Some(ev);
            return Ok(self.cur.as_ref().unwrap());
        }
    }

    /// Moves the position one record in the current direction, ignoring
    /// the filter.
    fn step(&mut self) {
        self.cur = None;
        if !self.fill_buf() {
            return;
        }

        if self.fwd {
            if let Ok(frame) = self.batch.get() {
                self.pos.offset += frame.len() as i64 + FRAME_META_SIZE as i64;
            }
            self.batch.next();
        } else {
            self.batch.next();
            let before = self.pos;
            // the lookahead frame is the predecessor record, its length
            // tells how far back the position moves
            if self.fill_buf() && self.pos == before {
                if let Ok(frame) = self.batch.get() {
                    self.pos.offset -= frame.len() as i64 + FRAME_META_SIZE as i64;
                }
            }
        }
    }

    /// Makes sure the frame batch holds data, refilling from the reader
    /// when it ran dry. Returns false when no data is available.
    fn fill_buf(&mut self) -> bool {
        if !self.batch.end() || self.err.is_some() {
            return self.err.is_none();
        }

        // the reader advances on its own between refills; it is re-seated
        // only by drop_buf_to_pos after seeks and direction changes
        self.frames.clear();
        let res = if self.fwd {
            self.reader.read_forward(&mut self.frames)
        } else {
            self.reader.read_back(&mut self.frames)
        };
        match res {
            Ok(first) => {
                self.pos = first;
                self.batch.reset(self.frames.take());
                true
            }
            Err(err) => {
                self.err = Some(err);
                self.batch.reset_empty();
                false
            }
        }
    }

    fn drop_buf_to_pos(&mut self) {
        if matches!(self.err, Some(Error::Eof)) {
            self.err = None;
        }
        self.cur = None;
        self.batch.reset_empty();
        self.reader.set_pos(self.pos);
    }

    fn take_err(&mut self) -> Error {
        match &self.err {
            Some(err) => clone_err(err),
            None => Error::Eof,
        }
    }
}

fn clone_err(err: &Error) -> Error {
    match err {
        Error::Eof => Error::Eof,
        Error::Closed => Error::Closed,
        Error::Corruption(msg) => Error::Corruption(msg.clone()),
        Error::Conflict(msg) => Error::Conflict(msg.clone()),
        Error::Transient(msg) => Error::Transient(msg.clone()),
        Error::NotFound(msg) => Error::NotFound(msg.clone()),
        Error::InvalidInput(msg) => Error::InvalidInput(msg.clone()),
        Error::InvalidQuery(msg) => Error::InvalidQuery(msg.clone()),
        other => Error::transient(other.to_string()),
    }
}
