//! User-facing cursors: ordered, filtered iteration over one or more
//! journals with a streaming reader on top.

mod position;
mod reader;
mod registry;

pub use position::{CursorPosition, POS_HEAD, POS_TAIL};
pub use reader::{CursorReader, ReaderCloser};
pub use registry::{new_cursor_id, CursorRegistry};

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::LogEvent;
use crate::config::RecordId;
use crate::error::{Error, Result};
use crate::index::TagIndex;
use crate::journal::JournalIterator;
use crate::kql::{Formatter, Query};
use crate::stream::{build_merge_tree, earliest_first, EventIterator, IteratorPos};

/// What it takes to build a cursor.
pub struct CursorSettings {
    pub id: String,
    pub sources: Vec<String>,
    pub formatter: Option<Formatter>,
}

/// Shared handle to one journal iterator. The cursor keeps one per
/// source journal and the merge tree holds clones of the same handles,
/// so position and filter changes are visible on both paths.
#[derive(Clone)]
pub(crate) struct IterHandle(pub(crate) Arc<Mutex<JournalIterator>>);

impl EventIterator for IterHandle {
    fn end(&mut self) -> bool {
        self.0.lock().end()
    }

    fn get(&mut self, out: &mut LogEvent) -> Result<()> {
        self.0.lock().get(out)
    }

    fn next(&mut self) {
        self.0.lock().next();
    }

    fn backward(&mut self, bkwd: bool) {
        self.0.lock().backward(bkwd);
    }

    fn iterator_pos(&mut self) -> Option<IteratorPos> {
        Some(self.0.lock().iterator_pos())
    }

    fn close(&mut self) -> Result<()> {
        self.0.lock().close();
        Ok(())
    }
}

/// A stateful, bidirectional, filtered iterator over a set of journals.
///
/// Multiple journals are merged by record timestamp with stable ties.
/// The cursor is used by one consumer at a time; the registry enforces
/// that by handing a cursor out and taking it back.
pub struct Cursor {
    id: String,
    its: BTreeMap<String, Arc<Mutex<JournalIterator>>>,
    it: Box<dyn EventIterator>,
    formatter: Option<Formatter>,
    fmt_buf: Vec<u8>,
    index: Arc<TagIndex>,
}

impl Cursor {
    /// Builds a cursor over the given per-journal iterators.
    pub(crate) fn build(
        id: String,
        iterators: Vec<JournalIterator>,
        formatter: Option<Formatter>,
        index: Arc<TagIndex>,
    ) -> Result<Cursor> {
        if iterators.is_empty() {
            return Err(Error::invalid_input(
                "a cursor needs at least one source journal",
            ));
        }

        let mut its = BTreeMap::new();
        let mut children: Vec<Box<dyn EventIterator>> = Vec::with_capacity(iterators.len());
        for iter in iterators {
            let handle = Arc::new(Mutex::new(iter));
            let jid = handle.lock().id().to_string();
            children.push(Box::new(IterHandle(handle.clone())));
            its.insert(jid, handle);
        }

        let it = build_merge_tree(earliest_first, children).expect("non-empty children");
        debug!(cursor = %id, sources = its.len(), "cursor created");
        Ok(Cursor {
            id,
            its,
            it,
            formatter,
            fmt_buf: Vec::new(),
            index,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Installs the record predicate on every child iterator.
    pub fn set_filter(&mut self, filter: Option<crate::stream::FilterFn>) {
        for handle in self.its.values() {
            handle.lock().set_filter(filter.clone());
        }
    }

    /// Places the cursor. Sentinels apply to every child, the map form
    /// pins each named journal.
    pub fn set_position(&mut self, pos: &CursorPosition) {
        match pos {
            CursorPosition::Head => {
                for handle in self.its.values() {
                    handle.lock().set_pos(RecordId::MIN);
                }
            }
            CursorPosition::Tail => {
                for handle in self.its.values() {
                    handle.lock().set_pos(RecordId::MAX);
                }
            }
            CursorPosition::Map(map) => {
                for (jid, rid) in map {
                    if let Some(handle) = self.its.get(jid) {
                        handle.lock().set_pos(*rid);
                    }
                }
            }
        }
    }

    pub fn get_position(&self) -> CursorPosition {
        let mut map = BTreeMap::new();
        for (jid, handle) in &self.its {
            map.insert(jid.clone(), handle.lock().pos());
        }
        CursorPosition::Map(map)
    }

    /// Goes to the tail and walks back over `count` matching records, so
    /// the next read returns the count-th record from the end under the
    /// installed filter.
    pub fn skip_from_tail(&mut self, mut count: i64) {
        debug!(cursor = %self.id, count, "skip from tail");
        if count <= 0 || self.its.is_empty() {
            return;
        }
        self.it.backward(true);
        self.set_position(&CursorPosition::Tail);

        let mut pivot = None;
        while !self.it.end() && count > 0 {
            let mut ev = LogEvent::default();
            if self.it.get(&mut ev).is_err() {
                break;
            }
            pivot = self.it.iterator_pos();
            if count > 1 {
                self.it.next();
            }
            count -= 1;
        }

        self.it.backward(false);
        if count > 0 {
            // fewer matching records than requested: the next read is EOF
            self.set_position(&CursorPosition::Tail);
            return;
        }
        self.meet_pos(pivot);
    }

    /// Skips `count` matching records forward, or backward for a negative
    /// count.
    pub fn offset(&mut self, mut count: i64) {
        debug!(cursor = %self.id, count, "offset");
        if count >= 0 {
            while count > 0 && !self.it.end() {
                let mut ev = LogEvent::default();
                let _ = self.it.get(&mut ev);
                self.it.next();
                count -= 1;
            }
            return;
        }

        if self.it.end() {
            self.skip_from_tail(-count);
            return;
        }

        let mut pivot = self.it.iterator_pos();
        self.it.backward(true);
        self.meet_pos(pivot.clone());

        while !self.it.end() && count < 0 {
            self.it.next();
            let mut ev = LogEvent::default();
            if self.it.get(&mut ev).is_ok() {
                pivot = self.it.iterator_pos();
            }
            count += 1;
        }

        self.it.backward(false);
        self.meet_pos(pivot);
    }

    /// After a direction change under a merge tree the mixer's first pick
    /// need not be the record served before the flip. Walking until the
    /// merged position equals the pre-flip pivot re-anchors the stream.
    fn meet_pos(&mut self, pivot: Option<IteratorPos>) {
        let pivot = match pivot {
            Some(p) if self.its.len() > 1 => p,
            _ => return,
        };
        for _ in 0..self.its.len() {
            if self.it.end() {
                return;
            }
            let mut ev = LogEvent::default();
            let _ = self.it.get(&mut ev);
            if self.it.iterator_pos().as_ref() == Some(&pivot) {
                return;
            }
            self.it.next();
        }
    }

    /// Applies a compiled query: filter, position and offset.
    pub fn apply_query(&mut self, query: &Arc<Query>) -> Result<()> {
        self.set_filter(Some(query.clone().filter_fn()));

        let pos_text = query.position().unwrap_or(POS_HEAD);
        match CursorPosition::decode(pos_text)? {
            CursorPosition::Tail => {
                // tail delivers the last records in forward order: the
                // offset wins when given, else the limit bounds the span
                let skip = if query.offset() > 0 {
                    query.offset()
                } else if query.limit() > 0 {
                    query.limit()
                } else {
                    1
                };
                self.skip_from_tail(skip);
            }
            pos => {
                self.set_position(&pos);
                self.offset(query.offset());
            }
        }
        Ok(())
    }

    /// Formats the current record and advances. The end of data and any
    /// child error surface here.
    pub(crate) fn next_record(&mut self) -> Result<Vec<u8>> {
        if self.it.end() {
            return Err(Error::Eof);
        }
        let mut ev = LogEvent::default();
        self.it.get(&mut ev)?;
        let journal = self
            .it
            .iterator_pos()
            .map(|p| p.journal)
            .unwrap_or_default();
        let line = self.render(&ev, &journal);
        self.it.next();
        Ok(line)
    }

    fn render(&mut self, ev: &LogEvent, journal: &str) -> Vec<u8> {
        let Some(formatter) = &self.formatter else {
            // default rendering: the raw message, prefixed with the source
            // journal when the cursor merges several
            let mut out = Vec::with_capacity(ev.msg.len() + journal.len() + 4);
            if self.its.len() > 1 {
                out.push(b'[');
                out.extend_from_slice(journal.as_bytes());
                out.extend_from_slice(b"]: ");
            }
            out.extend_from_slice(&ev.msg);
            out.push(b'\n');
            return out;
        };

        // keep the scratch buffer from growing without bound
        if self.fmt_buf.capacity() > 1024 && self.fmt_buf.len() < 512 {
            self.fmt_buf = Vec::new();
        } else {
            self.fmt_buf.clear();
        }

        let index = &self.index;
        formatter.format(&mut self.fmt_buf, |name| match name {
            "ts" => chrono::DateTime::from_timestamp_nanos(ev.ts).to_rfc3339(),
            "msg" => ev.msg_lossy().into_owned(),
            "journal" => journal.to_string(),
            other => index
                .get_tags_desc(ev.tgid)
                .map(|d| d.tags.get(other).to_string())
                .unwrap_or_default(),
        });
        self.fmt_buf.clone()
    }

    /// Resets every child to its pinned position and waits until any of
    /// the underlying journals grows past it.
    pub(crate) async fn wait_records(&self, cancel: &CancellationToken) -> Result<()> {
        let mut waits = Vec::new();
        for handle in self.its.values() {
            let (journal, pos) = handle.lock().wait_handle();
            waits.push((journal, pos));
        }
        if waits.is_empty() {
            return Err(Error::Eof);
        }

        let waiters: Vec<_> = waits
            .into_iter()
            .map(|(journal, pos)| {
                let cancel = cancel.clone();
                Box::pin(async move { journal.wait_new_data(pos, &cancel).await })
            })
            .collect();
        let (res, _, _) = futures::future::select_all(waiters).await;
        res
    }

    pub(crate) fn iter_handles(&self) -> Vec<Arc<Mutex<JournalIterator>>> {
        self.its.values().cloned().collect()
    }

    /// Turns the cursor into a streaming reader. `limit` bounds the
    /// number of records, negative meaning unlimited; `blocking` makes
    /// the reader wait for new data instead of reporting end of data.
    pub fn into_reader(self, limit: i64, blocking: bool) -> CursorReader {
        CursorReader::new(self, limit, blocking)
    }

    /// Releases the journal readers of every child iterator.
    pub fn close(&mut self) {
        debug!(cursor = %self.id, "cursor closed");
        for handle in self.its.values() {
            handle.lock().close();
        }
    }
}
