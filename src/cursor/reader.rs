use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::journal::JournalIterator;

use super::Cursor;

/// Streaming reader over a cursor.
///
/// `read` is used by one task at a time; closing is idempotent and safe
/// from any task through [`ReaderCloser`], which is how a disconnecting
/// client interrupts a blocked read.
///
/// A record is copied into the output in full, continuing across `read`
/// calls when it does not fit; an error is only reported once every byte
/// of the preceding records has been handed out, so consumers can
/// tokenize the stream safely.
pub struct CursorReader {
    cursor: Cursor,
    limit: i64,
    blocking: bool,
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    buf: Vec<u8>,
    buf_at: usize,
}

/// Cancellation handle of one [`CursorReader`]. Cloneable, idempotent.
#[derive(Clone)]
pub struct ReaderCloser {
    cancel: CancellationToken,
    closed: Arc<AtomicBool>,
    its: Vec<Arc<Mutex<JournalIterator>>>,
}

impl ReaderCloser {
    /// Cancels any blocked read and releases the journal readers of the
    /// underlying iterators. Safe to call any number of times.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("cursor reader closed");
        self.cancel.cancel();
        for handle in &self.its {
            handle.lock().close();
        }
    }
}

impl CursorReader {
    pub(crate) fn new(cursor: Cursor, limit: i64, blocking: bool) -> CursorReader {
        CursorReader {
            cursor,
            limit,
            blocking,
            cancel: CancellationToken::new(),
            closed: Arc::new(AtomicBool::new(false)),
            buf: Vec::new(),
            buf_at: 0,
        }
    }

    /// Handle for closing the reader from another task.
    pub fn closer(&self) -> ReaderCloser {
        ReaderCloser {
            cancel: self.cancel.clone(),
            closed: self.closed.clone(),
            its: self.cursor.iter_handles(),
        }
    }

    /// Fills `out` with formatted records. Returns the number of bytes
    /// written; zero bytes only together with an error. On end of data a
    /// blocking reader waits for any source journal to grow instead of
    /// returning.
    pub async fn read(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < out.len() {
            // only block when nothing was handed out yet, a partially
            // filled buffer goes to the caller first
            if let Err(err) = self.fill_buf(self.blocking && n == 0).await {
                if n > 0 {
                    return Ok(n);
                }
                self.close();
                return Err(err);
            }
            let avail = &self.buf[self.buf_at..];
            let c = avail.len().min(out.len() - n);
            out[n..n + c].copy_from_slice(&avail[..c]);
            self.buf_at += c;
            n += c;
        }
        Ok(n)
    }

    /// Reads everything up to the limit or end of data into one vector.
    /// Never blocks for new data.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let blocking = self.blocking;
        self.blocking = false;
        let mut out = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            match self.read(&mut chunk).await {
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(Error::Eof) => break,
                Err(err) => {
                    self.blocking = blocking;
                    return Err(err);
                }
            }
        }
        self.blocking = blocking;
        Ok(out)
    }

    async fn fill_buf(&mut self, wait_on_eof: bool) -> Result<()> {
        if self.buf_at < self.buf.len() {
            return Ok(());
        }
        if self.limit == 0 {
            return Err(Error::Eof);
        }

        loop {
            if self.closed.load(Ordering::Acquire) || self.cancel.is_cancelled() {
                return Err(Error::Closed);
            }

            match self.cursor.next_record() {
                Ok(line) => {
                    self.buf = line;
                    self.buf_at = 0;
                    if self.limit > 0 {
                        self.limit -= 1;
                    }
                    return Ok(());
                }
                Err(Error::Eof) if wait_on_eof => {
                    self.cursor.wait_records(&self.cancel).await?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Closes the reader in place. The cursor stays usable for a later
    /// reader, only the blocked read and the record limit state end here.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
    }

    /// Hands the cursor back, closing the reader.
    pub fn into_cursor(self) -> Cursor {
        self.close();
        self.cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closer_is_idempotent_and_cancels() {
        let cancel = CancellationToken::new();
        let closer = ReaderCloser {
            cancel: cancel.clone(),
            closed: Arc::new(AtomicBool::new(false)),
            its: Vec::new(),
        };
        closer.close();
        closer.close();
        assert!(cancel.is_cancelled());
    }
}
