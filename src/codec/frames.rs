//! A framed byte-buffer container.
//!
//! The container stores a sequence of records, each wrapped as
//! `len32 | payload | len32`. The duplicated length word makes stepping
//! O(1) from either end, so a reader can consume the sequence forward or
//! backward without an index.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

/// Writer side of the container. Grows its backing buffer as needed.
#[derive(Default)]
pub struct FrameBufWriter {
    buf: BytesMut,
}

impl FrameBufWriter {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(n),
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Number of payload plus framing bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn push(&mut self, payload: &[u8]) {
        self.buf.put_u32(payload.len() as u32);
        self.buf.put_slice(payload);
        self.buf.put_u32(payload.len() as u32);
    }

    /// Takes the written frames out of the writer, leaving it empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// Reader side of the container. Maintains a cursor from each end so the
/// frames can be drained forward, backward, or from both sides.
#[derive(Default)]
pub struct FrameBufReader {
    buf: Bytes,
    head: usize,
    tail: usize,
}

impl FrameBufReader {
    pub fn reset(&mut self, buf: Bytes) {
        self.head = 0;
        self.tail = buf.len();
        self.buf = buf;
    }

    pub fn reset_empty(&mut self) {
        self.reset(Bytes::new());
    }

    pub fn end(&self) -> bool {
        self.head >= self.tail
    }

    /// Returns the payload of the frame under the forward cursor.
    pub fn get(&self) -> Result<Bytes> {
        let (start, len) = self.head_frame()?;
        Ok(self.buf.slice(start..start + len))
    }

    pub fn next(&mut self) {
        if let Ok((start, len)) = self.head_frame() {
            self.head = start + len + 4;
        } else {
            self.head = self.tail;
        }
    }

    /// Returns the payload of the frame under the backward cursor.
    pub fn get_back(&self) -> Result<Bytes> {
        let (start, len) = self.tail_frame()?;
        Ok(self.buf.slice(start..start + len))
    }

    pub fn next_back(&mut self) {
        if let Ok((start, _)) = self.tail_frame() {
            self.tail = start - 4;
        } else {
            self.tail = self.head;
        }
    }

    fn head_frame(&self) -> Result<(usize, usize)> {
        if self.end() {
            return Err(Error::Eof);
        }
        if self.head + 4 > self.tail {
            return Err(Error::corruption("framed buffer is truncated"));
        }
        let len =
            u32::from_be_bytes(self.buf[self.head..self.head + 4].try_into().unwrap()) as usize;
        let start = self.head + 4;
        if start + len + 4 > self.tail {
            return Err(Error::corruption("frame length exceeds buffer"));
        }
        Ok((start, len))
    }

    fn tail_frame(&self) -> Result<(usize, usize)> {
        if self.end() {
            return Err(Error::Eof);
        }
        if self.tail < self.head + 8 {
            return Err(Error::corruption("framed buffer is truncated"));
        }
        let len =
            u32::from_be_bytes(self.buf[self.tail - 4..self.tail].try_into().unwrap()) as usize;
        if self.tail < len + 8 || self.tail - 8 - len < self.head {
            return Err(Error::corruption("frame length exceeds buffer"));
        }
        let start = self.tail - 4 - len;
        Ok((start, len))
    }
}
