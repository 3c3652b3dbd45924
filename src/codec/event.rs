use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

use super::{read_bytes, read_i64, read_u32};

/// Flag in the message-length word marking an absent tag line.
const NO_TAG_LINE: u32 = 1 << 31;
const LEN_MASK: u32 = NO_TAG_LINE - 1;

/// One stored log record.
///
/// Layout on disk and on the wire:
/// `tagGroupId i64 | timestamp i64 | msgLen u32 | msg | [tagLen u32 | tagLine]`.
/// The high bit of the message-length word is set when the tag line is
/// absent. A tag line is only present on the first record of a run that
/// shares the same tags within a chunk.
///
/// `msg` and `tag_line` produced by [`LogEvent::unmarshal`] are zero-copy
/// slices of the source buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogEvent {
    /// Tag group this record belongs to, 0 when unassigned.
    pub tgid: i64,
    /// Nanoseconds since the epoch.
    pub ts: i64,
    /// Opaque message bytes, UTF-8 in practice.
    pub msg: Bytes,
    /// Canonical tag line, empty on records that inherit the run's tags.
    pub tag_line: Bytes,
}

impl LogEvent {
    pub fn new(ts: i64, msg: impl Into<Bytes>) -> Self {
        Self {
            tgid: 0,
            ts,
            msg: msg.into(),
            tag_line: Bytes::new(),
        }
    }

    pub fn with_tag_line(ts: i64, msg: impl Into<Bytes>, tag_line: impl Into<Bytes>) -> Self {
        Self {
            tgid: 0,
            ts,
            msg: msg.into(),
            tag_line: tag_line.into(),
        }
    }

    /// Size of the marshaled form.
    pub fn buf_size(&self) -> usize {
        if self.tag_line.is_empty() {
            20 + self.msg.len()
        } else {
            24 + self.msg.len() + self.tag_line.len()
        }
    }

    pub fn marshal(&self, dst: &mut BytesMut) {
        dst.reserve(self.buf_size());
        dst.put_i64(self.tgid);
        dst.put_i64(self.ts);
        if self.tag_line.is_empty() {
            dst.put_u32(self.msg.len() as u32 | NO_TAG_LINE);
            dst.put_slice(&self.msg);
        } else {
            dst.put_u32(self.msg.len() as u32);
            dst.put_slice(&self.msg);
            dst.put_u32(self.tag_line.len() as u32);
            dst.put_slice(&self.tag_line);
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.buf_size());
        self.marshal(&mut dst);
        dst.freeze()
    }

    pub fn unmarshal(buf: &mut Bytes) -> Result<LogEvent> {
        let tgid = read_i64(buf)?;
        let ts = read_i64(buf)?;
        let word = read_u32(buf)?;
        let msg_len = (word & LEN_MASK) as usize;
        if buf.len() < msg_len {
            return Err(Error::invalid_input("log event message is truncated"));
        }
        let msg = buf.split_to(msg_len);
        let tag_line = if word & NO_TAG_LINE == 0 {
            read_bytes(buf)?
        } else {
            Bytes::new()
        };
        Ok(LogEvent {
            tgid,
            ts,
            msg,
            tag_line,
        })
    }

    /// Overwrites the tag group id of a marshaled event in place. The rest
    /// of the buffer stays untouched, which is what lets the write path
    /// stamp ids without re-marshaling records.
    pub fn stamp_tgid(buf: &mut [u8], tgid: i64) -> Result<()> {
        if buf.len() < 8 {
            return Err(Error::invalid_input("buffer too short for a log event"));
        }
        buf[..8].copy_from_slice(&tgid.to_be_bytes());
        Ok(())
    }

    /// Message interpreted as UTF-8, with replacement characters on bad input.
    pub fn msg_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.msg)
    }

    pub fn tag_line_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.tag_line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_without_tag_line() {
        let ev = LogEvent::new(1234567890, &b"log line"[..]);
        let mut raw = ev.to_bytes();
        assert_eq!(raw.len(), ev.buf_size());
        let back = LogEvent::unmarshal(&mut raw).unwrap();
        assert_eq!(back, ev);
        assert!(raw.is_empty());
    }

    #[test]
    fn round_trip_with_tag_line() {
        let ev = LogEvent::with_tag_line(-5, &b"msg"[..], &b"|env=prod|"[..]);
        let mut raw = ev.to_bytes();
        let back = LogEvent::unmarshal(&mut raw).unwrap();
        assert_eq!(back.ts, -5);
        assert_eq!(&back.msg[..], b"msg");
        assert_eq!(&back.tag_line[..], b"|env=prod|");
    }

    #[test]
    fn absent_tag_line_sets_high_bit() {
        let ev = LogEvent::new(0, &b"x"[..]);
        let raw = ev.to_bytes();
        assert_eq!(raw[16] & 0x80, 0x80);
        let tagged = LogEvent::with_tag_line(0, &b"x"[..], &b"|a=b|"[..]);
        let raw = tagged.to_bytes();
        assert_eq!(raw[16] & 0x80, 0);
    }

    #[test]
    fn stamp_rewrites_only_the_group_id() {
        let ev = LogEvent::with_tag_line(77, &b"payload"[..], &b"|k=v|"[..]);
        let mut raw = ev.to_bytes().to_vec();
        LogEvent::stamp_tgid(&mut raw, 991).unwrap();
        let back = LogEvent::unmarshal(&mut Bytes::from(raw)).unwrap();
        assert_eq!(back.tgid, 991);
        assert_eq!(back.ts, 77);
        assert_eq!(&back.msg[..], b"payload");
        assert_eq!(&back.tag_line[..], b"|k=v|");
    }

    #[test]
    fn unmarshal_is_zero_copy() {
        let ev = LogEvent::new(1, &b"zero copy body"[..]);
        let raw = ev.to_bytes();
        let mut buf = raw.clone();
        let back = LogEvent::unmarshal(&mut buf).unwrap();
        assert_eq!(back.msg.as_ptr(), raw[20..].as_ptr());
    }

    #[test]
    fn truncated_buffers_error() {
        let ev = LogEvent::new(1, &b"abcdef"[..]);
        let raw = ev.to_bytes();
        for cut in [0, 7, 15, 19, raw.len() - 1] {
            let mut short = raw.slice(..cut);
            assert!(LogEvent::unmarshal(&mut short).is_err(), "cut at {cut}");
        }
    }
}
