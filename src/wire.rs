//! The ingest payload: one write packet.
//!
//! A packet is a framed container holding, in order: the source journal
//! id as a length-prefixed string, one log event with a non-empty tag
//! line that declares the batch's tags, and any number of events with an
//! empty tag line that inherit them. Packets violating that shape are
//! rejected before anything touches a journal.

use bytes::{Bytes, BytesMut};

use crate::codec::{FrameBufReader, FrameBufWriter, LogEvent};
use crate::error::{Error, Result};
use crate::tags::TagLine;

/// A decoded batch of records bound for one journal.
pub struct WritePacket {
    source_id: String,
    tag_line: TagLine,
    /// Marshaled events, first one carrying the tag line. Mutable so the
    /// write path can stamp group ids in place.
    records: Vec<BytesMut>,
}

impl WritePacket {
    /// Assembles a packet from parts, marshaling the events. The first
    /// record carries the tag line, the rest leave it empty.
    pub fn assemble(
        source_id: &str,
        tag_line: &TagLine,
        events: &[(i64, &[u8])],
    ) -> Result<WritePacket> {
        if events.is_empty() {
            return Err(Error::invalid_input("a write packet needs records"));
        }
        if tag_line.is_empty() {
            return Err(Error::invalid_input("a write packet needs a tag line"));
        }
        let mut records = Vec::with_capacity(events.len());
        for (i, (ts, msg)) in events.iter().enumerate() {
            let ev = if i == 0 {
                LogEvent::with_tag_line(*ts, msg.to_vec(), tag_line.as_str().as_bytes().to_vec())
            } else {
                LogEvent::new(*ts, msg.to_vec())
            };
            let mut buf = BytesMut::with_capacity(ev.buf_size());
            ev.marshal(&mut buf);
            records.push(buf);
        }
        validate_source_id(source_id)?;
        Ok(WritePacket {
            source_id: source_id.to_string(),
            tag_line: tag_line.clone(),
            records,
        })
    }

    /// Decodes the wire form of a packet.
    pub fn decode(payload: Bytes) -> Result<WritePacket> {
        let mut frames = FrameBufReader::default();
        frames.reset(payload);

        if frames.end() {
            return Err(Error::invalid_input("empty write packet"));
        }
        let source_id = String::from_utf8(frames.get()?.to_vec())
            .map_err(|_| Error::invalid_input("packet source id is not valid UTF-8"))?;
        validate_source_id(&source_id)?;
        frames.next();

        let mut records = Vec::new();
        let mut tag_line = TagLine::default();
        while !frames.end() {
            let raw = frames.get()?;
            let mut view = raw.clone();
            let ev = LogEvent::unmarshal(&mut view)?;
            if !view.is_empty() {
                return Err(Error::invalid_input("trailing bytes after a packet record"));
            }
            if records.is_empty() {
                if ev.tag_line.is_empty() {
                    return Err(Error::invalid_input(
                        "the first record of a packet must declare a tag line",
                    ));
                }
                tag_line = TagLine::from(
                    std::str::from_utf8(&ev.tag_line)
                        .map_err(|_| Error::invalid_input("packet tag line is not valid UTF-8"))?,
                );
            } else if !ev.tag_line.is_empty() {
                return Err(Error::invalid_input(
                    "only the first record of a packet may carry a tag line",
                ));
            }
            records.push(BytesMut::from(&raw[..]));
            frames.next();
        }

        if records.is_empty() {
            return Err(Error::invalid_input("a write packet needs records"));
        }
        Ok(WritePacket {
            source_id,
            tag_line,
            records,
        })
    }

    /// Serializes the packet for the wire.
    pub fn encode(&self) -> Bytes {
        let mut w = FrameBufWriter::with_capacity(
            self.records.iter().map(|r| r.len() + 8).sum::<usize>() + self.source_id.len() + 8,
        );
        w.push(self.source_id.as_bytes());
        for rec in &self.records {
            w.push(rec);
        }
        w.take()
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn tag_line(&self) -> &TagLine {
        &self.tag_line
    }

    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Mutable access for the group-id stamping step of the write path.
    pub(crate) fn records_mut(&mut self) -> &mut [BytesMut] {
        &mut self.records
    }

    pub(crate) fn records(&self) -> &[BytesMut] {
        &self.records
    }
}

/// Journal ids name directories, so they are kept printable and long
/// enough for the two-character shard convention.
pub(crate) fn validate_source_id(id: &str) -> Result<()> {
    if id.len() < 2 {
        return Err(Error::invalid_input(format!(
            "journal id '{id}' is shorter than 2 characters"
        )));
    }
    if !id
        .chars()
        .all(|c| c.is_ascii_graphic() && c != '/' && c != '\\')
    {
        return Err(Error::invalid_input(format!(
            "journal id '{id}' contains characters unfit for a directory name"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> WritePacket {
        WritePacket::assemble(
            "svc-a",
            &TagLine::from("|env=prod|"),
            &[
                (1, b"first".as_slice()),
                (2, b"second".as_slice()),
                (3, b"third".as_slice()),
            ],
        )
        .unwrap()
    }

    #[test]
    fn encode_decode_round_trip() {
        let packet = sample();
        let decoded = WritePacket::decode(packet.encode()).unwrap();
        assert_eq!(decoded.source_id(), "svc-a");
        assert_eq!(decoded.tag_line(), &TagLine::from("|env=prod|"));
        assert_eq!(decoded.record_count(), 3);

        let mut first = Bytes::copy_from_slice(&decoded.records()[0]);
        let ev = LogEvent::unmarshal(&mut first).unwrap();
        assert_eq!(&ev.tag_line[..], b"|env=prod|");
        let mut second = Bytes::copy_from_slice(&decoded.records()[1]);
        let ev = LogEvent::unmarshal(&mut second).unwrap();
        assert!(ev.tag_line.is_empty());
    }

    #[test]
    fn missing_source_id_is_rejected() {
        assert!(matches!(
            WritePacket::decode(Bytes::new()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn first_record_must_declare_tags() {
        let mut w = FrameBufWriter::default();
        w.push(b"svc-a");
        let ev = LogEvent::new(1, &b"untagged"[..]);
        w.push(&ev.to_bytes());
        assert!(matches!(
            WritePacket::decode(w.take()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn later_records_may_not_redeclare_tags() {
        let mut w = FrameBufWriter::default();
        w.push(b"svc-a");
        let ev = LogEvent::with_tag_line(1, &b"ok"[..], &b"|a=1|"[..]);
        w.push(&ev.to_bytes());
        let ev = LogEvent::with_tag_line(2, &b"bad"[..], &b"|b=2|"[..]);
        w.push(&ev.to_bytes());
        assert!(matches!(
            WritePacket::decode(w.take()),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn short_source_ids_are_rejected() {
        assert!(WritePacket::assemble("x", &TagLine::from("|a=1|"), &[(1, b"m".as_slice())]).is_err());
        assert!(validate_source_id("a/b").is_err());
        assert!(validate_source_id("svc-a").is_ok());
    }

    #[test]
    fn packet_without_records_is_rejected() {
        let mut w = FrameBufWriter::default();
        w.push(b"svc-a");
        assert!(matches!(
            WritePacket::decode(w.take()),
            Err(Error::InvalidInput(_))
        ));
    }
}
