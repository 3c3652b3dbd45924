use std::collections::BTreeMap;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::codec;
use crate::config::RecordId;
use crate::error::{Error, Result};

/// Literal wire form of the head sentinel.
pub const POS_HEAD: &str = "head";
/// Literal wire form of the tail sentinel.
pub const POS_TAIL: &str = "tail";

/// Where a cursor stands, or should be placed.
///
/// The sentinels apply to every journal the cursor reads; the map form
/// pins each journal to a concrete record. On the wire the map is a
/// sequence of `len-prefixed journal id | chunk id u32 | offset i64`
/// encoded with URL-safe base64; the sentinels are the literal strings
/// `head` and `tail`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorPosition {
    Head,
    Tail,
    Map(BTreeMap<String, RecordId>),
}

impl CursorPosition {
    pub fn encode(&self) -> String {
        match self {
            CursorPosition::Head => POS_HEAD.to_string(),
            CursorPosition::Tail => POS_TAIL.to_string(),
            CursorPosition::Map(map) => {
                let mut buf = BytesMut::new();
                for (journal, rid) in map {
                    codec::write_bytes(&mut buf, journal.as_bytes());
                    buf.put_u32(rid.chunk_id);
                    buf.put_i64(rid.offset);
                }
                URL_SAFE_NO_PAD.encode(buf)
            }
        }
    }

    pub fn decode(text: &str) -> Result<CursorPosition> {
        match text.to_ascii_lowercase().as_str() {
            POS_HEAD => return Ok(CursorPosition::Head),
            POS_TAIL => return Ok(CursorPosition::Tail),
            _ => {}
        }
        let raw = URL_SAFE_NO_PAD
            .decode(text)
            .map_err(|_| Error::invalid_input(format!("cannot decode cursor position '{text}'")))?;
        let mut buf = Bytes::from(raw);
        let mut map = BTreeMap::new();
        while buf.has_remaining() {
            let journal = codec::read_string(&mut buf)?;
            let chunk_id = codec::read_u32(&mut buf)?;
            let offset = codec::read_i64(&mut buf)?;
            map.insert(journal, RecordId::new(chunk_id, offset));
        }
        Ok(CursorPosition::Map(map))
    }
}
