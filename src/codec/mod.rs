//! Serialization primitives shared by the on-disk and wire formats.
//!
//! Everything is big-endian. Strings are a 4-byte length followed by the
//! raw bytes. [`read_bytes`] slices the source buffer without copying, so
//! the returned view is only valid while the backing buffer is; use
//! [`read_string`] when the bytes must outlive it.

mod event;
mod frames;

pub use event::LogEvent;
pub use frames::{FrameBufReader, FrameBufWriter};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

fn short_buf(what: &str, need: usize, have: usize) -> Error {
    Error::invalid_input(format!(
        "{what} needs {need} bytes, but only {have} are available"
    ))
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16> {
    if buf.remaining() < 2 {
        return Err(short_buf("u16", 2, buf.remaining()));
    }
    Ok(buf.get_u16())
}

pub fn read_u32(buf: &mut Bytes) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(short_buf("u32", 4, buf.remaining()));
    }
    Ok(buf.get_u32())
}

pub fn read_i64(buf: &mut Bytes) -> Result<i64> {
    if buf.remaining() < 8 {
        return Err(short_buf("i64", 8, buf.remaining()));
    }
    Ok(buf.get_i64())
}

/// Reads a length-prefixed byte string as a zero-copy slice of `buf`.
pub fn read_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let ln = read_u32(buf)? as usize;
    if buf.remaining() < ln {
        return Err(short_buf("string body", ln, buf.remaining()));
    }
    Ok(buf.split_to(ln))
}

/// Reads a length-prefixed string into owned memory, validating UTF-8.
pub fn read_string(buf: &mut Bytes) -> Result<String> {
    let raw = read_bytes(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| Error::invalid_input("string is not valid UTF-8"))
}

/// Writes a length-prefixed byte string.
pub fn write_bytes(dst: &mut BytesMut, v: &[u8]) {
    dst.put_u32(v.len() as u32);
    dst.put_slice(v);
}
