use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use tracing::warn;

use crate::error::{Error, Result};

pub(crate) const CHUNK_HEADER_SIZE: u64 = 16;
/// Leading length word, trailing length word and the checksum.
pub(crate) const FRAME_META_SIZE: u64 = 12;
pub(crate) const CHUNK_FILE_EXTENSION: &str = "dat";

const CHUNK_MAGIC: u32 = 0x4B4A_4331; // "KJC1"
const CHUNK_VERSION: u16 = 1;

/// A single size-bounded file of a journal: a fixed header followed by
/// framed records. Only the journal's last chunk is ever appended to;
/// earlier chunks are immutable.
///
/// Record frame layout: `len u32 | payload | len u32 | crc32(payload)`.
/// The duplicated length word allows O(1) stepping backward, the CRC
/// guards the payload.
pub(crate) struct Chunk {
    id: u32,
    path: PathBuf,
    file: File,
    /// Logical size, equal to the file size. Readers never look past it.
    size: AtomicU64,
    created_at: SystemTime,
}

pub(crate) fn chunk_file_name(id: u32) -> String {
    format!("{id:010}.{CHUNK_FILE_EXTENSION}")
}

pub(crate) fn parse_chunk_file_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(&format!(".{CHUNK_FILE_EXTENSION}"))?;
    if stem.len() != 10 {
        return None;
    }
    stem.parse().ok()
}

fn encode_frame(dst: &mut Vec<u8>, payload: &[u8]) {
    let len = payload.len() as u32;
    dst.extend_from_slice(&len.to_be_bytes());
    dst.extend_from_slice(payload);
    dst.extend_from_slice(&len.to_be_bytes());
    dst.extend_from_slice(&crc32fast::hash(payload).to_be_bytes());
}

impl Chunk {
    pub(crate) fn create(dir: &Path, id: u32) -> Result<Chunk> {
        let path = dir.join(chunk_file_name(id));
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let mut header = [0u8; CHUNK_HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&CHUNK_MAGIC.to_be_bytes());
        header[4..6].copy_from_slice(&CHUNK_VERSION.to_be_bytes());
        header[8..12].copy_from_slice(&id.to_be_bytes());
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(Chunk {
            id,
            path,
            file,
            size: AtomicU64::new(CHUNK_HEADER_SIZE),
            created_at: SystemTime::now(),
        })
    }

    /// Opens an existing chunk. When `scan_tail` is set the record frames
    /// are validated from the front; on the first torn or corrupt frame the
    /// file is either truncated back to the last intact record (`recover`)
    /// or the open fails.
    pub(crate) fn open(path: &Path, scan_tail: bool, recover: bool) -> Result<Chunk> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let meta = file.metadata()?;
        let file_size = meta.len();

        if file_size < CHUNK_HEADER_SIZE {
            return Err(Error::corruption(format!(
                "chunk {} is too small for its header",
                path.display()
            )));
        }

        let mut header = [0u8; CHUNK_HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;
        let magic = u32::from_be_bytes(header[0..4].try_into().unwrap());
        let version = u16::from_be_bytes(header[4..6].try_into().unwrap());
        let id = u32::from_be_bytes(header[8..12].try_into().unwrap());
        if magic != CHUNK_MAGIC {
            return Err(Error::corruption(format!(
                "chunk {} has a bad magic word",
                path.display()
            )));
        }
        if version != CHUNK_VERSION {
            return Err(Error::corruption(format!(
                "chunk {} has unsupported version {version}",
                path.display()
            )));
        }

        let created_at = meta.created().unwrap_or_else(|_| SystemTime::now());
        let chunk = Chunk {
            id,
            path: path.to_path_buf(),
            file,
            size: AtomicU64::new(file_size),
            created_at,
        };

        if scan_tail {
            chunk.recover_tail(recover)?;
        }
        Ok(chunk)
    }

    fn recover_tail(&self, recover: bool) -> Result<()> {
        let size = self.size.load(Ordering::Acquire);
        let mut off = CHUNK_HEADER_SIZE;
        let mut scratch = Vec::new();
        while off < size {
            match self.check_frame(off, size, &mut scratch) {
                Ok(total) => off += total,
                Err(err) => {
                    if !recover {
                        return Err(Error::corruption(format!(
                            "chunk {} has a damaged record at offset {off}: {err}",
                            self.path.display()
                        )));
                    }
                    warn!(
                        chunk = self.id,
                        offset = off,
                        %err,
                        "truncating chunk back to the last intact record"
                    );
                    self.file.set_len(off)?;
                    self.file.sync_all()?;
                    self.size.store(off, Ordering::Release);
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn check_frame(&self, off: u64, size: u64, scratch: &mut Vec<u8>) -> Result<u64> {
        if off + 4 > size {
            return Err(Error::corruption("torn length word"));
        }
        let mut word = [0u8; 4];
        self.file.read_exact_at(&mut word, off)?;
        let len = u32::from_be_bytes(word) as u64;
        let total = len + FRAME_META_SIZE;
        if off + total > size {
            return Err(Error::corruption("frame runs past the end of the file"));
        }
        scratch.resize((len + 8) as usize, 0);
        self.file.read_exact_at(scratch, off + 4)?;
        let payload = &scratch[..len as usize];
        let suffix = u32::from_be_bytes(scratch[len as usize..len as usize + 4].try_into().unwrap());
        if suffix as u64 != len {
            return Err(Error::corruption("length suffix mismatch"));
        }
        let crc = u32::from_be_bytes(scratch[len as usize + 4..].try_into().unwrap());
        if crc != crc32fast::hash(payload) {
            return Err(Error::corruption("checksum mismatch"));
        }
        Ok(total)
    }

    #[inline]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub(crate) fn len(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn created_at(&self) -> SystemTime {
        self.created_at
    }

    pub(crate) fn modified_at(&self) -> SystemTime {
        self.file
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(self.created_at)
    }

    /// Appends a batch of record payloads as one write. Returns the offsets
    /// of every appended frame.
    pub(crate) fn append_frames(&self, payloads: &[&[u8]]) -> Result<Vec<u64>> {
        let start = self.size.load(Ordering::Acquire);
        let mut buf = Vec::with_capacity(
            payloads
                .iter()
                .map(|p| p.len() + FRAME_META_SIZE as usize)
                .sum(),
        );
        let mut offsets = Vec::with_capacity(payloads.len());
        for payload in payloads {
            offsets.push(start + buf.len() as u64);
            encode_frame(&mut buf, payload);
        }
        self.file
            .write_all_at(&buf, start)
            .map_err(|err| Error::transient(format!("chunk write failed: {err}")))?;
        self.size.store(start + buf.len() as u64, Ordering::Release);
        Ok(offsets)
    }

    /// Reads and verifies the frame starting at `off`. Returns the payload
    /// and the total frame size.
    pub(crate) fn read_frame(&self, off: u64, scratch: &mut Vec<u8>) -> Result<(usize, u64)> {
        let size = self.len();
        if off < CHUNK_HEADER_SIZE || off + 4 > size {
            return Err(Error::Eof);
        }
        let mut word = [0u8; 4];
        self.file.read_exact_at(&mut word, off)?;
        let len = u32::from_be_bytes(word) as u64;
        let total = len + FRAME_META_SIZE;
        if off + total > size {
            return Err(Error::corruption(format!(
                "record at {}:{off} runs past the chunk end",
                self.id
            )));
        }
        scratch.resize((len + 8) as usize, 0);
        self.file.read_exact_at(scratch, off + 4)?;
        let suffix = u32::from_be_bytes(scratch[len as usize..len as usize + 4].try_into().unwrap());
        if suffix as u64 != len {
            return Err(Error::corruption(format!(
                "record at {}:{off} has a length suffix mismatch",
                self.id
            )));
        }
        let crc = u32::from_be_bytes(scratch[len as usize + 4..].try_into().unwrap());
        if crc != crc32fast::hash(&scratch[..len as usize]) {
            return Err(Error::corruption(format!(
                "record at {}:{off} failed its checksum",
                self.id
            )));
        }
        scratch.truncate(len as usize);
        Ok((len as usize, total))
    }

    /// Offset of the frame that precedes the one at `off`, or None when
    /// `off` is the first record.
    pub(crate) fn prev_frame_offset(&self, off: u64) -> Result<Option<u64>> {
        if off <= CHUNK_HEADER_SIZE {
            return Ok(None);
        }
        if off < CHUNK_HEADER_SIZE + FRAME_META_SIZE {
            return Err(Error::corruption(format!(
                "impossible record offset {}:{off}",
                self.id
            )));
        }
        let mut word = [0u8; 4];
        self.file.read_exact_at(&mut word, off - 8)?;
        let len = u32::from_be_bytes(word) as u64;
        let total = len + FRAME_META_SIZE;
        if off < CHUNK_HEADER_SIZE + total {
            return Err(Error::corruption(format!(
                "broken reverse length word before {}:{off}",
                self.id
            )));
        }
        Ok(Some(off - total))
    }

    /// Offset of the last record frame in the chunk, None when empty.
    pub(crate) fn last_frame_offset(&self) -> Result<Option<u64>> {
        let size = self.len();
        if size <= CHUNK_HEADER_SIZE {
            return Ok(None);
        }
        self.prev_frame_offset(size)
    }

    pub(crate) fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    pub(crate) fn remove_file(&self) -> Result<()> {
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn payloads<'a>(items: &'a [&'a str]) -> Vec<&'a [u8]> {
        items.iter().map(|s| s.as_bytes()).collect()
    }

    #[test]
    fn file_name_round_trip() {
        assert_eq!(chunk_file_name(7), "0000000007.dat");
        assert_eq!(parse_chunk_file_name("0000000007.dat"), Some(7));
        assert_eq!(parse_chunk_file_name("7.dat"), None);
        assert_eq!(parse_chunk_file_name("0000000007.tmp"), None);
    }

    #[test]
    fn append_then_read_frames() {
        let dir = TempDir::new().unwrap();
        let chunk = Chunk::create(dir.path(), 1).unwrap();
        let offs = chunk.append_frames(&payloads(&["first", "second"])).unwrap();
        assert_eq!(offs[0], CHUNK_HEADER_SIZE);

        let mut scratch = Vec::new();
        let (len, total) = chunk.read_frame(offs[0], &mut scratch).unwrap();
        assert_eq!(&scratch[..len], b"first");
        assert_eq!(offs[0] + total, offs[1]);
        chunk.read_frame(offs[1], &mut scratch).unwrap();
        assert_eq!(&scratch[..], b"second");
    }

    #[test]
    fn reverse_stepping() {
        let dir = TempDir::new().unwrap();
        let chunk = Chunk::create(dir.path(), 1).unwrap();
        let offs = chunk.append_frames(&payloads(&["a", "bb", "ccc"])).unwrap();

        let last = chunk.last_frame_offset().unwrap().unwrap();
        assert_eq!(last, offs[2]);
        let mid = chunk.prev_frame_offset(last).unwrap().unwrap();
        assert_eq!(mid, offs[1]);
        let first = chunk.prev_frame_offset(mid).unwrap().unwrap();
        assert_eq!(first, offs[0]);
        assert_eq!(chunk.prev_frame_offset(first).unwrap(), None);
    }

    #[test]
    fn reopen_keeps_records() {
        let dir = TempDir::new().unwrap();
        let offs;
        {
            let chunk = Chunk::create(dir.path(), 3).unwrap();
            offs = chunk.append_frames(&payloads(&["persisted"])).unwrap();
            chunk.sync().unwrap();
        }
        let path = dir.path().join(chunk_file_name(3));
        let chunk = Chunk::open(&path, true, false).unwrap();
        assert_eq!(chunk.id(), 3);
        let mut scratch = Vec::new();
        chunk.read_frame(offs[0], &mut scratch).unwrap();
        assert_eq!(&scratch[..], b"persisted");
    }

    #[test]
    fn torn_tail_is_truncated_when_recovery_is_on() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(chunk_file_name(1));
        {
            let chunk = Chunk::create(dir.path(), 1).unwrap();
            chunk.append_frames(&payloads(&["keep", "lose"])).unwrap();
            chunk.sync().unwrap();
        }
        // cut into the middle of the second frame
        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 5).unwrap();

        let chunk = Chunk::open(&path, true, true).unwrap();
        let last = chunk.last_frame_offset().unwrap().unwrap();
        let mut scratch = Vec::new();
        chunk.read_frame(last, &mut scratch).unwrap();
        assert_eq!(&scratch[..], b"keep");
    }

    #[test]
    fn torn_tail_fails_without_recovery() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(chunk_file_name(1));
        {
            let chunk = Chunk::create(dir.path(), 1).unwrap();
            chunk.append_frames(&payloads(&["data"])).unwrap();
        }
        let full = std::fs::metadata(&path).unwrap().len();
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(full - 2).unwrap();

        assert!(matches!(
            Chunk::open(&path, true, false),
            Err(Error::Corruption(_))
        ));
    }

    #[test]
    fn corrupt_checksum_is_detected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(chunk_file_name(1));
        let off;
        {
            let chunk = Chunk::create(dir.path(), 1).unwrap();
            off = chunk.append_frames(&payloads(&["payload"])).unwrap()[0];
        }
        // flip a payload byte without touching the framing
        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        file.write_all_at(b"P", off + 4).unwrap();

        let chunk = Chunk::open(&path, false, false).unwrap();
        let mut scratch = Vec::new();
        assert!(matches!(
            chunk.read_frame(off, &mut scratch),
            Err(Error::Corruption(_))
        ));
    }
}
