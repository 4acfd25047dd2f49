//! Segment files backing the durable queue.
//!
//! ```text
//! header  : magic [8] | version u32 | reserved u32
//! record* : len u32 | crc32 u32 | payload [len]
//! ```
//! All integers are little endian.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use crc32fast::Hasher as Crc32Hasher;
use tracing::warn;

use crate::core::error::{PacketError, QueueError};

const HEADER_MAGIC: &[u8; 8] = b"BLIPFQ\0\0";
const HEADER_VERSION: u32 = 1;
pub(crate) const HEADER_LEN: u64 = 16;
pub(crate) const RECORD_HEADER_LEN: u64 = 8;

/// Upper bound on a single record; anything larger is treated as corruption.
const MAX_RECORD_LEN: u64 = 1 << 30;

pub(crate) fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("seg-{id:010}.log"))
}

pub(crate) fn parse_segment_id(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("seg-")
        .and_then(|s| s.strip_suffix(".log"))
        .and_then(|s| s.parse::<u64>().ok())
}

/// Size on disk of a record carrying `payload_len` bytes.
pub(crate) fn record_len(payload_len: usize) -> u64 {
    RECORD_HEADER_LEN + payload_len as u64
}

fn crc(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Append handle for the active segment.
#[derive(Debug)]
pub(crate) struct SegmentWriter {
    pub id: u64,
    pub path: PathBuf,
    file: File,
    pub size: u64,
    unsynced: usize,
}

impl SegmentWriter {
    /// Creates a brand-new segment, truncating any leftover file with the same id.
    pub fn create(dir: &Path, id: u64) -> Result<Self, QueueError> {
        let path = segment_path(dir, id);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; HEADER_LEN as usize];
        header[..8].copy_from_slice(HEADER_MAGIC);
        header[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
        file.write_all(&header)?;

        Ok(Self {
            id,
            path,
            file,
            size: HEADER_LEN,
            unsynced: 0,
        })
    }

    pub fn has_records(&self) -> bool {
        self.size > HEADER_LEN
    }

    /// Appends one record as a single write.
    pub fn append(&mut self, payload: &[u8]) -> Result<(), QueueError> {
        if payload.len() as u64 > MAX_RECORD_LEN {
            return Err(PacketError::TooLarge {
                field: "record",
                len: payload.len(),
            }
            .into());
        }
        let len = payload.len() as u32;

        let mut buf = Vec::with_capacity(record_len(payload.len()) as usize);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&crc(payload).to_le_bytes());
        buf.extend_from_slice(payload);
        self.file.write_all(&buf)?;

        self.size += buf.len() as u64;
        self.unsynced += 1;
        Ok(())
    }

    /// fsync once `every_n` records have piled up since the last sync.
    pub fn maybe_sync(&mut self, every_n: Option<usize>) -> io::Result<()> {
        match every_n {
            Some(n) if self.unsynced >= n.max(1) => self.sync(),
            _ => Ok(()),
        }
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()?;
        self.unsynced = 0;
        Ok(())
    }
}

/// Read handle positioned on one segment.
#[derive(Debug)]
pub(crate) struct SegmentReader {
    pub id: u64,
    file: File,
}

impl SegmentReader {
    pub fn open(dir: &Path, id: u64) -> Result<Self, QueueError> {
        let file = File::open(segment_path(dir, id))?;
        Ok(Self { id, file })
    }

    /// Reads the record starting at `offset`, returning its payload.
    ///
    /// The caller guarantees a complete record lies before the segment's
    /// known end, so a short read here is corruption.
    pub fn read_at(&mut self, offset: u64) -> Result<Bytes, QueueError> {
        self.file.seek(SeekFrom::Start(offset))?;
        match read_record(&mut self.file)? {
            RecordRead::Record(payload) => Ok(payload),
            RecordRead::End => Err(QueueError::Corruption(format!(
                "segment {} truncated at offset {offset}",
                self.id
            ))),
            RecordRead::Corrupt(reason) => Err(QueueError::Corruption(format!(
                "segment {} at offset {offset}: {reason}",
                self.id
            ))),
        }
    }
}

enum RecordRead {
    Record(Bytes),
    /// Clean EOF or a torn tail left by a crash mid-append.
    End,
    Corrupt(String),
}

fn read_record<R: Read>(reader: &mut R) -> io::Result<RecordRead> {
    let mut header = [0u8; RECORD_HEADER_LEN as usize];
    if !read_full(reader, &mut header)? {
        return Ok(RecordRead::End);
    }

    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[..4]);
    let len = u32::from_le_bytes(len_bytes) as u64;
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&header[4..8]);
    let expected = u32::from_le_bytes(crc_bytes);

    if len > MAX_RECORD_LEN {
        return Ok(RecordRead::Corrupt(format!("implausible record length {len}")));
    }

    let mut payload = vec![0u8; len as usize];
    if !read_full(reader, &mut payload)? {
        return Ok(RecordRead::End);
    }

    let actual = crc(&payload);
    if actual != expected {
        return Ok(RecordRead::Corrupt(format!(
            "CRC mismatch: expected {expected:08x}, got {actual:08x}"
        )));
    }
    Ok(RecordRead::Record(Bytes::from(payload)))
}

/// Fills `buf` completely; `false` when EOF hits first.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    let mut read = 0usize;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => return Ok(false),
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Result of scanning a segment left over from an earlier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SegmentScan {
    /// Offset just past the last intact record.
    pub end: u64,
    /// Intact records at or after the requested start offset.
    pub pending: usize,
}

/// Walks every record in a sealed segment, stopping at the first torn or
/// corrupt record. A segment with a bad header scans as empty.
pub(crate) fn scan(path: &Path, start: u64) -> Result<SegmentScan, QueueError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut header = [0u8; HEADER_LEN as usize];
    let header_ok = read_full(&mut reader, &mut header)?
        && &header[..8] == HEADER_MAGIC
        && header[8..12] == HEADER_VERSION.to_le_bytes();
    if !header_ok {
        warn!(target: "producer::queue", path = %path.display(), "segment header invalid, ignoring segment");
        return Ok(SegmentScan { end: 0, pending: 0 });
    }

    let mut offset = HEADER_LEN;
    let mut pending = 0usize;
    loop {
        match read_record(&mut reader)? {
            RecordRead::Record(payload) => {
                if offset >= start {
                    pending += 1;
                }
                offset += record_len(payload.len());
            }
            RecordRead::End => break,
            RecordRead::Corrupt(reason) => {
                warn!(
                    target: "producer::queue",
                    path = %path.display(),
                    offset,
                    %reason,
                    "corrupt record, discarding rest of segment"
                );
                break;
            }
        }
    }

    Ok(SegmentScan { end: offset, pending })
}

pub(crate) fn remove_segment(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(target: "producer::queue", path = %path.display(), error = %e, "failed to remove segment");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn scan_counts_records_after_start() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), 1).unwrap();
        writer.append(b"one").unwrap();
        let second = writer.size;
        writer.append(b"two").unwrap();
        writer.append(b"three").unwrap();

        let all = scan(&writer.path, HEADER_LEN).unwrap();
        assert_eq!(all, SegmentScan { end: writer.size, pending: 3 });

        let tail = scan(&writer.path, second).unwrap();
        assert_eq!(tail.pending, 2);
    }

    #[test]
    fn torn_tail_is_ignored() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), 7).unwrap();
        writer.append(b"intact").unwrap();
        let intact_end = writer.size;
        writer.append(b"will be torn").unwrap();
        drop(writer);

        let path = segment_path(dir.path(), 7);
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(intact_end + 5).unwrap();

        let result = scan(&path, HEADER_LEN).unwrap();
        assert_eq!(result, SegmentScan { end: intact_end, pending: 1 });
    }

    #[test]
    fn reader_detects_crc_mismatch() {
        let dir = TempDir::new().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), 2).unwrap();
        writer.append(b"payload").unwrap();
        drop(writer);

        let path = segment_path(dir.path(), 2);
        let mut raw = fs::read(&path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        fs::write(&path, raw).unwrap();

        let mut reader = SegmentReader::open(dir.path(), 2).unwrap();
        assert!(matches!(reader.read_at(HEADER_LEN), Err(QueueError::Corruption(_))));
        assert_eq!(scan(&path, HEADER_LEN).unwrap().pending, 0);
    }

    #[test]
    fn segment_names_round_trip_ids() {
        let path = segment_path(Path::new("/tmp"), 42);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "seg-0000000042.log");
        assert_eq!(parse_segment_id(name), Some(42));
        assert_eq!(parse_segment_id("cursor"), None);
    }
}
