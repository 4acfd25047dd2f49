//! Persisted read position of a durable queue.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32Hasher;
use tracing::warn;

const CURSOR_FILE: &str = "cursor";
const CURSOR_LEN: usize = 8 + 8 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Position {
    pub segment: u64,
    pub offset: u64,
}

impl Position {
    fn encode(&self) -> [u8; CURSOR_LEN] {
        let mut buf = [0u8; CURSOR_LEN];
        buf[..8].copy_from_slice(&self.segment.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        let crc = checksum(&buf[..16]);
        buf[16..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(raw: &[u8]) -> Option<Self> {
        if raw.len() != CURSOR_LEN {
            return None;
        }
        let mut crc_bytes = [0u8; 4];
        crc_bytes.copy_from_slice(&raw[16..]);
        if checksum(&raw[..16]) != u32::from_le_bytes(crc_bytes) {
            return None;
        }
        let mut segment = [0u8; 8];
        segment.copy_from_slice(&raw[..8]);
        let mut offset = [0u8; 8];
        offset.copy_from_slice(&raw[8..16]);
        Some(Self {
            segment: u64::from_le_bytes(segment),
            offset: u64::from_le_bytes(offset),
        })
    }
}

fn checksum(data: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub(crate) fn cursor_path(dir: &Path) -> PathBuf {
    dir.join(CURSOR_FILE)
}

/// Loads the saved position. A missing or damaged cursor yields `None`,
/// which replays from the oldest segment (at-least-once).
pub(crate) fn load(dir: &Path) -> io::Result<Option<Position>> {
    let path = cursor_path(dir);
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let position = Position::decode(&raw);
    if position.is_none() {
        warn!(target: "producer::queue", path = %path.display(), "cursor damaged, replaying from oldest segment");
    }
    Ok(position)
}

/// Fixed-size cursor file rewritten in place after every dequeue.
#[derive(Debug)]
pub(crate) struct CursorFile {
    file: File,
}

impl CursorFile {
    pub fn open(dir: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(cursor_path(dir))?;
        Ok(Self { file })
    }

    pub fn store(&mut self, position: Position) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&position.encode())?;
        self.file.set_len(CURSOR_LEN as u64)
    }

    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}
