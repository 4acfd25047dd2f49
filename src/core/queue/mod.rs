//! Disk-backed FIFO buffering packets between callers and delivery workers.
//!
//! Packets are appended to size-bounded segment files under one directory per
//! destination. A persisted cursor remembers how far consumers have read, so
//! a restart resumes with the first unconsumed packet. Fully drained segments
//! are deleted as soon as the read position moves past them.
//!
//! Enqueue is a plain local write and never waits on consumers. Dequeue is
//! async, does its file reads on the blocking pool and parks the caller until
//! a packet arrives or the queue is closed and drained.

mod cursor;
mod segment;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::core::error::QueueError;
use crate::core::packet::Packet;

use cursor::{CursorFile, Position};
use segment::{SegmentReader, SegmentWriter, HEADER_LEN};

#[derive(Debug, Clone, Copy)]
struct SealedSegment {
    /// Offset just past the last record.
    end: u64,
    /// Records not yet handed to a consumer.
    remaining: usize,
}

#[derive(Debug)]
struct QueueState {
    sealed: BTreeMap<u64, SealedSegment>,
    writer: SegmentWriter,
    active_remaining: usize,
    reader: Option<SegmentReader>,
    read: Position,
    cursor: CursorFile,
    pending: usize,
    closed: bool,
}

#[derive(Debug)]
pub struct DurableQueue {
    name: String,
    dir: PathBuf,
    segment_size: u64,
    fsync_every_n: Option<usize>,
    state: Mutex<QueueState>,
    available: Notify,
}

impl DurableQueue {
    /// Opens (or creates) the queue stored under `config.directory/name`.
    ///
    /// With `discard_existing` every segment left by a previous run is
    /// deleted; otherwise unconsumed packets are kept and come out first.
    pub fn open(config: &QueueConfig, name: &str, discard_existing: bool) -> Result<Self, QueueError> {
        if config.segment_size_bytes == 0 {
            return Err(QueueError::InvalidConfig(
                "segment_size_bytes must be greater than 0".to_string(),
            ));
        }

        let dir = config.directory.join(name);
        fs::create_dir_all(&dir)?;

        let mut segments = list_segments(&dir)?;
        let saved = if discard_existing {
            if !segments.is_empty() {
                info!(target: "producer::queue", queue = name, segments = segments.len(), "discarding packets from previous run");
            }
            for path in segments.values() {
                segment::remove_segment(path);
            }
            segments.clear();
            remove_if_exists(&cursor::cursor_path(&dir))?;
            None
        } else {
            cursor::load(&dir)?
        };

        // Segments before the cursor were drained but not yet deleted.
        if let Some(pos) = saved {
            let stale: Vec<u64> = segments.range(..pos.segment).map(|(id, _)| *id).collect();
            for id in stale {
                if let Some(path) = segments.remove(&id) {
                    segment::remove_segment(&path);
                }
            }
        }

        let mut sealed = BTreeMap::new();
        let mut pending = 0usize;
        for (&id, path) in &segments {
            let start = match saved {
                Some(pos) if pos.segment == id => pos.offset.max(HEADER_LEN),
                _ => HEADER_LEN,
            };
            let scan = segment::scan(path, start)?;
            pending += scan.pending;
            sealed.insert(
                id,
                SealedSegment {
                    end: scan.end,
                    remaining: scan.pending,
                },
            );
        }

        let last_id = segments
            .keys()
            .next_back()
            .copied()
            .into_iter()
            .chain(saved.map(|p| p.segment))
            .max();
        let writer = SegmentWriter::create(&dir, last_id.map_or(1, |id| id + 1))?;

        let read = match sealed.keys().next() {
            Some(&first) => Position {
                segment: first,
                offset: match saved {
                    Some(pos) if pos.segment == first => pos.offset.max(HEADER_LEN),
                    _ => HEADER_LEN,
                },
            },
            None => Position {
                segment: writer.id,
                offset: HEADER_LEN,
            },
        };

        let mut cursor = CursorFile::open(&dir)?;
        cursor.store(read)?;

        let mut state = QueueState {
            sealed,
            writer,
            active_remaining: 0,
            reader: None,
            read,
            cursor,
            pending,
            closed: false,
        };
        state.reclaim_drained(&dir)?;

        info!(
            target: "producer::queue",
            queue = name,
            dir = %dir.display(),
            pending,
            segments = state.sealed.len() + 1,
            "durable queue opened"
        );

        Ok(Self {
            name: name.to_string(),
            dir,
            segment_size: config.segment_size_bytes,
            fsync_every_n: config.fsync_every_n,
            state: Mutex::new(state),
            available: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Appends a packet at the tail. Fails only once the queue is closed
    /// or the local write itself fails.
    pub fn enqueue(&self, packet: &Packet) -> Result<(), QueueError> {
        self.append(packet, false)
    }

    /// Puts a packet that was already dequeued back at the tail. Accepted
    /// even after [`close`](Self::close), so a packet a consumer could not
    /// finish stays on disk for the next run.
    pub fn requeue(&self, packet: &Packet) -> Result<(), QueueError> {
        self.append(packet, true)?;
        debug!(target: "producer::queue", queue = %self.name, packet = %packet.id(), "packet requeued");
        Ok(())
    }

    fn append(&self, packet: &Packet, after_close: bool) -> Result<(), QueueError> {
        let encoded = packet.encode()?;
        {
            let mut state = self.state.lock();
            if state.closed && !after_close {
                return Err(QueueError::Closed);
            }

            let needed = segment::record_len(encoded.len());
            if state.writer.has_records() && state.writer.size + needed > self.segment_size {
                state.roll(&self.dir)?;
            }

            state.writer.append(&encoded)?;
            state.writer.maybe_sync(self.fsync_every_n)?;
            state.active_remaining += 1;
            state.pending += 1;
        }
        self.available.notify_one();
        Ok(())
    }

    /// Takes the head packet without waiting. `Ok(None)` means the queue is
    /// currently empty; `Err(Closed)` means it is closed and fully drained.
    pub fn try_dequeue(&self) -> Result<Option<Packet>, QueueError> {
        let mut state = self.state.lock();
        loop {
            match state.pop(&self.dir)? {
                Some(raw) => match Packet::decode(raw) {
                    Ok(packet) => return Ok(Some(packet)),
                    Err(e) => {
                        warn!(target: "producer::queue", queue = %self.name, error = %e, "undecodable packet skipped");
                    }
                },
                None if state.closed => return Err(QueueError::Closed),
                None => return Ok(None),
            }
        }
    }

    /// Waits for the head packet. Each packet is returned to exactly one
    /// caller. After [`close`](Self::close) the remaining packets are still
    /// handed out, then every call fails with [`QueueError::Closed`].
    ///
    /// Cancel-safe: a packet read on behalf of a dropped call is requeued at
    /// the tail rather than lost.
    pub async fn dequeue(self: &Arc<Self>) -> Result<Packet, QueueError> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent enqueue/close is not missed.
            notified.as_mut().enable();

            if let Some(packet) = self.read_blocking().await? {
                return Ok(packet);
            }
            notified.await;
        }
    }

    /// Runs [`try_dequeue`](Self::try_dequeue) on the blocking pool: segment
    /// reads, cursor rewrites and segment deletes are synchronous file I/O.
    async fn read_blocking(self: &Arc<Self>) -> Result<Option<Packet>, QueueError> {
        let (tx, rx) = oneshot::channel();
        let queue = Arc::clone(self);
        tokio::task::spawn_blocking(move || {
            if let Err(Ok(Some(packet))) = tx.send(queue.try_dequeue()) {
                if let Err(e) = queue.requeue(&packet) {
                    error!(
                        target: "producer::queue",
                        queue = %queue.name,
                        packet = %packet.id(),
                        error = %e,
                        "failed to requeue packet of a cancelled dequeue"
                    );
                }
            }
        });
        rx.await
            .map_err(|_| QueueError::Io(io::Error::other("dequeue task ended without a result")))?
    }

    /// Stops accepting packets and wakes every waiting consumer.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        info!(target: "producer::queue", queue = %self.name, "durable queue closed");
        self.available.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Packets enqueued but not yet dequeued.
    pub fn len(&self) -> usize {
        self.state.lock().pending
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Segment files currently on disk, including the active one.
    pub fn segment_count(&self) -> usize {
        self.state.lock().sealed.len() + 1
    }

    /// Forces the active segment and the cursor to stable storage.
    pub fn flush(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.writer.sync()?;
        state.cursor.sync()?;
        Ok(())
    }
}

impl QueueState {
    fn roll(&mut self, dir: &Path) -> Result<(), QueueError> {
        self.writer.sync()?;
        let next = SegmentWriter::create(dir, self.writer.id + 1)?;
        let old = std::mem::replace(&mut self.writer, next);
        self.sealed.insert(
            old.id,
            SealedSegment {
                end: old.size,
                remaining: std::mem::take(&mut self.active_remaining),
            },
        );
        debug!(
            target: "producer::queue",
            sealed = old.id,
            path = %old.path.display(),
            active = self.writer.id,
            bytes = old.size,
            "segment rolled over"
        );
        Ok(())
    }

    fn end_of(&self, id: u64) -> Option<u64> {
        if id == self.writer.id {
            Some(self.writer.size)
        } else {
            self.sealed.get(&id).map(|s| s.end)
        }
    }

    fn next_segment_after(&self, id: u64) -> u64 {
        self.sealed
            .range(id + 1..)
            .next()
            .map_or(self.writer.id, |(next, _)| *next)
    }

    /// Deletes sealed segments the read position has fully consumed and
    /// moves the position to the next segment.
    fn reclaim_drained(&mut self, dir: &Path) -> io::Result<()> {
        let mut moved = false;
        while self.read.segment != self.writer.id {
            if let Some(seg) = self.sealed.get(&self.read.segment) {
                if self.read.offset < seg.end {
                    break;
                }
            }
            let drained = self.read.segment;
            if let Some(seg) = self.sealed.remove(&drained) {
                // Whatever the segment still claimed is unreachable now.
                self.pending = self.pending.saturating_sub(seg.remaining);
            }
            if self.reader.as_ref().is_some_and(|r| r.id == drained) {
                self.reader = None;
            }
            segment::remove_segment(&segment::segment_path(dir, drained));
            debug!(target: "producer::queue", segment = drained, "drained segment reclaimed");

            self.read = Position {
                segment: self.next_segment_after(drained),
                offset: HEADER_LEN,
            };
            moved = true;
        }
        if moved {
            self.cursor.store(self.read)?;
        }
        Ok(())
    }

    /// Gives up on the rest of the segment under the read position.
    fn skip_segment(&mut self, dir: &Path) -> Result<(), QueueError> {
        if self.read.segment == self.writer.id {
            self.roll(dir)?;
        }
        if let Some(seg) = self.sealed.get_mut(&self.read.segment) {
            seg.end = self.read.offset;
        }
        self.reclaim_drained(dir)?;
        Ok(())
    }

    fn pop(&mut self, dir: &Path) -> Result<Option<bytes::Bytes>, QueueError> {
        loop {
            self.reclaim_drained(dir)?;

            let end = self.end_of(self.read.segment).unwrap_or(HEADER_LEN);
            if self.read.offset >= end {
                return Ok(None);
            }

            if self.reader.as_ref().map(|r| r.id) != Some(self.read.segment) {
                self.reader = Some(SegmentReader::open(dir, self.read.segment)?);
            }
            let Some(reader) = self.reader.as_mut() else {
                return Ok(None);
            };

            match reader.read_at(self.read.offset) {
                Ok(payload) => {
                    self.read.offset += segment::record_len(payload.len());
                    self.pending = self.pending.saturating_sub(1);
                    if self.read.segment == self.writer.id {
                        self.active_remaining = self.active_remaining.saturating_sub(1);
                    } else if let Some(seg) = self.sealed.get_mut(&self.read.segment) {
                        seg.remaining = seg.remaining.saturating_sub(1);
                    }
                    self.cursor.store(self.read)?;
                    self.reclaim_drained(dir)?;
                    return Ok(Some(payload));
                }
                Err(QueueError::Corruption(reason)) => {
                    warn!(
                        target: "producer::queue",
                        segment = self.read.segment,
                        offset = self.read.offset,
                        %reason,
                        "skipping corrupt remainder of segment"
                    );
                    self.skip_segment(dir)?;
                }
                Err(e) => {
                    self.reader = None;
                    return Err(e);
                }
            }
        }
    }
}

fn list_segments(dir: &Path) -> io::Result<BTreeMap<u64, PathBuf>> {
    let mut segments = BTreeMap::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if let Some(id) = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(segment::parse_segment_id)
        {
            segments.insert(id, path);
        }
    }
    Ok(segments)
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
