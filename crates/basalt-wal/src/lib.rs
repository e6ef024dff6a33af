//! Redo-oriented write-ahead log.
//!
//! File layout of `<base>.log`:
//!
//! ```text
//! [xchecksum: 4 bytes LE] [frame] [frame] ... [possible bad tail]
//! frame := [size: 4 LE] [checksum: 4 LE] [data: size bytes]
//! ```
//!
//! Both checksums are the fold `acc = acc * 13331 + byte`, seeded at 0:
//! per-frame over `data`, aggregate over the concatenated frames. Appends
//! are durable — the frame is written, the aggregate prefix updated, and
//! the file synced before `append` returns.
//!
//! The aggregate checksum is *advisory*. Appending a frame and updating
//! the prefix are two writes, so a crash between them leaves a prefix that
//! matches nothing; rejecting the whole log on that mismatch would brick
//! the database on every such crash. Recovery therefore trusts the
//! per-frame checksums and truncates the file at the first frame that
//! fails one (or is cut short). Open performs that truncation.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use basalt_error::{BasaltError, Result};
use basalt_types::codec;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// File suffix of the write-ahead log.
pub const LOG_SUFFIX: &str = ".log";

/// Multiplier of the checksum fold.
const SEED: u32 = 13331;

const OF_SIZE: u64 = 0;
const OF_CHECKSUM: u64 = 4;
const OF_DATA: u64 = 8;

fn log_path(base: &Path) -> PathBuf {
    let mut path = base.as_os_str().to_owned();
    path.push(LOG_SUFFIX);
    PathBuf::from(path)
}

/// Checksum fold over `data`, continuing from `acc`.
#[must_use]
pub fn checksum(mut acc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        acc = acc.wrapping_mul(SEED).wrapping_add(u32::from(byte));
    }
    acc
}

struct Inner {
    file: File,
    /// Read cursor for `next`; byte position of the next frame.
    pos: u64,
    /// Length of the verified portion of the file.
    len: u64,
    xchecksum: u32,
}

impl Inner {
    /// Read the frame at the cursor, verify it, and advance. Returns the
    /// whole frame (header included); `None` on end or bad tail.
    fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.pos + OF_DATA >= self.len {
            return None;
        }
        let mut header = [0_u8; 8];
        self.file
            .read_exact_at(&mut header, self.pos)
            .unwrap_or_else(|err| panic!("log read failed at {}: {err}", self.pos));
        let size = u64::from(codec::read_u32(&header));
        if self.pos + OF_DATA + size > self.len {
            return None; // bad tail: frame cut short
        }
        let mut frame = vec![0_u8; (OF_DATA + size) as usize];
        self.file
            .read_exact_at(&mut frame, self.pos)
            .unwrap_or_else(|err| panic!("log read failed at {}: {err}", self.pos));
        let recorded = codec::read_u32(&frame[OF_CHECKSUM as usize..]);
        let computed = checksum(0, &frame[OF_DATA as usize..]);
        if recorded != computed {
            return None; // bad tail: payload corrupt
        }
        self.pos += frame.len() as u64;
        Some(frame)
    }
}

/// Append-only log with rewind-and-iterate recovery access.
pub struct Wal {
    inner: Mutex<Inner>,
}

impl Wal {
    /// Create a fresh log at `<base>.log`, truncating any existing file.
    pub fn create(base: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(log_path(base))?;
        let mut prefix = [0_u8; 4];
        codec::put_u32(&mut prefix, 0);
        file.write_all_at(&prefix, 0)?;
        file.sync_all()?;
        Ok(Self {
            inner: Mutex::new(Inner {
                file,
                pos: OF_CHECKSUM,
                len: 4,
                xchecksum: 0,
            }),
        })
    }

    /// Open an existing log, dropping any bad tail.
    pub fn open(base: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(log_path(base))?;
        let len = file.metadata()?.len();
        if len < 4 {
            return Err(BasaltError::BadLogFile);
        }
        let mut prefix = [0_u8; 4];
        file.read_exact_at(&mut prefix, 0)?;
        let xchecksum = codec::read_u32(&prefix);

        let mut inner = Inner {
            file,
            pos: OF_CHECKSUM,
            len,
            xchecksum,
        };
        // Walk every verifiable frame; the cursor stops at the first bad
        // one. The aggregate is recomputed but only logged — per-frame
        // checksums are the source of truth (see the module docs).
        let mut aggregate = 0_u32;
        while let Some(frame) = inner.next_frame() {
            aggregate = checksum(aggregate, &frame);
        }
        if inner.pos < len {
            warn!(
                verified = inner.pos,
                file_len = len,
                "truncating bad log tail"
            );
        }
        if aggregate != xchecksum {
            debug!(
                recorded = xchecksum,
                computed = aggregate,
                "aggregate log checksum mismatch (advisory)"
            );
        }
        inner
            .file
            .set_len(inner.pos)
            .unwrap_or_else(|err| panic!("log truncate failed: {err}"));
        inner.len = inner.pos;
        inner.pos = OF_CHECKSUM;
        Ok(Self {
            inner: Mutex::new(inner),
        })
    }

    /// Append one record and sync. The record is durable on return.
    pub fn append(&self, data: &[u8]) {
        let mut frame = vec![0_u8; OF_DATA as usize + data.len()];
        codec::put_u32(&mut frame[OF_SIZE as usize..], data.len() as u32);
        codec::put_u32(&mut frame[OF_CHECKSUM as usize..], checksum(0, data));
        frame[OF_DATA as usize..].copy_from_slice(data);

        let mut inner = self.inner.lock();
        inner
            .file
            .write_all_at(&frame, inner.len)
            .unwrap_or_else(|err| panic!("log append failed: {err}"));
        inner.len += frame.len() as u64;
        inner.xchecksum = checksum(inner.xchecksum, &frame);
        let mut prefix = [0_u8; 4];
        codec::put_u32(&mut prefix, inner.xchecksum);
        inner
            .file
            .write_all_at(&prefix, 0)
            .unwrap_or_else(|err| panic!("log prefix write failed: {err}"));
        inner
            .file
            .sync_all()
            .unwrap_or_else(|err| panic!("log sync failed: {err}"));
    }

    /// Move the read cursor back to the first record.
    pub fn rewind(&self) {
        self.inner.lock().pos = OF_CHECKSUM;
    }

    /// Read the next record's data, advancing the cursor. `None` at the
    /// end of the verified log.
    pub fn next(&self) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock();
        let frame = inner.next_frame()?;
        Some(frame[OF_DATA as usize..].to_vec())
    }
}
