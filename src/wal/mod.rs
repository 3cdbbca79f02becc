//! Write-ahead log
//!
//! Sequential frames `[lsn u64][len u32][crc32 u32][payload]`, one per
//! prepared transaction. Frames are fsynced before prepare returns. Replay
//! verifies checksums and stops at the first torn frame; a partial tail write
//! is indistinguishable from end-of-log and is ignored. Truncation by LSN
//! rewrites the surviving suffix and renames it into place.

pub mod record;

pub use record::{
    AlterRecord, BlockMutation, CatalogOp, PreparedRecord, RecordOp, WalPayload,
};

use crate::error::{EngineError, Result};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

const FRAME_HEADER: usize = 8 + 4 + 4;

struct WalInner {
    file: File,
    next_lsn: u64,
}

pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Scan surviving frames to find the next LSN, and chop any torn
        // tail so new frames land right after the last intact one.
        let mut next_lsn = 1;
        if path.exists() {
            let valid_len = scan_frames(&path, 0, |lsn, _| {
                next_lsn = lsn + 1;
                Ok(())
            })?;
            let file = OpenOptions::new().write(true).open(&path)?;
            if file.metadata()?.len() > valid_len {
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, inner: Mutex::new(WalInner { file, next_lsn }) })
    }

    /// Append one payload and fsync. Returns the frame's LSN.
    pub fn append(&self, payload: &WalPayload) -> Result<u64> {
        let bytes = bincode::serialize(payload)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&bytes);
        let crc = hasher.finalize();

        let mut inner = self.inner.lock();
        let lsn = inner.next_lsn;
        let mut frame = Vec::with_capacity(FRAME_HEADER + bytes.len());
        frame.extend_from_slice(&lsn.to_be_bytes());
        frame.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
        frame.extend_from_slice(&crc.to_be_bytes());
        frame.extend_from_slice(&bytes);
        inner.file.write_all(&frame)?;
        inner.file.sync_data()?;
        inner.next_lsn = lsn + 1;
        Ok(lsn)
    }

    pub fn last_lsn(&self) -> u64 {
        self.inner.lock().next_lsn - 1
    }

    /// Invoke `f` on every intact frame with `lsn > from_lsn`, in order.
    pub fn replay(
        &self,
        from_lsn: u64,
        f: impl FnMut(u64, WalPayload) -> Result<()>,
    ) -> Result<()> {
        // Serialize against appends so the scan sees whole frames.
        let _guard = self.inner.lock();
        scan_frames(&self.path, from_lsn, f)?;
        Ok(())
    }

    /// Drop every frame with `lsn <= upto`. Durable once the rename lands.
    pub fn truncate_to(&self, upto: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.file.sync_data()?;

        let tmp_path = self.path.with_extension("tmp");
        let mut tmp = File::create(&tmp_path)?;
        let mut kept = 0usize;
        scan_frames(&self.path, 0, |lsn, payload| {
            if lsn > upto {
                let bytes = bincode::serialize(&payload)?;
                let mut hasher = crc32fast::Hasher::new();
                hasher.update(&bytes);
                let crc = hasher.finalize();
                tmp.write_all(&lsn.to_be_bytes())?;
                tmp.write_all(&(bytes.len() as u32).to_be_bytes())?;
                tmp.write_all(&crc.to_be_bytes())?;
                tmp.write_all(&bytes)?;
                kept += 1;
            }
            Ok(())
        })?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, &self.path)?;

        inner.file = OpenOptions::new().append(true).open(&self.path)?;
        log::debug!("wal truncated to lsn {}, {} frames kept", upto, kept);
        Ok(())
    }
}

/// Scan intact frames, returning the byte offset after the last one.
fn scan_frames(
    path: &Path,
    from_lsn: u64,
    mut f: impl FnMut(u64, WalPayload) -> Result<()>,
) -> Result<u64> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut reader = BufReader::new(file);
    let mut valid_len = 0u64;
    loop {
        let mut header = [0u8; FRAME_HEADER];
        match read_fully(&mut reader, &mut header) {
            ReadOutcome::Done | ReadOutcome::Torn => return Ok(valid_len),
            ReadOutcome::Full => {}
        }
        let lsn = u64::from_be_bytes(header[..8].try_into().unwrap());
        let len = u32::from_be_bytes(header[8..12].try_into().unwrap()) as usize;
        let crc = u32::from_be_bytes(header[12..16].try_into().unwrap());
        let mut payload = vec![0u8; len];
        match read_fully(&mut reader, &mut payload) {
            ReadOutcome::Full => {}
            // A torn payload at the tail: the frame never fully landed.
            _ => return Ok(valid_len),
        }
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&payload);
        if hasher.finalize() != crc {
            return Ok(valid_len);
        }
        if lsn > from_lsn {
            let decoded: WalPayload = bincode::deserialize(&payload)
                .map_err(|e| EngineError::Corruption(format!("wal frame {}: {}", lsn, e)))?;
            f(lsn, decoded)?;
        }
        valid_len += (FRAME_HEADER + len) as u64;
    }
}

enum ReadOutcome {
    Full,
    Done,
    Torn,
}

fn read_fully(reader: &mut impl Read, buf: &mut [u8]) -> ReadOutcome {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return if filled == 0 { ReadOutcome::Done } else { ReadOutcome::Torn };
            }
            Ok(n) => filled += n,
            Err(_) => return ReadOutcome::Torn,
        }
    }
    ReadOutcome::Full
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;
    use tempfile::TempDir;

    fn pointer(n: i64) -> WalPayload {
        WalPayload::CheckpointPointer {
            start: Timestamp::new(0, 0),
            end: Timestamp::new(n, 0),
            location: vec![n as u8],
        }
    }

    #[test]
    fn test_append_assigns_sequential_lsns() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).unwrap();
        assert_eq!(wal.append(&pointer(1)).unwrap(), 1);
        assert_eq!(wal.append(&pointer(2)).unwrap(), 2);
        assert_eq!(wal.last_lsn(), 2);
    }

    #[test]
    fn test_replay_from_lsn() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).unwrap();
        for i in 1..=5 {
            wal.append(&pointer(i)).unwrap();
        }
        let mut seen = Vec::new();
        wal.replay(2, |lsn, _| {
            seen.push(lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![3, 4, 5]);
    }

    #[test]
    fn test_reopen_continues_lsns() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(&pointer(1)).unwrap();
            wal.append(&pointer(2)).unwrap();
        }
        let wal = Wal::open(&path).unwrap();
        assert_eq!(wal.append(&pointer(3)).unwrap(), 3);
    }

    #[test]
    fn test_torn_tail_ignored() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wal.log");
        {
            let wal = Wal::open(&path).unwrap();
            wal.append(&pointer(1)).unwrap();
            wal.append(&pointer(2)).unwrap();
        }
        // Chop bytes off the last frame.
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let wal = Wal::open(&path).unwrap();
        let mut seen = Vec::new();
        wal.replay(0, |lsn, _| {
            seen.push(lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![1]);
        // The torn frame's LSN is reused.
        assert_eq!(wal.append(&pointer(9)).unwrap(), 2);
    }

    #[test]
    fn test_truncate_drops_prefix() {
        let dir = TempDir::new().unwrap();
        let wal = Wal::open(dir.path().join("wal.log")).unwrap();
        for i in 1..=4 {
            wal.append(&pointer(i)).unwrap();
        }
        wal.truncate_to(2).unwrap();

        let mut seen = Vec::new();
        wal.replay(0, |lsn, _| {
            seen.push(lsn);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![3, 4]);
        // Appends continue past the old tail.
        assert_eq!(wal.append(&pointer(5)).unwrap(), 5);
    }
}
