//! The commit log as seen by the replication engine.
//!
//! Storage itself lives outside this crate; replication needs only the three
//! operations of the [`CommitLog`] trait. [`MemoryLog`] backs the standalone
//! binary and the tests.

use anyhow::{bail, ensure, Result};
use bytes::Bytes;
use parking_lot::RwLock;
use utils::offset::Offset;

/// Interface the replication engine consumes from the log layer.
pub trait CommitLog: Send + Sync + 'static {
    /// Current end of the log: the offset right past the last byte.
    fn max_phy_offset(&self) -> Offset;

    /// Append `body` at exactly `phy_offset`. Re-appending bytes that are
    /// already stored is accepted iff they are identical; a gap or a
    /// mismatch is an error.
    fn append(&self, phy_offset: Offset, body: &[u8]) -> Result<()>;

    /// Read up to `max_bytes` contiguous bytes starting at `from`. Returns
    /// an empty buffer at or past the end of the log.
    fn read(&self, from: Offset, max_bytes: usize) -> Result<Bytes>;
}

/// Heap-backed commit log.
#[derive(Default)]
pub struct MemoryLog {
    bytes: RwLock<Vec<u8>>,
}

impl MemoryLog {
    pub fn new() -> Self {
        MemoryLog::default()
    }

    /// Producer-side append to the tail; returns the new end of the log.
    pub fn append_record(&self, body: &[u8]) -> Offset {
        let mut bytes = self.bytes.write();
        bytes.extend_from_slice(body);
        Offset(bytes.len() as u64)
    }
}

impl CommitLog for MemoryLog {
    fn max_phy_offset(&self) -> Offset {
        Offset(self.bytes.read().len() as u64)
    }

    fn append(&self, phy_offset: Offset, body: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let end = bytes.len() as u64;
        if phy_offset.0 > end {
            bail!("append at {} leaves a gap, log ends at {}", phy_offset, end);
        }
        if phy_offset.0 < end {
            // replay of bytes we already have
            let replay_end = phy_offset.0 + body.len() as u64;
            ensure!(
                replay_end <= end,
                "append at {} overlaps the log end {}",
                phy_offset,
                end
            );
            let start = phy_offset.0 as usize;
            ensure!(
                &bytes[start..start + body.len()] == body,
                "append at {} does not match the bytes already stored",
                phy_offset
            );
            return Ok(());
        }
        bytes.extend_from_slice(body);
        Ok(())
    }

    fn read(&self, from: Offset, max_bytes: usize) -> Result<Bytes> {
        let bytes = self.bytes.read();
        let start = from.0 as usize;
        if start >= bytes.len() {
            return Ok(Bytes::new());
        }
        let stop = bytes.len().min(start + max_bytes);
        Ok(Bytes::copy_from_slice(&bytes[start..stop]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_contiguous() {
        let log = MemoryLog::new();
        log.append(Offset::ZERO, b"hello").unwrap();
        log.append(Offset(5), b" world").unwrap();
        assert_eq!(log.max_phy_offset(), Offset(11));
        assert_eq!(log.read(Offset::ZERO, 64).unwrap(), &b"hello world"[..]);
    }

    #[test]
    fn test_append_gap_fails() {
        let log = MemoryLog::new();
        log.append(Offset::ZERO, b"hello").unwrap();
        assert!(log.append(Offset(10), b"gap").is_err());
        assert_eq!(log.max_phy_offset(), Offset(5));
    }

    #[test]
    fn test_append_replay() {
        let log = MemoryLog::new();
        log.append(Offset::ZERO, b"hello").unwrap();
        // identical replay is a no-op
        log.append(Offset::ZERO, b"hello").unwrap();
        assert_eq!(log.max_phy_offset(), Offset(5));
        // diverging replay is rejected
        assert!(log.append(Offset::ZERO, b"jello").is_err());
        // replay running past the current end is rejected
        assert!(log.append(Offset(3), b"loxx").is_err());
    }

    #[test]
    fn test_read_windows() {
        let log = MemoryLog::new();
        assert_eq!(log.append_record(&[0xAA; 100]), Offset(100));
        assert_eq!(log.read(Offset::ZERO, 30).unwrap().len(), 30);
        assert_eq!(log.read(Offset(90), 30).unwrap().len(), 10);
        assert!(log.read(Offset(100), 30).unwrap().is_empty());
        assert!(log.read(Offset(500), 30).unwrap().is_empty());
    }
}
