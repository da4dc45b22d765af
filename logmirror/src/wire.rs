//! Wire format of the replication link.
//!
//! Master to slave: a stream of [`Frame`]s, `{ phy_offset: u64 BE,
//! body_size: i32 BE, body }`. There is no magic number, version or
//! checksum; TCP plus the offset contiguity check on the slave provide
//! integrity. Slave to master: bare 8-byte big-endian offset reports.

use anyhow::{bail, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::time::Duration;
use utils::offset::Offset;

pub const FRAME_HEADER_SIZE: usize = 12;
pub const OFFSET_REPORT_SIZE: usize = 8;

/// Why one replication stream ended. Every loop maps its exit onto one of
/// these, logs it, and lets its own state machine decide what happens next;
/// errors never cross task boundaries as panics.
#[derive(thiserror::Error, Debug)]
pub enum StreamEnd {
    /// I/O failure or clean disconnect by the peer.
    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
    /// Nothing received from the peer for the housekeeping interval.
    #[error("peer silent for {0:?}")]
    Silent(Duration),
    /// The peer broke the framing or offset contiguity rules.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// Service shutdown.
    #[error("shutting down")]
    Shutdown,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One unit of push from master to slave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Log offset at which `body` begins on the master.
    pub phy_offset: Offset,
    /// Zero or more whole log records; empty for heartbeats.
    pub body: Bytes,
}

impl Frame {
    pub fn heartbeat(at: Offset) -> Frame {
        Frame {
            phy_offset: at,
            body: Bytes::new(),
        }
    }

    pub fn is_heartbeat(&self) -> bool {
        self.body.is_empty()
    }

    /// Offset right past the bytes this frame carries.
    pub fn end_offset(&self) -> Offset {
        self.phy_offset + self.body.len() as u64
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + self.body.len());
        buf.put_u64(self.phy_offset.0);
        buf.put_i32(self.body.len() as i32);
        buf.put_slice(&self.body);
    }

    /// Cut one whole frame off the front of `buf`. Returns None when the
    /// buffered bytes do not yet hold a complete frame, leaving them as is.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = &buf[..FRAME_HEADER_SIZE];
        let phy_offset = Offset(header.get_u64());
        let body_size = header.get_i32();
        if body_size < 0 {
            bail!(
                "frame at {} advertises negative body size {}",
                phy_offset,
                body_size
            );
        }
        let body_size = body_size as usize;
        if buf.len() < FRAME_HEADER_SIZE + body_size {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_SIZE);
        let body = buf.split_to(body_size).freeze();
        Ok(Some(Frame { phy_offset, body }))
    }
}

pub fn encode_report(offset: Offset) -> [u8; OFFSET_REPORT_SIZE] {
    offset.0.to_be_bytes()
}

pub fn decode_report(raw: [u8; OFFSET_REPORT_SIZE]) -> Offset {
    Offset(u64::from_be_bytes(raw))
}
