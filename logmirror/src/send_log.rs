//! Master side of the replication link: the registry of live slave
//! connections and the per-connection handler that pushes log bytes and
//! consumes offset reports.

use anyhow::anyhow;
use bytes::BytesMut;
use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::*;
use utils::offset::Offset;

use crate::commit_log::CommitLog;
use crate::watermark::SlaveWatermark;
use crate::wire::{decode_report, Frame, StreamEnd, FRAME_HEADER_SIZE, OFFSET_REPORT_SIZE};
use crate::HaConf;

/// Largest body pushed in one frame.
pub const MAX_SEND_SIZE: usize = 64 * 1024;

// An idle sender re-checks the log end at least this often even without a
// commit notification.
const POLL_STATE_TIMEOUT: Duration = Duration::from_secs(1);

pub type ConnectionId = u64;

/// Registry of live master-side connections. The HA service holds it
/// (wrapped in Arc).
pub struct LogSenders {
    mutex: Mutex<LogSendersShared>,
    // live connection count, read lock-free by the health check
    live: AtomicUsize,
}

impl LogSenders {
    pub fn new() -> Arc<LogSenders> {
        Arc::new(LogSenders {
            mutex: Mutex::new(LogSendersShared { slots: Vec::new() }),
            live: AtomicUsize::new(0),
        })
    }

    /// Register a new connection. The returned guard provides access to the
    /// slot and deregisters in Drop.
    fn register(self: &Arc<LogSenders>, state: SenderState) -> SenderGuard {
        let slots = &mut self.mutex.lock().slots;
        // find an empty slot or grow
        let pos = if let Some(pos) = slots.iter().position(|s| s.is_none()) {
            slots[pos] = Some(state);
            pos
        } else {
            slots.push(Some(state));
            slots.len() - 1
        };
        self.live.fetch_add(1, Ordering::Relaxed);
        SenderGuard {
            id: pos,
            senders: Arc::clone(self),
        }
    }

    /// Number of live connections.
    pub fn count(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Snapshot of every connection's state.
    pub fn get_all(&self) -> Vec<SenderState> {
        self.mutex.lock().slots.iter().flatten().cloned().collect()
    }

    /// Reported offset of the most lagging slave. None if no slave is
    /// connected.
    pub fn min_reported(&self) -> Option<Offset> {
        self.mutex
            .lock()
            .slots
            .iter()
            .flatten()
            .map(|s| s.reported_offset)
            .min()
    }

    fn record_ack(&self, id: usize, offset: Offset) {
        let mut shared = self.mutex.lock();
        shared.get_slot_mut(id).reported_offset = offset;
    }

    fn unregister(&self, id: usize) {
        self.mutex.lock().slots[id] = None;
        self.live.fetch_sub(1, Ordering::Relaxed);
    }
}

struct LogSendersShared {
    slots: Vec<Option<SenderState>>,
}

impl LogSendersShared {
    fn get_slot_mut(&mut self, id: usize) -> &mut SenderState {
        self.slots[id].as_mut().expect("sender doesn't exist")
    }
}

/// Per-connection state. Serialized only for introspection dumps.
#[derive(Debug, Clone, Serialize)]
pub struct SenderState {
    pub peer_addr: SocketAddr,
    pub conn_id: ConnectionId,
    /// Latest offset the slave reported; right after accept, the resume
    /// point it asked for.
    pub reported_offset: Offset,
}

/// Scope guard for a slot in [`LogSenders`]; deregisters in Drop.
struct SenderGuard {
    id: usize,
    senders: Arc<LogSenders>,
}

impl Drop for SenderGuard {
    fn drop(&mut self) {
        self.senders.unregister(self.id);
    }
}

/// Run one accepted slave connection to completion.
///
/// The slave speaks first: its initial offset report establishes where
/// streaming resumes. After that a sending half and an ack-reading half run
/// concurrently until either fails or shutdown is signaled; any exit tears
/// the connection down and deregisters it.
pub async fn handle_slave<L: CommitLog>(
    socket: TcpStream,
    peer_addr: SocketAddr,
    conn_id: ConnectionId,
    conf: HaConf,
    log: Arc<L>,
    senders: Arc<LogSenders>,
    watermark: Arc<SlaveWatermark>,
    commit_rx: watch::Receiver<Offset>,
    cancel: watch::Receiver<bool>,
) -> Result<(), StreamEnd> {
    socket.set_nodelay(true)?;
    let (mut read_half, write_half) = socket.into_split();

    let start_pos = read_first_report(&mut read_half, conf.ha_housekeeping_interval).await?;
    let end_pos = log.max_phy_offset();
    if start_pos > end_pos {
        warn!(
            "slave reports offset {} ahead of available log end {}",
            start_pos, end_pos
        );
    }
    info!(
        "starting streaming from {}, log ends at {}",
        start_pos, end_pos
    );
    watermark.advance_to(start_pos);

    let guard = senders.register(SenderState {
        peer_addr,
        conn_id,
        reported_offset: start_pos,
    });

    let mut sender = LogSender {
        write: write_half,
        log,
        start_pos,
        end_pos,
        commit_rx,
        heartbeat_interval: conf.ha_send_heartbeat_interval,
        last_write_at: Instant::now(),
        send_buf: BytesMut::with_capacity(FRAME_HEADER_SIZE + MAX_SEND_SIZE),
        cancel: cancel.clone(),
    };
    let mut acker = AckReader {
        read: read_half,
        senders: Arc::clone(&senders),
        slot_id: guard.id,
        watermark,
        housekeeping_interval: conf.ha_housekeeping_interval,
        cancel,
    };

    // Concurrently push data and consume acks; acks are not synchronized
    // with sends, so neither half may block the other.
    let res = tokio::select! {
        r = sender.run() => r,
        r = acker.run() => r,
    };
    drop(guard);
    res
}

async fn read_first_report(
    read: &mut OwnedReadHalf,
    within: Duration,
) -> Result<Offset, StreamEnd> {
    let mut raw = [0u8; OFFSET_REPORT_SIZE];
    match timeout(within, read.read_exact(&mut raw)).await {
        Err(_) => Err(StreamEnd::Silent(within)),
        Ok(Err(e)) => Err(e.into()),
        Ok(Ok(_)) => Ok(decode_report(raw)),
    }
}

/// The half driving data towards the slave.
struct LogSender<L: CommitLog> {
    write: OwnedWriteHalf,
    log: Arc<L>,
    // next offset to push; never below the slave's first report
    start_pos: Offset,
    // log end known to be available for sending
    end_pos: Offset,
    // notified when producers append; the log itself is re-polled anyway
    commit_rx: watch::Receiver<Offset>,
    heartbeat_interval: Duration,
    last_write_at: Instant,
    send_buf: BytesMut,
    cancel: watch::Receiver<bool>,
}

impl<L: CommitLog> LogSender<L> {
    /// Push log bytes until an error occurs. Err is always returned; Result
    /// is used only for `?` convenience.
    async fn run(&mut self) -> Result<(), StreamEnd> {
        loop {
            self.wait_data().await?;
            while self.start_pos < self.end_pos {
                if *self.cancel.borrow() {
                    return Err(StreamEnd::Shutdown);
                }
                let window = self.log.read(self.start_pos, MAX_SEND_SIZE)?;
                if window.is_empty() {
                    return Err(StreamEnd::Other(anyhow!(
                        "log claims end {} but has no bytes at {}",
                        self.end_pos,
                        self.start_pos
                    )));
                }
                let sent = window.len();
                self.send(Frame {
                    phy_offset: self.start_pos,
                    body: window,
                })
                .await?;
                trace!(
                    "sent {} log bytes {}-{}",
                    sent,
                    self.start_pos,
                    self.start_pos + sent as u64
                );
                self.start_pos += sent as u64;
            }
        }
    }

    /// Wait until the log grows past `start_pos`, heartbeating while idle.
    async fn wait_data(&mut self) -> Result<(), StreamEnd> {
        loop {
            self.end_pos = self.log.max_phy_offset();
            if self.end_pos > self.start_pos {
                return Ok(());
            }
            if *self.cancel.borrow() {
                return Err(StreamEnd::Shutdown);
            }

            let heartbeat_due = self
                .heartbeat_interval
                .saturating_sub(self.last_write_at.elapsed());
            let wait = heartbeat_due.min(POLL_STATE_TIMEOUT);
            tokio::select! {
                _ = self.cancel.changed() => return Err(StreamEnd::Shutdown),
                res = timeout(wait, self.commit_rx.changed()) => {
                    if let Ok(Err(_)) = res {
                        // commit notifications are gone; plain polling still
                        // bounds the wait
                        tokio::time::sleep(wait).await;
                    }
                }
            }
            if self.last_write_at.elapsed() >= self.heartbeat_interval {
                self.send(Frame::heartbeat(self.start_pos)).await?;
                trace!("sent heartbeat at {}", self.start_pos);
            }
        }
    }

    async fn send(&mut self, frame: Frame) -> Result<(), StreamEnd> {
        self.send_buf.clear();
        frame.encode(&mut self.send_buf);
        self.write.write_all(&self.send_buf).await?;
        self.last_write_at = Instant::now();
        Ok(())
    }
}

/// The half consuming the slave's offset reports.
struct AckReader {
    read: OwnedReadHalf,
    senders: Arc<LogSenders>,
    slot_id: usize,
    watermark: Arc<SlaveWatermark>,
    housekeeping_interval: Duration,
    cancel: watch::Receiver<bool>,
}

impl AckReader {
    /// Consume 8-byte offset reports. Partial reads accumulate across wait
    /// boundaries so a report split by the timeout is not lost; a slave that
    /// stays silent for the housekeeping interval is dropped.
    async fn run(&mut self) -> Result<(), StreamEnd> {
        let mut raw = [0u8; OFFSET_REPORT_SIZE];
        let mut filled = 0;
        loop {
            tokio::select! {
                _ = self.cancel.changed() => return Err(StreamEnd::Shutdown),
                res = timeout(self.housekeeping_interval, self.read.read(&mut raw[filled..])) => match res {
                    Err(_) => return Err(StreamEnd::Silent(self.housekeeping_interval)),
                    Ok(Ok(0)) => return Err(StreamEnd::Io(io::ErrorKind::UnexpectedEof.into())),
                    Ok(Ok(n)) => {
                        filled += n;
                        if filled == OFFSET_REPORT_SIZE {
                            filled = 0;
                            let acked = decode_report(raw);
                            trace!("slave acknowledged {}", acked);
                            self.senders.record_ack(self.slot_id, acked);
                            self.watermark.advance_to(acked);
                        }
                    }
                    Ok(Err(e)) => return Err(e.into()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mock_addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn mock_state(conn_id: ConnectionId, reported: u64) -> SenderState {
        SenderState {
            peer_addr: mock_addr(9000 + conn_id as u16),
            conn_id,
            reported_offset: Offset(reported),
        }
    }

    #[test]
    fn test_registry_count_tracks_membership() {
        let senders = LogSenders::new();
        assert_eq!(senders.count(), 0);

        let g1 = senders.register(mock_state(1, 10));
        let g2 = senders.register(mock_state(2, 20));
        assert_eq!(senders.count(), 2);
        assert_eq!(senders.get_all().len(), 2);

        drop(g1);
        assert_eq!(senders.count(), 1);
        assert_eq!(senders.get_all().len(), 1);

        // freed slot is reused
        let g3 = senders.register(mock_state(3, 30));
        assert_eq!(g3.id, 0);
        assert_eq!(senders.count(), 2);

        drop(g2);
        drop(g3);
        assert_eq!(senders.count(), 0);
        assert!(senders.get_all().is_empty());
    }

    #[test]
    fn test_min_reported_tracks_laggard() {
        let senders = LogSenders::new();
        assert_eq!(senders.min_reported(), None);

        let g1 = senders.register(mock_state(1, 100));
        let _g2 = senders.register(mock_state(2, 40));
        assert_eq!(senders.min_reported(), Some(Offset(40)));

        senders.record_ack(1, Offset(200));
        assert_eq!(senders.min_reported(), Some(Offset(100)));

        drop(g1);
        assert_eq!(senders.min_reported(), Some(Offset(200)));
    }

    #[test]
    fn test_sender_state_serializes() {
        let state = mock_state(7, 512);
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["conn_id"], 7);
        assert_eq!(json["reported_offset"], 512);
    }
}
