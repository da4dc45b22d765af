//! Slave side of the replication link: one client loop that connects to the
//! master, appends pushed frames to the local log and reports progress.

use anyhow::Context;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{timeout, Instant};
use tracing::*;

use crate::commit_log::CommitLog;
use crate::wire::{encode_report, Frame, StreamEnd};
use crate::HaConf;

// Capacity of the inbound frame buffer.
const READ_BUFFER_SIZE: usize = 4 * 1024 * 1024;

// Delay between connect attempts, and between idle passes while no master
// address is configured.
const CONNECT_RETRY_DELAY: Duration = Duration::from_secs(5);

// Upper bound of one pass of the connected loop.
const POLL_STATE_TIMEOUT: Duration = Duration::from_secs(1);

/// The client loop a slave runs against its master. Lives for the whole
/// service lifetime; stays idle while no master address is set.
pub struct HaClient<L: CommitLog> {
    conf: HaConf,
    log: Arc<L>,
    master_addr: Mutex<Option<String>>,
}

impl<L: CommitLog> HaClient<L> {
    pub fn new(conf: HaConf, log: Arc<L>) -> Arc<HaClient<L>> {
        let master_addr = Mutex::new(conf.ha_master_addr.clone());
        Arc::new(HaClient {
            conf,
            log,
            master_addr,
        })
    }

    /// Point the client at a different master. An established connection
    /// keeps running until it fails; only the next dial uses the new
    /// address.
    pub fn update_master_address(&self, addr: Option<String>) {
        let mut cur = self.master_addr.lock();
        if *cur != addr {
            info!("master address changed from {:?} to {:?}", *cur, addr);
            *cur = addr;
        }
    }

    pub fn master_addr(&self) -> Option<String> {
        self.master_addr.lock().clone()
    }

    /// Client loop: connect, mirror until the link dies, back off, repeat.
    pub async fn run(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        info!("HA client started");
        while !*cancel.borrow() {
            match self.master_addr() {
                None => trace!("no master address configured"),
                Some(addr) => match self.connect(&addr).await {
                    Err(e) => warn!("failed to connect to master {addr}: {e:#}"),
                    Ok(stream) => {
                        info!("connected to master {addr}");
                        match self.mirror(stream, &mut cancel).await {
                            Err(StreamEnd::Shutdown) => break,
                            Err(e) => warn!("replication link to master {addr} failed: {e:#}"),
                            Ok(()) => {}
                        }
                    }
                },
            }
            tokio::select! {
                _ = cancel.changed() => break,
                _ = tokio::time::sleep(CONNECT_RETRY_DELAY) => {}
            }
        }
        info!("HA client stopped");
    }

    async fn connect(&self, addr: &str) -> anyhow::Result<TcpStream> {
        let stream = timeout(CONNECT_RETRY_DELAY, TcpStream::connect(addr))
            .await
            .context("connect timed out")??;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// One connection's lifetime. Err is always returned; Result is used
    /// only for `?` convenience. All connection state (read buffer, report
    /// cursor, timers) lives here, so a teardown discards any half-received
    /// frame and the next connect starts from the durable log end.
    async fn mirror(
        &self,
        mut stream: TcpStream,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<(), StreamEnd> {
        let mut read_buf = BytesMut::with_capacity(READ_BUFFER_SIZE);

        // everything up to our local end is durable here: the resume point
        let mut reported = self.log.max_phy_offset();
        stream.write_all(&encode_report(reported)).await?;
        debug!("reported offset {}", reported);
        let mut last_write_at = Instant::now();
        let mut last_read_at = Instant::now();

        loop {
            if *cancel.borrow() {
                return Err(StreamEnd::Shutdown);
            }

            // remind the master we are alive and where we are, even when
            // nothing advanced
            if last_write_at.elapsed() >= self.conf.ha_send_heartbeat_interval {
                stream.write_all(&encode_report(reported)).await?;
                last_write_at = Instant::now();
                trace!("heartbeat report at {}", reported);
            }

            ensure_read_capacity(&mut read_buf);
            tokio::select! {
                _ = cancel.changed() => return Err(StreamEnd::Shutdown),
                res = timeout(POLL_STATE_TIMEOUT, stream.read_buf(&mut read_buf)) => match res {
                    Err(_) => {} // nothing arrived this pass
                    Ok(Ok(0)) => return Err(StreamEnd::Io(io::ErrorKind::UnexpectedEof.into())),
                    Ok(Ok(_)) => last_read_at = Instant::now(),
                    Ok(Err(e)) => return Err(e.into()),
                }
            }

            self.dispatch(&mut read_buf)?;

            // report progress as soon as appends advanced the local end
            let local_max = self.log.max_phy_offset();
            if local_max > reported {
                reported = local_max;
                stream.write_all(&encode_report(reported)).await?;
                last_write_at = Instant::now();
                debug!("reported offset {}", reported);
            }

            if last_read_at.elapsed() >= self.conf.ha_housekeeping_interval {
                return Err(StreamEnd::Silent(self.conf.ha_housekeeping_interval));
            }
        }
    }

    /// Decode and apply every whole frame buffered so far; trailing partial
    /// bytes stay in the buffer for the next pass.
    fn dispatch(&self, read_buf: &mut BytesMut) -> Result<(), StreamEnd> {
        while let Some(frame) =
            Frame::decode(read_buf).map_err(|e| StreamEnd::Protocol(format!("{e:#}")))?
        {
            if frame.is_heartbeat() {
                trace!("heartbeat from master at {}", frame.phy_offset);
                continue;
            }
            let local_max = self.log.max_phy_offset();
            if !local_max.is_zero() && frame.phy_offset != local_max {
                return Err(StreamEnd::Protocol(format!(
                    "master pushed offset {} but local log ends at {}",
                    frame.phy_offset, local_max
                )));
            }
            self.log
                .append(frame.phy_offset, &frame.body)
                .with_context(|| {
                    format!(
                        "failed to append {} bytes at {}",
                        frame.body.len(),
                        frame.phy_offset
                    )
                })?;
        }
        Ok(())
    }
}

/// Make room for the next read. When the buffer has run out of capacity,
/// `reserve` compacts: the undecoded tail moves to the front of fresh
/// capacity and nothing is lost.
fn ensure_read_capacity(read_buf: &mut BytesMut) {
    if read_buf.capacity() == read_buf.len() {
        read_buf.reserve(READ_BUFFER_SIZE);
    }
}
