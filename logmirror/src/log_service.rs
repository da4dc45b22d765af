//! The replication listener: accepts slave connections and spawns a
//! handler task per connection.

use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::*;
use utils::offset::Offset;

use crate::commit_log::CommitLog;
use crate::send_log::{self, ConnectionId, LogSenders};
use crate::watermark::SlaveWatermark;
use crate::wire::StreamEnd;
use crate::HaConf;

/// Bind the HA listen socket with address reuse.
pub fn bind_ha_listener(addr: &str) -> Result<TcpListener> {
    let addr: SocketAddr = addr
        .parse()
        .with_context(|| format!("failed to parse HA listen address '{addr}'"))?;
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket
        .bind(addr)
        .with_context(|| format!("failed to bind HA listener on {addr}"))?;
    Ok(socket.listen(128)?)
}

/// Accept loop: runs until shutdown, spawning one handler task per slave.
/// A connection that fails to even get going only loses itself; the loop
/// keeps accepting.
pub async fn accept_loop<L: CommitLog>(
    listener: TcpListener,
    conf: HaConf,
    log: Arc<L>,
    senders: Arc<LogSenders>,
    watermark: Arc<SlaveWatermark>,
    commit_rx: watch::Receiver<Offset>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut next_conn_id: ConnectionId = 0;
    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            res = listener.accept() => {
                let (socket, peer_addr) = match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("failed to accept a slave connection: {e}");
                        continue;
                    }
                };
                next_conn_id += 1;
                let conn_id = next_conn_id;
                info!("accepted slave connection from {peer_addr}");

                let conf = conf.clone();
                let log = Arc::clone(&log);
                let senders = Arc::clone(&senders);
                let watermark = Arc::clone(&watermark);
                let commit_rx = commit_rx.clone();
                let cancel = cancel.clone();
                tokio::spawn(
                    async move {
                        let res = send_log::handle_slave(
                            socket, peer_addr, conn_id, conf, log, senders, watermark,
                            commit_rx, cancel,
                        )
                        .await;
                        match res {
                            Ok(()) => info!("connection closed"),
                            Err(StreamEnd::Shutdown) => info!("connection closed on shutdown"),
                            Err(e) => warn!("connection failed: {e:#}"),
                        }
                    }
                    .instrument(info_span!("slave_conn", %peer_addr, conn_id)),
                );
            }
        }
    }
    // dropping the listener closes it; connection tasks notice cancellation
    // on their own within a bounded wait
    info!("HA listener stopped");
}
