//! Glue module: wires the listener, per-slave handlers, group commit
//! service and client loop together and exposes the operations an embedding
//! broker consumes.

use anyhow::{bail, Context, Result};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::*;
use utils::offset::Offset;

use crate::commit_log::CommitLog;
use crate::group_commit::{GroupCommitRequest, GroupCommitService};
use crate::log_service;
use crate::receive_log::HaClient;
use crate::send_log::{LogSenders, SenderState};
use crate::watermark::SlaveWatermark;
use crate::HaConf;

/// The replication engine facade.
///
/// A node is always master-capable (it listens for slaves) and always runs
/// the client loop, which idles until a master address is configured.
pub struct HaService<L: CommitLog> {
    conf: HaConf,
    log: Arc<L>,
    senders: Arc<LogSenders>,
    watermark: Arc<SlaveWatermark>,
    group_commit: Arc<GroupCommitService>,
    client: Arc<HaClient<L>>,
    // producers publish new log ends here; senders poll the log as well, so
    // this only shortens push latency
    commit_tx: watch::Sender<Offset>,
    cancel_tx: watch::Sender<bool>,
    listen_addr: OnceCell<SocketAddr>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl<L: CommitLog> HaService<L> {
    pub fn new(conf: HaConf, log: Arc<L>) -> Arc<HaService<L>> {
        let watermark = Arc::new(SlaveWatermark::new());
        let group_commit = GroupCommitService::new(Arc::clone(&watermark), conf.sync_flush_timeout);
        let client = HaClient::new(conf.clone(), Arc::clone(&log));
        let (commit_tx, _) = watch::channel(log.max_phy_offset());
        let (cancel_tx, _) = watch::channel(false);
        Arc::new(HaService {
            conf,
            log,
            senders: LogSenders::new(),
            watermark,
            group_commit,
            client,
            commit_tx,
            cancel_tx,
            listen_addr: OnceCell::new(),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listener and start all loops.
    pub async fn start(&self) -> Result<()> {
        if self.listen_addr.get().is_some() {
            bail!("HA service already started");
        }
        let listener = log_service::bind_ha_listener(&self.conf.ha_listen_addr)?;
        let listen_addr = listener
            .local_addr()
            .context("HA listener has no local address")?;
        self.listen_addr.set(listen_addr).ok();
        info!("HA service listening on {}", listen_addr);

        let acceptor = tokio::spawn(
            log_service::accept_loop(
                listener,
                self.conf.clone(),
                Arc::clone(&self.log),
                Arc::clone(&self.senders),
                Arc::clone(&self.watermark),
                self.commit_tx.subscribe(),
                self.cancel_tx.subscribe(),
            )
            .instrument(info_span!("ha_listener")),
        );
        let group_commit = tokio::spawn(
            Arc::clone(&self.group_commit)
                .run(self.cancel_tx.subscribe())
                .instrument(info_span!("group_commit")),
        );
        let client = tokio::spawn(
            Arc::clone(&self.client)
                .run(self.cancel_tx.subscribe())
                .instrument(info_span!("ha_client")),
        );

        // joined in shutdown order: client first, then the listener (per-slave
        // tasks notice cancellation on their own), then the producer waiters
        let mut tasks = self.tasks.lock();
        tasks.push(("HA client", client));
        tasks.push(("HA listener", acceptor));
        tasks.push(("group commit service", group_commit));
        Ok(())
    }

    /// Signal every loop to stop and wait for them. All waits in the loops
    /// are bounded, so this returns promptly.
    pub async fn shutdown(&self) {
        info!("shutting down HA service");
        let _ = self.cancel_tx.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for (name, task) in tasks {
            if let Err(e) = task.await {
                warn!("{name} task panicked: {e}");
            }
        }
    }

    /// Address the listener is bound to; useful with port-0 configs.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        self.listen_addr.get().copied()
    }

    /// True iff at least one slave is connected and the furthest
    /// acknowledged offset is within the configured distance of
    /// `master_put_where`.
    pub fn is_slave_ok(&self, master_put_where: Offset) -> bool {
        self.senders.count() > 0
            && self.watermark.fall_behind(master_put_where) < self.conf.ha_slave_fallbehind_max
    }

    /// Park a producer until replication covers it. Non-blocking enqueue;
    /// the outcome arrives on the request's receiver.
    pub fn put_request(&self, req: GroupCommitRequest) {
        self.group_commit.put_request(req);
    }

    /// Acknowledge transfer up to `offset` on behalf of a slave.
    pub fn notify_transfer_some(&self, offset: Offset) {
        self.watermark.advance_to(offset);
    }

    /// Tell the senders a producer appended up to `max`. They poll the log
    /// on a bounded interval anyway; the nudge only shortens push latency.
    pub fn notify_commit(&self, max: Offset) {
        self.commit_tx.send_if_modified(|cur| {
            if max > *cur {
                *cur = max;
                true
            } else {
                false
            }
        });
    }

    /// Re-point the client loop at a different master.
    pub fn update_master_address(&self, addr: Option<String>) {
        self.client.update_master_address(addr);
    }

    /// Furthest offset acknowledged by any slave.
    pub fn watermark(&self) -> Offset {
        self.watermark.get()
    }

    /// Number of live slave connections.
    pub fn connection_count(&self) -> usize {
        self.senders.count()
    }

    /// Snapshot of every live slave connection, for introspection.
    pub fn senders_state(&self) -> Vec<SenderState> {
        self.senders.get_all()
    }

    /// Reported offset of the most lagging slave.
    pub fn min_reported_offset(&self) -> Option<Offset> {
        self.senders.min_reported()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_log::MemoryLog;

    #[tokio::test]
    async fn test_start_shutdown_cycle() {
        let service = HaService::new(HaConf::dummy(), Arc::new(MemoryLog::new()));
        service.start().await.unwrap();

        let addr = service.listen_addr().unwrap();
        assert_ne!(addr.port(), 0);

        // nothing connected yet
        assert_eq!(service.connection_count(), 0);
        assert!(!service.is_slave_ok(Offset::ZERO));
        assert!(service.senders_state().is_empty());
        assert_eq!(service.min_reported_offset(), None);

        // double start is rejected
        assert!(service.start().await.is_err());

        service.shutdown().await;
    }
}
