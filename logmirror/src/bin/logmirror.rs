//! Standalone replication node. Always listens for slave connections;
//! mirrors a master when one is configured.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::*;

use logmirror::commit_log::MemoryLog;
use logmirror::ha_service::HaService;
use logmirror::{defaults::*, HaConf, HA_RUNTIME};
use utils::project_git_version;

project_git_version!(GIT_VERSION);

#[derive(Parser)]
#[command(name = "logmirror", version = GIT_VERSION, about = "Append-only log replication node")]
struct Args {
    /// Listen address for slave connections.
    #[arg(long, default_value = DEFAULT_HA_LISTEN_ADDR)]
    listen_addr: String,
    /// host:port of the master to mirror; omit to run master-only.
    #[arg(long)]
    master_addr: Option<String>,
    /// Max quiet time before a side sends its heartbeat.
    #[arg(long, value_parser = humantime::parse_duration, default_value = DEFAULT_SEND_HEARTBEAT_INTERVAL)]
    heartbeat_interval: Duration,
    /// Max quiet time before the remote side is declared dead.
    #[arg(long, value_parser = humantime::parse_duration, default_value = DEFAULT_HOUSEKEEPING_INTERVAL)]
    housekeeping_interval: Duration,
    /// Bytes the master may run ahead of the slave watermark before slaves
    /// stop counting as in-sync.
    #[arg(long, default_value_t = DEFAULT_SLAVE_FALLBEHIND_MAX)]
    slave_fallbehind_max: u64,
    /// Upper bound of a producer's synchronous replication wait.
    #[arg(long, value_parser = humantime::parse_duration, default_value = DEFAULT_SYNC_FLUSH_TIMEOUT)]
    sync_flush_timeout: Duration,
}

fn main() -> Result<()> {
    let args = Args::parse();

    utils::logging::init()?;
    info!("version: {GIT_VERSION}");

    let conf = HaConf {
        ha_listen_addr: args.listen_addr,
        ha_master_addr: args.master_addr,
        ha_send_heartbeat_interval: args.heartbeat_interval,
        ha_housekeeping_interval: args.housekeeping_interval,
        ha_slave_fallbehind_max: args.slave_fallbehind_max,
        sync_flush_timeout: args.sync_flush_timeout,
    };

    HA_RUNTIME.block_on(async move {
        let service = HaService::new(conf, Arc::new(MemoryLog::new()));
        service.start().await?;

        wait_for_shutdown_signal().await?;

        service.shutdown().await;
        Ok(())
    })
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = interrupt.recv() => info!("received SIGINT, shutting down"),
        _ = terminate.recv() => info!("received SIGTERM, shutting down"),
    }
    Ok(())
}
