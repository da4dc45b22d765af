use once_cell::sync::Lazy;
use tokio::runtime::Runtime;

use std::time::Duration;

pub mod commit_log;
pub mod group_commit;
pub mod ha_service;
pub mod log_service;
pub mod receive_log;
pub mod send_log;
pub mod watermark;
pub mod wire;

pub mod defaults {
    pub const DEFAULT_HA_LISTEN_ADDR: &str = "0.0.0.0:10912";

    pub const DEFAULT_SEND_HEARTBEAT_INTERVAL: &str = "5s";
    pub const DEFAULT_HOUSEKEEPING_INTERVAL: &str = "20s";
    pub const DEFAULT_SYNC_FLUSH_TIMEOUT: &str = "5s";
    pub const DEFAULT_SLAVE_FALLBEHIND_MAX: u64 = 256 * (1 << 20);
}

/// Runtime configuration of the replication engine.
///
/// Both roles share one struct: a node always listens for slave connections
/// and always runs the client loop, which stays idle until a master address
/// is set.
#[derive(Debug, Clone)]
pub struct HaConf {
    /// Address the node listens on for slave connections.
    pub ha_listen_addr: String,
    /// `host:port` of the master this node mirrors. None leaves the client
    /// loop idle.
    pub ha_master_addr: Option<String>,
    /// Max quiet time before a side sends its heartbeat.
    pub ha_send_heartbeat_interval: Duration,
    /// Max quiet time before the remote side is declared dead.
    pub ha_housekeeping_interval: Duration,
    /// Allowed bytes the master may run ahead of the slave watermark before
    /// the slave stops counting as in-sync.
    pub ha_slave_fallbehind_max: u64,
    /// Upper bound of a producer's group-commit wait.
    pub sync_flush_timeout: Duration,
}

impl HaConf {
    #[cfg(test)]
    fn dummy() -> Self {
        HaConf {
            ha_listen_addr: "127.0.0.1:0".to_string(),
            ha_master_addr: None,
            ha_send_heartbeat_interval: Duration::from_secs(5),
            ha_housekeeping_interval: Duration::from_secs(20),
            ha_slave_fallbehind_max: defaults::DEFAULT_SLAVE_FALLBEHIND_MAX,
            sync_flush_timeout: Duration::from_secs(5),
        }
    }
}

// Tokio runtime all replication tasks run on.
pub static HA_RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .thread_name("HA service worker")
        .enable_all()
        .build()
        .expect("Failed to create HA service runtime")
});
