//! Replication tuning knobs, grouped into a single struct constructed with
//! `Default` and passed explicitly into constructors rather than read from
//! a global.

use serde_derive::{Deserialize, Serialize};

/// Default applier worker pool size.
pub const DEFAULT_APPLIER_WORKER_THREADS: usize = 4;
/// Default interval for the master group-complete manager's daemon.
pub const DEFAULT_MASTER_GCM_INTERVAL_MS: u64 = 10;
/// Default interval for the slave group-complete manager's daemon.
pub const DEFAULT_SLAVE_GCM_INTERVAL_MS: u64 = 10;
/// Default interval for the control-channel's `check_alive` sweep.
pub const DEFAULT_CONTROL_CHANNEL_CHECK_INTERVAL_SECS: u64 = 10;
/// Default maximum transmission unit for one transfer-sender chunk.
pub const DEFAULT_MTU: usize = 16 * 1024;
/// Default capacity of the consumer -> dispatcher entry queue.
pub const DEFAULT_ENTRY_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Number of worker threads in the slave's applier pool.
    pub applier_worker_threads_count: usize,

    /// How often the master group-complete manager's daemon ticks
    /// `do_prepare_complete`.
    pub master_gcm_interval_ms: u64,

    /// How often the slave group-complete manager's daemon ticks
    /// `do_prepare_complete`.
    pub slave_gcm_interval_ms: u64,

    /// How often the master control-channel manager sweeps readers for
    /// liveness (`check_alive`).
    pub control_channel_check_interval_secs: u64,

    /// Maximum bytes the transfer sender reads from the stream per
    /// iteration.
    pub mtu: usize,

    /// Bound on the consumer -> dispatcher entry queue; a full queue blocks
    /// the consumer daemon rather than growing without bound.
    pub entry_queue_capacity: usize,

    /// Whether `apply()` failures and applied objects are stringified into
    /// the log at debug level. Off by default -- stringifying every object
    /// on a hot path is not free, matching `PRM_ID_DEBUG_REPLICATION_DATA`
    /// in the original source, which also defaults to off.
    pub debug_replication_data: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        ReplicationConfig {
            applier_worker_threads_count: DEFAULT_APPLIER_WORKER_THREADS,
            master_gcm_interval_ms: DEFAULT_MASTER_GCM_INTERVAL_MS,
            slave_gcm_interval_ms: DEFAULT_SLAVE_GCM_INTERVAL_MS,
            control_channel_check_interval_secs: DEFAULT_CONTROL_CHANNEL_CHECK_INTERVAL_SECS,
            mtu: DEFAULT_MTU,
            entry_queue_capacity: DEFAULT_ENTRY_QUEUE_CAPACITY,
            debug_replication_data: false,
        }
    }
}

impl ReplicationConfig {
    pub fn master_gcm_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.master_gcm_interval_ms)
    }

    pub fn slave_gcm_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.slave_gcm_interval_ms)
    }

    pub fn control_channel_check_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.control_channel_check_interval_secs)
    }
}
