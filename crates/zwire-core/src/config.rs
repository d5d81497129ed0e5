//! Driver configuration.

use std::path::PathBuf;
use std::time::Duration;

/// What to do with a snapshot-loaded node's query stage when the init data
/// confirms it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStageReset {
    /// Re-run from Associations so session-ephemeral data is refreshed
    #[default]
    Associations,
    /// Trust the snapshot and leave the node Complete
    Preserve,
}

/// Options consumed by the driver.
#[derive(Debug, Clone)]
pub struct DriverOptions {
    /// Directory where snapshots are read and written
    pub user_path: PathBuf,

    /// Write the snapshot at shutdown
    pub save_configuration: bool,

    /// Give up opening the transport after this many attempts (0 = retry
    /// forever)
    pub driver_max_attempts: u32,

    /// Emit a MsgComplete notification when each transaction closes
    pub notify_transactions: bool,

    /// Time for one full sweep of the poll list
    pub poll_interval: Duration,

    /// Stage policy for snapshot-loaded nodes at init-data reconciliation
    pub query_stage_reset: QueryStageReset,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            user_path: PathBuf::from("."),
            save_configuration: true,
            driver_max_attempts: 0,
            notify_transactions: false,
            poll_interval: Duration::from_secs(30),
            query_stage_reset: QueryStageReset::default(),
        }
    }
}
