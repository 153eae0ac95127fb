//! Handle for the single long-running application process on the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The application process started by the last successful restart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessHandle {
    /// OS process id on the host
    pub pid: u32,

    /// Port the process binds
    pub port: u16,

    /// Application log on the host
    pub log_path: String,

    /// When the restart reported the pid
    pub started_at: DateTime<Utc>,
}

impl ProcessHandle {
    pub fn new(pid: u32, port: u16, log_path: impl Into<String>) -> Self {
        Self {
            pid,
            port,
            log_path: log_path.into(),
            started_at: Utc::now(),
        }
    }

    /// Extract the pid from start-script output.
    ///
    /// The start script prints `pid=<n>` as its last marker line; anything
    /// else the shell printed before it is ignored.
    pub fn parse_pid(output: &str) -> Option<u32> {
        output
            .lines()
            .rev()
            .filter_map(|line| line.trim().strip_prefix("pid="))
            .find_map(|pid| pid.trim().parse().ok())
    }
}
