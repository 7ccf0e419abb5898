use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::JobId;

/// Return code recorded for jobs that could not be launched or were left
/// RUNNING by a crashed daemon.
pub const SENTINEL_RETURN_CODE: i64 = -1;

#[derive(clap::ValueEnum, Clone, Copy, Serialize, Deserialize, Debug, PartialEq, Eq)]
#[value(rename_all = "UPPER")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "PENDING" => JobStatus::Pending,
            "RUNNING" => JobStatus::Running,
            "COMPLETED" => JobStatus::Completed,
            "FAILED" => JobStatus::Failed,
            "CANCELLED" => JobStatus::Cancelled,
            _ => {
                return Err(crate::Error::StoreError(format!(
                    "Unknown job status '{s}'"
                )))
            }
        })
    }
}

/// A row of the `jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    /// Initial/requested CPU count; for elastic jobs the live allocation is
    /// `current_cpus`.
    pub cpus: u32,
    pub mem_mb: u64,
    pub status: JobStatus,
    pub priority: i32,
    pub submit_time: f64,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
    pub wait_time: Option<f64>,
    pub runtime: Option<f64>,
    pub return_code: Option<i64>,
    pub user: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub cpu_user_time: Option<f64>,
    pub cpu_system_time: Option<f64>,
    pub is_elastic: bool,
    pub min_cpus: Option<u32>,
    pub max_cpus: Option<u32>,
    pub current_cpus: Option<u32>,
    pub control_file: Option<String>,
    /// Comma-separated node names, empty when topology is off.
    pub nodes: Option<String>,
}

impl Job {
    /// CPU count the daemon has reserved for this job right now.
    pub fn allocated_cpus(&self) -> u32 {
        self.current_cpus.unwrap_or(self.cpus)
    }

    pub fn node_list(&self) -> Vec<String> {
        self.nodes
            .as_deref()
            .filter(|nodes| !nodes.is_empty())
            .map(|nodes| nodes.split(',').map(|n| n.to_string()).collect())
            .unwrap_or_default()
    }
}

/// Fields a client provides at submission; everything else is filled in by
/// the daemon later.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub command: String,
    pub cpus: u32,
    pub mem_mb: u64,
    pub priority: i32,
    pub submit_time: f64,
    pub user: String,
    pub is_elastic: bool,
    pub min_cpus: Option<u32>,
    pub max_cpus: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::JobStatus;
    use std::str::FromStr;

    #[test]
    fn test_status_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(JobStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(JobStatus::from_str("DONE").is_err());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }
}
