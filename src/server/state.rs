use std::path::PathBuf;

use tokio::process::Child;

use crate::{JobId, Map, Set};

/// Elastic metadata the daemon keeps for a running child.
#[derive(Debug, Clone)]
pub struct ElasticAlloc {
    pub min_cpus: u32,
    pub max_cpus: u32,
    pub control_file: PathBuf,
}

/// In-memory record of one spawned child. `cpus` is the live reservation;
/// for elastic jobs it moves with every scale event.
pub struct RunningJob {
    pub child: Child,
    pub pid: u32,
    pub cpus: u32,
    pub mem_mb: u64,
    pub nodes: Vec<String>,
    pub start_time: f64,
    pub stdout_path: PathBuf,
    pub stderr_path: PathBuf,
    pub elastic: Option<ElasticAlloc>,
    /// Last sampled cumulative child CPU times (user, system) in seconds.
    /// Sampled while the child is alive; the exit row records the final
    /// sample.
    pub cpu_times: Option<(f64, f64)>,
}

/// Process-local model of the cluster: fixed totals plus the running map.
/// All mutations happen inside the scheduler loop.
pub struct SchedulerState {
    total_cpus: u32,
    total_mem_mb: u64,
    running: Map<JobId, RunningJob>,
}

impl SchedulerState {
    pub fn new(total_cpus: u32, total_mem_mb: u64) -> Self {
        Self {
            total_cpus,
            total_mem_mb,
            running: Map::new(),
        }
    }

    pub fn total_cpus(&self) -> u32 {
        self.total_cpus
    }

    pub fn total_mem_mb(&self) -> u64 {
        self.total_mem_mb
    }

    pub fn used_cpus(&self) -> u32 {
        self.running.values().map(|job| job.cpus).sum()
    }

    pub fn used_mem_mb(&self) -> u64 {
        self.running.values().map(|job| job.mem_mb).sum()
    }

    pub fn avail_cpus(&self) -> u32 {
        self.total_cpus.saturating_sub(self.used_cpus())
    }

    pub fn avail_mem_mb(&self) -> u64 {
        self.total_mem_mb.saturating_sub(self.used_mem_mb())
    }

    pub fn used_nodes(&self) -> Set<String> {
        self.running
            .values()
            .flat_map(|job| job.nodes.iter().cloned())
            .collect()
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn insert_running(&mut self, job_id: JobId, job: RunningJob) {
        assert!(self.running.insert(job_id, job).is_none());
    }

    pub fn remove_running(&mut self, job_id: JobId) -> Option<RunningJob> {
        self.running.remove(&job_id)
    }

    pub fn get_running(&self, job_id: JobId) -> Option<&RunningJob> {
        self.running.get(&job_id)
    }

    pub fn get_running_mut(&mut self, job_id: JobId) -> Option<&mut RunningJob> {
        self.running.get_mut(&job_id)
    }

    pub fn running_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.running.keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}
