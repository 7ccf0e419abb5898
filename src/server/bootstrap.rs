use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;

use crate::client::globalsettings::GlobalSettings;
use crate::common::format::ArgMemory;
use crate::common::fsutils::default_topology_config_path;
use crate::common::timeutils::now_epoch;
use crate::server::scheduler::{self, SchedulerSetup};
use crate::server::state::SchedulerState;
use crate::server::supervisor::detect_cpu_enforcement;
use crate::store::JobStore;
use crate::topology::{parse_topology_config, Topology};

const FALLBACK_TOTAL_MEM_MB: u64 = 16 * 1024;

#[derive(Parser)]
pub struct SchedulerOpts {
    /// Override detected total CPUs
    #[arg(long)]
    total_cpus: Option<u32>,

    /// Override total memory (e.g. 16GB)
    #[arg(long)]
    total_mem: Option<ArgMemory>,

    /// Scheduler poll interval in seconds
    #[arg(long, default_value_t = 1.0)]
    poll_interval: f64,

    /// Cluster utilization threshold (percent) below which elastic jobs
    /// scale up
    #[arg(long, default_value_t = 50.0)]
    elastic_threshold: f64,

    /// Disable elastic job scaling
    #[arg(long)]
    disable_elastic: bool,

    /// Path to the topology config file
    #[arg(long)]
    topology_config: Option<PathBuf>,
}

pub fn detect_total_cpus() -> u32 {
    (num_cpus::get() as u32).max(1)
}

pub fn detect_total_mem_mb() -> u64 {
    psutil::memory::virtual_memory()
        .map(|memory| memory.total() / (1024 * 1024))
        .unwrap_or(FALLBACK_TOTAL_MEM_MB)
}

/// Loads the topology for the daemon. An explicitly given config must exist
/// and parse; the default path is used when present, otherwise a default
/// topology is synthesized from the CPU count.
fn load_topology(
    config_path: Option<&Path>,
    total_cpus: u32,
) -> anyhow::Result<Option<Topology>> {
    let (path, explicit) = match config_path {
        Some(path) => (path.to_path_buf(), true),
        None => (default_topology_config_path(), false),
    };
    if path.exists() {
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("Cannot read topology config {}", path.display()))?;
        let config = parse_topology_config(&text)
            .with_context(|| format!("Cannot parse topology config {}", path.display()))?;
        if !config.enabled {
            log::info!(
                "Topology-aware scheduling disabled by {}",
                path.display()
            );
            return Ok(None);
        }
        let topology = Topology::build(&config.switches)
            .with_context(|| format!("Invalid topology config {}", path.display()))?;
        log::info!(
            "Topology-aware scheduling enabled (config: {})",
            path.display()
        );
        Ok(Some(topology))
    } else if explicit {
        bail!("Topology config {} not found", path.display());
    } else {
        log::info!("Topology-aware scheduling enabled (synthesized default)");
        Ok(Some(Topology::synthesize_default(total_cpus)))
    }
}

pub async fn run_scheduler(
    gsettings: &GlobalSettings,
    opts: SchedulerOpts,
) -> anyhow::Result<()> {
    let total_cpus = opts.total_cpus.unwrap_or_else(detect_total_cpus);
    let total_mem_mb = opts
        .total_mem
        .map(|mem| mem.unpack())
        .unwrap_or_else(detect_total_mem_mb);
    if total_cpus < 1 || total_mem_mb < 1 {
        bail!("Total CPUs and memory must both be at least 1");
    }

    std::fs::create_dir_all(gsettings.log_dir())
        .with_context(|| format!("Cannot create log directory {}", gsettings.log_dir().display()))?;

    let store = JobStore::open(gsettings.db_path()).await?;
    let orphaned = store.fail_orphaned_running(now_epoch()).await?;
    if orphaned > 0 {
        log::warn!("Marked {orphaned} orphaned RUNNING jobs from a previous daemon as FAILED");
    }

    let topology = load_topology(opts.topology_config.as_deref(), total_cpus)?;

    log::info!("Starting scheduler with {total_cpus} CPUs, {total_mem_mb} MB memory");
    if !opts.disable_elastic {
        log::info!(
            "Elastic scaling enabled (threshold: {}% utilization)",
            opts.elastic_threshold
        );
    }

    let setup = SchedulerSetup {
        poll_interval: Duration::from_secs_f64(opts.poll_interval.max(0.05)),
        elastic_enabled: !opts.disable_elastic,
        elastic_threshold: opts.elastic_threshold,
        log_dir: gsettings.log_dir().to_path_buf(),
        enforcement: detect_cpu_enforcement(),
    };
    let mut state = SchedulerState::new(total_cpus, total_mem_mb);
    scheduler::run(&mut state, &store, topology.as_ref(), &setup).await;
    Ok(())
}
