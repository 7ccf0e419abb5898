use clap::Parser;

use crate::client::globalsettings::GlobalSettings;
use crate::client::output::{CliOutput, SystemInfo};
use crate::common::format::ArgMemory;
use crate::server::bootstrap::{detect_total_cpus, detect_total_mem_mb};
use crate::store::JobStore;

#[derive(Parser)]
pub struct StatsOpts {
    /// Override detected total CPUs
    #[arg(long)]
    total_cpus: Option<u32>,

    /// Override total memory (e.g. 16GB)
    #[arg(long)]
    total_mem: Option<ArgMemory>,
}

pub async fn command_stats(
    gsettings: &GlobalSettings,
    output: &CliOutput,
    opts: StatsOpts,
) -> anyhow::Result<()> {
    let store = JobStore::open(gsettings.db_path()).await?;
    let stats = store.stats().await?;

    let total_cpus = opts.total_cpus.unwrap_or_else(detect_total_cpus);
    let total_mem_mb = opts
        .total_mem
        .map(|mem| mem.unpack())
        .unwrap_or_else(detect_total_mem_mb);

    output.print_stats(&stats, total_cpus, total_mem_mb, &read_system_info());
    Ok(())
}

fn read_system_info() -> SystemInfo {
    let cpu_percent = psutil::cpu::CpuPercentCollector::new()
        .and_then(|mut collector| {
            collector.cpu_percent()?;
            std::thread::sleep(std::time::Duration::from_millis(100));
            collector.cpu_percent()
        })
        .ok();
    let mem_percent = psutil::memory::virtual_memory()
        .map(|memory| memory.percent())
        .ok();
    SystemInfo {
        cpu_percent,
        mem_percent,
    }
}
