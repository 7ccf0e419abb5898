use clap::Parser;

use crate::client::globalsettings::GlobalSettings;
use crate::client::utils::current_user;
use crate::common::error::MsError;
use crate::common::format::ArgMemory;
use crate::common::timeutils::now_epoch;
use crate::store::{JobStore, NewJob};

#[derive(Parser)]
pub struct SubmitOpts {
    /// CPUs required (initial allocation for elastic jobs)
    #[arg(long)]
    cpus: u32,

    /// Memory limit (e.g. 8GB, 1024MB, 512)
    #[arg(long)]
    mem: ArgMemory,

    /// Job priority (higher = earlier)
    #[arg(long, default_value_t = 0)]
    priority: i32,

    /// Enable elastic scaling for this job
    #[arg(long)]
    elastic: bool,

    /// Minimum CPUs for an elastic job [default: --cpus]
    #[arg(long, requires = "elastic")]
    min_cpus: Option<u32>,

    /// Maximum CPUs for an elastic job [default: detected host CPUs]
    #[arg(long, requires = "elastic")]
    max_cpus: Option<u32>,

    /// Command to run, passed to the shell
    #[arg(trailing_var_arg = true, required = true)]
    command: Vec<String>,
}

fn invalid(message: String) -> anyhow::Error {
    MsError::InvalidUsage(message).into()
}

pub async fn submit_job(gsettings: &GlobalSettings, opts: SubmitOpts) -> anyhow::Result<()> {
    let mem_mb = opts.mem.unpack();
    if opts.cpus < 1 {
        return Err(invalid("--cpus must be at least 1".to_string()));
    }
    if mem_mb < 1 {
        return Err(invalid("--mem must be at least 1 MB".to_string()));
    }
    let command = opts.command.join(" ");
    if command.trim().is_empty() {
        return Err(invalid("Command must not be empty".to_string()));
    }

    let (min_cpus, max_cpus) = if opts.elastic {
        let min_cpus = opts.min_cpus.unwrap_or(opts.cpus);
        let max_cpus = opts.max_cpus.unwrap_or_else(|| num_cpus::get() as u32);
        if min_cpus < 1 {
            return Err(invalid("--min-cpus must be at least 1".to_string()));
        }
        if min_cpus > max_cpus {
            return Err(invalid(format!(
                "min_cpus ({min_cpus}) > max_cpus ({max_cpus})"
            )));
        }
        if opts.cpus < min_cpus || opts.cpus > max_cpus {
            return Err(invalid(format!(
                "Initial cpus ({}) must be between min ({min_cpus}) and max ({max_cpus})",
                opts.cpus
            )));
        }
        (Some(min_cpus), Some(max_cpus))
    } else {
        (None, None)
    };

    let store = JobStore::open(gsettings.db_path()).await?;
    let job = NewJob {
        command: command.clone(),
        cpus: opts.cpus,
        mem_mb,
        priority: opts.priority,
        submit_time: now_epoch(),
        user: current_user(),
        is_elastic: opts.elastic,
        min_cpus,
        max_cpus,
    };
    let job_id = store.insert_pending(&job).await?;

    println!("Submitted job {job_id}");
    if opts.elastic {
        println!(
            "  [ELASTIC] cpus={} (min={}, max={}), mem={}MB, priority={}",
            opts.cpus,
            min_cpus.unwrap_or(opts.cpus),
            max_cpus.unwrap_or(opts.cpus),
            mem_mb,
            opts.priority
        );
    } else {
        println!(
            "  cpus={}, mem={}MB, priority={}",
            opts.cpus, mem_mb, opts.priority
        );
    }
    println!("  command={command}");
    Ok(())
}
