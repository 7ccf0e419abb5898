use clap::Parser;

use crate::client::globalsettings::GlobalSettings;
use crate::client::output::CliOutput;
use crate::common::error::MsError;
use crate::store::{CancelOutcome, JobStatus, JobStore};
use crate::JobId;

#[derive(Parser)]
pub struct QueueOpts {
    /// Filter by job status
    #[arg(long, value_enum)]
    status: Option<JobStatus>,
}

#[derive(Parser)]
pub struct ShowOpts {
    job_id: JobId,
}

#[derive(Parser)]
pub struct CancelOpts {
    job_id: JobId,
}

pub async fn command_queue(
    gsettings: &GlobalSettings,
    output: &CliOutput,
    opts: QueueOpts,
) -> anyhow::Result<()> {
    let store = JobStore::open(gsettings.db_path()).await?;
    let jobs = store.list(opts.status).await?;
    if jobs.is_empty() {
        println!("No jobs found.");
        return Ok(());
    }
    output.print_job_list(&jobs);
    Ok(())
}

pub async fn command_show(
    gsettings: &GlobalSettings,
    output: &CliOutput,
    opts: ShowOpts,
) -> anyhow::Result<()> {
    let store = JobStore::open(gsettings.db_path()).await?;
    match store.get(opts.job_id).await? {
        Some(job) => {
            output.print_job_detail(&job);
            Ok(())
        }
        None => Err(MsError::InvalidUsage(format!("Job {} not found", opts.job_id)).into()),
    }
}

pub async fn command_cancel(gsettings: &GlobalSettings, opts: CancelOpts) -> anyhow::Result<()> {
    let store = JobStore::open(gsettings.db_path()).await?;
    match store.cancel_pending(opts.job_id).await? {
        CancelOutcome::Cancelled => {
            println!("Cancelled job {}", opts.job_id);
            Ok(())
        }
        CancelOutcome::AlreadyCancelled => {
            log::warn!("Job {} was already cancelled", opts.job_id);
            Ok(())
        }
        CancelOutcome::NotFound => {
            Err(MsError::InvalidUsage(format!("Job {} not found", opts.job_id)).into())
        }
        CancelOutcome::NotPending(status) => Err(MsError::InvalidUsage(format!(
            "Job {} cannot be cancelled: it is {}, only {} jobs can be cancelled",
            opts.job_id,
            status,
            JobStatus::Pending
        ))
        .into()),
    }
}
