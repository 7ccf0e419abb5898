use std::path::PathBuf;

use clap::{Parser, Subcommand};

use mini_slurm::client::commands::jobs::{
    command_cancel, command_queue, command_show, CancelOpts, QueueOpts, ShowOpts,
};
use mini_slurm::client::commands::stats::{command_stats, StatsOpts};
use mini_slurm::client::commands::submit::{submit_job, SubmitOpts};
use mini_slurm::client::globalsettings::GlobalSettings;
use mini_slurm::client::output::CliOutput;
use mini_slurm::common::error::MsError;
use mini_slurm::common::fsutils::{absolute_path, default_db_path, default_log_dir};
use mini_slurm::common::setup::setup_logging;
use mini_slurm::server::bootstrap::{run_scheduler, SchedulerOpts};

#[derive(Parser)]
#[command(
    name = "mini-slurm",
    version = mini_slurm::MS_VERSION,
    about = "A tiny local HPC-style job scheduler"
)]
struct RootOptions {
    #[clap(flatten)]
    common: CommonOpts,

    #[command(subcommand)]
    subcmd: SubCommand,
}

#[derive(Parser)]
struct CommonOpts {
    /// Path of the job store database
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Directory for job stdout/stderr logs and control files
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    /// More verbose log output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum SubCommand {
    /// Submit a job
    Submit(SubmitOpts),
    /// Show the job queue
    Queue(QueueOpts),
    /// Show job details
    Show(ShowOpts),
    /// Cancel a pending job
    Cancel(CancelOpts),
    /// Show system statistics and job metrics
    Stats(StatsOpts),
    /// Run the scheduler daemon
    Scheduler(SchedulerOpts),
}

fn make_global_settings(opts: &CommonOpts) -> GlobalSettings {
    let db_path = absolute_path(opts.db_path.clone().unwrap_or_else(default_db_path));
    let log_dir = absolute_path(opts.log_dir.clone().unwrap_or_else(default_log_dir));
    GlobalSettings::new(db_path, log_dir)
}

/// Exit code contract: 0 success, 1 user error, 2 store unavailable.
fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<MsError>() {
        Some(MsError::StoreError(_)) => 2,
        _ => 1,
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Clap exits with 2 on bad arguments by default; 2 is reserved for an
    // unavailable store, so remap argument errors to 1.
    let top_opts = match RootOptions::try_parse() {
        Ok(opts) => opts,
        Err(error) => {
            let _ = error.print();
            let code = if error.use_stderr() { 1 } else { 0 };
            std::process::exit(code);
        }
    };
    setup_logging(top_opts.common.debug);

    let gsettings = make_global_settings(&top_opts.common);
    let output = CliOutput::new();

    let result = match top_opts.subcmd {
        SubCommand::Submit(opts) => submit_job(&gsettings, opts).await,
        SubCommand::Queue(opts) => command_queue(&gsettings, &output, opts).await,
        SubCommand::Show(opts) => command_show(&gsettings, &output, opts).await,
        SubCommand::Cancel(opts) => command_cancel(&gsettings, opts).await,
        SubCommand::Stats(opts) => command_stats(&gsettings, &output, opts).await,
        SubCommand::Scheduler(opts) => run_scheduler(&gsettings, opts).await,
    };

    if let Err(error) = result {
        let code = exit_code(&error);
        output.print_error(&error);
        std::process::exit(code);
    }
}
