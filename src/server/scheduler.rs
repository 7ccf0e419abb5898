use std::path::PathBuf;
use std::time::Duration;

use crate::common::timeutils::now_epoch;
use crate::server::elastic::{
    apply_scale_deltas, elastic_views, plan_scale_down, plan_scale_up,
};
use crate::server::state::SchedulerState;
use crate::server::supervisor::{self, CpuEnforcement, LaunchRequest};
use crate::store::job::SENTINEL_RETURN_CODE;
use crate::store::{Job, JobStatus, JobStore};
use crate::topology::Topology;
use crate::Set;

pub struct SchedulerSetup {
    pub poll_interval: Duration,
    pub elastic_enabled: bool,
    pub elastic_threshold: f64,
    pub log_dir: PathBuf,
    pub enforcement: CpuEnforcement,
}

/// One admission decision: a pending job plus its assigned nodes (empty
/// when topology is off).
#[derive(Debug)]
pub struct AdmissionCandidate {
    pub job: Job,
    pub nodes: Vec<String>,
}

/// Walks pending jobs in `(priority DESC, submit_time ASC, id ASC)` order
/// and picks every job that fits the remaining resources. A job that does
/// not fit (or cannot assemble a node set) is skipped without reserving
/// anything, so later jobs may pass it.
pub fn plan_admission(
    mut pending: Vec<Job>,
    mut avail_cpus: u32,
    mut avail_mem_mb: u64,
    topology: Option<&Topology>,
    used_nodes: &mut Set<String>,
) -> Vec<AdmissionCandidate> {
    pending.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then(a.submit_time.total_cmp(&b.submit_time))
            .then(a.id.cmp(&b.id))
    });

    let mut admitted = Vec::new();
    for job in pending {
        if job.cpus > avail_cpus || job.mem_mb > avail_mem_mb {
            continue;
        }
        let nodes = match topology {
            Some(topology) => {
                match topology.select_nodes(job.cpus as usize, used_nodes) {
                    Some(nodes) => nodes,
                    None => continue,
                }
            }
            None => Vec::new(),
        };
        avail_cpus -= job.cpus;
        avail_mem_mb -= job.mem_mb;
        used_nodes.extend(nodes.iter().cloned());
        admitted.push(AdmissionCandidate { job, nodes });
    }
    admitted
}

/// The daemon's main loop: reap, scale, admit, sleep. Errors are confined
/// to the offending job; a tick never aborts.
pub async fn run(
    state: &mut SchedulerState,
    store: &JobStore,
    topology: Option<&Topology>,
    setup: &SchedulerSetup,
) {
    loop {
        tick(state, store, topology, setup).await;
        tokio::time::sleep(setup.poll_interval).await;
    }
}

pub async fn tick(
    state: &mut SchedulerState,
    store: &JobStore,
    topology: Option<&Topology>,
    setup: &SchedulerSetup,
) {
    reap_finished(state, store).await;
    if setup.elastic_enabled {
        elastic_pass(state, store, setup.elastic_threshold).await;
    }
    admit_pending(state, store, topology, setup).await;
}

async fn reap_finished(state: &mut SchedulerState, store: &JobStore) {
    for job_id in state.running_ids() {
        let reaped = {
            let Some(running) = state.get_running_mut(job_id) else {
                continue;
            };
            // The OS forgets child CPU times at reap, so sample first.
            supervisor::sample_cpu_times(running);
            match supervisor::try_reap(running) {
                Ok(reaped) => reaped,
                Err(error) => {
                    log::error!("Polling job {job_id} failed: {error}");
                    continue;
                }
            }
        };
        let Some(return_code) = reaped else {
            continue;
        };

        let Some(finished) = state.remove_running(job_id) else {
            continue;
        };
        let end_time = now_epoch();
        let runtime = (end_time - finished.start_time).max(0.0);
        let status = if return_code == 0 {
            JobStatus::Completed
        } else {
            JobStatus::Failed
        };
        if let Some(alloc) = &finished.elastic {
            supervisor::remove_control_file(&alloc.control_file);
        }
        let (cpu_user, cpu_system) = match finished.cpu_times {
            Some((user, system)) => (Some(user), Some(system)),
            None => (None, None),
        };
        if let Err(error) = store
            .mark_finished(
                job_id,
                status,
                end_time,
                runtime,
                return_code,
                cpu_user,
                cpu_system,
            )
            .await
        {
            log::error!("Recording exit of job {job_id} failed: {error}");
        }
        log::info!("Job {job_id} finished with rc={return_code} runtime={runtime:.2}s");
    }
}

async fn elastic_pass(state: &mut SchedulerState, store: &JobStore, threshold: f64) {
    let pending = match store.pending_jobs().await {
        Ok(pending) => pending,
        Err(error) => {
            log::error!("Fetching pending jobs for elastic pass failed: {error}");
            return;
        }
    };
    let elastic_rows = match store.running_elastic_jobs().await {
        Ok(rows) => rows,
        Err(error) => {
            log::error!("Fetching elastic jobs failed: {error}");
            return;
        }
    };
    if elastic_rows.is_empty() {
        return;
    }

    let views = elastic_views(state, &elastic_rows);
    let deltas = plan_scale_down(&pending, &views, state.avail_cpus(), state.avail_mem_mb());
    apply_scale_deltas(state, store, &deltas).await;

    let views = elastic_views(state, &elastic_rows);
    let deltas = plan_scale_up(
        &views,
        state.used_cpus(),
        state.used_mem_mb(),
        state.total_cpus(),
        state.total_mem_mb(),
        threshold,
    );
    apply_scale_deltas(state, store, &deltas).await;
}

async fn admit_pending(
    state: &mut SchedulerState,
    store: &JobStore,
    topology: Option<&Topology>,
    setup: &SchedulerSetup,
) {
    let pending = match store.pending_jobs().await {
        Ok(pending) => pending,
        Err(error) => {
            log::error!("Fetching pending jobs failed: {error}");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    let mut used_nodes = state.used_nodes();
    let candidates = plan_admission(
        pending,
        state.avail_cpus(),
        state.avail_mem_mb(),
        topology,
        &mut used_nodes,
    );

    for candidate in candidates {
        let job = candidate.job;
        let cpu_ids: Vec<usize> = match topology {
            Some(topology) => candidate
                .nodes
                .iter()
                .map(|node| topology.cpu_index(node))
                .take(job.cpus as usize)
                .collect(),
            None => (0..job.cpus as usize).collect(),
        };

        let elastic_suffix = if job.is_elastic { " [ELASTIC]" } else { "" };
        let nodes_suffix = if candidate.nodes.is_empty() {
            String::new()
        } else {
            format!(" nodes={}", candidate.nodes.join(","))
        };
        log::info!(
            "Starting job {}: {} (CPUs={}, Mem={} MB){}{}",
            job.id,
            job.command,
            job.cpus,
            job.mem_mb,
            nodes_suffix,
            elastic_suffix
        );

        let launched = supervisor::launch_job(LaunchRequest {
            job: &job,
            cpu_ids,
            nodes: candidate.nodes.clone(),
            log_dir: &setup.log_dir,
            total_cpus: state.total_cpus(),
            enforcement: setup.enforcement,
        });

        match launched {
            Ok(running) => {
                let start_time = running.start_time;
                let wait_time = (start_time - job.submit_time).max(0.0);
                let control_file = running
                    .elastic
                    .as_ref()
                    .map(|alloc| alloc.control_file.display().to_string());
                let result = store
                    .mark_running(
                        job.id,
                        start_time,
                        wait_time,
                        &running.stdout_path.display().to_string(),
                        &running.stderr_path.display().to_string(),
                        control_file.as_deref(),
                        job.is_elastic.then_some(job.cpus),
                        &candidate.nodes,
                    )
                    .await;
                if let Err(error) = result {
                    log::error!("Recording admission of job {} failed: {error}", job.id);
                }
                state.insert_running(job.id, running);
            }
            Err(error) => {
                log::error!("Launching job {} failed: {error}", job.id);
                let now = now_epoch();
                let stdout = supervisor::stdout_path(&setup.log_dir, job.id);
                let stderr = supervisor::stderr_path(&setup.log_dir, job.id);
                let recorded = async {
                    store
                        .mark_running(
                            job.id,
                            now,
                            (now - job.submit_time).max(0.0),
                            &stdout.display().to_string(),
                            &stderr.display().to_string(),
                            None,
                            None,
                            &candidate.nodes,
                        )
                        .await?;
                    store
                        .mark_finished(
                            job.id,
                            JobStatus::Failed,
                            now,
                            0.0,
                            SENTINEL_RETURN_CODE,
                            None,
                            None,
                        )
                        .await
                };
                if let Err(error) = recorded.await {
                    log::error!("Recording launch failure of job {} failed: {error}", job.id);
                }
            }
        }
    }
}
