use crate::common::timeutils::now_epoch;
use crate::server::state::SchedulerState;
use crate::server::supervisor::{notify_scale_event, write_control_file};
use crate::store::{Job, JobStore};
use crate::{JobId, Map};

/// Snapshot of one running elastic job used by the planning passes.
#[derive(Debug, Clone)]
pub struct ElasticView {
    pub id: JobId,
    pub priority: i32,
    pub current_cpus: u32,
    pub min_cpus: u32,
    pub max_cpus: u32,
}

/// A planned allocation change for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScaleDelta {
    pub job_id: JobId,
    pub new_cpus: u32,
}

/// Builds planning views from store rows, taking the live allocation from
/// the in-memory reservation (the store lags one write behind during a
/// rolled-back event).
pub fn elastic_views(state: &SchedulerState, rows: &[Job]) -> Vec<ElasticView> {
    rows.iter()
        .filter_map(|job| {
            let running = state.get_running(job.id)?;
            Some(ElasticView {
                id: job.id,
                priority: job.priority,
                current_cpus: running.cpus,
                min_cpus: job.min_cpus.unwrap_or(running.cpus),
                max_cpus: job.max_cpus.unwrap_or(running.cpus),
            })
        })
        .collect()
}

/// Pressure relief: when a pending job outranks every running elastic job
/// and lacks CPUs, shave elastic allocations (lowest priority first, larger
/// allocations first) one CPU at a time down to each job's minimum, until
/// the pending job fits or nothing more can be freed.
///
/// Memory is never scaled, so a pending job that lacks memory is not a
/// scale-down trigger.
pub fn plan_scale_down(
    pending: &[Job],
    elastic: &[ElasticView],
    avail_cpus: u32,
    avail_mem_mb: u64,
) -> Vec<ScaleDelta> {
    let Some(max_elastic_priority) = elastic.iter().map(|e| e.priority).max() else {
        return Vec::new();
    };
    let Some(target) = pending.iter().find(|job| {
        job.priority > max_elastic_priority
            && job.cpus > avail_cpus
            && job.mem_mb <= avail_mem_mb
    }) else {
        return Vec::new();
    };

    let mut victims: Vec<&ElasticView> = elastic.iter().collect();
    victims.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(b.current_cpus.cmp(&a.current_cpus))
            .then(a.id.cmp(&b.id))
    });

    let mut needed = target.cpus - avail_cpus;
    let mut deltas = Vec::new();
    for victim in victims {
        if needed == 0 {
            break;
        }
        let shavable = victim.current_cpus.saturating_sub(victim.min_cpus);
        let shave = needed.min(shavable);
        if shave > 0 {
            deltas.push(ScaleDelta {
                job_id: victim.id,
                new_cpus: victim.current_cpus - shave,
            });
            needed -= shave;
        }
    }
    deltas
}

/// Growth: when the cluster is underutilized, hand free CPUs to elastic
/// jobs one at a time (highest priority first, smallest allocation first)
/// until each hits its maximum or the CPUs run out.
pub fn plan_scale_up(
    elastic: &[ElasticView],
    used_cpus: u32,
    used_mem_mb: u64,
    total_cpus: u32,
    total_mem_mb: u64,
    threshold: f64,
) -> Vec<ScaleDelta> {
    if total_cpus == 0 {
        return Vec::new();
    }
    let cpu_util = used_cpus as f64 / total_cpus as f64;
    let mem_util = if total_mem_mb == 0 {
        0.0
    } else {
        used_mem_mb as f64 / total_mem_mb as f64
    };
    let util = cpu_util.max(mem_util) * 100.0;
    if util >= threshold {
        return Vec::new();
    }

    let mut free = total_cpus.saturating_sub(used_cpus);
    let mut grown: Vec<ElasticView> = elastic.to_vec();
    let mut changed: Map<JobId, u32> = Map::new();
    while free > 0 {
        grown.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.current_cpus.cmp(&b.current_cpus))
                .then(a.id.cmp(&b.id))
        });
        let Some(job) = grown.iter_mut().find(|e| e.current_cpus < e.max_cpus) else {
            break;
        };
        job.current_cpus += 1;
        free -= 1;
        changed.insert(job.id, job.current_cpus);
    }

    let mut deltas: Vec<ScaleDelta> = changed
        .into_iter()
        .map(|(job_id, new_cpus)| ScaleDelta { job_id, new_cpus })
        .collect();
    deltas.sort_by_key(|delta| delta.job_id);
    deltas
}

/// Applies planned deltas: in-memory reservation and store first, then the
/// atomic control-file rewrite, then the best-effort notification signal.
/// A control-file write failure rolls the delta back and drops the event.
pub async fn apply_scale_deltas(
    state: &mut SchedulerState,
    store: &JobStore,
    deltas: &[ScaleDelta],
) {
    for delta in deltas {
        let Some(running) = state.get_running_mut(delta.job_id) else {
            continue;
        };
        let Some(alloc) = running.elastic.clone() else {
            continue;
        };
        let old_cpus = running.cpus;
        if old_cpus == delta.new_cpus {
            continue;
        }

        running.cpus = delta.new_cpus;
        if let Err(error) = store.set_current_cpus(delta.job_id, delta.new_cpus).await {
            log::error!(
                "Job {}: persisting scaled allocation failed, dropping scale event: {error}",
                delta.job_id
            );
            if let Some(running) = state.get_running_mut(delta.job_id) {
                running.cpus = old_cpus;
            }
            continue;
        }

        let mem_mb = state
            .get_running(delta.job_id)
            .map(|running| running.mem_mb)
            .unwrap_or_default();
        if let Err(error) = write_control_file(
            &alloc.control_file,
            delta.new_cpus,
            mem_mb,
            alloc.min_cpus,
            alloc.max_cpus,
            Some(now_epoch()),
        ) {
            log::warn!(
                "Job {}: control file update failed, dropping scale event: {error}",
                delta.job_id
            );
            if let Some(running) = state.get_running_mut(delta.job_id) {
                running.cpus = old_cpus;
            }
            if let Err(error) = store.set_current_cpus(delta.job_id, old_cpus).await {
                log::error!("Job {}: rollback of scaled allocation failed: {error}", delta.job_id);
            }
            continue;
        }

        if let Some(running) = state.get_running(delta.job_id) {
            notify_scale_event(running.pid);
        }
        log::info!(
            "Scaled job {} {} {} -> {} CPUs",
            delta.job_id,
            if delta.new_cpus > old_cpus { "UP" } else { "DOWN" },
            old_cpus,
            delta.new_cpus
        );
    }
}

#[cfg(test)]
mod tests {
    use super::{plan_scale_down, plan_scale_up, ElasticView, ScaleDelta};
    use crate::store::job::{Job, JobStatus};

    fn pending_job(id: i64, cpus: u32, mem_mb: u64, priority: i32) -> Job {
        Job {
            id,
            command: "cmd".to_string(),
            cpus,
            mem_mb,
            status: JobStatus::Pending,
            priority,
            submit_time: id as f64,
            start_time: None,
            end_time: None,
            wait_time: None,
            runtime: None,
            return_code: None,
            user: None,
            stdout_path: None,
            stderr_path: None,
            cpu_user_time: None,
            cpu_system_time: None,
            is_elastic: false,
            min_cpus: None,
            max_cpus: None,
            current_cpus: None,
            control_file: None,
            nodes: None,
        }
    }

    fn view(id: i64, priority: i32, current: u32, min: u32, max: u32) -> ElasticView {
        ElasticView {
            id,
            priority,
            current_cpus: current,
            min_cpus: min,
            max_cpus: max,
        }
    }

    #[test]
    fn test_scale_up_to_max() {
        // Idle 8-CPU cluster, one elastic job at 2/8.
        let deltas = plan_scale_up(&[view(1, 0, 2, 2, 8)], 2, 4096, 8, 16384, 50.0);
        assert_eq!(
            deltas,
            vec![ScaleDelta {
                job_id: 1,
                new_cpus: 8
            }]
        );
    }

    #[test]
    fn test_scale_up_respects_max_cpus() {
        let deltas = plan_scale_up(&[view(1, 0, 2, 2, 4)], 2, 1024, 8, 16384, 50.0);
        assert_eq!(deltas[0].new_cpus, 4);
    }

    #[test]
    fn test_scale_up_gated_by_utilization() {
        // 4/8 CPUs used is exactly the 50% threshold.
        assert!(plan_scale_up(&[view(1, 0, 4, 2, 8)], 4, 1024, 8, 16384, 50.0).is_empty());
        // Memory pressure alone also gates the pass.
        assert!(plan_scale_up(&[view(1, 0, 2, 2, 8)], 2, 12288, 8, 16384, 50.0).is_empty());
    }

    #[test]
    fn test_scale_up_priority_first() {
        let views = [view(1, 0, 2, 2, 8), view(2, 5, 2, 2, 8)];
        let deltas = plan_scale_up(&views, 4, 1024, 16, 65536, 50.0);
        // 12 free CPUs: the high-priority job fills to its max first, the
        // rest goes to the other one.
        assert_eq!(
            deltas,
            vec![
                ScaleDelta {
                    job_id: 1,
                    new_cpus: 8
                },
                ScaleDelta {
                    job_id: 2,
                    new_cpus: 8
                }
            ]
        );
    }

    #[test]
    fn test_scale_up_no_elastic_jobs() {
        assert!(plan_scale_up(&[], 0, 0, 8, 16384, 50.0).is_empty());
    }

    #[test]
    fn test_scale_down_for_priority_pressure() {
        // Elastic job grew to 8/8; a priority-10 job needs 4 CPUs.
        let pending = [pending_job(2, 4, 4096, 10)];
        let elastic = [view(1, 0, 8, 2, 8)];
        let deltas = plan_scale_down(&pending, &elastic, 0, 12288);
        assert_eq!(
            deltas,
            vec![ScaleDelta {
                job_id: 1,
                new_cpus: 4
            }]
        );
    }

    #[test]
    fn test_scale_down_stops_at_min_cpus() {
        let pending = [pending_job(2, 8, 1024, 10)];
        let elastic = [view(1, 0, 6, 2, 8)];
        let deltas = plan_scale_down(&pending, &elastic, 0, 4096);
        // Only 4 CPUs can be freed; they are freed anyway.
        assert_eq!(
            deltas,
            vec![ScaleDelta {
                job_id: 1,
                new_cpus: 2
            }]
        );
    }

    #[test]
    fn test_scale_down_requires_strictly_higher_priority() {
        let pending = [pending_job(2, 4, 1024, 5)];
        let elastic = [view(1, 5, 8, 2, 8)];
        assert!(plan_scale_down(&pending, &elastic, 0, 4096).is_empty());
    }

    #[test]
    fn test_scale_down_ignores_memory_infeasible_target() {
        // Freeing CPUs cannot help a job that lacks memory.
        let pending = [pending_job(2, 4, 32768, 10)];
        let elastic = [view(1, 0, 8, 2, 8)];
        assert!(plan_scale_down(&pending, &elastic, 0, 4096).is_empty());
    }

    #[test]
    fn test_scale_down_victim_order() {
        // Lowest priority first, then larger allocations first.
        let pending = [pending_job(9, 6, 1024, 10)];
        let elastic = [view(1, 2, 4, 2, 8), view(2, 0, 4, 2, 8), view(3, 0, 6, 2, 8)];
        let deltas = plan_scale_down(&pending, &elastic, 0, 4096);
        assert_eq!(
            deltas,
            vec![
                ScaleDelta {
                    job_id: 3,
                    new_cpus: 2
                },
                ScaleDelta {
                    job_id: 2,
                    new_cpus: 2
                }
            ]
        );
    }

    #[test]
    fn test_scale_down_noop_when_target_already_fits() {
        let pending = [pending_job(2, 4, 1024, 10)];
        let elastic = [view(1, 0, 4, 2, 8)];
        assert!(plan_scale_down(&pending, &elastic, 4, 8192).is_empty());
    }
}
