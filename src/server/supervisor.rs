use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::common::env::{
    MS_CONTROL_FILE, MS_CURRENT_CPUS, MS_ELASTIC, MS_JOB_ID, MS_MAX_CPUS, MS_MIN_CPUS,
    THREAD_COUNT_ENV_VARS,
};
use crate::common::timeutils::now_epoch;
use crate::server::state::{ElasticAlloc, RunningJob};
use crate::store::job::{Job, SENTINEL_RETURN_CODE};
use crate::{JobId, Map};

/// Commands are handed to the OS shell, so users can submit pipelines and
/// `python train.py`-style lines directly.
pub const SHELL: &str = "/bin/sh";

/// How CPU allocations are enforced on this host, picked once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuEnforcement {
    /// Wrap the command in `taskset -c <ids>`.
    Taskset,
    /// No affinity support; rely on the thread-count environment variables.
    ThreadEnv,
}

pub fn detect_cpu_enforcement() -> CpuEnforcement {
    if cfg!(target_os = "linux") && taskset_available() {
        CpuEnforcement::Taskset
    } else {
        CpuEnforcement::ThreadEnv
    }
}

fn taskset_available() -> bool {
    std::env::var_os("PATH")
        .map(|paths| std::env::split_paths(&paths).any(|dir| dir.join("taskset").is_file()))
        .unwrap_or(false)
}

pub struct LaunchRequest<'a> {
    pub job: &'a Job,
    pub cpu_ids: Vec<usize>,
    pub nodes: Vec<String>,
    pub log_dir: &'a Path,
    pub total_cpus: u32,
    pub enforcement: CpuEnforcement,
}

pub fn stdout_path(log_dir: &Path, job_id: JobId) -> PathBuf {
    log_dir.join(format!("job_{job_id}.out"))
}

pub fn stderr_path(log_dir: &Path, job_id: JobId) -> PathBuf {
    log_dir.join(format!("job_{job_id}.err"))
}

pub fn control_file_path(log_dir: &Path, job_id: JobId) -> PathBuf {
    log_dir.join(format!("job_{job_id}.control"))
}

/// Spawns the job's child process with its own process group, an
/// address-space cap, captured output streams and the per-job environment.
pub fn launch_job(request: LaunchRequest) -> crate::Result<RunningJob> {
    let job = request.job;
    let stdout_path = stdout_path(request.log_dir, job.id);
    let stderr_path = stderr_path(request.log_dir, job.id);

    let elastic = if job.is_elastic {
        let control_file = control_file_path(request.log_dir, job.id);
        let alloc = ElasticAlloc {
            min_cpus: job.min_cpus.unwrap_or(job.cpus),
            max_cpus: job.max_cpus.unwrap_or(request.total_cpus),
            control_file,
        };
        write_control_file(
            &alloc.control_file,
            job.cpus,
            job.mem_mb,
            alloc.min_cpus,
            alloc.max_cpus,
            None,
        )?;
        Some(alloc)
    } else {
        None
    };

    let stdout = File::create(&stdout_path)?;
    let stderr = File::create(&stderr_path)?;

    let command_line = build_command_line(
        &job.command,
        &request.cpu_ids,
        job.cpus,
        request.total_cpus,
        request.enforcement,
    );

    let mut command = Command::new(SHELL);
    command.arg("-c").arg(&command_line);
    command.stdout(Stdio::from(stdout));
    command.stderr(Stdio::from(stderr));
    command.stdin(Stdio::null());
    command.kill_on_drop(true);

    for name in THREAD_COUNT_ENV_VARS {
        command.env(name, job.cpus.to_string());
    }
    if let Some(alloc) = &elastic {
        command.env(MS_ELASTIC, "1");
        command.env(MS_JOB_ID, job.id.to_string());
        command.env(MS_CONTROL_FILE, &alloc.control_file);
        command.env(MS_CURRENT_CPUS, job.cpus.to_string());
        command.env(MS_MIN_CPUS, alloc.min_cpus.to_string());
        command.env(MS_MAX_CPUS, alloc.max_cpus.to_string());
    }

    let mem_bytes = job.mem_mb.saturating_mul(1024 * 1024) as libc::rlim_t;
    unsafe {
        command.pre_exec(move || {
            // Own process group, so scale notifications and the OOM limit
            // stay confined to this job.
            if let Err(error) = nix::unistd::setsid() {
                log::error!("Cannot set SID for job process: {error:?}");
            }
            #[cfg(target_os = "linux")]
            {
                // Terminate the job when the daemon dies.
                let ret = libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM);
                if ret != 0 {
                    log::error!("Cannot set PR_SET_PDEATHSIG for job process: {ret}");
                }
            }
            let limit = libc::rlimit {
                rlim_cur: mem_bytes,
                rlim_max: mem_bytes,
            };
            if libc::setrlimit(libc::RLIMIT_AS, &limit) != 0 {
                log::error!("Cannot set memory limit for job process");
            }
            Ok(())
        });
    }

    let child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            append_to_log(&stderr_path, &format!("Launch failed: {error}\n"));
            if let Some(alloc) = &elastic {
                remove_control_file(&alloc.control_file);
            }
            return Err(crate::Error::GenericError(format!(
                "Spawning job {} failed: {error}",
                job.id
            )));
        }
    };
    let pid = child.id().unwrap_or_default();

    Ok(RunningJob {
        child,
        pid,
        cpus: job.cpus,
        mem_mb: job.mem_mb,
        nodes: request.nodes,
        start_time: now_epoch(),
        stdout_path,
        stderr_path,
        elastic,
        cpu_times: None,
    })
}

fn build_command_line(
    command: &str,
    cpu_ids: &[usize],
    cpus: u32,
    total_cpus: u32,
    enforcement: CpuEnforcement,
) -> String {
    if enforcement == CpuEnforcement::Taskset && !cpu_ids.is_empty() && cpus < total_cpus {
        let ids = cpu_ids
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!("taskset -c {ids} {command}")
    } else {
        command.to_string()
    }
}

fn append_to_log(path: &Path, message: &str) {
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(message.as_bytes()));
    if let Err(error) = result {
        log::warn!("Cannot write to log {}: {error}", path.display());
    }
}

/// Non-blocking exit check. Returns the recorded return code when the
/// child has finished: its exit code, or minus the terminating signal.
pub fn try_reap(job: &mut RunningJob) -> std::io::Result<Option<i64>> {
    Ok(job.child.try_wait()?.map(exit_return_code))
}

fn exit_return_code(status: std::process::ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map(|signal| -(signal as i64))
        .unwrap_or(SENTINEL_RETURN_CODE)
}

/// Samples cumulative child CPU times while the child is still alive; the
/// OS forgets them once the child is reaped.
pub fn sample_cpu_times(job: &mut RunningJob) {
    if let Ok(process) = psutil::process::Process::new(job.pid) {
        if let Ok(times) = process.cpu_times() {
            job.cpu_times = Some((times.user().as_secs_f64(), times.system().as_secs_f64()));
        }
    }
}

/// Best-effort scale notification; the control file stays authoritative.
pub fn notify_scale_event(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;
    if let Err(error) = killpg(Pid::from_raw(pid as i32), Signal::SIGUSR1) {
        log::debug!("Sending SIGUSR1 to process group {pid} failed: {error}");
    }
}

/// Writes the control file atomically (temp + rename) so the job never
/// reads a torn file. `scale_event` is present from the first scale on.
pub fn write_control_file(
    path: &Path,
    cpus: u32,
    mem_mb: u64,
    min_cpus: u32,
    max_cpus: u32,
    scale_event: Option<f64>,
) -> std::io::Result<()> {
    let mut contents = format!(
        "CPUS={cpus}\nMEM_MB={mem_mb}\nMIN_CPUS={min_cpus}\nMAX_CPUS={max_cpus}\nSTATUS=RUNNING\n"
    );
    if let Some(event) = scale_event {
        contents.push_str(&format!("SCALE_EVENT={event}\n"));
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)
}

pub fn read_control_file(path: &Path) -> std::io::Result<Map<String, String>> {
    let text = std::fs::read_to_string(path)?;
    Ok(text
        .lines()
        .filter_map(|line| {
            line.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect())
}

pub fn remove_control_file(path: &Path) {
    if let Err(error) = std::fs::remove_file(path) {
        if error.kind() != std::io::ErrorKind::NotFound {
            log::warn!("Cannot remove control file {}: {error}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::time::Duration;

    use tempdir::TempDir;

    use super::{
        build_command_line, exit_return_code, launch_job, read_control_file, try_reap,
        write_control_file, CpuEnforcement, LaunchRequest,
    };
    use crate::store::job::{Job, JobStatus};

    fn test_job(id: i64, command: &str, cpus: u32) -> Job {
        Job {
            id,
            command: command.to_string(),
            cpus,
            mem_mb: 256,
            status: JobStatus::Pending,
            priority: 0,
            submit_time: 0.0,
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

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(exit_return_code(ExitStatus::from_raw(0)), 0);
        assert_eq!(exit_return_code(ExitStatus::from_raw(3 << 8)), 3);
        // Terminated by SIGKILL
        assert_eq!(exit_return_code(ExitStatus::from_raw(9)), -9);
    }

    #[test]
    fn test_command_line_wrapping() {
        assert_eq!(
            build_command_line("echo hi", &[0, 1], 2, 8, CpuEnforcement::Taskset),
            "taskset -c 0,1 echo hi"
        );
        // Whole-machine jobs are not pinned.
        assert_eq!(
            build_command_line("echo hi", &[0, 1], 8, 8, CpuEnforcement::Taskset),
            "echo hi"
        );
        assert_eq!(
            build_command_line("echo hi", &[0, 1], 2, 8, CpuEnforcement::ThreadEnv),
            "echo hi"
        );
    }

    #[test]
    fn test_control_file_round_trip() {
        let dir = TempDir::new("ms-test").unwrap();
        let path = dir.path().join("job_1.control");
        write_control_file(&path, 4, 2048, 2, 8, None).unwrap();
        let fields = read_control_file(&path).unwrap();
        assert_eq!(fields["CPUS"], "4");
        assert_eq!(fields["MEM_MB"], "2048");
        assert_eq!(fields["MIN_CPUS"], "2");
        assert_eq!(fields["MAX_CPUS"], "8");
        assert_eq!(fields["STATUS"], "RUNNING");
        assert!(!fields.contains_key("SCALE_EVENT"));

        write_control_file(&path, 6, 2048, 2, 8, Some(1234.5)).unwrap();
        let fields = read_control_file(&path).unwrap();
        assert_eq!(fields["CPUS"], "6");
        assert_eq!(fields["SCALE_EVENT"], "1234.5");
        // The temp file never survives the rename.
        assert!(!path.with_extension("tmp").exists());
    }

    #[tokio::test]
    async fn test_launch_and_reap() {
        let dir = TempDir::new("ms-test").unwrap();
        let job = test_job(1, "exit 3", 1);
        let mut running = launch_job(LaunchRequest {
            job: &job,
            cpu_ids: vec![0],
            nodes: vec![],
            log_dir: dir.path(),
            total_cpus: 4,
            enforcement: CpuEnforcement::ThreadEnv,
        })
        .unwrap();

        let mut return_code = None;
        for _ in 0..100 {
            if let Some(rc) = try_reap(&mut running).unwrap() {
                return_code = Some(rc);
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(return_code, Some(3));
    }

    #[tokio::test]
    async fn test_launch_captures_stdout() {
        let dir = TempDir::new("ms-test").unwrap();
        let job = test_job(2, "echo hello", 1);
        let mut running = launch_job(LaunchRequest {
            job: &job,
            cpu_ids: vec![0],
            nodes: vec![],
            log_dir: dir.path(),
            total_cpus: 4,
            enforcement: CpuEnforcement::ThreadEnv,
        })
        .unwrap();

        for _ in 0..100 {
            if try_reap(&mut running).unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let output = std::fs::read_to_string(dir.path().join("job_2.out")).unwrap();
        assert_eq!(output.trim(), "hello");
    }
}
