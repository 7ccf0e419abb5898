macro_rules! create_ms_env {
    ($name: literal) => {
        concat!("MINI_SLURM_", $name)
    };
}

/// Variables exported to elastic children only.
pub const MS_ELASTIC: &str = create_ms_env!("ELASTIC");
pub const MS_JOB_ID: &str = create_ms_env!("JOB_ID");
pub const MS_CONTROL_FILE: &str = create_ms_env!("CONTROL_FILE");
pub const MS_CURRENT_CPUS: &str = create_ms_env!("CURRENT_CPUS");
pub const MS_MIN_CPUS: &str = create_ms_env!("MIN_CPUS");
pub const MS_MAX_CPUS: &str = create_ms_env!("MAX_CPUS");

/// Advisory thread-count variables set for every child to the allocated
/// CPU count (initial value only; scale events do not rewrite them).
pub const THREAD_COUNT_ENV_VARS: [&str; 3] =
    ["OMP_NUM_THREADS", "MKL_NUM_THREADS", "NUMEXPR_NUM_THREADS"];
