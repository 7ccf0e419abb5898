use std::path::PathBuf;

pub fn absolute_path(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        let env = std::env::current_dir().unwrap();
        env.join(path)
    }
}

fn home_path(file_name: &str) -> PathBuf {
    let mut home = dirs::home_dir().unwrap_or_else(std::env::temp_dir);
    home.push(file_name);
    home
}

pub fn default_db_path() -> PathBuf {
    home_path(".mini_slurm.db")
}

pub fn default_log_dir() -> PathBuf {
    home_path(".mini_slurm_logs")
}

pub fn default_topology_config_path() -> PathBuf {
    home_path(".mini_slurm_topology.conf")
}
