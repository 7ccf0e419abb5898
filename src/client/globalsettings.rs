use std::path::{Path, PathBuf};

/// Resolved file-system layout shared by every subcommand.
pub struct GlobalSettings {
    db_path: PathBuf,
    log_dir: PathBuf,
}

impl GlobalSettings {
    pub fn new(db_path: PathBuf, log_dir: PathBuf) -> Self {
        Self { db_path, log_dir }
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }
}
