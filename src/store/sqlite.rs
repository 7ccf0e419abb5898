use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::store::job::{Job, JobStatus, NewJob, SENTINEL_RETURN_CODE};
use crate::{JobId, Map};

/// Single-file transactional job store shared by the daemon and all
/// clients. The daemon is the only writer of RUNNING-state transitions;
/// clients append submissions and flip PENDING rows to CANCELLED.
#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
}

/// Result of a conditional cancellation.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyCancelled,
    NotFound,
    NotPending(JobStatus),
}

#[derive(Debug, Default)]
pub struct StoreStats {
    pub total_jobs: i64,
    pub status_counts: Map<String, i64>,
    pub running_count: i64,
    pub pending_count: i64,
    pub used_cpus: i64,
    pub used_mem_mb: i64,
    pub avg_wait_time: f64,
    pub avg_runtime: f64,
    pub completed_count: i64,
}

impl JobStore {
    /// Open (or create) the file-backed store.
    pub async fn open<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let url = format!("sqlite://{}", path.as_ref().to_string_lossy());
        let opts = SqliteConnectOptions::from_str(&url)
            .map_err(|e| crate::Error::StoreError(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    /// Open an in-memory store (handy for tests).
    pub async fn open_memory() -> crate::Result<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| crate::Error::StoreError(e.to_string()))?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;
        let store = Self { pool };
        store.bootstrap().await?;
        Ok(store)
    }

    async fn bootstrap(&self) -> crate::Result<()> {
        // Improve concurrency between the daemon and clients.
        let _ = sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              command TEXT NOT NULL,
              cpus INTEGER NOT NULL,
              mem_mb INTEGER NOT NULL,
              status TEXT NOT NULL,
              priority INTEGER NOT NULL DEFAULT 0,
              submit_time REAL NOT NULL,
              start_time REAL,
              end_time REAL,
              wait_time REAL,
              runtime REAL,
              return_code INTEGER,
              user TEXT,
              stdout_path TEXT,
              stderr_path TEXT,
              cpu_user_time REAL,
              cpu_system_time REAL,
              is_elastic INTEGER NOT NULL DEFAULT 0,
              min_cpus INTEGER,
              max_cpus INTEGER,
              current_cpus INTEGER,
              control_file TEXT,
              nodes TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically appends a new PENDING job and returns its id.
    pub async fn insert_pending(&self, job: &NewJob) -> crate::Result<JobId> {
        let current_cpus = job.is_elastic.then_some(job.cpus as i64);
        let row = sqlx::query(
            r#"
            INSERT INTO jobs(
              command, cpus, mem_mb, status, priority, submit_time, user,
              is_elastic, min_cpus, max_cpus, current_cpus
            ) VALUES (?, ?, ?, 'PENDING', ?, ?, ?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(&job.command)
        .bind(job.cpus as i64)
        .bind(job.mem_mb as i64)
        .bind(job.priority)
        .bind(job.submit_time)
        .bind(&job.user)
        .bind(job.is_elastic)
        .bind(job.min_cpus.map(|v| v as i64))
        .bind(job.max_cpus.map(|v| v as i64))
        .bind(current_cpus)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get::<i64, _>("id")?)
    }

    /// Lists jobs, optionally filtered by status, oldest submission first.
    pub async fn list(&self, status: Option<JobStatus>) -> crate::Result<Vec<Job>> {
        let rows = match status {
            Some(status) => {
                sqlx::query("SELECT * FROM jobs WHERE status = ? ORDER BY submit_time ASC, id ASC")
                    .bind(status.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM jobs ORDER BY submit_time ASC, id ASC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    pub async fn get(&self, id: JobId) -> crate::Result<Option<Job>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    /// PENDING jobs in admission order.
    pub async fn pending_jobs(&self) -> crate::Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status = 'PENDING'
            ORDER BY priority DESC, submit_time ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    pub async fn running_elastic_jobs(&self) -> crate::Result<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM jobs
            WHERE status = 'RUNNING' AND is_elastic = 1
            ORDER BY priority ASC, submit_time ASC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    /// Admission transition: PENDING -> RUNNING with launch bookkeeping.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_running(
        &self,
        id: JobId,
        start_time: f64,
        wait_time: f64,
        stdout_path: &str,
        stderr_path: &str,
        control_file: Option<&str>,
        current_cpus: Option<u32>,
        nodes: &[String],
    ) -> crate::Result<()> {
        let nodes = (!nodes.is_empty()).then(|| nodes.join(","));
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'RUNNING',
                start_time = ?,
                wait_time = ?,
                stdout_path = ?,
                stderr_path = ?,
                control_file = ?,
                current_cpus = ?,
                nodes = ?
            WHERE id = ?
            "#,
        )
        .bind(start_time)
        .bind(wait_time)
        .bind(stdout_path)
        .bind(stderr_path)
        .bind(control_file)
        .bind(current_cpus.map(|v| v as i64))
        .bind(nodes)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Reap transition: RUNNING -> COMPLETED/FAILED with exit metrics.
    #[allow(clippy::too_many_arguments)]
    pub async fn mark_finished(
        &self,
        id: JobId,
        status: JobStatus,
        end_time: f64,
        runtime: f64,
        return_code: i64,
        cpu_user_time: Option<f64>,
        cpu_system_time: Option<f64>,
    ) -> crate::Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs
            SET status = ?,
                end_time = ?,
                runtime = ?,
                return_code = ?,
                cpu_user_time = ?,
                cpu_system_time = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(end_time)
        .bind(runtime)
        .bind(return_code)
        .bind(cpu_user_time)
        .bind(cpu_system_time)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Conditional cancellation; only PENDING rows are flipped.
    pub async fn cancel_pending(&self, id: JobId) -> crate::Result<CancelOutcome> {
        let result = sqlx::query("UPDATE jobs SET status = 'CANCELLED' WHERE id = ? AND status = 'PENDING'")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() > 0 {
            return Ok(CancelOutcome::Cancelled);
        }
        match self.get(id).await? {
            None => Ok(CancelOutcome::NotFound),
            Some(job) if job.status == JobStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            Some(job) => Ok(CancelOutcome::NotPending(job.status)),
        }
    }

    pub async fn set_current_cpus(&self, id: JobId, current_cpus: u32) -> crate::Result<()> {
        sqlx::query("UPDATE jobs SET current_cpus = ? WHERE id = ?")
            .bind(current_cpus as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_nodes(&self, id: JobId, nodes: &[String]) -> crate::Result<()> {
        sqlx::query("UPDATE jobs SET nodes = ? WHERE id = ?")
            .bind(nodes.join(","))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Startup reconciliation: a crashed daemon cannot have live children
    /// under its new process, so rows left RUNNING become FAILED.
    pub async fn fail_orphaned_running(&self, now: f64) -> crate::Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'FAILED',
                end_time = ?,
                runtime = ? - start_time,
                return_code = ?
            WHERE status = 'RUNNING'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(SENTINEL_RETURN_CODE)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> crate::Result<StoreStats> {
        let mut stats = StoreStats::default();

        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM jobs GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        for row in rows {
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            stats.total_jobs += count;
            match status.as_str() {
                "RUNNING" => stats.running_count = count,
                "PENDING" => stats.pending_count = count,
                _ => {}
            }
            stats.status_counts.insert(status, count);
        }

        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(COALESCE(current_cpus, cpus)), 0) AS used_cpus,
                   COALESCE(SUM(mem_mb), 0) AS used_mem_mb
            FROM jobs WHERE status = 'RUNNING'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        stats.used_cpus = row.try_get("used_cpus")?;
        stats.used_mem_mb = row.try_get("used_mem_mb")?;

        let row = sqlx::query(
            r#"
            SELECT AVG(wait_time) AS avg_wait, AVG(runtime) AS avg_runtime, COUNT(*) AS count
            FROM jobs
            WHERE status IN ('COMPLETED', 'FAILED')
              AND wait_time IS NOT NULL AND runtime IS NOT NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        stats.avg_wait_time = row.try_get::<Option<f64>, _>("avg_wait")?.unwrap_or(0.0);
        stats.avg_runtime = row.try_get::<Option<f64>, _>("avg_runtime")?.unwrap_or(0.0);
        stats.completed_count = row.try_get("count")?;

        Ok(stats)
    }
}

fn job_from_row(row: &SqliteRow) -> crate::Result<Job> {
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: row.try_get("id")?,
        command: row.try_get("command")?,
        cpus: row.try_get::<i64, _>("cpus")? as u32,
        mem_mb: row.try_get::<i64, _>("mem_mb")? as u64,
        status: status.parse()?,
        priority: row.try_get::<i64, _>("priority")? as i32,
        submit_time: row.try_get("submit_time")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        wait_time: row.try_get("wait_time")?,
        runtime: row.try_get("runtime")?,
        return_code: row.try_get("return_code")?,
        user: row.try_get("user")?,
        stdout_path: row.try_get("stdout_path")?,
        stderr_path: row.try_get("stderr_path")?,
        cpu_user_time: row.try_get("cpu_user_time")?,
        cpu_system_time: row.try_get("cpu_system_time")?,
        is_elastic: row.try_get::<i64, _>("is_elastic")? != 0,
        min_cpus: row.try_get::<Option<i64>, _>("min_cpus")?.map(|v| v as u32),
        max_cpus: row.try_get::<Option<i64>, _>("max_cpus")?.map(|v| v as u32),
        current_cpus: row
            .try_get::<Option<i64>, _>("current_cpus")?
            .map(|v| v as u32),
        control_file: row.try_get("control_file")?,
        nodes: row.try_get("nodes")?,
    })
}

#[cfg(test)]
mod tests {
    use super::{CancelOutcome, JobStore};
    use crate::store::job::{JobStatus, NewJob, SENTINEL_RETURN_CODE};

    fn new_job(command: &str, cpus: u32, priority: i32, submit_time: f64) -> NewJob {
        NewJob {
            command: command.to_string(),
            cpus,
            mem_mb: 1024,
            priority,
            submit_time,
            user: "test".to_string(),
            is_elastic: false,
            min_cpus: None,
            max_cpus: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = JobStore::open_memory().await.unwrap();
        let id = store
            .insert_pending(&new_job("sleep 1", 2, 0, 1000.0))
            .await
            .unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.command, "sleep 1");
        assert_eq!(job.cpus, 2);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.current_cpus, None);
        assert!(store.get(id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_elastic_submission_records_current_cpus() {
        let store = JobStore::open_memory().await.unwrap();
        let mut job = new_job("train", 2, 0, 1000.0);
        job.is_elastic = true;
        job.min_cpus = Some(2);
        job.max_cpus = Some(8);
        let id = store.insert_pending(&job).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert!(job.is_elastic);
        assert_eq!(job.current_cpus, Some(2));
        assert_eq!(job.min_cpus, Some(2));
        assert_eq!(job.max_cpus, Some(8));
    }

    #[tokio::test]
    async fn test_pending_order() {
        let store = JobStore::open_memory().await.unwrap();
        let a = store
            .insert_pending(&new_job("a", 4, 0, 1000.0))
            .await
            .unwrap();
        let b = store
            .insert_pending(&new_job("b", 4, 10, 1001.0))
            .await
            .unwrap();
        let c = store
            .insert_pending(&new_job("c", 4, 5, 1002.0))
            .await
            .unwrap();
        let pending = store.pending_jobs().await.unwrap();
        let ids: Vec<_> = pending.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![b, c, a]);
    }

    #[tokio::test]
    async fn test_cancel_only_pending() {
        let store = JobStore::open_memory().await.unwrap();
        let id = store
            .insert_pending(&new_job("a", 1, 0, 1000.0))
            .await
            .unwrap();
        assert_eq!(
            store.cancel_pending(id).await.unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            store.cancel_pending(id).await.unwrap(),
            CancelOutcome::AlreadyCancelled
        );
        assert_eq!(
            store.cancel_pending(id + 1).await.unwrap(),
            CancelOutcome::NotFound
        );

        let running = store
            .insert_pending(&new_job("b", 1, 0, 1000.0))
            .await
            .unwrap();
        store
            .mark_running(running, 1001.0, 1.0, "out", "err", None, None, &[])
            .await
            .unwrap();
        assert_eq!(
            store.cancel_pending(running).await.unwrap(),
            CancelOutcome::NotPending(JobStatus::Running)
        );
    }

    #[tokio::test]
    async fn test_mark_running_and_finished() {
        let store = JobStore::open_memory().await.unwrap();
        let id = store
            .insert_pending(&new_job("a", 2, 0, 1000.0))
            .await
            .unwrap();
        store
            .mark_running(
                id,
                1002.0,
                2.0,
                "/logs/job_1.out",
                "/logs/job_1.err",
                None,
                None,
                &["node1".to_string(), "node2".to_string()],
            )
            .await
            .unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.wait_time, Some(2.0));
        assert_eq!(job.node_list(), vec!["node1", "node2"]);

        store
            .mark_finished(id, JobStatus::Completed, 1010.0, 8.0, 0, Some(1.5), None)
            .await
            .unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.return_code, Some(0));
        assert_eq!(job.runtime, Some(8.0));
        assert_eq!(job.cpu_user_time, Some(1.5));
    }

    #[tokio::test]
    async fn test_set_current_cpus_and_nodes() {
        let store = JobStore::open_memory().await.unwrap();
        let mut elastic = new_job("train", 2, 0, 1000.0);
        elastic.is_elastic = true;
        elastic.min_cpus = Some(2);
        elastic.max_cpus = Some(8);
        let id = store.insert_pending(&elastic).await.unwrap();

        store.set_current_cpus(id, 6).await.unwrap();
        store
            .set_nodes(id, &["node1".to_string(), "node3".to_string()])
            .await
            .unwrap();

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.current_cpus, Some(6));
        // The requested allocation is preserved.
        assert_eq!(job.cpus, 2);
        assert_eq!(job.node_list(), vec!["node1", "node3"]);
    }

    #[tokio::test]
    async fn test_fail_orphaned_running() {
        let store = JobStore::open_memory().await.unwrap();
        let id = store
            .insert_pending(&new_job("a", 1, 0, 1000.0))
            .await
            .unwrap();
        store
            .mark_running(id, 1001.0, 1.0, "out", "err", None, None, &[])
            .await
            .unwrap();
        let pending = store
            .insert_pending(&new_job("b", 1, 0, 1000.0))
            .await
            .unwrap();

        assert_eq!(store.fail_orphaned_running(1005.0).await.unwrap(), 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.return_code, Some(SENTINEL_RETURN_CODE));
        assert_eq!(job.runtime, Some(4.0));
        // Pending rows are untouched.
        let job = store.get(pending).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_stats() {
        let store = JobStore::open_memory().await.unwrap();
        let a = store
            .insert_pending(&new_job("a", 2, 0, 1000.0))
            .await
            .unwrap();
        store
            .insert_pending(&new_job("b", 1, 0, 1001.0))
            .await
            .unwrap();
        store
            .mark_running(a, 1002.0, 2.0, "out", "err", None, None, &[])
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total_jobs, 2);
        assert_eq!(stats.running_count, 1);
        assert_eq!(stats.pending_count, 1);
        assert_eq!(stats.used_cpus, 2);
        assert_eq!(stats.used_mem_mb, 1024);

        store
            .mark_finished(a, JobStatus::Completed, 1010.0, 8.0, 0, None, None)
            .await
            .unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.avg_runtime, 8.0);
        assert_eq!(stats.used_cpus, 0);
    }
}
