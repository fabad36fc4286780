use super::models::{NewRemoteJob, RemoteJob};
use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::ids::{ClusterId, JobId, RemoteJobId};
use chrono::Utc;
use sqlx::Row;

fn row_to_remote_job(row: sqlx::sqlite::SqliteRow) -> CoreResult<RemoteJob> {
    let assigned_nodes: String = row.try_get("assigned_nodes")?;
    let metadata: String = row.try_get("metadata")?;
    let submitted_at: String = row.try_get("submitted_at")?;
    Ok(RemoteJob {
        id: RemoteJobId(row.try_get("id")?),
        job_id: JobId(row.try_get("job_id")?),
        cluster_id: ClusterId(row.try_get("cluster_id")?),
        remote_handle: row.try_get("remote_handle")?,
        submitted_at: chrono::DateTime::parse_from_rfc3339(&submitted_at)
            .map_err(|e| CoreError::validation(format!("bad timestamp: {e}")))?
            .with_timezone(&Utc),
        queue_name: row.try_get("queue_name")?,
        assigned_nodes: serde_json::from_str(&assigned_nodes)?,
        remote_work_dir: row.try_get("remote_work_dir")?,
        remote_stdout: row.try_get("remote_stdout")?,
        remote_stderr: row.try_get("remote_stderr")?,
        metadata: serde_json::from_str(&metadata)?,
    })
}

impl Store {
    /// Record a remote submission for a job. A job has at most one
    /// `remote_jobs` row (enforced by a unique index on `job_id`).
    pub async fn create_remote_job(&self, attrs: NewRemoteJob) -> CoreResult<RemoteJobId> {
        let assigned_nodes = serde_json::to_string(&attrs.assigned_nodes)?;
        let metadata = serde_json::to_string(&attrs.metadata)?;
        let now = self.now().to_rfc3339();
        let result = sqlx::query(
            "INSERT INTO remote_jobs (job_id, cluster_id, remote_handle, submitted_at,
                queue_name, assigned_nodes, remote_work_dir, remote_stdout, remote_stderr,
                metadata)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(attrs.job_id.0)
        .bind(attrs.cluster_id.0)
        .bind(&attrs.remote_handle)
        .bind(&now)
        .bind(&attrs.queue_name)
        .bind(&assigned_nodes)
        .bind(&attrs.remote_work_dir)
        .bind(&attrs.remote_stdout)
        .bind(&attrs.remote_stderr)
        .bind(&metadata)
        .execute(&self.pool)
        .await?;
        Ok(RemoteJobId(result.last_insert_rowid()))
    }

    pub async fn get_remote_job_by_job(&self, job_id: JobId) -> CoreResult<RemoteJob> {
        let row = sqlx::query("SELECT * FROM remote_jobs WHERE job_id = ?")
            .bind(job_id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("remote job for job {job_id}")))?;
        row_to_remote_job(row)
    }

    /// Drop a job's remote-submission record, if any. A no-op for jobs
    /// that never had one (e.g. local runner jobs) — callers don't need to
    /// know whether a row exists before cleaning up at terminal state.
    pub async fn delete_remote_job(&self, job_id: JobId) -> CoreResult<()> {
        sqlx::query("DELETE FROM remote_jobs WHERE job_id = ?")
            .bind(job_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_remote_output(
        &self,
        job_id: JobId,
        stdout: Option<String>,
        stderr: Option<String>,
    ) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE remote_jobs SET remote_stdout = ?, remote_stderr = ? WHERE job_id = ?",
        )
        .bind(stdout)
        .bind(stderr)
        .bind(job_id.0)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!(
                "remote job for job {job_id}"
            )));
        }
        Ok(())
    }
}
