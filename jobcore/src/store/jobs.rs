use super::models::{validate_name, Job, JobStatus, NewJob, RunnerKind};
use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::ids::{ClusterId, JobId};
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;

fn parse_ts(s: Option<String>) -> CoreResult<Option<DateTime<Utc>>> {
    match s {
        None => Ok(None),
        Some(s) => Ok(Some(
            DateTime::parse_from_rfc3339(&s)
                .map_err(|e| CoreError::validation(format!("bad timestamp '{s}': {e}")))?
                .with_timezone(&Utc),
        )),
    }
}

fn row_to_job(row: sqlx::sqlite::SqliteRow) -> CoreResult<Job> {
    let status: String = row.try_get("status")?;
    let runner_kind: String = row.try_get("runner_kind")?;
    let parallelism: String = row.try_get("parallelism")?;
    let results_index: Option<String> = row.try_get("results_index")?;
    let cluster_id: Option<i64> = row.try_get("cluster_id")?;
    let created_at: String = row.try_get("created_at")?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        name: row.try_get("name")?,
        work_dir: row.try_get("work_dir")?,
        status: JobStatus::from_str(&status)?,
        code_kind: row.try_get("code_kind")?,
        runner_kind: RunnerKind::from_str(&runner_kind)?,
        cluster_id: cluster_id.map(ClusterId),
        parallelism: serde_json::from_str(&parallelism)?,
        created_at: parse_ts(Some(created_at))?.unwrap(),
        started_at: parse_ts(row.try_get("started_at")?)?,
        ended_at: parse_ts(row.try_get("ended_at")?)?,
        handle: row.try_get("handle")?,
        input_blob: row.try_get("input_blob")?,
        results_blob: row.try_get("results_blob")?,
        results_index: results_index
            .map(|s| serde_json::from_str(&s))
            .transpose()?,
    })
}

impl Store {
    /// Create a job. Fails if `attrs.name` violates the character allowlist.
    /// Status starts at `pending`.
    pub async fn create_job(&self, attrs: NewJob) -> CoreResult<JobId> {
        validate_name(&attrs.name)?;
        let now = self.now().to_rfc3339();
        let parallelism = serde_json::to_string(&attrs.parallelism)?;

        let result = sqlx::query(
            "INSERT INTO jobs (name, work_dir, status, code_kind, runner_kind, cluster_id,
                parallelism, created_at, input_blob)
             VALUES (?, ?, 'pending', ?, ?, ?, ?, ?, ?)",
        )
        .bind(&attrs.name)
        .bind(&attrs.work_dir)
        .bind(&attrs.code_kind)
        .bind(attrs.runner_kind.as_str())
        .bind(attrs.cluster_id.map(|c| c.0))
        .bind(&parallelism)
        .bind(&now)
        .bind(&attrs.input_blob)
        .execute(&self.pool)
        .await?;

        Ok(JobId(result.last_insert_rowid()))
    }

    pub async fn get_job(&self, id: JobId) -> CoreResult<Job> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("job {id}")))?;
        row_to_job(row)
    }

    pub async fn get_jobs_by_status(&self, status: JobStatus) -> CoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    pub async fn get_jobs_by_cluster(&self, cluster_id: ClusterId) -> CoreResult<Vec<Job>> {
        let rows = sqlx::query("SELECT * FROM jobs WHERE cluster_id = ?")
            .bind(cluster_id.0)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_job).collect()
    }

    /// Transition a job's status. Sets `started_at` on entering `running`
    /// and `ended_at` on entering any terminal state. Rejects transitions
    /// not allowed by the state machine in spec.md §4.5.
    pub async fn update_status(
        &self,
        id: JobId,
        new_status: JobStatus,
        handle: Option<String>,
    ) -> CoreResult<()> {
        let current = self.get_job(id).await?.status;
        if !current.can_transition_to(new_status) {
            return Err(CoreError::validation(format!(
                "illegal transition for job {id}: {current} -> {new_status}"
            )));
        }

        let now = self.now().to_rfc3339();
        let mut query = String::from("UPDATE jobs SET status = ?");
        if new_status == JobStatus::Running {
            query.push_str(", started_at = ?");
        }
        if new_status.is_terminal() {
            query.push_str(", ended_at = ?");
        }
        if handle.is_some() {
            query.push_str(", handle = ?");
        }
        query.push_str(" WHERE id = ?");

        let mut q = sqlx::query(&query).bind(new_status.as_str());
        if new_status == JobStatus::Running {
            q = q.bind(now.clone());
        }
        if new_status.is_terminal() {
            q = q.bind(now.clone());
        }
        if let Some(h) = handle {
            q = q.bind(h);
        }
        q = q.bind(id.0);
        q.execute(&self.pool).await?;

        tracing::debug!(job_id = %id, from = %current, to = %new_status, "job status updated");
        Ok(())
    }

    pub async fn update_results(
        &self,
        id: JobId,
        results_blob: Option<String>,
        results_index: Option<serde_json::Value>,
    ) -> CoreResult<()> {
        let results_index = results_index.map(|v| serde_json::to_string(&v)).transpose()?;
        sqlx::query("UPDATE jobs SET results_blob = ?, results_index = ? WHERE id = ?")
            .bind(results_blob)
            .bind(results_index)
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Fetch the status of many jobs in a single query (eliminates N+1
    /// access; spec.md §4.1).
    pub async fn get_status_batch(&self, ids: &[JobId]) -> CoreResult<HashMap<JobId, JobStatus>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("SELECT id, status FROM jobs WHERE id IN ({placeholders})");
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id.0);
        }
        let rows = q.fetch_all(&self.pool).await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let id: i64 = row.try_get("id")?;
            let status: String = row.try_get("status")?;
            out.insert(JobId(id), JobStatus::from_str(&status)?);
        }
        Ok(out)
    }

    /// Check existence of many jobs in a single query.
    pub async fn job_exists_batch(&self, ids: &[JobId]) -> CoreResult<HashMap<JobId, bool>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(",");
        let sql = format!("SELECT id FROM jobs WHERE id IN ({placeholders})");
        let mut q = sqlx::query(&sql);
        for id in ids {
            q = q.bind(id.0);
        }
        let rows = q.fetch_all(&self.pool).await?;
        let existing: std::collections::HashSet<i64> = rows
            .into_iter()
            .map(|r| r.try_get::<i64, _>("id"))
            .collect::<Result<_, _>>()?;
        Ok(ids
            .iter()
            .map(|id| (*id, existing.contains(&id.0)))
            .collect())
    }

    pub async fn delete_job(&self, id: JobId) -> CoreResult<()> {
        let job = self.get_job(id).await?;
        if !job.status.is_terminal() {
            return Err(CoreError::validation(format!(
                "job {id} is not terminal, cannot delete"
            )));
        }
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn new_job() -> NewJob {
        NewJob {
            name: "probe".into(),
            work_dir: "/tmp/probe".into(),
            code_kind: "shell".into(),
            runner_kind: RunnerKind::Local,
            cluster_id: None,
            parallelism: serde_json::json!({}),
            input_blob: "echo hi".into(),
        }
    }

    /// A job's `created_at`/`started_at` track a `ManualClock` exactly,
    /// never the wall clock (spec.md §6).
    #[tokio::test]
    async fn timestamps_follow_the_injected_clock() {
        let start = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = Arc::new(ManualClock::new(start));
        let store = Store::open_in_memory_with_clock(clock.clone()).await.unwrap();

        let id = store.create_job(new_job()).await.unwrap();
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.created_at, start);

        clock.advance(chrono::Duration::hours(3));
        store
            .update_status(id, JobStatus::Scheduled, None)
            .await
            .unwrap();
        store
            .update_status(id, JobStatus::Running, Some("h".into()))
            .await
            .unwrap();
        let job = store.get_job(id).await.unwrap();
        assert_eq!(job.started_at, Some(start + chrono::Duration::hours(3)));
        assert_ne!(job.started_at.unwrap(), job.created_at);
    }
}
