use super::models::{validate_name, NewWorkflow, Workflow, WorkflowDag, WorkflowStatus};
use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::graph;
use crate::ids::{JobId, WorkflowId};
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

fn validate_dag(dag: &WorkflowDag) -> CoreResult<()> {
    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    for step in &dag.steps {
        validate_name(&step.name)?;
        adjacency.entry(step.name.clone()).or_default();
        for pred in &step.predecessors {
            adjacency
                .entry(pred.name.clone())
                .or_default()
                .push(step.name.clone());
        }
    }
    graph::assert_acyclic(&adjacency, "workflow steps")
}

impl Store {
    /// Create a workflow and its step rows atomically: one transaction
    /// inserting the `workflows` row and every `workflow_steps` row, so a
    /// reader never observes a workflow with a partial step set. Rejects
    /// DAGs with a step-predecessor cycle.
    pub async fn create_workflow(&self, attrs: NewWorkflow) -> CoreResult<WorkflowId> {
        validate_name(&attrs.name)?;
        validate_dag(&attrs.dag)?;

        let dag_json = serde_json::to_string(&attrs.dag)?;
        let now = self.now().to_rfc3339();

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query(
            "INSERT INTO workflows (name, dag, error_policy, status, created_at)
             VALUES (?, ?, ?, 'running', ?)",
        )
        .bind(&attrs.name)
        .bind(&dag_json)
        .bind(attrs.error_policy.as_str())
        .bind(&now)
        .execute(&mut *tx)
        .await?;
        let workflow_id = WorkflowId(result.last_insert_rowid());

        for step in &attrs.dag.steps {
            sqlx::query(
                "INSERT INTO workflow_steps (workflow_id, name, job_id, status)
                 VALUES (?, ?, NULL, 'pending')",
            )
            .bind(workflow_id.0)
            .bind(&step.name)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(workflow_id)
    }

    pub async fn get_workflow(&self, id: WorkflowId) -> CoreResult<Workflow> {
        let row = sqlx::query("SELECT * FROM workflows WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("workflow {id}")))?;

        let dag: String = row.try_get("dag")?;
        let status: String = row.try_get("status")?;
        let error_policy: String = row.try_get("error_policy")?;
        let created_at: String = row.try_get("created_at")?;

        Ok(Workflow {
            id,
            name: row.try_get("name")?,
            dag: serde_json::from_str(&dag)?,
            error_policy: crate::store::models::ErrorPolicy::from_str(&error_policy)?,
            status: WorkflowStatus::from_str(&status)?,
            created_at: parse_ts(Some(created_at))?.unwrap(),
            started_at: parse_ts(row.try_get("started_at")?)?,
            ended_at: parse_ts(row.try_get("ended_at")?)?,
        })
    }

    pub async fn update_workflow_status(
        &self,
        id: WorkflowId,
        status: WorkflowStatus,
    ) -> CoreResult<()> {
        let now = self.now().to_rfc3339();
        let terminal = matches!(
            status,
            WorkflowStatus::Completed
                | WorkflowStatus::Failed
                | WorkflowStatus::Partial
                | WorkflowStatus::Cancelled
        );
        if terminal {
            sqlx::query("UPDATE workflows SET status = ?, ended_at = ? WHERE id = ?")
                .bind(status.as_str())
                .bind(&now)
                .bind(id.0)
                .execute(&self.pool)
                .await?;
        } else {
            sqlx::query("UPDATE workflows SET status = ?, started_at = COALESCE(started_at, ?) WHERE id = ?")
                .bind(status.as_str())
                .bind(&now)
                .bind(id.0)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    /// Bind a workflow step to the job created for it, and set the step's
    /// own execution status.
    pub async fn bind_workflow_step(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        job_id: JobId,
    ) -> CoreResult<()> {
        let result = sqlx::query(
            "UPDATE workflow_steps SET job_id = ?, status = 'scheduled'
             WHERE workflow_id = ? AND name = ?",
        )
        .bind(job_id.0)
        .bind(workflow_id.0)
        .bind(step_name)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!(
                "step '{step_name}' in workflow {workflow_id}"
            )));
        }
        Ok(())
    }

    pub async fn update_step_status(
        &self,
        workflow_id: WorkflowId,
        step_name: &str,
        status: &str,
    ) -> CoreResult<()> {
        sqlx::query("UPDATE workflow_steps SET status = ? WHERE workflow_id = ? AND name = ?")
            .bind(status)
            .bind(workflow_id.0)
            .bind(step_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Ids of every workflow not yet in a terminal status, for the
    /// orchestrator's background poll loop.
    pub async fn list_running_workflow_ids(&self) -> CoreResult<Vec<WorkflowId>> {
        let rows = sqlx::query("SELECT id FROM workflows WHERE status = 'running'")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| Ok(WorkflowId(row.try_get("id")?)))
            .collect()
    }

    /// Step name -> (job_id, status) for every step in a workflow, fetched
    /// in a single query for the orchestrator's poll loop.
    pub async fn workflow_step_states(
        &self,
        workflow_id: WorkflowId,
    ) -> CoreResult<HashMap<String, (Option<JobId>, String)>> {
        let rows = sqlx::query("SELECT name, job_id, status FROM workflow_steps WHERE workflow_id = ?")
            .bind(workflow_id.0)
            .fetch_all(&self.pool)
            .await?;
        let mut out = HashMap::with_capacity(rows.len());
        for row in rows {
            let name: String = row.try_get("name")?;
            let job_id: Option<i64> = row.try_get("job_id")?;
            let status: String = row.try_get("status")?;
            out.insert(name, (job_id.map(JobId), status));
        }
        Ok(out)
    }
}
