use super::models::{DependencyEdge, GateKind};
use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::graph;
use crate::ids::JobId;
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;

impl Store {
    /// Add a dependency edge `from_job_id -> to_job_id` (to_job_id runs
    /// after from_job_id, gated by `gate`). Rejects the edge if it would
    /// introduce a cycle in the full dependency graph (spec.md §4.1,
    /// §4.2's `assert_acyclic` contract).
    pub async fn add_dependency(
        &self,
        from_job_id: JobId,
        to_job_id: JobId,
        gate: GateKind,
    ) -> CoreResult<()> {
        if from_job_id == to_job_id {
            return Err(CoreError::validation("a job cannot depend on itself"));
        }

        let edges = self.all_dependency_edges().await?;
        let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
        for edge in &edges {
            adjacency
                .entry(edge.from_job_id.to_string())
                .or_default()
                .push(edge.to_job_id.to_string());
        }
        adjacency
            .entry(from_job_id.to_string())
            .or_default()
            .push(to_job_id.to_string());

        graph::assert_acyclic(&adjacency, "job dependencies")?;

        sqlx::query(
            "INSERT INTO dependencies (from_job_id, to_job_id, gate) VALUES (?, ?, ?)
             ON CONFLICT(from_job_id, to_job_id) DO UPDATE SET gate = excluded.gate",
        )
        .bind(from_job_id.0)
        .bind(to_job_id.0)
        .bind(gate.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn remove_dependency(&self, from_job_id: JobId, to_job_id: JobId) -> CoreResult<()> {
        sqlx::query("DELETE FROM dependencies WHERE from_job_id = ? AND to_job_id = ?")
            .bind(from_job_id.0)
            .bind(to_job_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn all_dependency_edges(&self) -> CoreResult<Vec<DependencyEdge>> {
        let rows = sqlx::query("SELECT from_job_id, to_job_id, gate FROM dependencies")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter()
            .map(|row| {
                let gate: String = row.try_get("gate")?;
                Ok(DependencyEdge {
                    from_job_id: JobId(row.try_get("from_job_id")?),
                    to_job_id: JobId(row.try_get("to_job_id")?),
                    gate: GateKind::from_str(&gate)?,
                })
            })
            .collect()
    }

    /// Upstream dependency edges for many jobs at once, keyed by the
    /// downstream job id — a single `IN (...)` query rather than one
    /// lookup per job (spec.md §4.5 step 2).
    pub async fn dependencies_of_batch(
        &self,
        job_ids: &[JobId],
    ) -> CoreResult<HashMap<JobId, Vec<DependencyEdge>>> {
        let mut out: HashMap<JobId, Vec<DependencyEdge>> =
            job_ids.iter().map(|id| (*id, Vec::new())).collect();
        if job_ids.is_empty() {
            return Ok(out);
        }

        let placeholders = vec!["?"; job_ids.len()].join(",");
        let sql = format!(
            "SELECT from_job_id, to_job_id, gate FROM dependencies WHERE to_job_id IN ({placeholders})"
        );
        let mut q = sqlx::query(&sql);
        for id in job_ids {
            q = q.bind(id.0);
        }
        let rows = q.fetch_all(&self.pool).await?;
        for row in rows {
            let gate: String = row.try_get("gate")?;
            let edge = DependencyEdge {
                from_job_id: JobId(row.try_get("from_job_id")?),
                to_job_id: JobId(row.try_get("to_job_id")?),
                gate: GateKind::from_str(&gate)?,
            };
            out.entry(edge.to_job_id).or_default().push(edge);
        }
        Ok(out)
    }
}
