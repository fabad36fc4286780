use super::models::{validate_name, Cluster, ClusterKind, NewCluster};
use super::Store;
use crate::error::{CoreError, CoreResult};
use crate::ids::ClusterId;
use sqlx::Row;
use std::str::FromStr;

fn row_to_cluster(row: sqlx::sqlite::SqliteRow) -> CoreResult<Cluster> {
    let kind: String = row.try_get("kind")?;
    let connection_config: String = row.try_get("connection_config")?;
    let active: i64 = row.try_get("active")?;
    Ok(Cluster {
        id: ClusterId(row.try_get("id")?),
        name: row.try_get("name")?,
        kind: ClusterKind::from_str(&kind)?,
        hostname: row.try_get("hostname")?,
        port: row.try_get::<i64, _>("port")? as u16,
        username: row.try_get("username")?,
        connection_config: serde_json::from_str(&connection_config)?,
        active: active != 0,
        max_concurrent: row.try_get("max_concurrent")?,
    })
}

impl Store {
    pub async fn create_cluster(&self, attrs: NewCluster) -> CoreResult<ClusterId> {
        validate_name(&attrs.name)?;
        let connection_config = serde_json::to_string(&attrs.connection_config)?;
        let result = sqlx::query(
            "INSERT INTO clusters (name, kind, hostname, port, username, connection_config,
                active, max_concurrent)
             VALUES (?, ?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(&attrs.name)
        .bind(attrs.kind.as_str())
        .bind(&attrs.hostname)
        .bind(attrs.port as i64)
        .bind(&attrs.username)
        .bind(&connection_config)
        .bind(attrs.max_concurrent)
        .execute(&self.pool)
        .await?;
        Ok(ClusterId(result.last_insert_rowid()))
    }

    pub async fn get_cluster(&self, id: ClusterId) -> CoreResult<Cluster> {
        let row = sqlx::query("SELECT * FROM clusters WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| CoreError::not_found(format!("cluster {id}")))?;
        row_to_cluster(row)
    }

    pub async fn list_clusters(&self) -> CoreResult<Vec<Cluster>> {
        let rows = sqlx::query("SELECT * FROM clusters ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_cluster).collect()
    }

    /// Deactivate a cluster. Existing jobs referencing it are left alone;
    /// the queue manager is responsible for refusing new submissions.
    pub async fn deactivate_cluster(&self, id: ClusterId) -> CoreResult<()> {
        let result = sqlx::query("UPDATE clusters SET active = 0 WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("cluster {id}")));
        }
        Ok(())
    }

    pub async fn remove_cluster(&self, id: ClusterId) -> CoreResult<()> {
        let running = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE cluster_id = ? AND status IN
                ('scheduled', 'running')",
        )
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?
        .try_get::<i64, _>("n")?;
        if running > 0 {
            return Err(CoreError::conflict(format!(
                "cluster {id} has {running} active job(s), cannot remove"
            )));
        }
        let result = sqlx::query("DELETE FROM clusters WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found(format!("cluster {id}")));
        }
        Ok(())
    }

    /// Count of jobs currently occupying a cluster's concurrency budget
    /// (`scheduled` or `running`), for cap enforcement in the queue
    /// manager (spec.md §4.5).
    pub async fn cluster_occupancy(&self, id: ClusterId) -> CoreResult<i64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS n FROM jobs WHERE cluster_id = ? AND status IN
                ('scheduled', 'running')",
        )
        .bind(id.0)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("n")?)
    }
}
