//! Batch (SLURM-family) runner (spec.md §4.4.3): generates a batch script
//! under a strict per-field allowlist, submits through the connection
//! pool, and polls the scheduler's queue/accounting commands.

use super::shell::{shell_quote, CommandSpec};
use super::{Runner, RunnerHandle, RunnerStatus};
use crate::error::{CoreError, CoreResult};
use crate::ids::ClusterId;
use crate::pool::connection::HostKeyPolicy;
use crate::pool::{ClusterTarget, ConnectionPool};
use crate::store::models::Job;
use crate::store::Store;
use async_trait::async_trait;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

/// Batch-script directives, validated per spec.md §4.4.3's allowlist table
/// before a single byte of them reaches a remote shell.
#[derive(Debug, Clone, Default)]
pub struct BatchDirectives {
    pub job_name: String,
    pub partition: Option<String>,
    pub modules: Vec<String>,
    pub account: Option<String>,
    pub email: Option<String>,
    pub time_limit: Option<String>,
    pub dependency: Option<String>,
    pub array_spec: Option<String>,
}

fn pattern<'a>(cell: &'a OnceLock<Regex>, re: &str) -> &'a Regex {
    cell.get_or_init(|| Regex::new(re).expect("static regex"))
}

macro_rules! allowlist {
    ($name:ident, $re:expr) => {
        fn $name(value: &str) -> CoreResult<()> {
            static RE: OnceLock<Regex> = OnceLock::new();
            if !pattern(&RE, $re).is_match(value) {
                return Err(CoreError::validation(format!(
                    "'{value}' does not match the allowed {} pattern",
                    stringify!($name)
                )));
            }
            Ok(())
        }
    };
}

allowlist!(validate_job_name, r"^[A-Za-z0-9._-]{1,255}$");
allowlist!(validate_partition, r"^[A-Za-z0-9_]+$");
allowlist!(validate_module, r"^[A-Za-z0-9/._-]+$");
allowlist!(validate_account, r"^[A-Za-z0-9_-]+$");
allowlist!(validate_email, r"^[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}$");
allowlist!(validate_time_limit, r"^(\d{1,2}-)?\d{1,2}:\d{2}:\d{2}$");
allowlist!(validate_dependency, r"^[0-9]+$");
allowlist!(validate_array_spec, r"^[0-9,:-]+$");

impl BatchDirectives {
    fn validate(&self) -> CoreResult<()> {
        validate_job_name(&self.job_name)?;
        if let Some(p) = &self.partition {
            validate_partition(p)?;
        }
        for m in &self.modules {
            validate_module(m)?;
        }
        if let Some(a) = &self.account {
            validate_account(a)?;
        }
        if let Some(e) = &self.email {
            validate_email(e)?;
        }
        if let Some(t) = &self.time_limit {
            validate_time_limit(t)?;
        }
        if let Some(d) = &self.dependency {
            validate_dependency(d)?;
        }
        if let Some(a) = &self.array_spec {
            validate_array_spec(a)?;
        }
        Ok(())
    }

    /// Render the `#SBATCH` header block. Every value is shell-quoted on
    /// top of the allowlist check — defense in depth per spec.md §9.
    fn render(&self, remote_work_dir: &str) -> String {
        let mut lines = vec!["#!/bin/sh".to_string()];
        lines.push(format!("#SBATCH --job-name={}", shell_quote(&self.job_name)));
        lines.push(format!("#SBATCH --chdir={}", shell_quote(remote_work_dir)));
        lines.push(format!(
            "#SBATCH --output={}/stdout.log",
            shell_quote(remote_work_dir)
        ));
        lines.push(format!(
            "#SBATCH --error={}/stderr.log",
            shell_quote(remote_work_dir)
        ));
        if let Some(p) = &self.partition {
            lines.push(format!("#SBATCH --partition={}", shell_quote(p)));
        }
        if let Some(a) = &self.account {
            lines.push(format!("#SBATCH --account={}", shell_quote(a)));
        }
        if let Some(e) = &self.email {
            lines.push(format!("#SBATCH --mail-user={}", shell_quote(e)));
            lines.push("#SBATCH --mail-type=END,FAIL".to_string());
        }
        if let Some(t) = &self.time_limit {
            lines.push(format!("#SBATCH --time={}", shell_quote(t)));
        }
        if let Some(d) = &self.dependency {
            lines.push(format!("#SBATCH --dependency=afterok:{}", shell_quote(d)));
        }
        if let Some(a) = &self.array_spec {
            lines.push(format!("#SBATCH --array={}", shell_quote(a)));
        }
        for m in &self.modules {
            lines.push(format!("module load {}", shell_quote(m)));
        }
        lines.push(format!("sh {}/job.sh", shell_quote(remote_work_dir)));
        lines.push(format!(
            "echo $? > {}/.exit_code",
            shell_quote(remote_work_dir)
        ));
        lines.join("\n")
    }
}

pub struct BatchRunner {
    pool: Arc<ConnectionPool>,
    store: Arc<Store>,
    command_timeout: Duration,
}

impl BatchRunner {
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<Store>, command_timeout: Duration) -> Self {
        Self {
            pool,
            store,
            command_timeout,
        }
    }

    async fn target_for(&self, cluster_id: ClusterId) -> CoreResult<ClusterTarget> {
        let cluster = self.store.get_cluster(cluster_id).await?;
        let policy = match cluster
            .connection_config
            .get("known_hosts_policy")
            .and_then(|v| v.as_str())
        {
            Some("permissive-warn") => HostKeyPolicy::PermissiveWarn,
            Some("file") => {
                let path = cluster
                    .connection_config
                    .get("known_hosts_path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CoreError::validation("known_hosts_policy=file requires known_hosts_path"))?;
                HostKeyPolicy::File(path.into())
            }
            _ => HostKeyPolicy::PlatformDefault,
        };
        Ok(ClusterTarget {
            cluster_id,
            destination: format!("ssh://{}@{}:{}", cluster.username, cluster.hostname, cluster.port),
            host_key_policy: policy,
        })
    }

    fn remote_work_dir(cluster_id: ClusterId, job_name: &str) -> String {
        format!("jobcore-scratch/cluster-{cluster_id}/{job_name}")
    }

    fn directives_for(job: &Job) -> BatchDirectives {
        let modules = job
            .parallelism
            .get("modules")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        BatchDirectives {
            job_name: job.name.clone(),
            partition: job.parallelism.get("partition").and_then(|v| v.as_str()).map(String::from),
            modules,
            account: job.parallelism.get("account").and_then(|v| v.as_str()).map(String::from),
            email: job.parallelism.get("email").and_then(|v| v.as_str()).map(String::from),
            time_limit: job.parallelism.get("time_limit").and_then(|v| v.as_str()).map(String::from),
            dependency: None,
            array_spec: job.parallelism.get("array_spec").and_then(|v| v.as_str()).map(String::from),
        }
    }
}

#[async_trait]
impl Runner for BatchRunner {
    async fn submit(&self, job: &Job, _work_dir: &Path) -> CoreResult<String> {
        let cluster_id = job
            .cluster_id
            .ok_or_else(|| CoreError::validation("batch runner requires a cluster"))?;
        let target = self.target_for(cluster_id).await?;
        let remote_work_dir = Self::remote_work_dir(cluster_id, &job.name);
        let directives = Self::directives_for(job);
        directives.validate()?;

        let conn = self.pool.acquire(&target).await?;
        let connection = conn.connection().clone();

        let mkdir = CommandSpec::new("mkdir").arg("-p").arg(&remote_work_dir).build();
        connection.run(&mkdir, self.command_timeout).await?;

        let script_file = tempfile::NamedTempFile::new()
            .map_err(|e| CoreError::runner(format!("create temp script: {e}"), None))?;
        std::fs::write(script_file.path(), &job.input_blob)
            .map_err(|e| CoreError::runner(format!("write temp script: {e}"), None))?;
        connection
            .upload(script_file.path(), &format!("{remote_work_dir}/job.sh"))
            .await?;

        let batch_file = tempfile::NamedTempFile::new()
            .map_err(|e| CoreError::runner(format!("create temp batch script: {e}"), None))?;
        std::fs::write(batch_file.path(), directives.render(&remote_work_dir))
            .map_err(|e| CoreError::runner(format!("write batch script: {e}"), None))?;
        connection
            .upload(batch_file.path(), &format!("{remote_work_dir}/submit.sbatch"))
            .await?;

        let submit = CommandSpec::new("sbatch")
            .arg("--parsable")
            .arg(format!("{remote_work_dir}/submit.sbatch"))
            .build();
        let output = connection.run(&submit, self.command_timeout).await?;
        if output.exit_code != Some(0) {
            return Err(CoreError::runner(
                format!("sbatch failed: {}", String::from_utf8_lossy(&output.stderr)),
                output.exit_code,
            ));
        }
        let scheduler_id = String::from_utf8_lossy(&output.stdout)
            .trim()
            .split(';')
            .next()
            .unwrap_or_default()
            .to_string();
        super::shell::validate_positive_int(&scheduler_id)?;
        conn.release().await;

        let handle = RunnerHandle::new("batch", Some(cluster_id), scheduler_id, remote_work_dir).encode();
        tracing::info!(%handle, "batch job submitted");
        Ok(handle)
    }

    async fn status(&self, handle: &str) -> CoreResult<RunnerStatus> {
        let parsed = RunnerHandle::parse(handle)?;
        let cluster_id = parsed
            .cluster_id
            .ok_or_else(|| CoreError::validation("batch handle missing cluster id"))?;
        super::shell::validate_positive_int(&parsed.remote_id)?;
        let target = self.target_for(cluster_id).await?;
        let conn = self.pool.acquire(&target).await?;
        let connection = conn.connection().clone();

        let squeue = CommandSpec::new("squeue")
            .arg("-h")
            .arg("-j")
            .arg(&parsed.remote_id)
            .arg("-o")
            .arg("%T")
            .build();
        let squeue_out = connection.run(&squeue, self.command_timeout).await?;
        let state = String::from_utf8_lossy(&squeue_out.stdout).trim().to_string();
        if !state.is_empty() {
            conn.release().await;
            return Ok(match state.as_str() {
                "PENDING" | "CONFIGURING" => RunnerStatus::Pending,
                "RUNNING" | "COMPLETING" => RunnerStatus::Running,
                "COMPLETED" => RunnerStatus::Completed,
                "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" => RunnerStatus::Failed,
                _ => RunnerStatus::Unknown,
            });
        }

        // Job left the scheduler queue; fall back to the accounting command.
        let sacct = CommandSpec::new("sacct")
            .arg("-n")
            .arg("-j")
            .arg(&parsed.remote_id)
            .arg("-o")
            .arg("State")
            .arg("-P")
            .build();
        let sacct_out = connection.run(&sacct, self.command_timeout).await?;
        conn.release().await;
        let first_line = String::from_utf8_lossy(&sacct_out.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string();
        if first_line.starts_with("COMPLETED") {
            Ok(RunnerStatus::Completed)
        } else if first_line.is_empty() {
            Ok(RunnerStatus::Unknown)
        } else {
            Ok(RunnerStatus::Failed)
        }
    }

    async fn cancel(&self, handle: &str) -> CoreResult<bool> {
        let parsed = RunnerHandle::parse(handle)?;
        let cluster_id = parsed
            .cluster_id
            .ok_or_else(|| CoreError::validation("batch handle missing cluster id"))?;
        super::shell::validate_positive_int(&parsed.remote_id)?;
        let target = self.target_for(cluster_id).await?;
        let conn = self.pool.acquire(&target).await?;
        let cancel = CommandSpec::new("scancel").arg(&parsed.remote_id).build();
        let output = conn.connection().run(&cancel, self.command_timeout).await?;
        conn.release().await;
        Ok(output.exit_code == Some(0))
    }

    async fn fetch_outputs(&self, handle: &str, dest_dir: &Path) -> CoreResult<()> {
        let parsed = RunnerHandle::parse(handle)?;
        let cluster_id = parsed
            .cluster_id
            .ok_or_else(|| CoreError::validation("batch handle missing cluster id"))?;
        let target = self.target_for(cluster_id).await?;
        let conn = self.pool.acquire(&target).await?;
        let connection = conn.connection().clone();

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| CoreError::runner(format!("create dest dir: {e}"), None))?;

        let names = connection.list_dir(&parsed.work_dir).await?;
        for name in names {
            if super::shell::validate_output_filename(&name).is_err() {
                tracing::warn!(%name, "skipping remote entry with unsafe filename");
                continue;
            }
            let remote_path = format!("{}/{}", parsed.work_dir, name);
            let local_path = dest_dir.join(&name);
            connection.download(&remote_path, &local_path).await?;
        }
        conn.release().await;
        Ok(())
    }

    async fn cleanup(&self, handle: &str) -> CoreResult<()> {
        let parsed = RunnerHandle::parse(handle)?;
        let cluster_id = parsed
            .cluster_id
            .ok_or_else(|| CoreError::validation("batch handle missing cluster id"))?;
        let target = self.target_for(cluster_id).await?;
        let conn = self.pool.acquire(&target).await?;
        let rm = CommandSpec::new("rm").arg("-rf").arg(&parsed.work_dir).build();
        conn.connection().run(&rm, self.command_timeout).await?;
        conn.release().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_malformed_fields() {
        let mut d = BatchDirectives {
            job_name: "ok-name".into(),
            ..Default::default()
        };
        assert!(d.validate().is_ok());
        d.partition = Some("gpu; rm -rf /".into());
        assert!(d.validate().is_err());
    }

    #[test]
    fn rejects_bad_time_limit() {
        let d = BatchDirectives {
            job_name: "a".into(),
            time_limit: Some("not-a-time".into()),
            ..Default::default()
        };
        assert!(d.validate().is_err());
    }

    #[test]
    fn renders_quoted_directives() {
        let d = BatchDirectives {
            job_name: "job; rm -rf /".into(),
            ..Default::default()
        };
        assert!(d.validate().is_err());

        let d = BatchDirectives {
            job_name: "ok".into(),
            email: Some("a@b.com".into()),
            ..Default::default()
        };
        d.validate().unwrap();
        let rendered = d.render("work");
        assert!(rendered.contains("--mail-user='a@b.com'"));
    }
}
