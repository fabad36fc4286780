//! SSH runner (spec.md §4.4.2): uses the connection pool, detaches a
//! background process on the remote host, and polls a multi-signal chain
//! for completion.

use super::shell::{shell_quote, validate_output_filename, CommandSpec};
use super::{Runner, RunnerHandle, RunnerStatus};
use crate::error::{CoreError, CoreResult};
use crate::ids::ClusterId;
use crate::pool::connection::HostKeyPolicy;
use crate::pool::{ClusterTarget, ConnectionPool};
use crate::store::models::Job;
use crate::store::Store;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct SshRunner {
    pool: Arc<ConnectionPool>,
    store: Arc<Store>,
    command_timeout: Duration,
}

impl SshRunner {
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<Store>, command_timeout: Duration) -> Self {
        Self {
            pool,
            store,
            command_timeout,
        }
    }

    async fn target_for(&self, cluster_id: ClusterId) -> CoreResult<ClusterTarget> {
        let cluster = self.store.get_cluster(cluster_id).await?;
        let policy = match cluster.connection_config.get("known_hosts_policy").and_then(|v| v.as_str()) {
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

    /// The execution wrapper: runs the job script, captures `$?` into
    /// `.exit_code` atomically (write to a temp file, then rename), and
    /// detaches so the ssh session can close without killing the job.
    fn wrapper_script(remote_work_dir: &str) -> String {
        format!(
            "cd {dir} && \
             nohup sh -c '{dir}/job.sh > {dir}/stdout.log 2> {dir}/stderr.log; \
             echo $? > {dir}/.exit_code.tmp && mv {dir}/.exit_code.tmp {dir}/.exit_code' \
             > /dev/null 2>&1 < /dev/null & \
             echo $!",
            dir = shell_quote(remote_work_dir)
        )
    }
}

#[async_trait]
impl Runner for SshRunner {
    async fn submit(&self, job: &Job, _work_dir: &Path) -> CoreResult<String> {
        let cluster_id = job
            .cluster_id
            .ok_or_else(|| CoreError::validation("ssh runner requires a cluster"))?;
        let target = self.target_for(cluster_id).await?;
        let remote_work_dir = Self::remote_work_dir(cluster_id, &job.name);

        let conn = self.pool.acquire(&target).await?;
        let connection = conn.connection().clone();

        let mkdir = CommandSpec::new("mkdir").arg("-p").arg(&remote_work_dir).build();
        connection.run(&mkdir, self.command_timeout).await?;

        let script_path = tempfile::NamedTempFile::new()
            .map_err(|e| CoreError::runner(format!("create temp script: {e}"), None))?;
        std::fs::write(script_path.path(), &job.input_blob)
            .map_err(|e| CoreError::runner(format!("write temp script: {e}"), None))?;
        connection
            .upload(script_path.path(), &format!("{remote_work_dir}/job.sh"))
            .await?;

        let chmod = CommandSpec::new("chmod")
            .arg("+x")
            .arg(format!("{remote_work_dir}/job.sh"))
            .build();
        connection.run(&chmod, self.command_timeout).await?;

        let output = connection
            .run(&Self::wrapper_script(&remote_work_dir), self.command_timeout)
            .await?;
        if output.exit_code != Some(0) {
            return Err(CoreError::runner(
                format!(
                    "failed to launch job: {}",
                    String::from_utf8_lossy(&output.stderr)
                ),
                output.exit_code,
            ));
        }
        let pid = String::from_utf8_lossy(&output.stdout).trim().to_string();
        super::shell::validate_positive_int(&pid)?;

        conn.release().await;

        let handle = RunnerHandle::new("ssh", Some(cluster_id), pid, remote_work_dir).encode();
        tracing::info!(%handle, "ssh job launched");
        Ok(handle)
    }

    async fn status(&self, handle: &str) -> CoreResult<RunnerStatus> {
        let parsed = RunnerHandle::parse(handle)?;
        let cluster_id = parsed
            .cluster_id
            .ok_or_else(|| CoreError::validation("ssh handle missing cluster id"))?;
        let target = self.target_for(cluster_id).await?;
        let conn = self.pool.acquire(&target).await?;
        let connection = conn.connection().clone();

        // 1. Liveness.
        let ps = CommandSpec::new("ps").arg("-p").arg(&parsed.remote_id).build();
        let ps_out = connection.run(&ps, self.command_timeout).await?;
        if ps_out.exit_code == Some(0) {
            conn.release().await;
            return Ok(RunnerStatus::Running);
        }

        // 2. Exit code file.
        let cat_exit = CommandSpec::new("cat")
            .arg(format!("{}/.exit_code", parsed.work_dir))
            .build();
        let exit_out = connection.run(&cat_exit, self.command_timeout).await?;
        if exit_out.exit_code == Some(0) {
            let text = String::from_utf8_lossy(&exit_out.stdout);
            if let Ok(code) = text.trim().parse::<i32>() {
                conn.release().await;
                return Ok(if code == 0 {
                    RunnerStatus::Completed
                } else {
                    RunnerStatus::Failed
                });
            }
        }

        // 3. Output-marker fallback: error markers checked first.
        let cat_out = CommandSpec::new("cat")
            .arg(format!("{}/stdout.log", parsed.work_dir))
            .build();
        let out = connection.run(&cat_out, self.command_timeout).await?;
        conn.release().await;
        let text = String::from_utf8_lossy(&out.stdout);
        if text.contains("ERROR") || text.contains("FAILED") {
            return Ok(RunnerStatus::Failed);
        }
        if text.contains("SUCCESS") || text.contains("COMPLETED") {
            return Ok(RunnerStatus::Completed);
        }

        // 4. Never guess.
        Ok(RunnerStatus::Unknown)
    }

    async fn cancel(&self, handle: &str) -> CoreResult<bool> {
        let parsed = RunnerHandle::parse(handle)?;
        let cluster_id = parsed
            .cluster_id
            .ok_or_else(|| CoreError::validation("ssh handle missing cluster id"))?;
        super::shell::validate_positive_int(&parsed.remote_id)?;
        let target = self.target_for(cluster_id).await?;
        let conn = self.pool.acquire(&target).await?;
        let kill = CommandSpec::new("kill").arg("-TERM").arg(&parsed.remote_id).build();
        let output = conn.connection().run(&kill, self.command_timeout).await?;
        conn.release().await;
        Ok(output.exit_code == Some(0))
    }

    async fn fetch_outputs(&self, handle: &str, dest_dir: &Path) -> CoreResult<()> {
        let parsed = RunnerHandle::parse(handle)?;
        let cluster_id = parsed
            .cluster_id
            .ok_or_else(|| CoreError::validation("ssh handle missing cluster id"))?;
        let target = self.target_for(cluster_id).await?;
        let conn = self.pool.acquire(&target).await?;
        let connection = conn.connection().clone();

        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| CoreError::runner(format!("create dest dir: {e}"), None))?;

        let names = connection.list_dir(&parsed.work_dir).await?;
        for name in names {
            if validate_output_filename(&name).is_err() {
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
            .ok_or_else(|| CoreError::validation("ssh handle missing cluster id"))?;
        let target = self.target_for(cluster_id).await?;
        let conn = self.pool.acquire(&target).await?;
        let rm = CommandSpec::new("rm").arg("-rf").arg(&parsed.work_dir).build();
        conn.connection().run(&rm, self.command_timeout).await?;
        conn.release().await;
        Ok(())
    }
}
