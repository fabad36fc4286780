//! Local subprocess runner (spec.md §4.4.1). Owns the subprocess for its
//! lifetime; the work directory is owned by the runner and removed on
//! terminal state via `cleanup`.

use super::shell::validate_output_filename;
use super::{Runner, RunnerHandle, RunnerStatus};
use crate::error::{CoreError, CoreResult};
use crate::store::models::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

pub struct LocalRunner {
    children: Mutex<HashMap<String, Child>>,
    graceful_timeout: Duration,
}

impl LocalRunner {
    pub fn new() -> Self {
        Self::with_graceful_timeout(Duration::from_secs(10))
    }

    pub fn with_graceful_timeout(graceful_timeout: Duration) -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
            graceful_timeout,
        }
    }
}

impl Default for LocalRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Runner for LocalRunner {
    async fn submit(&self, job: &Job, work_dir: &Path) -> CoreResult<String> {
        tokio::fs::create_dir_all(work_dir)
            .await
            .map_err(|e| CoreError::runner(format!("create work dir: {e}"), None))?;

        let script_path = work_dir.join("job.sh");
        tokio::fs::write(&script_path, &job.input_blob)
            .await
            .map_err(|e| CoreError::runner(format!("write job script: {e}"), None))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = tokio::fs::metadata(&script_path)
                .await
                .map_err(|e| CoreError::runner(e.to_string(), None))?
                .permissions();
            perms.set_mode(0o755);
            tokio::fs::set_permissions(&script_path, perms)
                .await
                .map_err(|e| CoreError::runner(e.to_string(), None))?;
        }

        let stdout_file = std::fs::File::create(work_dir.join("stdout.log"))
            .map_err(|e| CoreError::runner(format!("create stdout.log: {e}"), None))?;
        let stderr_file = std::fs::File::create(work_dir.join("stderr.log"))
            .map_err(|e| CoreError::runner(format!("create stderr.log: {e}"), None))?;

        let child = Command::new("sh")
            .arg(&script_path)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout_file))
            .stderr(Stdio::from(stderr_file))
            .spawn()
            .map_err(|e| CoreError::runner(format!("spawn job: {e}"), None))?;

        let pid = child
            .id()
            .ok_or_else(|| CoreError::runner("process exited before pid was available", None))?;
        let handle = RunnerHandle::new("local", None, pid.to_string(), work_dir.display().to_string());
        let encoded = handle.encode();
        self.children.lock().await.insert(encoded.clone(), child);
        tracing::info!(pid, work_dir = %work_dir.display(), "local job started");
        Ok(encoded)
    }

    async fn status(&self, handle: &str) -> CoreResult<RunnerStatus> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(handle) else {
            return Ok(RunnerStatus::Unknown);
        };
        match child.try_wait() {
            Ok(Some(exit)) => Ok(if exit.success() {
                RunnerStatus::Completed
            } else {
                RunnerStatus::Failed
            }),
            Ok(None) => Ok(RunnerStatus::Running),
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll local child");
                Ok(RunnerStatus::Unknown)
            }
        }
    }

    async fn cancel(&self, handle: &str) -> CoreResult<bool> {
        let parsed = RunnerHandle::parse(handle)?;
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(handle) else {
            return Ok(false);
        };

        if Command::new("kill")
            .arg("-TERM")
            .arg(&parsed.remote_id)
            .status()
            .await
            .is_err()
        {
            tracing::warn!(pid = %parsed.remote_id, "failed to send SIGTERM, will force-kill");
        }

        match tokio::time::timeout(self.graceful_timeout, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
            }
        }
        Ok(true)
    }

    async fn fetch_outputs(&self, handle: &str, dest_dir: &Path) -> CoreResult<()> {
        let parsed = RunnerHandle::parse(handle)?;
        let work_dir = Path::new(&parsed.work_dir);
        tokio::fs::create_dir_all(dest_dir)
            .await
            .map_err(|e| CoreError::runner(format!("create dest dir: {e}"), None))?;

        let mut entries = tokio::fs::read_dir(work_dir)
            .await
            .map_err(|e| CoreError::runner(format!("read work dir: {e}"), None))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CoreError::runner(e.to_string(), None))?
        {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            validate_output_filename(&name)?;
            tokio::fs::copy(entry.path(), dest_dir.join(name.as_ref()))
                .await
                .map_err(|e| CoreError::runner(format!("copy output {name}: {e}"), None))?;
        }
        Ok(())
    }

    async fn cleanup(&self, handle: &str) -> CoreResult<()> {
        let parsed = RunnerHandle::parse(handle)?;
        self.children.lock().await.remove(handle);
        tokio::fs::remove_dir_all(&parsed.work_dir)
            .await
            .or_else(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Ok(())
                } else {
                    Err(e)
                }
            })
            .map_err(|e| CoreError::runner(format!("remove work dir: {e}"), None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::JobId;
    use crate::store::models::{JobStatus, RunnerKind};

    fn test_job(script: &str) -> Job {
        Job {
            id: JobId(1),
            name: "test-job".into(),
            work_dir: String::new(),
            status: JobStatus::Pending,
            code_kind: "shell".into(),
            runner_kind: RunnerKind::Local,
            cluster_id: None,
            parallelism: serde_json::json!({}),
            created_at: chrono::Utc::now(),
            started_at: None,
            ended_at: None,
            handle: None,
            input_blob: script.to_string(),
            results_blob: None,
            results_index: None,
        }
    }

    #[tokio::test]
    async fn runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new();
        let job = test_job("#!/bin/sh\necho hello\nexit 0\n");
        let handle = runner.submit(&job, dir.path()).await.unwrap();

        let mut status = runner.status(&handle).await.unwrap();
        for _ in 0..50 {
            if status != RunnerStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = runner.status(&handle).await.unwrap();
        }
        assert_eq!(status, RunnerStatus::Completed);

        let dest = tempfile::tempdir().unwrap();
        runner.fetch_outputs(&handle, dest.path()).await.unwrap();
        assert!(dest.path().join("stdout.log").exists());

        runner.cleanup(&handle).await.unwrap();
        assert!(!dir.path().exists());
    }

    #[tokio::test]
    async fn reports_failure_on_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let runner = LocalRunner::new();
        let job = test_job("#!/bin/sh\nexit 7\n");
        let handle = runner.submit(&job, dir.path()).await.unwrap();

        let mut status = runner.status(&handle).await.unwrap();
        for _ in 0..50 {
            if status != RunnerStatus::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            status = runner.status(&handle).await.unwrap();
        }
        assert_eq!(status, RunnerStatus::Failed);
    }
}
