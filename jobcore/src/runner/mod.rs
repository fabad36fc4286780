//! Runner Interface & Implementations (spec.md §4.4): a uniform contract
//! over local subprocess, SSH, and batch-scheduler execution backends.

pub mod batch;
pub mod local;
pub mod shell;
pub mod ssh;

use crate::error::{CoreError, CoreResult};
use crate::ids::ClusterId;
use crate::store::models::Job;
use async_trait::async_trait;
use std::path::Path;

/// Multi-signal status, per spec.md §4.4: never guess — `Unknown` is a
/// legitimate outcome when no signal decides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Unknown,
}

#[async_trait]
pub trait Runner: Send + Sync {
    /// Stage inputs, start execution, return an opaque handle. Must not
    /// block on I/O beyond what's needed to hand the job off.
    async fn submit(&self, job: &Job, work_dir: &Path) -> CoreResult<String>;

    async fn status(&self, handle: &str) -> CoreResult<RunnerStatus>;

    /// Best-effort cancellation; returns whether cancellation was issued.
    async fn cancel(&self, handle: &str) -> CoreResult<bool>;

    /// Retrieve output artifacts into `dest_dir`.
    async fn fetch_outputs(&self, handle: &str, dest_dir: &Path) -> CoreResult<()>;

    /// Remove the remote/temporary work area.
    async fn cleanup(&self, handle: &str) -> CoreResult<()>;
}

/// Recommended handle shape (spec.md §6): `"{runner_kind}:{cluster_id?}:
/// {remote_id}:{work_dir}"`, every field shell-quote-safe. `cluster_id` is
/// empty for the local runner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerHandle {
    pub runner_kind: String,
    pub cluster_id: Option<ClusterId>,
    pub remote_id: String,
    pub work_dir: String,
}

impl RunnerHandle {
    pub fn new(
        runner_kind: impl Into<String>,
        cluster_id: Option<ClusterId>,
        remote_id: impl Into<String>,
        work_dir: impl Into<String>,
    ) -> Self {
        Self {
            runner_kind: runner_kind.into(),
            cluster_id,
            remote_id: remote_id.into(),
            work_dir: work_dir.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.runner_kind,
            self.cluster_id.map(|c| c.to_string()).unwrap_or_default(),
            self.remote_id,
            self.work_dir
        )
    }

    pub fn parse(raw: &str) -> CoreResult<Self> {
        let mut parts = raw.splitn(4, ':');
        let runner_kind = parts
            .next()
            .ok_or_else(|| CoreError::validation("empty handle"))?
            .to_string();
        let cluster_id = parts.next().unwrap_or("");
        let remote_id = parts
            .next()
            .ok_or_else(|| CoreError::validation(format!("malformed handle: {raw}")))?
            .to_string();
        let work_dir = parts
            .next()
            .ok_or_else(|| CoreError::validation(format!("malformed handle: {raw}")))?
            .to_string();
        let cluster_id = if cluster_id.is_empty() {
            None
        } else {
            Some(ClusterId(cluster_id.parse().map_err(|_| {
                CoreError::validation(format!("malformed handle: {raw}"))
            })?))
        };
        Ok(Self {
            runner_kind,
            cluster_id,
            remote_id,
            work_dir,
        })
    }
}
