//! Queue Manager (spec.md §4.5): in-memory job-queue state layered over
//! the Store, plus the scheduler worker that drives pending jobs to
//! `running` and polls running jobs to their terminal state.
//!
//! Grounded on the teacher's `dog-queue::backend::memory::reaper::LeaseReaper`
//! tick discipline: snapshot under lock, do I/O outside the lock, log and
//! keep looping on a failed iteration rather than propagating it.

use crate::error::{CoreError, CoreResult};
use crate::ids::{ClusterId, JobId};
use crate::runner::{Runner, RunnerStatus};
use crate::store::models::{GateKind, JobStatus, NewJob, RunnerKind};
use crate::store::Store;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct QueuedJob {
    id: JobId,
    priority: i64,
    cluster_id: Option<ClusterId>,
    runner_kind: RunnerKind,
    status: JobStatus,
}

/// The three runner backends, keyed by `RunnerKind`. Which one a job uses
/// is fixed at submission time by `NewJob::runner_kind`.
pub struct RunnerRegistry {
    pub local: Arc<dyn Runner>,
    pub ssh: Arc<dyn Runner>,
    pub batch: Arc<dyn Runner>,
}

impl RunnerRegistry {
    fn runner_for(&self, kind: RunnerKind) -> Arc<dyn Runner> {
        match kind {
            RunnerKind::Local => self.local.clone(),
            RunnerKind::Ssh => self.ssh.clone(),
            RunnerKind::Batch => self.batch.clone(),
        }
    }
}

pub struct QueueManager {
    store: Arc<Store>,
    runners: RunnerRegistry,
    jobs: Mutex<HashMap<JobId, QueuedJob>>,
    cluster_caps: Mutex<HashMap<ClusterId, i64>>,
    scratch_base: PathBuf,
    scheduling_interval: Duration,
}

impl QueueManager {
    pub fn new(
        store: Arc<Store>,
        runners: RunnerRegistry,
        scratch_base: PathBuf,
        scheduling_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            runners,
            jobs: Mutex::new(HashMap::new()),
            cluster_caps: Mutex::new(HashMap::new()),
            scratch_base,
            scheduling_interval,
        })
    }

    pub async fn set_cluster_cap(&self, cluster_id: ClusterId, cap: i64) {
        self.cluster_caps.lock().await.insert(cluster_id, cap);
    }

    /// Persist the job, validate dependency existence with a single batch
    /// check, add the dependency edges (each individually cycle-checked
    /// against the full graph by the store), and track it in the
    /// in-memory map. Atomic under the queue lock for the in-memory half;
    /// the store half is sequential awaits, matching spec.md §4.5.
    pub async fn submit(
        &self,
        attrs: NewJob,
        dependencies: Vec<(JobId, GateKind)>,
        priority: i64,
    ) -> CoreResult<JobId> {
        if !dependencies.is_empty() {
            let ids: Vec<JobId> = dependencies.iter().map(|(id, _)| *id).collect();
            let existence = self.store.job_exists_batch(&ids).await?;
            for (dep_id, _) in &dependencies {
                if !existence.get(dep_id).copied().unwrap_or(false) {
                    return Err(CoreError::validation(format!(
                        "dependency job {dep_id} does not exist"
                    )));
                }
            }
        }

        let cluster_id = attrs.cluster_id;
        let runner_kind = attrs.runner_kind;
        let job_id = self.store.create_job(attrs).await?;

        for (dep_id, gate) in &dependencies {
            self.store.add_dependency(*dep_id, job_id, *gate).await?;
        }

        self.jobs.lock().await.insert(
            job_id,
            QueuedJob {
                id: job_id,
                priority,
                cluster_id,
                runner_kind,
                status: JobStatus::Pending,
            },
        );
        Ok(job_id)
    }

    /// Best-effort cancellation: delegates to the runner if the job has a
    /// live handle, then marks `cancelled` in the store regardless.
    pub async fn cancel(&self, job_id: JobId) -> CoreResult<()> {
        let job = self.store.get_job(job_id).await?;
        if !job.status.is_terminal() {
            if let Some(handle) = &job.handle {
                let runner = self.runners.runner_for(job.runner_kind);
                let _ = runner.cancel(handle).await;
            }
            self.store.update_status(job_id, JobStatus::Cancelled, None).await?;
            if let Err(e) = self.store.delete_remote_job(job_id).await {
                tracing::warn!(%job_id, error = %e, "failed to drop remote job record");
            }
        }
        if let Some(q) = self.jobs.lock().await.get_mut(&job_id) {
            q.status = JobStatus::Cancelled;
        }
        Ok(())
    }

    pub async fn reprioritise(&self, job_id: JobId, priority: i64) -> CoreResult<()> {
        let mut guard = self.jobs.lock().await;
        let q = guard
            .get_mut(&job_id)
            .ok_or_else(|| CoreError::not_found(format!("job {job_id} is not tracked by the queue")))?;
        q.priority = priority;
        Ok(())
    }

    async fn mark_completed(&self, job_id: JobId) -> CoreResult<()> {
        self.store.update_status(job_id, JobStatus::Completed, None).await?;
        if let Err(e) = self.store.delete_remote_job(job_id).await {
            tracing::warn!(%job_id, error = %e, "failed to drop remote job record");
        }
        if let Some(q) = self.jobs.lock().await.get_mut(&job_id) {
            q.status = JobStatus::Completed;
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: JobId, reason: &str) -> CoreResult<()> {
        tracing::warn!(%job_id, reason, "job transitioning to failed");
        self.store.update_status(job_id, JobStatus::Failed, None).await?;
        if let Err(e) = self.store.delete_remote_job(job_id).await {
            tracing::warn!(%job_id, error = %e, "failed to drop remote job record");
        }
        if let Some(q) = self.jobs.lock().await.get_mut(&job_id) {
            q.status = JobStatus::Failed;
        }
        Ok(())
    }

    /// Record the remote submission for a non-local job (spec.md §3's
    /// "exactly one RemoteJob row per non-local job in non-terminal
    /// status" invariant; §2's "runner returns handle -> store records
    /// remote handle" data-flow step). `queue_name`/`assigned_nodes`/
    /// `metadata` aren't surfaced by the `Runner::submit` contract, so they
    /// start empty; the work dir and remote id come out of the handle the
    /// runner just returned.
    async fn record_remote_job(
        &self,
        job_id: JobId,
        cluster_id: Option<ClusterId>,
        handle: &str,
    ) -> CoreResult<()> {
        let Some(cluster_id) = cluster_id else {
            return Ok(());
        };
        let parsed = crate::runner::RunnerHandle::parse(handle)?;
        self.store
            .create_remote_job(crate::store::models::NewRemoteJob {
                job_id,
                cluster_id,
                remote_handle: parsed.remote_id,
                queue_name: None,
                assigned_nodes: Vec::new(),
                remote_work_dir: parsed.work_dir,
                remote_stdout: None,
                remote_stderr: None,
                metadata: serde_json::json!({}),
            })
            .await?;
        Ok(())
    }

    fn job_work_dir(&self, job_id: JobId) -> PathBuf {
        self.scratch_base.join(format!("job-{job_id}"))
    }

    fn results_dir(&self, job_id: JobId) -> PathBuf {
        self.scratch_base.join(format!("job-{job_id}-results"))
    }

    /// Steps 1-5 of spec.md §4.5's scheduler tick: snapshot, batch-evaluate
    /// dependency gates, apply cluster caps, dispatch.
    async fn schedule_pending(&self) -> CoreResult<()> {
        let (pending, mut running_counts): (Vec<JobId>, HashMap<ClusterId, i64>) = {
            let guard = self.jobs.lock().await;
            let pending = guard
                .values()
                .filter(|q| q.status == JobStatus::Pending)
                .map(|q| q.id)
                .collect();
            let mut counts = HashMap::new();
            for q in guard.values() {
                if matches!(q.status, JobStatus::Scheduled | JobStatus::Running) {
                    if let Some(cid) = q.cluster_id {
                        *counts.entry(cid).or_insert(0) += 1;
                    }
                }
            }
            (pending, counts)
        };
        if pending.is_empty() {
            return Ok(());
        }

        // Single batched round-trip for every pending job's dependency
        // edges, then a single batched status lookup for every upstream id
        // they reference — gates are evaluated in memory from there
        // (spec.md §4.5 step 2: eliminates N+1).
        let edges_by_job = self.store.dependencies_of_batch(&pending).await?;
        let upstream_ids: Vec<JobId> = edges_by_job
            .values()
            .flatten()
            .map(|edge| edge.from_job_id)
            .collect::<std::collections::HashSet<_>>()
            .into_iter()
            .collect();
        let statuses = self.store.get_status_batch(&upstream_ids).await?;

        let mut ready = Vec::new();
        for job_id in &pending {
            let can_run = edges_by_job
                .get(job_id)
                .map(|edges| {
                    edges.iter().all(|edge| {
                        statuses
                            .get(&edge.from_job_id)
                            .is_some_and(|status| edge.gate.satisfied_by(*status))
                    })
                })
                .unwrap_or(true);
            if can_run {
                ready.push(*job_id);
            }
        }

        // Highest priority first, read from the lock-free in-memory snapshot.
        let priorities: HashMap<JobId, i64> = {
            let guard = self.jobs.lock().await;
            ready
                .iter()
                .filter_map(|id| guard.get(id).map(|q| (*id, q.priority)))
                .collect()
        };
        ready.sort_by_key(|id| std::cmp::Reverse(priorities.get(id).copied().unwrap_or(0)));

        let caps = self.cluster_caps.lock().await.clone();
        let mut selected = Vec::new();
        for job_id in ready {
            let cluster_id = {
                let guard = self.jobs.lock().await;
                guard.get(&job_id).and_then(|q| q.cluster_id)
            };
            if let Some(cid) = cluster_id {
                let cap = caps.get(&cid).copied().unwrap_or(i64::MAX);
                let count = running_counts.entry(cid).or_insert(0);
                if *count >= cap {
                    continue;
                }
                *count += 1;
            }
            selected.push(job_id);
        }

        for job_id in selected {
            self.dispatch(job_id).await;
        }
        Ok(())
    }

    /// Step 5: re-check live status under the lock immediately before
    /// handing off to the runner, since the job may have been cancelled
    /// mid-tick.
    async fn dispatch(&self, job_id: JobId) {
        let runner_kind = {
            let mut guard = self.jobs.lock().await;
            match guard.get_mut(&job_id) {
                Some(q) if q.status == JobStatus::Pending => {
                    q.status = JobStatus::Scheduled;
                    q.runner_kind
                }
                _ => return,
            }
        };
        if let Err(e) = self.store.update_status(job_id, JobStatus::Scheduled, None).await {
            tracing::warn!(%job_id, error = %e, "failed to persist scheduled status");
            return;
        }

        let job = match self.store.get_job(job_id).await {
            Ok(j) => j,
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "failed to reload job before submit");
                let _ = self.mark_failed(job_id, "failed to reload job before submit").await;
                return;
            }
        };

        let runner = self.runners.runner_for(runner_kind);
        let work_dir = self.job_work_dir(job_id);

        match runner.submit(&job, &work_dir).await {
            Ok(handle) => {
                // Cancellation-during-submission race (spec.md §4.5): a
                // `cancel` may have landed on the store while `submit` was
                // in flight. Check the live status before committing.
                let cancelled = self
                    .store
                    .get_job(job_id)
                    .await
                    .map(|j| j.status == JobStatus::Cancelled)
                    .unwrap_or(false);
                if cancelled {
                    let _ = runner.cancel(&handle).await;
                    return;
                }
                if runner_kind != RunnerKind::Local {
                    if let Err(e) = self.record_remote_job(job_id, job.cluster_id, &handle).await {
                        tracing::warn!(%job_id, error = %e, "failed to record remote job handle");
                    }
                }
                if let Err(e) = self
                    .store
                    .update_status(job_id, JobStatus::Running, Some(handle))
                    .await
                {
                    tracing::warn!(%job_id, error = %e, "failed to persist running status");
                }
                if let Some(q) = self.jobs.lock().await.get_mut(&job_id) {
                    q.status = JobStatus::Running;
                }
            }
            Err(e) => {
                tracing::warn!(%job_id, error = %e, "runner submit failed");
                let _ = self.mark_failed(job_id, &e.to_string()).await;
            }
        }
    }

    /// Poll every tracked `running` job's handle and drive it to a
    /// terminal state on a decisive signal ("unknown" never advances the
    /// state, per the state diagram in spec.md §4.5).
    async fn poll_running(&self) {
        let running: Vec<(JobId, RunnerKind)> = {
            let guard = self.jobs.lock().await;
            guard
                .values()
                .filter(|q| q.status == JobStatus::Running)
                .map(|q| (q.id, q.runner_kind))
                .collect()
        };

        for (job_id, runner_kind) in running {
            let job = match self.store.get_job(job_id).await {
                Ok(j) => j,
                Err(e) => {
                    tracing::warn!(%job_id, error = %e, "failed to reload job while polling");
                    continue;
                }
            };
            let Some(handle) = job.handle.clone() else {
                continue;
            };
            let runner = self.runners.runner_for(runner_kind);
            let status = match runner.status(&handle).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(%job_id, error = %e, "runner status poll failed");
                    continue;
                }
            };
            match status {
                RunnerStatus::Completed => {
                    let dest = self.results_dir(job_id);
                    if let Err(e) = runner.fetch_outputs(&handle, &dest).await {
                        tracing::warn!(%job_id, error = %e, "failed to fetch outputs");
                    }
                    if let Err(e) = self.mark_completed(job_id).await {
                        tracing::warn!(%job_id, error = %e, "failed to persist completion");
                    }
                    if let Err(e) = runner.cleanup(&handle).await {
                        tracing::warn!(%job_id, error = %e, "failed to clean up runner work area");
                    }
                }
                RunnerStatus::Failed => {
                    let dest = self.results_dir(job_id);
                    let _ = runner.fetch_outputs(&handle, &dest).await;
                    if let Err(e) = self.mark_failed(job_id, "runner reported failure").await {
                        tracing::warn!(%job_id, error = %e, "failed to persist failure");
                    }
                    if let Err(e) = runner.cleanup(&handle).await {
                        tracing::warn!(%job_id, error = %e, "failed to clean up runner work area");
                    }
                }
                RunnerStatus::Running | RunnerStatus::Pending | RunnerStatus::Unknown => {}
            }
        }
    }

    async fn tick(&self) -> CoreResult<()> {
        self.schedule_pending().await?;
        self.poll_running().await;
        Ok(())
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn tick_for_test(&self) -> CoreResult<()> {
        self.tick().await
    }

    /// The scheduler worker (spec.md §4.5, §5 Propagation policy): panics
    /// inside one iteration must not kill the loop, so each tick is caught
    /// and logged with enough context to diagnose, never propagated.
    pub async fn run(self: Arc<Self>) -> CoreResult<()> {
        let mut ticker = tokio::time::interval(self.scheduling_interval);
        let mut iteration: u64 = 0;
        loop {
            ticker.tick().await;
            iteration += 1;
            let started = std::time::Instant::now();
            if let Err(e) = self.tick().await {
                tracing::warn!(iteration, elapsed = ?started.elapsed(), error = %e, "scheduler tick failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::local::LocalRunner;
    use crate::runner::RunnerHandle;
    use async_trait::async_trait;
    use std::path::Path;

    fn new_job(name: &str, script: &str) -> NewJob {
        NewJob {
            name: name.into(),
            work_dir: String::new(),
            code_kind: "shell".into(),
            runner_kind: RunnerKind::Local,
            cluster_id: None,
            parallelism: serde_json::json!({}),
            input_blob: script.into(),
        }
    }

    struct AlwaysFailRunner;

    #[async_trait]
    impl Runner for AlwaysFailRunner {
        async fn submit(&self, _job: &crate::store::models::Job, _work_dir: &Path) -> CoreResult<String> {
            Err(CoreError::runner("synthetic failure", None))
        }
        async fn status(&self, _handle: &str) -> CoreResult<RunnerStatus> {
            Ok(RunnerStatus::Unknown)
        }
        async fn cancel(&self, _handle: &str) -> CoreResult<bool> {
            Ok(false)
        }
        async fn fetch_outputs(&self, _handle: &str, _dest_dir: &Path) -> CoreResult<()> {
            Ok(())
        }
        async fn cleanup(&self, _handle: &str) -> CoreResult<()> {
            Ok(())
        }
    }

    async fn test_queue() -> (Arc<QueueManager>, tempfile::TempDir) {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let scratch = tempfile::tempdir().unwrap();
        let runners = RunnerRegistry {
            local: Arc::new(LocalRunner::new()),
            ssh: Arc::new(AlwaysFailRunner),
            batch: Arc::new(AlwaysFailRunner),
        };
        let queue = QueueManager::new(store, runners, scratch.path().to_path_buf(), Duration::from_millis(20));
        (queue, scratch)
    }

    #[tokio::test]
    async fn runs_a_single_job_to_completion() {
        let (queue, _scratch) = test_queue().await;
        let job_id = queue
            .submit(new_job("solo", "#!/bin/sh\nexit 0\n"), vec![], 0)
            .await
            .unwrap();

        for _ in 0..100 {
            queue.tick().await.unwrap();
            let job = queue.store.get_job(job_id).await.unwrap();
            if job.status == JobStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job never reached completed");
    }

    #[tokio::test]
    async fn dependent_job_waits_for_upstream() {
        let (queue, _scratch) = test_queue().await;
        let upstream = queue
            .submit(new_job("upstream", "#!/bin/sh\nexit 0\n"), vec![], 0)
            .await
            .unwrap();
        let downstream = queue
            .submit(
                new_job("downstream", "#!/bin/sh\nexit 0\n"),
                vec![(upstream, GateKind::AfterSuccess)],
                0,
            )
            .await
            .unwrap();

        for _ in 0..200 {
            queue.tick().await.unwrap();
            let up = queue.store.get_job(upstream).await.unwrap();
            let down = queue.store.get_job(downstream).await.unwrap();
            if up.status == JobStatus::Completed && down.status == JobStatus::Completed {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dependent job never completed");
    }

    #[tokio::test]
    async fn cluster_cap_limits_concurrent_scheduling() {
        let (queue, _scratch) = test_queue().await;
        let cluster_id = queue
            .store
            .create_cluster(crate::store::models::NewCluster {
                name: "capped".into(),
                kind: crate::store::models::ClusterKind::Batch,
                hostname: "batch.example".into(),
                port: 22,
                username: "jobs".into(),
                connection_config: serde_json::json!({}),
                max_concurrent: 1,
            })
            .await
            .unwrap();
        queue.set_cluster_cap(cluster_id, 1).await;

        let mut ids = Vec::new();
        for i in 0..3 {
            let mut attrs = new_job(&format!("capped-{i}"), "#!/bin/sh\nsleep 0.2\nexit 0\n");
            attrs.cluster_id = Some(cluster_id);
            let id = queue.submit(attrs, vec![], 0).await.unwrap();
            ids.push(id);
            // Keep the in-memory record's cluster binding consistent with
            // the store's, since submit() captures it at call time.
        }

        queue.schedule_pending().await.unwrap();
        let guard = queue.jobs.lock().await;
        let scheduled_count = ids
            .iter()
            .filter(|id| guard.get(id).map(|q| q.status != JobStatus::Pending).unwrap_or(false))
            .count();
        assert!(scheduled_count <= 1, "cap of 1 was exceeded: {scheduled_count}");
    }

    #[tokio::test]
    async fn submit_rejects_missing_dependency() {
        let (queue, _scratch) = test_queue().await;
        let err = queue
            .submit(new_job("orphan", "#!/bin/sh\nexit 0\n"), vec![(JobId(9999), GateKind::AfterSuccess)], 0)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn failing_runner_marks_job_failed() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let scratch = tempfile::tempdir().unwrap();
        let runners = RunnerRegistry {
            local: Arc::new(AlwaysFailRunner),
            ssh: Arc::new(AlwaysFailRunner),
            batch: Arc::new(AlwaysFailRunner),
        };
        let queue = QueueManager::new(store, runners, scratch.path().to_path_buf(), Duration::from_millis(20));
        let job_id = queue.submit(new_job("doomed", "exit 1"), vec![], 0).await.unwrap();

        for _ in 0..20 {
            queue.tick().await.unwrap();
            let job = queue.store.get_job(job_id).await.unwrap();
            if job.status == JobStatus::Failed {
                return;
            }
        }
        panic!("job never transitioned to failed");
    }

    /// Reports `Running` on the first status poll and `Completed` from the
    /// second one on, so a test can observe the job mid-flight before it
    /// reaches a terminal state.
    struct OkAfterOnePollRunner {
        polled: std::sync::atomic::AtomicBool,
    }

    impl OkAfterOnePollRunner {
        fn new() -> Self {
            Self {
                polled: std::sync::atomic::AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl Runner for OkAfterOnePollRunner {
        async fn submit(&self, job: &crate::store::models::Job, work_dir: &Path) -> CoreResult<String> {
            Ok(RunnerHandle::new("ssh", job.cluster_id, "remote-42", work_dir.display().to_string()).encode())
        }
        async fn status(&self, _handle: &str) -> CoreResult<RunnerStatus> {
            if self.polled.swap(true, std::sync::atomic::Ordering::SeqCst) {
                Ok(RunnerStatus::Completed)
            } else {
                Ok(RunnerStatus::Running)
            }
        }
        async fn cancel(&self, _handle: &str) -> CoreResult<bool> {
            Ok(false)
        }
        async fn fetch_outputs(&self, _handle: &str, _dest_dir: &Path) -> CoreResult<()> {
            Ok(())
        }
        async fn cleanup(&self, _handle: &str) -> CoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn remote_submit_records_and_clears_remote_job_row() {
        let store = Arc::new(Store::open_in_memory().await.unwrap());
        let scratch = tempfile::tempdir().unwrap();
        let cluster_id = store
            .create_cluster(crate::store::models::NewCluster {
                name: "remote".into(),
                kind: crate::store::models::ClusterKind::Ssh,
                hostname: "remote.example".into(),
                port: 22,
                username: "jobs".into(),
                connection_config: serde_json::json!({}),
                max_concurrent: 10,
            })
            .await
            .unwrap();
        let runners = RunnerRegistry {
            local: Arc::new(AlwaysFailRunner),
            ssh: Arc::new(OkAfterOnePollRunner::new()),
            batch: Arc::new(AlwaysFailRunner),
        };
        let queue = QueueManager::new(store.clone(), runners, scratch.path().to_path_buf(), Duration::from_millis(20));

        let mut attrs = new_job("remote-job", "#!/bin/sh\nexit 0\n");
        attrs.runner_kind = RunnerKind::Ssh;
        attrs.cluster_id = Some(cluster_id);
        let job_id = queue.submit(attrs, vec![], 0).await.unwrap();

        // First tick: scheduled -> submitted -> running. The remote job row
        // must exist the moment the job is running.
        queue.tick().await.unwrap();
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Running);
        let remote = store.get_remote_job_by_job(job_id).await.unwrap();
        assert_eq!(remote.remote_handle, "remote-42");
        assert_eq!(remote.cluster_id, cluster_id);

        // Second tick: poll observes completion, row is cleared.
        queue.tick().await.unwrap();
        let job = store.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let err = store.get_remote_job_by_job(job_id).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
    }

    #[allow(dead_code)]
    fn assert_handle_type(_: &RunnerHandle) {}
}
