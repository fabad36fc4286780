//! Workflow Orchestrator (spec.md §4.6): expands `template` steps into
//! Queue Manager submissions, runs `data-transfer` steps synchronously,
//! and derives workflow status from step outcomes under the workflow's
//! error policy.

use crate::error::{CoreError, CoreResult};
use crate::ids::{ClusterId, WorkflowId};
use crate::queue::QueueManager;
use crate::runner::shell::validate_output_filename;
use crate::store::models::{
    ErrorPolicy, GateKind, JobStatus, NewJob, NewWorkflow, RunnerKind, StepKind, WorkflowDag,
    WorkflowStatus, WorkflowStep,
};
use crate::store::Store;
use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub struct Orchestrator {
    store: Arc<Store>,
    queue: Arc<QueueManager>,
    scratch_base: PathBuf,
    tick_interval: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        queue: Arc<QueueManager>,
        scratch_base: PathBuf,
        tick_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            queue,
            scratch_base,
            tick_interval,
        })
    }

    /// Build the step-name adjacency, reject cycles, persist the workflow
    /// and its steps atomically. The DAG cycle check itself happens inside
    /// `Store::create_workflow` (shared `graph::assert_acyclic` routine);
    /// this is the orchestrator's user-visible entry point.
    pub async fn submit_workflow(
        &self,
        name: impl Into<String>,
        dag: WorkflowDag,
        error_policy: ErrorPolicy,
    ) -> CoreResult<WorkflowId> {
        self.store
            .create_workflow(NewWorkflow {
                name: name.into(),
                dag,
                error_policy,
            })
            .await
    }

    fn job_results_dir(&self, job_id: crate::ids::JobId) -> PathBuf {
        self.scratch_base.join(format!("job-{job_id}-results"))
    }

    fn transfer_dest_dir(&self, workflow_id: WorkflowId, rel: &str) -> PathBuf {
        self.scratch_base.join(format!("workflow-{workflow_id}")).join(rel)
    }

    async fn enqueue_template_step(&self, workflow_id: WorkflowId, step: &WorkflowStep) -> CoreResult<()> {
        let params = &step.parameters;
        let script = params
            .get("script")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::validation(format!("template step '{}' is missing 'script'", step.name)))?;
        let runner_kind = params
            .get("runner_kind")
            .and_then(|v| v.as_str())
            .map(RunnerKind::from_str)
            .transpose()?
            .unwrap_or(RunnerKind::Local);
        let cluster_id = params.get("cluster_id").and_then(|v| v.as_i64()).map(ClusterId);
        let parallelism = params.get("parallelism").cloned().unwrap_or_else(|| serde_json::json!({}));
        let code_kind = params
            .get("code_kind")
            .and_then(|v| v.as_str())
            .unwrap_or("shell")
            .to_string();

        let attrs = NewJob {
            name: format!("{workflow_id}-{}", step.name),
            work_dir: String::new(),
            code_kind,
            runner_kind,
            cluster_id,
            parallelism,
            input_blob: script.to_string(),
        };
        let job_id = self.queue.submit(attrs, vec![], 0).await?;
        self.store.bind_workflow_step(workflow_id, &step.name, job_id).await?;
        Ok(())
    }

    /// `data-transfer` steps run synchronously in the orchestrator: copy
    /// declared files out of a predecessor's completed results directory
    /// into a declared destination. Failure marks the step `failed` and
    /// is handled by the caller under the workflow's error policy.
    async fn run_data_transfer_step(&self, workflow_id: WorkflowId, step: &WorkflowStep) -> CoreResult<()> {
        let params = &step.parameters;
        let from_step = params
            .get("from_step")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::validation(format!("data-transfer step '{}' is missing 'from_step'", step.name)))?;
        let files = params
            .get("files")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CoreError::validation(format!("data-transfer step '{}' is missing 'files'", step.name)))?;
        let dest_rel = params.get("dest_dir").and_then(|v| v.as_str()).unwrap_or(step.name.as_str());

        let states = self.store.workflow_step_states(workflow_id).await?;
        let (job_id_opt, _) = states
            .get(from_step)
            .ok_or_else(|| CoreError::validation(format!("unknown predecessor step '{from_step}'")))?;
        let job_id = job_id_opt
            .ok_or_else(|| CoreError::validation(format!("predecessor step '{from_step}' has no bound job")))?;

        let source_dir = self.job_results_dir(job_id);
        let dest_dir = self.transfer_dest_dir(workflow_id, dest_rel);
        tokio::fs::create_dir_all(&dest_dir)
            .await
            .map_err(|e| CoreError::validation(format!("create transfer dest dir: {e}")))?;

        for file in files {
            let name = file
                .as_str()
                .ok_or_else(|| CoreError::validation("data-transfer 'files' entries must be strings"))?;
            validate_output_filename(name)?;
            tokio::fs::copy(source_dir.join(name), dest_dir.join(name))
                .await
                .map_err(|e| CoreError::validation(format!("copy '{name}' from '{from_step}': {e}")))?;
        }
        Ok(())
    }

    /// One orchestrator tick: reconcile step statuses against their bound
    /// jobs' live status, enumerate newly-ready steps and enqueue or run
    /// them, then derive and persist the workflow's overall status.
    async fn drive_once(&self, workflow_id: WorkflowId) -> CoreResult<()> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        if workflow.status != WorkflowStatus::Running {
            return Ok(());
        }

        let mut states = self.store.workflow_step_states(workflow_id).await?;

        // Reconcile in-flight template steps against their job's live status.
        for (name, (job_id_opt, status)) in states.clone() {
            if status != "scheduled" && status != "running" {
                continue;
            }
            let Some(job_id) = job_id_opt else { continue };
            let job = self.store.get_job(job_id).await?;
            let new_status = match job.status {
                JobStatus::Completed => Some("completed"),
                JobStatus::Failed | JobStatus::Cancelled => Some("failed"),
                JobStatus::Running => Some("running"),
                _ => None,
            };
            if let Some(new_status) = new_status {
                if new_status != status {
                    self.store.update_step_status(workflow_id, &name, new_status).await?;
                }
            }
        }

        states = self.store.workflow_step_states(workflow_id).await?;
        let completed: HashSet<String> = states
            .iter()
            .filter(|(_, (_, s))| s == "completed")
            .map(|(n, _)| n.clone())
            .collect();
        let failed: HashSet<String> = states
            .iter()
            .filter(|(_, (_, s))| s == "failed")
            .map(|(n, _)| n.clone())
            .collect();
        let fail_fast_tripped = workflow.error_policy == ErrorPolicy::FailFast && !failed.is_empty();

        for step in &workflow.dag.steps {
            let current = states.get(&step.name).map(|(_, s)| s.as_str()).unwrap_or("pending");
            if current != "pending" {
                continue;
            }

            if fail_fast_tripped {
                self.store.update_step_status(workflow_id, &step.name, "skipped").await?;
                continue;
            }

            let mut all_satisfied = true;
            let mut permanently_blocked = false;
            for pred in &step.predecessors {
                let pred_status = states.get(&pred.name).map(|(_, s)| s.as_str()).unwrap_or("pending");
                let pred_terminal = matches!(pred_status, "completed" | "failed" | "skipped");
                let satisfied = match pred.gate {
                    GateKind::AfterSuccess => completed.contains(&pred.name),
                    GateKind::AfterAny => completed.contains(&pred.name) || failed.contains(&pred.name),
                    GateKind::AfterFailure => failed.contains(&pred.name),
                };
                if !satisfied {
                    all_satisfied = false;
                    if pred_terminal {
                        permanently_blocked = true;
                    }
                }
            }

            if permanently_blocked {
                self.store.update_step_status(workflow_id, &step.name, "skipped").await?;
                continue;
            }
            if !all_satisfied {
                continue;
            }

            match step.kind {
                StepKind::Template => {
                    if let Err(e) = self.enqueue_template_step(workflow_id, step).await {
                        tracing::warn!(step = %step.name, error = %e, "failed to enqueue template step");
                        self.store.update_step_status(workflow_id, &step.name, "failed").await?;
                    }
                }
                StepKind::DataTransfer => match self.run_data_transfer_step(workflow_id, step).await {
                    Ok(()) => {
                        self.store.update_step_status(workflow_id, &step.name, "completed").await?;
                    }
                    Err(e) => {
                        tracing::warn!(step = %step.name, error = %e, "data-transfer step failed");
                        self.store.update_step_status(workflow_id, &step.name, "failed").await?;
                    }
                },
            }
        }

        self.finalize_if_terminal(workflow_id).await
    }

    async fn finalize_if_terminal(&self, workflow_id: WorkflowId) -> CoreResult<()> {
        let workflow = self.store.get_workflow(workflow_id).await?;
        let states = self.store.workflow_step_states(workflow_id).await?;
        let all_terminal = states
            .values()
            .all(|(_, s)| matches!(s.as_str(), "completed" | "failed" | "skipped"));
        if !all_terminal {
            return Ok(());
        }
        let any_failed = states.values().any(|(_, s)| s == "failed");
        let all_completed = states.values().all(|(_, s)| s == "completed");
        let new_status = if all_completed {
            WorkflowStatus::Completed
        } else if any_failed && workflow.error_policy == ErrorPolicy::FailFast {
            WorkflowStatus::Failed
        } else {
            WorkflowStatus::Partial
        };
        self.store.update_workflow_status(workflow_id, new_status).await
    }

    /// Background driver loop: polls every non-terminal workflow on an
    /// interval. Mirrors the Queue Manager's tick discipline — errors in
    /// one workflow's iteration are logged, never allowed to stop the loop
    /// or affect other workflows.
    pub async fn run(self: Arc<Self>) -> CoreResult<()> {
        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            ticker.tick().await;
            let running = self.running_workflow_ids().await;
            for workflow_id in running {
                if let Err(e) = self.drive_once(workflow_id).await {
                    tracing::warn!(%workflow_id, error = %e, "orchestrator tick failed for workflow");
                }
            }
        }
    }

    async fn running_workflow_ids(&self) -> Vec<WorkflowId> {
        self.store.list_running_workflow_ids().await.unwrap_or_default()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn drive_once_for_test(&self, workflow_id: WorkflowId) -> CoreResult<()> {
        self.drive_once(workflow_id).await
    }
}
