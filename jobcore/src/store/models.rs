use crate::ids::{ClusterId, JobId, RemoteJobId, WorkflowId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Closed status value space for a [`Job`] (spec.md §4.5 state machine).
/// No silent mappings: every transition is checked against this set by the
/// store before being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    Pending,
    Ready,
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Legal transitions per spec.md §4.5's state diagram.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Ready, Scheduled)
                | (Ready, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Failed)
                | (Scheduled, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }
}

impl FromStr for JobStatus {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "scheduled" => Ok(Self::Scheduled),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::error::CoreError::validation(format!(
                "unknown job status: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunnerKind {
    Local,
    Ssh,
    Batch,
}

impl RunnerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Ssh => "ssh",
            Self::Batch => "batch",
        }
    }
}

impl FromStr for RunnerKind {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "ssh" => Ok(Self::Ssh),
            "batch" => Ok(Self::Batch),
            other => Err(crate::error::CoreError::validation(format!(
                "unknown runner kind: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attributes needed to create a [`Job`]; free-form scheduling metadata is
/// confined to the opaque `parallelism` and `input_blob` fields rather than
/// an open-ended parameter map (spec.md §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewJob {
    pub name: String,
    pub work_dir: String,
    pub code_kind: String,
    pub runner_kind: RunnerKind,
    pub cluster_id: Option<ClusterId>,
    pub parallelism: serde_json::Value,
    pub input_blob: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub work_dir: String,
    pub status: JobStatus,
    pub code_kind: String,
    pub runner_kind: RunnerKind,
    pub cluster_id: Option<ClusterId>,
    pub parallelism: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub handle: Option<String>,
    pub input_blob: String,
    pub results_blob: Option<String>,
    pub results_index: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterKind {
    Ssh,
    Batch,
}

impl ClusterKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ssh => "ssh",
            Self::Batch => "batch",
        }
    }
}

impl FromStr for ClusterKind {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ssh" => Ok(Self::Ssh),
            "batch" => Ok(Self::Batch),
            other => Err(crate::error::CoreError::validation(format!(
                "unknown cluster kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewCluster {
    pub name: String,
    pub kind: ClusterKind,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub connection_config: serde_json::Value,
    pub max_concurrent: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
    pub id: ClusterId,
    pub name: String,
    pub kind: ClusterKind,
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub connection_config: serde_json::Value,
    pub active: bool,
    pub max_concurrent: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRemoteJob {
    pub job_id: JobId,
    pub cluster_id: ClusterId,
    pub remote_handle: String,
    pub queue_name: Option<String>,
    pub assigned_nodes: Vec<String>,
    pub remote_work_dir: String,
    pub remote_stdout: Option<String>,
    pub remote_stderr: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteJob {
    pub id: RemoteJobId,
    pub job_id: JobId,
    pub cluster_id: ClusterId,
    pub remote_handle: String,
    pub submitted_at: DateTime<Utc>,
    pub queue_name: Option<String>,
    pub assigned_nodes: Vec<String>,
    pub remote_work_dir: String,
    pub remote_stdout: Option<String>,
    pub remote_stderr: Option<String>,
    pub metadata: serde_json::Value,
}

/// Semantics of a dependency edge (spec.md §3, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateKind {
    AfterSuccess,
    AfterAny,
    AfterFailure,
}

impl GateKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AfterSuccess => "after-success",
            Self::AfterAny => "after-any",
            Self::AfterFailure => "after-failure",
        }
    }

    /// Whether `upstream`'s status satisfies this gate. `Cancelled` upstream
    /// jobs are treated as equivalent to `Failed` for `after-any`, and as
    /// neither success nor failure for the other gates (§9 Open Question:
    /// downstream never runs) — see DESIGN.md.
    pub fn satisfied_by(self, upstream: JobStatus) -> bool {
        match self {
            Self::AfterSuccess => upstream == JobStatus::Completed,
            Self::AfterAny => matches!(
                upstream,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
            ),
            Self::AfterFailure => upstream == JobStatus::Failed,
        }
    }
}

impl FromStr for GateKind {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "after-success" => Ok(Self::AfterSuccess),
            "after-any" => Ok(Self::AfterAny),
            "after-failure" => Ok(Self::AfterFailure),
            other => Err(crate::error::CoreError::validation(format!(
                "unknown gate kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyEdge {
    pub from_job_id: JobId,
    pub to_job_id: JobId,
    pub gate: GateKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Partial,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Partial => "partial",
            Self::Cancelled => "cancelled",
        }
    }
}

impl FromStr for WorkflowStatus {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "partial" => Ok(Self::Partial),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::error::CoreError::validation(format!(
                "unknown workflow status: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorPolicy {
    FailFast,
    Continue,
}

impl ErrorPolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FailFast => "fail-fast",
            Self::Continue => "continue",
        }
    }
}

impl FromStr for ErrorPolicy {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fail-fast" => Ok(Self::FailFast),
            "continue" => Ok(Self::Continue),
            other => Err(crate::error::CoreError::validation(format!(
                "unknown error policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Template,
    DataTransfer,
}

impl StepKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Template => "template",
            Self::DataTransfer => "data-transfer",
        }
    }
}

impl FromStr for StepKind {
    type Err = crate::error::CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "template" => Ok(Self::Template),
            "data-transfer" => Ok(Self::DataTransfer),
            other => Err(crate::error::CoreError::validation(format!(
                "unknown step kind: {other}"
            ))),
        }
    }
}

/// A named predecessor edge inside a workflow DAG definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepPredecessor {
    pub name: String,
    pub gate: GateKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub kind: StepKind,
    pub parameters: serde_json::Value,
    pub predecessors: Vec<StepPredecessor>,
}

/// The DAG definition blob stored on a [`Workflow`] row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDag {
    pub steps: Vec<WorkflowStep>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewWorkflow {
    pub name: String,
    pub dag: WorkflowDag,
    pub error_policy: ErrorPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub name: String,
    pub dag: WorkflowDag,
    pub error_policy: ErrorPolicy,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Character allowlist enforced on every user-supplied name (spec.md §4.1,
/// §4.4 batch-script field table, §8 injection-resistance property).
pub fn validate_name(name: &str) -> crate::error::CoreResult<()> {
    static ALLOWED: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ALLOWED.get_or_init(|| regex::Regex::new(r"^[A-Za-z0-9._-]+$").unwrap());
    if name.is_empty() || name.len() > 255 || !re.is_match(name) {
        return Err(crate::error::CoreError::validation(format!(
            "name '{name}' must match [A-Za-z0-9._-]+ and be 1-255 chars"
        )));
    }
    Ok(())
}
