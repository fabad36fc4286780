use thiserror::Error;

/// Result type used throughout the core.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// The closed error taxonomy for the job orchestration core.
///
/// Every variant maps to exactly one exit code at the CLI boundary
/// (`jobcore-cli`); the core itself never maps errors to exit codes.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("circular dependency in {context}: {}", cycle_path.join(" -> "))]
    CircularDependency {
        cycle_path: Vec<String>,
        context: String,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("connectivity error: {0}")]
    Connectivity(String),

    #[error("host key unverifiable: {0} (hint: run `ssh-keyscan -H <host> >> <known_hosts>`)")]
    HostKeyUnverifiable(String),

    #[error("runner error: {message}{}", exit_code.map(|c| format!(" (exit code {c})")).unwrap_or_default())]
    Runner {
        message: String,
        exit_code: Option<i32>,
    },

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        Self::Connectivity(msg.into())
    }

    pub fn host_key_unverifiable(msg: impl Into<String>) -> Self {
        Self::HostKeyUnverifiable(msg.into())
    }

    pub fn runner(msg: impl Into<String>, exit_code: Option<i32>) -> Self {
        Self::Runner {
            message: msg.into(),
            exit_code,
        }
    }

    /// Exit code per spec.md §6: 0 ok; 1 generic; 2 validation error;
    /// 3 not found; 4 dependency cycle; 5 connectivity error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Validation(_) => 2,
            Self::NotFound(_) => 3,
            Self::CircularDependency { .. } => 4,
            Self::Connectivity(_) | Self::HostKeyUnverifiable(_) | Self::Timeout(_) => 5,
            _ => 1,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Timeout(_))
    }
}
