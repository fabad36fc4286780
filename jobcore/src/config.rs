use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Process-wide configuration, built once at startup and passed by reference
/// or `Arc` to every collaborator (spec.md §9: no module-level globals).
///
/// Every field has an environment variable with a sane default, following
/// the same "env var, fallback to default" idiom the teacher's example app
/// config uses throughout (`env::var(...).unwrap_or_else(|_| "...".into())`).
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub known_hosts_path: Option<PathBuf>,
    pub scratch_dir: PathBuf,
    pub scheduler_interval: Duration,
    pub pool_size: u32,
    pub busy_timeout: Duration,
    pub health_check_interval: Duration,
    pub probe_timeout: Duration,
    pub connect_timeout: Duration,
    pub submit_timeout: Duration,
}

impl Config {
    /// Load from environment variables, applying defaults for anything unset.
    pub fn from_env() -> Self {
        Self {
            db_path: env::var("JOBCORE_DB_PATH")
                .unwrap_or_else(|_| "jobcore.db".to_string())
                .into(),
            known_hosts_path: env::var("JOBCORE_KNOWN_HOSTS").ok().map(PathBuf::from),
            scratch_dir: env::var("JOBCORE_SCRATCH_DIR")
                .unwrap_or_else(|_| "/tmp/jobcore".to_string())
                .into(),
            scheduler_interval: Duration::from_millis(
                env::var("JOBCORE_SCHEDULER_INTERVAL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1000),
            ),
            pool_size: env::var("JOBCORE_POOL_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(4),
            busy_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(
                env::var("JOBCORE_HEALTH_CHECK_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(30),
            ),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            submit_timeout: Duration::from_secs(30),
        }
    }

    /// In-memory config for tests: a throwaway scratch dir under the OS tmp dir.
    pub fn for_tests(db_path: PathBuf) -> Self {
        Self {
            db_path,
            known_hosts_path: None,
            scratch_dir: env::temp_dir().join("jobcore-test-scratch"),
            scheduler_interval: Duration::from_millis(50),
            pool_size: 4,
            busy_timeout: Duration::from_secs(5),
            health_check_interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            submit_timeout: Duration::from_secs(5),
        }
    }
}

/// Initialise the `RUST_LOG`-driven tracing subscriber the way the teacher's
/// example app bootstraps logging: default to `info` when unset, then let
/// `tracing_subscriber` take over.
pub fn init_tracing() {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}
