//! Persistent store: the single source of truth for jobs, clusters,
//! remote-job handles, dependencies, and workflows (spec.md §4.1).
//!
//! Grounded on the teacher's `dog-queue::backend::memory::storage::MemoryBackend`
//! for shape (one struct owning all state, async methods returning
//! `QueueResult<T>`), generalized from an in-memory `HashMap` to a SQLite
//! connection pool since spec.md requires a real single-file, multi-reader
//! store rather than a process-local cache.

pub mod clusters;
pub mod dependencies;
pub mod jobs;
pub mod migrations;
pub mod models;
pub mod remote_jobs;
pub mod workflows;

use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::CoreResult;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open (creating if absent) the store file at `config.db_path`,
    /// configure WAL + busy timeout + foreign keys per spec.md §4.1, and
    /// apply any pending migrations.
    pub async fn open(config: &Config) -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str(&format!(
            "sqlite://{}",
            config.db_path.display()
        ))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
        .busy_timeout(config.busy_timeout)
        .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(options)
            .await?;

        migrations::apply(&pool, migrations::MIGRATIONS).await?;

        Ok(Self {
            pool,
            clock: Arc::new(SystemClock),
        })
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn open_in_memory() -> CoreResult<Self> {
        Self::open_in_memory_with_clock(Arc::new(SystemClock)).await
    }

    /// Same as [`Store::open_in_memory`], but sourcing every timestamp
    /// from the given [`Clock`] — lets tests drive `created_at`/`started_at`/
    /// `ended_at` deterministically instead of racing the wall clock
    /// (spec.md §6).
    #[cfg(any(test, feature = "test-util"))]
    pub async fn open_in_memory_with_clock(clock: Arc<dyn Clock>) -> CoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        migrations::apply(&pool, migrations::MIGRATIONS).await?;
        Ok(Self { pool, clock })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}
