//! PostgreSQL implementation of JobSource
//!
//! Production persistence using PostgreSQL with:
//! - Atomic job claiming with `FOR UPDATE SKIP LOCKED`
//! - Named queues serialised through a queue lock row
//! - `pg_notify` on insert so idle workers can be nudged
//!
//! # Schema
//!
//! All tables live in a dedicated schema (default `taskq`), created by
//! [`PostgresJobSource::install_schema`]:
//!
//! - `tasks(id serial, identifier text unique)`
//! - `job_queues(id serial, queue_name text unique, locked_at, locked_by)`
//! - `jobs(id bigserial, job_queue_id, task_id, payload jsonb, priority
//!   smallint, run_at, attempts smallint, max_attempts smallint, last_error,
//!   key text unique, flags jsonb, locked_at, locked_by, created_at,
//!   updated_at)`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, info, instrument, warn};

use super::memory::DEFAULT_LOCK_TIMEOUT;
use super::store::*;
use crate::reliability::BackoffPolicy;
use crate::worker::WorkerPool;

/// Default schema holding the queue tables
pub const DEFAULT_SCHEMA: &str = "taskq";

/// Channel notified whenever a job is inserted
pub const JOB_INSERT_CHANNEL: &str = "jobs:insert";

const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS {schema};

CREATE TABLE IF NOT EXISTS {schema}.tasks (
    id serial PRIMARY KEY,
    identifier text NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS {schema}.job_queues (
    id serial PRIMARY KEY,
    queue_name text NOT NULL UNIQUE,
    locked_at timestamptz,
    locked_by text
);

CREATE TABLE IF NOT EXISTS {schema}.jobs (
    id bigserial PRIMARY KEY,
    job_queue_id int REFERENCES {schema}.job_queues (id),
    task_id int NOT NULL REFERENCES {schema}.tasks (id),
    payload jsonb NOT NULL DEFAULT '{}'::jsonb,
    priority smallint NOT NULL DEFAULT 0,
    run_at timestamptz NOT NULL DEFAULT now(),
    attempts smallint NOT NULL DEFAULT 0,
    max_attempts smallint NOT NULL DEFAULT 25 CHECK (max_attempts >= 1),
    last_error text,
    key text UNIQUE,
    flags jsonb NOT NULL DEFAULT '[]'::jsonb,
    locked_at timestamptz,
    locked_by text,
    created_at timestamptz NOT NULL DEFAULT now(),
    updated_at timestamptz NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS jobs_claim_order ON {schema}.jobs (priority, run_at, id);
CREATE INDEX IF NOT EXISTS jobs_locked_by ON {schema}.jobs (locked_by) WHERE locked_by IS NOT NULL;
"#;

/// Columns selected for every returned job
const JOB_COLUMNS: &str = r#"
    jobs.id, jobs.task_id, jobs.payload, jobs.priority, jobs.run_at,
    jobs.attempts, jobs.max_attempts, jobs.last_error, jobs.key, jobs.flags,
    jobs.locked_at, jobs.locked_by, jobs.created_at, jobs.updated_at,
    (SELECT identifier FROM {schema}.tasks WHERE tasks.id = jobs.task_id) AS task_identifier,
    (SELECT queue_name FROM {schema}.job_queues WHERE job_queues.id = jobs.job_queue_id) AS queue_name
"#;

type PgQuery<'q> = sqlx::query::Query<'q, Postgres, sqlx::postgres::PgArguments>;

fn db_error(context: &str, e: sqlx::Error) -> StoreError {
    error!("Failed to {}: {}", context, e);
    StoreError::Database(e.to_string())
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let flags: serde_json::Value = row.get("flags");
    let flags: Vec<String> = serde_json::from_value(flags)
        .map_err(|e| StoreError::Serialization(format!("invalid job flags: {}", e)))?;

    Ok(Job {
        id: JobId(row.get("id")),
        queue_name: row.get("queue_name"),
        task_id: TaskId(row.get("task_id")),
        task_identifier: row.get("task_identifier"),
        payload: row.get("payload"),
        priority: row.get("priority"),
        run_at: row.get("run_at"),
        attempts: row.get("attempts"),
        max_attempts: row.get("max_attempts"),
        last_error: row.get("last_error"),
        key: row.get("key"),
        flags,
        locked_at: row.get("locked_at"),
        locked_by: row.get("locked_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

/// PostgreSQL implementation of JobSource
///
/// Uses a connection pool; every multi-statement operation runs in its own
/// transaction so lock changes are atomic with the job row update.
///
/// # Example
///
/// ```ignore
/// use taskq::PostgresJobSource;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresJobSource::new(pool);
/// store.install_schema().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobSource {
    pool: PgPool,
    schema: String,
    lock_timeout: Duration,
    backoff: BackoffPolicy,
}

impl PostgresJobSource {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            schema: DEFAULT_SCHEMA.to_string(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            backoff: BackoffPolicy::default(),
        }
    }

    /// Use a different schema for the queue tables
    pub fn with_schema(mut self, schema: &str) -> Self {
        self.schema = schema.to_string();
        self
    }

    /// Set the age after which locks are considered abandoned
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// Set the backoff policy applied by `fail`
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Unquoted name of the schema holding the queue tables
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Create the schema and tables if they do not exist
    #[instrument(skip(self))]
    pub async fn install_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(&self.sql(SCHEMA_SQL))
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("install schema", e))?;

        info!(schema = %self.schema, "installed job queue schema");
        Ok(())
    }

    fn sql(&self, template: &str) -> String {
        template
            .replace("{columns}", JOB_COLUMNS)
            .replace("{schema}", &quote_ident(&self.schema))
    }

    fn lock_timeout_secs(&self) -> f64 {
        self.lock_timeout.as_secs_f64()
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| db_error("begin transaction", e))
    }

    /// Distinguish a missing job from a lock held by someone else
    async fn lock_error(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        worker_id: &str,
        job_id: JobId,
    ) -> StoreError {
        let exists = sqlx::query(&self.sql("SELECT 1 FROM {schema}.jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&mut **tx)
            .await;

        match exists {
            Ok(Some(_)) => StoreError::LockNotHeld {
                job_id,
                worker_id: worker_id.to_string(),
            },
            Ok(None) => StoreError::JobNotFound(job_id),
            Err(e) => db_error("look up job", e),
        }
    }

    async fn unlock_queue(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        queue_id: Option<i32>,
        worker_id: &str,
    ) -> Result<(), StoreError> {
        let Some(queue_id) = queue_id else {
            return Ok(());
        };

        sqlx::query(&self.sql(
            r#"
            UPDATE {schema}.job_queues
            SET locked_at = NULL, locked_by = NULL
            WHERE id = $1 AND locked_by = $2
            "#,
        ))
        .bind(queue_id)
        .bind(worker_id)
        .execute(&mut **tx)
        .await
        .map_err(|e| db_error("unlock queue", e))?;
        Ok(())
    }

    async fn fetch_jobs(&self, query: PgQuery<'_>) -> Result<Vec<Job>, StoreError> {
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("update jobs", e))?;
        rows.iter().map(job_from_row).collect()
    }
}

#[async_trait]
impl JobSource for PostgresJobSource {
    #[instrument(skip(self))]
    async fn register_tasks(
        &self,
        identifiers: &[String],
    ) -> Result<Vec<(TaskId, String)>, StoreError> {
        sqlx::query(&self.sql(
            r#"
            INSERT INTO {schema}.tasks (identifier)
            SELECT unnest($1::text[])
            ON CONFLICT (identifier) DO NOTHING
            "#,
        ))
        .bind(identifiers)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("register tasks", e))?;

        let rows = sqlx::query(&self.sql(
            "SELECT id, identifier FROM {schema}.tasks WHERE identifier = ANY($1::text[])",
        ))
        .bind(identifiers)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("select tasks", e))?;

        Ok(rows
            .iter()
            .map(|row| (TaskId(row.get("id")), row.get("identifier")))
            .collect())
    }

    #[instrument(skip(self, task_ids))]
    async fn claim(
        &self,
        worker_id: &str,
        task_ids: &[TaskId],
        flags_to_skip: Option<&[String]>,
    ) -> Result<Option<Job>, StoreError> {
        if task_ids.is_empty() {
            return Ok(None);
        }
        let task_ids: Vec<i32> = task_ids.iter().map(|id| id.0).collect();
        let flags_to_skip: Option<Vec<String>> = flags_to_skip.map(<[String]>::to_vec);

        let mut tx = self.begin().await?;

        // Candidate row and its queue row are both taken with SKIP LOCKED so
        // concurrent claimers never block on each other
        let candidate = sqlx::query(&self.sql(
            r#"
            SELECT jobs.id, jobs.job_queue_id
            FROM {schema}.jobs
            WHERE jobs.task_id = ANY($1::int[])
              AND (jobs.locked_at IS NULL
                   OR jobs.locked_at < now() - make_interval(secs => $2::float8))
              AND jobs.run_at <= now()
              AND jobs.attempts < jobs.max_attempts
              AND ($3::text[] IS NULL OR NOT (jobs.flags ?| $3::text[]))
              AND (jobs.job_queue_id IS NULL OR jobs.job_queue_id IN (
                  SELECT id FROM {schema}.job_queues
                  WHERE locked_at IS NULL
                     OR locked_at < now() - make_interval(secs => $2::float8)
                  FOR UPDATE SKIP LOCKED
              ))
            ORDER BY jobs.priority ASC, jobs.run_at ASC, jobs.id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        ))
        .bind(&task_ids)
        .bind(self.lock_timeout_secs())
        .bind(&flags_to_skip)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("claim job", e))?;

        let Some(candidate) = candidate else {
            tx.commit().await.map_err(|e| db_error("commit claim", e))?;
            return Ok(None);
        };
        let job_id: i64 = candidate.get("id");
        let queue_id: Option<i32> = candidate.get("job_queue_id");

        if let Some(queue_id) = queue_id {
            sqlx::query(&self.sql(
                r#"
                UPDATE {schema}.job_queues
                SET locked_by = $2, locked_at = now()
                WHERE id = $1
                "#,
            ))
            .bind(queue_id)
            .bind(worker_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("lock queue", e))?;
        }

        let row = sqlx::query(&self.sql(
            r#"
            UPDATE {schema}.jobs
            SET attempts = attempts + 1,
                locked_by = $2,
                locked_at = now(),
                updated_at = now()
            WHERE id = $1
            RETURNING {columns}
            "#,
        ))
        .bind(job_id)
        .bind(worker_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("lock job", e))?;

        tx.commit().await.map_err(|e| db_error("commit claim", e))?;

        let job = job_from_row(&row)?;
        debug!(job_id = %job.id, attempts = job.attempts, "claimed job");
        Ok(Some(job))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn complete(&self, worker_id: &str, job: &Job) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        let deleted = sqlx::query(&self.sql(
            r#"
            DELETE FROM {schema}.jobs
            WHERE id = $1 AND locked_by = $2
            RETURNING job_queue_id
            "#,
        ))
        .bind(job.id.0)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("complete job", e))?;

        let Some(deleted) = deleted else {
            let err = self.lock_error(&mut tx, worker_id, job.id).await;
            let _ = tx.rollback().await;
            return Err(err);
        };

        self.unlock_queue(&mut tx, deleted.get("job_queue_id"), worker_id)
            .await?;
        tx.commit().await.map_err(|e| db_error("commit complete", e))?;

        debug!("completed job");
        Ok(())
    }

    #[instrument(skip(self, job, message, replacement_payload), fields(job_id = %job.id))]
    async fn fail(
        &self,
        worker_id: &str,
        job: &Job,
        message: &str,
        replacement_payload: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let delay = self.backoff.delay_for_attempt(job.attempts).as_secs_f64();
        let mut tx = self.begin().await?;

        let updated = sqlx::query(&self.sql(
            r#"
            UPDATE {schema}.jobs
            SET last_error = $3,
                run_at = greatest(now(), run_at) + make_interval(secs => $4::float8),
                payload = coalesce($5::jsonb, payload),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = now()
            WHERE id = $1 AND locked_by = $2
            RETURNING job_queue_id
            "#,
        ))
        .bind(job.id.0)
        .bind(worker_id)
        .bind(message)
        .bind(delay)
        .bind(&replacement_payload)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| db_error("fail job", e))?;

        let Some(updated) = updated else {
            let err = self.lock_error(&mut tx, worker_id, job.id).await;
            let _ = tx.rollback().await;
            return Err(err);
        };

        self.unlock_queue(&mut tx, updated.get("job_queue_id"), worker_id)
            .await?;
        tx.commit().await.map_err(|e| db_error("commit fail", e))?;

        debug!(delay_secs = delay, "rescheduled failed job");
        Ok(())
    }

    #[instrument(skip(self, new_job), fields(identifier = %new_job.identifier))]
    async fn add_job(&self, new_job: NewJob) -> Result<Job, StoreError> {
        let flags = serde_json::to_value(&new_job.flags)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut tx = self.begin().await?;

        let task_id: i32 = sqlx::query(&self.sql(
            r#"
            INSERT INTO {schema}.tasks (identifier) VALUES ($1)
            ON CONFLICT (identifier) DO UPDATE SET identifier = EXCLUDED.identifier
            RETURNING id
            "#,
        ))
        .bind(&new_job.identifier)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("upsert task", e))?
        .get("id");

        let queue_id: Option<i32> = match &new_job.queue_name {
            Some(queue_name) => Some(
                sqlx::query(&self.sql(
                    r#"
                    INSERT INTO {schema}.job_queues (queue_name) VALUES ($1)
                    ON CONFLICT (queue_name) DO UPDATE SET queue_name = EXCLUDED.queue_name
                    RETURNING id
                    "#,
                ))
                .bind(queue_name)
                .fetch_one(&mut *tx)
                .await
                .map_err(|e| db_error("upsert queue", e))?
                .get("id"),
            ),
            None => None,
        };

        // Replaces an unlocked job holding the same key; a locked one is
        // left alone and comes back as no row
        let upsert = self.sql(
            r#"
            INSERT INTO {schema}.jobs
                (job_queue_id, task_id, payload, priority, run_at, max_attempts, key, flags)
            VALUES ($1, $2, $3, $4, coalesce($5, now()), $6, $7, $8)
            ON CONFLICT (key) DO UPDATE SET
                job_queue_id = EXCLUDED.job_queue_id,
                task_id = EXCLUDED.task_id,
                payload = EXCLUDED.payload,
                priority = EXCLUDED.priority,
                run_at = EXCLUDED.run_at,
                max_attempts = EXCLUDED.max_attempts,
                flags = EXCLUDED.flags,
                attempts = 0,
                last_error = NULL,
                updated_at = now()
            WHERE {schema}.jobs.locked_at IS NULL
            RETURNING {columns}
            "#,
        );
        let bind_job = |sql| {
            sqlx::query(sql)
                .bind(queue_id)
                .bind(task_id)
                .bind(&new_job.payload)
                .bind(new_job.priority)
                .bind(new_job.run_at)
                .bind(new_job.max_attempts)
                .bind(&new_job.key)
                .bind(&flags)
        };

        let inserted = bind_job(upsert.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| db_error("insert job", e))?;

        let row = match (inserted, &new_job.key) {
            (Some(row), _) => row,
            (None, Some(key)) => {
                // The conflicting row is running and stays row-locked until
                // commit; its key moves to a fresh row
                sqlx::query(&self.sql(
                    "UPDATE {schema}.jobs SET key = NULL WHERE key = $1 AND locked_at IS NOT NULL",
                ))
                .bind(key)
                .execute(&mut *tx)
                .await
                .map_err(|e| db_error("release job key", e))?;

                bind_job(upsert.as_str())
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| db_error("insert job", e))?
            }
            (None, None) => {
                let _ = tx.rollback().await;
                return Err(StoreError::Database(
                    "insert job: no row returned".to_string(),
                ));
            }
        };

        sqlx::query("SELECT pg_notify($1, '')")
            .bind(JOB_INSERT_CHANNEL)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("notify job insert", e))?;

        tx.commit().await.map_err(|e| db_error("commit add job", e))?;

        let job = job_from_row(&row)?;
        debug!(job_id = %job.id, "added job");
        Ok(job)
    }

    #[instrument(skip(self))]
    async fn complete_jobs(&self, ids: &[JobId]) -> Result<Vec<Job>, StoreError> {
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let sql = self.sql(
            r#"
            DELETE FROM {schema}.jobs
            WHERE id = ANY($1::bigint[]) AND locked_at IS NULL
            RETURNING {columns}
            "#,
        );
        self.fetch_jobs(sqlx::query(&sql).bind(&ids)).await
    }

    #[instrument(skip(self))]
    async fn permanently_fail_jobs(
        &self,
        ids: &[JobId],
        reason: &str,
    ) -> Result<Vec<Job>, StoreError> {
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let sql = self.sql(
            r#"
            UPDATE {schema}.jobs
            SET last_error = $2, attempts = max_attempts, updated_at = now()
            WHERE id = ANY($1::bigint[]) AND locked_at IS NULL
            RETURNING {columns}
            "#,
        );
        self.fetch_jobs(sqlx::query(&sql).bind(&ids).bind(reason))
            .await
    }

    #[instrument(skip(self))]
    async fn reschedule_jobs(
        &self,
        ids: &[JobId],
        options: RescheduleOptions,
    ) -> Result<Vec<Job>, StoreError> {
        let ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let sql = self.sql(
            r#"
            UPDATE {schema}.jobs
            SET run_at = coalesce($2, run_at),
                priority = coalesce($3, priority),
                attempts = coalesce($4, attempts),
                max_attempts = coalesce($5, max_attempts),
                updated_at = now()
            WHERE id = ANY($1::bigint[]) AND locked_at IS NULL
            RETURNING {columns}
            "#,
        );
        let run_at: Option<DateTime<Utc>> = options.run_at;
        self.fetch_jobs(
            sqlx::query(&sql)
                .bind(&ids)
                .bind(run_at)
                .bind(options.priority)
                .bind(options.attempts)
                .bind(options.max_attempts),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn force_unlock_workers(&self, worker_ids: &[String]) -> Result<(), StoreError> {
        let mut tx = self.begin().await?;

        sqlx::query(&self.sql(
            "UPDATE {schema}.jobs SET locked_at = NULL, locked_by = NULL WHERE locked_by = ANY($1::text[])",
        ))
        .bind(worker_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("unlock worker jobs", e))?;

        sqlx::query(&self.sql(
            "UPDATE {schema}.job_queues SET locked_at = NULL, locked_by = NULL WHERE locked_by = ANY($1::text[])",
        ))
        .bind(worker_ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("unlock worker queues", e))?;

        tx.commit().await.map_err(|e| db_error("commit unlock", e))?;

        info!(?worker_ids, "force unlocked workers");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn reset_locked_at(&self) -> Result<u64, StoreError> {
        let mut tx = self.begin().await?;

        let jobs = sqlx::query(&self.sql(
            r#"
            UPDATE {schema}.jobs
            SET locked_at = NULL, locked_by = NULL, run_at = greatest(run_at, now())
            WHERE locked_at < now() - make_interval(secs => $1::float8)
            "#,
        ))
        .bind(self.lock_timeout_secs())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("reset job locks", e))?;

        sqlx::query(&self.sql(
            r#"
            UPDATE {schema}.job_queues
            SET locked_at = NULL, locked_by = NULL
            WHERE locked_at < now() - make_interval(secs => $1::float8)
            "#,
        ))
        .bind(self.lock_timeout_secs())
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("reset queue locks", e))?;

        tx.commit().await.map_err(|e| db_error("commit reset", e))?;

        let unlocked = jobs.rows_affected();
        if unlocked > 0 {
            warn!(unlocked, "released expired job locks");
        }
        Ok(unlocked)
    }
}

/// Nudges a worker pool whenever a job is inserted
///
/// Listens on [`JOB_INSERT_CHANNEL`] and stops once the pool begins
/// shutting down.
pub struct JobInsertListener {
    pool: PgPool,
}

impl JobInsertListener {
    /// Create a listener on the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Spawn the listen loop for the given worker pool
    pub fn spawn(self, workers: Arc<WorkerPool>) -> tokio::task::JoinHandle<Result<(), StoreError>> {
        tokio::spawn(self.run(workers))
    }

    /// Listen until the worker pool shuts down
    pub async fn run(self, workers: Arc<WorkerPool>) -> Result<(), StoreError> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| db_error("connect listener", e))?;
        listener
            .listen(JOB_INSERT_CHANNEL)
            .await
            .map_err(|e| db_error("listen for job inserts", e))?;

        let shutdown = workers.shutdown_token();
        info!(channel = JOB_INSERT_CHANNEL, "listening for new jobs");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!("job insert listener stopping");
                    return Ok(());
                }
                notification = listener.recv() => match notification {
                    Ok(_) => {
                        let nudged = workers.nudge(1);
                        debug!(nudged, "job inserted");
                    }
                    Err(e) => {
                        // The listener reconnects on the next recv
                        warn!(error = %e, "job insert listener lost its connection");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                },
            }
        }
    }
}
