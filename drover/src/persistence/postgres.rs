use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;
use uuid::Uuid;

use crate::config::MAX_VISIBILITY_TIMEOUT_MS;
use crate::dead_letter::{DeadLetterFilter, DeadLetterId, DeadLetterJob};
use crate::error::{QueueError, QueueResult};
use crate::job::{Job, JobError, JobFilter, JobId, JobPriority, JobStatus};
use crate::store::{DeadLetterStore, JobStore, QueueSnapshot, StuckRelease};

const UNIQUE_VIOLATION: &str = "23505";

/// PostgreSQL-backed job and dead-letter store.
///
/// Claims use a single `UPDATE ... WHERE id = (SELECT ... FOR UPDATE SKIP
/// LOCKED)` statement so competing workers never block on, or double-claim,
/// the same row.
#[derive(Clone, Debug)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wraps an existing pool. Call [`PostgresStore::migrate`] before use.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| QueueError::Store(format!("migration failed: {e}")))
    }
}

fn to_i32(value: u32) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn to_timeout_ms(value: u64) -> i64 {
    i64::try_from(value.min(MAX_VISIBILITY_TIMEOUT_MS)).unwrap_or(i64::MAX)
}

fn to_u32(value: i32, column: &str) -> QueueResult<u32> {
    u32::try_from(value).map_err(|_| QueueError::Store(format!("negative {column}: {value}")))
}

fn error_to_json(error: &JobError) -> QueueResult<serde_json::Value> {
    Ok(serde_json::to_value(error)?)
}

fn error_from_json(value: Option<serde_json::Value>) -> QueueResult<Option<JobError>> {
    value
        .map(serde_json::from_value)
        .transpose()
        .map_err(QueueError::from)
}

fn job_from_row(row: &PgRow) -> QueueResult<Job> {
    let status: String = row.try_get("status")?;
    let visibility_timeout_ms: i64 = row.try_get("visibility_timeout_ms")?;

    Ok(Job {
        id: JobId(row.try_get("id")?),
        job_type: row.try_get("job_type")?,
        status: status.parse().map_err(QueueError::Store)?,
        payload: row.try_get("payload")?,
        result: row.try_get("result")?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        max_attempts: to_u32(row.try_get("max_attempts")?, "max_attempts")?,
        priority: JobPriority(row.try_get("priority")?),
        available_at: row.try_get("available_at")?,
        lock_owner: row.try_get("lock_owner")?,
        locked_at: row.try_get("locked_at")?,
        last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        visibility_timeout_ms: u64::try_from(visibility_timeout_ms).unwrap_or(0),
        error: error_from_json(row.try_get("error")?)?,
        idempotency_key: row.try_get("idempotency_key")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> QueueResult<DeadLetterJob> {
    Ok(DeadLetterJob {
        id: DeadLetterId(row.try_get("id")?),
        original_job_id: JobId(row.try_get("original_job_id")?),
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        priority: JobPriority(row.try_get("priority")?),
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        max_attempts: to_u32(row.try_get("max_attempts")?, "max_attempts")?,
        error: error_from_json(row.try_get("error")?)?,
        original_created_at: row.try_get("original_created_at")?,
        moved_to_dlq_at: row.try_get("moved_to_dlq_at")?,
        retry_count: to_u32(row.try_get("retry_count")?, "retry_count")?,
        last_retried_at: row.try_get("last_retried_at")?,
    })
}

#[async_trait]
impl JobStore for PostgresStore {
    async fn insert(&self, job: Job) -> QueueResult<Job> {
        let error = job.error.as_ref().map(error_to_json).transpose()?;
        let res = sqlx::query(
            r#"
            INSERT INTO drover_jobs (
                id, job_type, status, payload, result, attempts, max_attempts, priority,
                available_at, lock_owner, locked_at, last_heartbeat_at, visibility_timeout_ms,
                error, idempotency_key, started_at, finished_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            RETURNING *
            "#,
        )
        .bind(job.id.0)
        .bind(&job.job_type)
        .bind(job.status.as_str())
        .bind(&job.payload)
        .bind(&job.result)
        .bind(to_i32(job.attempts))
        .bind(to_i32(job.max_attempts))
        .bind(job.priority.value())
        .bind(job.available_at)
        .bind(&job.lock_owner)
        .bind(job.locked_at)
        .bind(job.last_heartbeat_at)
        // Keeps the lock-expiry interval arithmetic in range.
        .bind(to_timeout_ms(job.visibility_timeout_ms))
        .bind(error)
        .bind(&job.idempotency_key)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .fetch_one(&self.pool)
        .await;

        match res {
            Ok(row) => job_from_row(&row),
            Err(sqlx::Error::Database(db_err))
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION) =>
            {
                debug!(job_type = %job.job_type, "idempotency key already taken");
                Err(QueueError::Conflict {
                    job_type: job.job_type,
                    idempotency_key: job.idempotency_key.unwrap_or_default(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn find(&self, id: JobId) -> QueueResult<Option<Job>> {
        let row = sqlx::query("SELECT * FROM drover_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM drover_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR job_type = $2)
            ORDER BY created_at DESC, id DESC
            LIMIT $3
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.job_type.as_deref())
        .bind(i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_from_row).collect()
    }

    async fn claim_next(&self, worker_id: &str, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE drover_jobs
            SET status = 'processing',
                lock_owner = $1,
                locked_at = $2,
                last_heartbeat_at = $2,
                started_at = COALESCE(started_at, $2),
                attempts = attempts + 1,
                updated_at = $2
            WHERE id = (
                SELECT id
                FROM drover_jobs
                WHERE status = 'queued'
                  AND available_at <= $2
                ORDER BY priority ASC, available_at ASC, created_at ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn heartbeat(
        &self,
        id: JobId,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE drover_jobs
            SET locked_at = $3,
                last_heartbeat_at = $3,
                updated_at = $3
            WHERE id = $1
              AND status = 'processing'
              AND lock_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_succeeded(
        &self,
        id: JobId,
        worker_id: &str,
        result: serde_json::Value,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE drover_jobs
            SET status = 'succeeded',
                result = $3,
                error = NULL,
                finished_at = $4,
                lock_owner = NULL,
                locked_at = NULL,
                last_heartbeat_at = NULL,
                updated_at = $4
            WHERE id = $1
              AND status = 'processing'
              AND lock_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(&result)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_retry(
        &self,
        id: JobId,
        worker_id: &str,
        error: JobError,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> QueueResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE drover_jobs
            SET status = 'queued',
                error = $3,
                available_at = $4,
                lock_owner = NULL,
                locked_at = NULL,
                last_heartbeat_at = NULL,
                updated_at = $5
            WHERE id = $1
              AND status = 'processing'
              AND lock_owner = $2
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(error_to_json(&error)?)
        .bind(available_at)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn mark_failed(
        &self,
        id: JobId,
        worker_id: &str,
        error: JobError,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<Job>> {
        let row = sqlx::query(
            r#"
            UPDATE drover_jobs
            SET status = 'failed',
                error = $3,
                finished_at = $4,
                idempotency_key = NULL,
                lock_owner = NULL,
                locked_at = NULL,
                last_heartbeat_at = NULL,
                updated_at = $4
            WHERE id = $1
              AND status = 'processing'
              AND lock_owner = $2
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(worker_id)
        .bind(error_to_json(&error)?)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn release_stuck(&self, now: DateTime<Utc>) -> QueueResult<StuckRelease> {
        let requeued = sqlx::query(
            r#"
            UPDATE drover_jobs
            SET status = 'queued',
                lock_owner = NULL,
                locked_at = NULL,
                last_heartbeat_at = NULL,
                updated_at = $1
            WHERE status = 'processing'
              AND attempts < max_attempts
              AND locked_at + visibility_timeout_ms * INTERVAL '1 millisecond' < $1
            "#,
        )
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let candidates = sqlx::query(
            r#"
            SELECT id, lock_owner, locked_at
            FROM drover_jobs
            WHERE status = 'processing'
              AND attempts >= max_attempts
              AND locked_at + visibility_timeout_ms * INTERVAL '1 millisecond' < $1
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut exhausted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let id: Uuid = candidate.try_get("id")?;
            let lock_owner: Option<String> = candidate.try_get("lock_owner")?;
            let locked_at: Option<DateTime<Utc>> = candidate.try_get("locked_at")?;
            let error = JobError::visibility_timeout(lock_owner.as_deref());

            // Guarded on the observed lock so a concurrent heartbeat or
            // finalize wins over this pass.
            let row = sqlx::query(
                r#"
                UPDATE drover_jobs
                SET status = 'failed',
                    error = $3,
                    finished_at = $4,
                    idempotency_key = NULL,
                    lock_owner = NULL,
                    locked_at = NULL,
                    last_heartbeat_at = NULL,
                    updated_at = $4
                WHERE id = $1
                  AND status = 'processing'
                  AND lock_owner IS NOT DISTINCT FROM $2
                  AND locked_at IS NOT DISTINCT FROM $5
                RETURNING *
                "#,
            )
            .bind(id)
            .bind(&lock_owner)
            .bind(error_to_json(&error)?)
            .bind(now)
            .bind(locked_at)
            .fetch_optional(&self.pool)
            .await?;

            match row {
                Some(row) => exhausted.push(job_from_row(&row)?),
                None => debug!(job_id = %id, "stuck job changed before it could be failed"),
            }
        }

        Ok(StuckRelease {
            requeued,
            exhausted,
        })
    }

    async fn snapshot(&self, now: DateTime<Utc>) -> QueueResult<QueueSnapshot> {
        let rows = sqlx::query(
            r#"
            SELECT job_type, status, COUNT(*) AS count
            FROM drover_jobs
            GROUP BY job_type, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshot = QueueSnapshot::new(now);
        for row in rows {
            let job_type: String = row.try_get("job_type")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            let status: JobStatus = status.parse().map_err(QueueError::Store)?;
            snapshot
                .entry_mut(&job_type)
                .add(status, u64::try_from(count).unwrap_or(0));
        }
        Ok(snapshot)
    }
}

#[async_trait]
impl DeadLetterStore for PostgresStore {
    async fn insert_dead_letter(&self, record: DeadLetterJob) -> QueueResult<DeadLetterJob> {
        let error = record.error.as_ref().map(error_to_json).transpose()?;
        let row = sqlx::query(
            r#"
            INSERT INTO drover_dead_letter_jobs (
                id, original_job_id, job_type, payload, priority, attempts, max_attempts,
                error, original_created_at, moved_to_dlq_at, retry_count, last_retried_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(record.id.0)
        .bind(record.original_job_id.0)
        .bind(&record.job_type)
        .bind(&record.payload)
        .bind(record.priority.value())
        .bind(to_i32(record.attempts))
        .bind(to_i32(record.max_attempts))
        .bind(error)
        .bind(record.original_created_at)
        .bind(record.moved_to_dlq_at)
        .bind(to_i32(record.retry_count))
        .bind(record.last_retried_at)
        .fetch_one(&self.pool)
        .await?;
        dead_letter_from_row(&row)
    }

    async fn find_dead_letter(&self, id: DeadLetterId) -> QueueResult<Option<DeadLetterJob>> {
        let row = sqlx::query("SELECT * FROM drover_dead_letter_jobs WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn list_dead_letters(
        &self,
        filter: &DeadLetterFilter,
    ) -> QueueResult<Vec<DeadLetterJob>> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM drover_dead_letter_jobs
            WHERE ($1::TEXT IS NULL OR job_type = $1)
            ORDER BY moved_to_dlq_at DESC, id DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(filter.job_type.as_deref())
        .bind(i64::try_from(filter.effective_limit()).unwrap_or(i64::MAX))
        .bind(i64::try_from(filter.effective_offset()).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn increment_retry_count(
        &self,
        id: DeadLetterId,
        now: DateTime<Utc>,
    ) -> QueueResult<Option<DeadLetterJob>> {
        let row = sqlx::query(
            r#"
            UPDATE drover_dead_letter_jobs
            SET retry_count = retry_count + 1,
                last_retried_at = $2
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id.0)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(dead_letter_from_row).transpose()
    }

    async fn delete_dead_letter(&self, id: DeadLetterId) -> QueueResult<bool> {
        let res = sqlx::query("DELETE FROM drover_dead_letter_jobs WHERE id = $1")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected() == 1)
    }

    async fn delete_dead_letters_before(&self, cutoff: DateTime<Utc>) -> QueueResult<u64> {
        let res = sqlx::query("DELETE FROM drover_dead_letter_jobs WHERE moved_to_dlq_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(res.rows_affected())
    }

    async fn count_dead_letters(&self) -> QueueResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM drover_dead_letter_jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(count).unwrap_or(0))
    }
}
