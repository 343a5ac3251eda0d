//! Postgres-backed job store.
//!
//! Claims and stuck-job recovery select candidate rows with
//! `FOR UPDATE SKIP LOCKED` inside a CTE and flip them in the same
//! statement, so concurrent workers (in any process) skip rows another
//! worker is claiming instead of waiting on them.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | JobStoreError |
//! |------------|----------------------|---------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | Any other | `Storage` |
//! | Row decode failure | N/A | `Corrupt` |
//! | Other | N/A | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use loyaltysync_core::{Phone, UserId};

use super::store::{EnqueueRequest, JobStats, JobStore, JobStoreError, Transition};
use super::types::{Job, JobId, JobStatus, STUCK_RECOVERY_MARKER};

/// Width of the `lock_owner` column; worker ids must fit in it.
pub const LOCK_OWNER_MAX_LEN: usize = 64;

const JOB_COLUMNS: &str = "id, user_id, phone, operation, status, payload, attempt_count, \
     max_attempts, next_retry_at, last_attempt_at, completed_at, lock_owner, locked_at, \
     last_error, created_at, updated_at";

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS sync_jobs (
        id              UUID PRIMARY KEY,
        user_id         BIGINT NULL,
        phone           VARCHAR(20) NULL,
        target_key      VARCHAR(64) NOT NULL,
        operation       VARCHAR(32) NOT NULL,
        status          VARCHAR(16) NOT NULL DEFAULT 'pending',
        payload         JSONB NOT NULL DEFAULT '{}'::jsonb,
        attempt_count   INTEGER NOT NULL DEFAULT 0,
        max_attempts    INTEGER NOT NULL DEFAULT 8,
        next_retry_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        last_attempt_at TIMESTAMPTZ NULL,
        completed_at    TIMESTAMPTZ NULL,
        lock_owner      VARCHAR(64) NULL,
        locked_at       TIMESTAMPTZ NULL,
        last_error      TEXT NULL,
        created_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        updated_at      TIMESTAMPTZ NOT NULL DEFAULT NOW(),
        CONSTRAINT ck_sync_jobs_target CHECK (user_id IS NOT NULL OR phone IS NOT NULL),
        CONSTRAINT ck_sync_jobs_attempts CHECK (attempt_count >= 0 AND attempt_count <= max_attempts)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS ix_sync_jobs_due ON sync_jobs (status, next_retry_at, id)",
    "CREATE INDEX IF NOT EXISTS ix_sync_jobs_target ON sync_jobs (operation, target_key)",
    "CREATE INDEX IF NOT EXISTS ix_sync_jobs_running ON sync_jobs (locked_at) WHERE status = 'running'",
];

/// Postgres-backed job store.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `sync_jobs` table and its indexes if they are missing.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, request), fields(operation = %request.operation, target = %request.target), err)]
    async fn enqueue(
        &self,
        request: EnqueueRequest,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let target_key = request.target.key();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // Serializes concurrent enqueues for the same (operation, target).
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(format!("sync_jobs:{}:{}", request.operation, target_key))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("enqueue_lock", e))?;

        let existing = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE operation = $1 AND target_key = $2 \
               AND status IN ('pending', 'failed', 'paused') \
             ORDER BY id DESC LIMIT 1 FOR UPDATE"
        ))
        .bind(request.operation.as_str())
        .bind(&target_key)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("find_active_job", e))?;

        let job = match existing {
            Some(row) => {
                let mut job = job_from_row(&row)?;
                job.reopen(request.payload, request.max_attempts, now);
                write_job(&mut tx, &job).await?;
                job
            }
            None => {
                let job = Job::new(
                    request.operation,
                    &request.target,
                    request.payload,
                    request.max_attempts,
                    now,
                );
                insert_job(&mut tx, &job).await?;
                job
            }
        };

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(job)
    }

    #[instrument(skip(self), err)]
    async fn claim_due(
        &self,
        worker_id: &str,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            WITH due AS (
                SELECT id
                FROM sync_jobs
                WHERE status IN ('pending', 'failed')
                  AND next_retry_at <= $1
                  AND attempt_count < max_attempts
                ORDER BY next_retry_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE sync_jobs AS j
            SET status = 'running',
                lock_owner = $3,
                locked_at = $1,
                last_attempt_at = $1,
                updated_at = $1
            FROM due
            WHERE j.id = due.id
            RETURNING {}
            "#,
            prefixed_columns("j")
        ))
        .bind(now)
        .bind(limit as i64)
        .bind(worker_id)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("claim_due", e))?;

        let mut jobs = rows
            .iter()
            .map(job_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        // RETURNING does not preserve the CTE order.
        jobs.sort_by_key(|j| (j.next_retry_at, j.id));
        Ok(jobs)
    }

    #[instrument(skip(self), err)]
    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM sync_jobs WHERE id = $1"))
            .bind(job_id.0)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn get_claimed(
        &self,
        job_id: JobId,
        worker_id: &str,
    ) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE id = $1 AND status = 'running' AND lock_owner = $2"
        ))
        .bind(job_id.0)
        .bind(worker_id)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_claimed", e))?;
        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self, transition), err)]
    async fn update_claimed(
        &self,
        job_id: JobId,
        worker_id: &str,
        transition: Transition<'_>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "SELECT {JOB_COLUMNS} FROM sync_jobs \
             WHERE id = $1 AND status = 'running' AND lock_owner = $2 \
             FOR UPDATE"
        ))
        .bind(job_id.0)
        .bind(worker_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("lock_claimed", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(None);
        };

        let mut job = job_from_row(&row)?;
        transition(&mut job);
        write_job(&mut tx, &job).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))?;
        Ok(Some(job))
    }

    #[instrument(skip(self), err)]
    async fn recover_stale(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<JobId>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM sync_jobs
                WHERE status = 'running'
                  AND locked_at IS NOT NULL
                  AND locked_at <= $1
                ORDER BY locked_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE sync_jobs AS j
            SET status = 'pending',
                next_retry_at = $3,
                lock_owner = NULL,
                locked_at = NULL,
                last_error = $4,
                updated_at = $3
            FROM stale
            WHERE j.id = stale.id
            RETURNING j.id
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .bind(now)
        .bind(STUCK_RECOVERY_MARKER)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("recover_stale", e))?;

        rows.iter()
            .map(|row| {
                row.try_get::<Uuid, _>("id")
                    .map(JobId::from_uuid)
                    .map_err(|e| JobStoreError::Corrupt(format!("failed to read id: {e}")))
            })
            .collect()
    }

    #[instrument(skip(self), err)]
    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS count FROM sync_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row
                .try_get("status")
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read status: {e}")))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| JobStoreError::Corrupt(format!("failed to read count: {e}")))?;
            let status = status
                .parse::<JobStatus>()
                .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
            stats.record(status, count.max(0) as usize);
        }
        Ok(stats)
    }
}

async fn insert_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        INSERT INTO sync_jobs (
            id, user_id, phone, target_key, operation, status, payload,
            attempt_count, max_attempts, next_retry_at, last_attempt_at,
            completed_at, lock_owner, locked_at, last_error, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17)
        "#,
    )
    .bind(job.id.0)
    .bind(job.user_id.map(|id| id.get()))
    .bind(job.phone.as_ref().map(|p| p.as_str().to_string()))
    .bind(job.target_key())
    .bind(job.operation.as_str())
    .bind(job.status.as_str())
    .bind(&job.payload)
    .bind(job.attempt_count as i32)
    .bind(job.max_attempts as i32)
    .bind(job.next_retry_at)
    .bind(job.last_attempt_at)
    .bind(job.completed_at)
    .bind(&job.lock_owner)
    .bind(job.locked_at)
    .bind(&job.last_error)
    .bind(job.created_at)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_job", e))?;
    Ok(())
}

async fn write_job(tx: &mut Transaction<'_, Postgres>, job: &Job) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE sync_jobs
        SET status = $2,
            payload = $3,
            attempt_count = $4,
            max_attempts = $5,
            next_retry_at = $6,
            last_attempt_at = $7,
            completed_at = $8,
            lock_owner = $9,
            locked_at = $10,
            last_error = $11,
            updated_at = $12
        WHERE id = $1
        "#,
    )
    .bind(job.id.0)
    .bind(job.status.as_str())
    .bind(&job.payload)
    .bind(job.attempt_count as i32)
    .bind(job.max_attempts as i32)
    .bind(job.next_retry_at)
    .bind(job.last_attempt_at)
    .bind(job.completed_at)
    .bind(&job.lock_owner)
    .bind(job.locked_at)
    .bind(&job.last_error)
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("write_job", e))?;
    Ok(())
}

fn prefixed_columns(alias: &str) -> String {
    JOB_COLUMNS
        .split(',')
        .map(|c| format!("{alias}.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    let corrupt = |e: sqlx::Error| JobStoreError::Corrupt(format!("failed to decode job row: {e}"));

    let phone: Option<String> = row.try_get("phone").map_err(corrupt)?;
    let phone = phone
        .map(|p| Phone::parse(&p))
        .transpose()
        .map_err(|e| JobStoreError::Corrupt(e.to_string()))?;
    let operation: String = row.try_get("operation").map_err(corrupt)?;
    let status: String = row.try_get("status").map_err(corrupt)?;
    let attempt_count: i32 = row.try_get("attempt_count").map_err(corrupt)?;
    let max_attempts: i32 = row.try_get("max_attempts").map_err(corrupt)?;

    Ok(Job {
        id: JobId::from_uuid(row.try_get("id").map_err(corrupt)?),
        user_id: row
            .try_get::<Option<i64>, _>("user_id")
            .map_err(corrupt)?
            .map(UserId::new),
        phone,
        operation: operation
            .parse()
            .map_err(|e: loyaltysync_core::DomainError| JobStoreError::Corrupt(e.to_string()))?,
        status: status
            .parse()
            .map_err(|e: loyaltysync_core::DomainError| JobStoreError::Corrupt(e.to_string()))?,
        payload: row.try_get("payload").map_err(corrupt)?,
        attempt_count: attempt_count.max(0) as u32,
        max_attempts: max_attempts.max(1) as u32,
        next_retry_at: row.try_get("next_retry_at").map_err(corrupt)?,
        last_attempt_at: row.try_get("last_attempt_at").map_err(corrupt)?,
        completed_at: row.try_get("completed_at").map_err(corrupt)?,
        lock_owner: row.try_get("lock_owner").map_err(corrupt)?,
        locked_at: row.try_get("locked_at").map_err(corrupt)?,
        last_error: row.try_get("last_error").map_err(corrupt)?,
        created_at: row.try_get("created_at").map_err(corrupt)?,
        updated_at: row.try_get("updated_at").map_err(corrupt)?,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => JobStoreError::Conflict(msg),
                _ => JobStoreError::Storage(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::{OperationKind, SyncTarget};
    use serde_json::Map;
    use std::collections::HashSet;

    async fn store() -> PostgresJobStore {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = PgPool::connect(&url).await.expect("connect to postgres");
        let store = PostgresJobStore::new(pool);
        store.ensure_schema().await.expect("schema");
        store
    }

    fn unique_user() -> UserId {
        UserId::new(rand::random::<u32>() as i64 + 1_000_000)
    }

    fn request(user_id: UserId) -> EnqueueRequest {
        EnqueueRequest {
            operation: OperationKind::SyncUser,
            target: SyncTarget::user(user_id),
            payload: Map::new(),
            max_attempts: 8,
        }
    }

    #[test]
    fn prefixed_columns_qualifies_every_column() {
        let columns = prefixed_columns("j");
        assert!(columns.starts_with("j.id, j.user_id"));
        assert_eq!(columns.matches("j.").count(), JOB_COLUMNS.split(',').count());
    }

    #[tokio::test]
    #[ignore = "requires DATABASE_URL"]
    async fn enqueue_merges_and_claims_once() {
        let store = store().await;
        let user = unique_user();
        let now = Utc::now();

        let first = store.enqueue(request(user), now).await.unwrap();
        let second = store.enqueue(request(user), now).await.unwrap();
        assert_eq!(first.id, second.id);

        let claimed = store.claim_due("pg-test-worker", 1000, now).await.unwrap();
        assert!(claimed.iter().any(|j| j.id == first.id));

        let done = store
            .update_claimed(first.id, "pg-test-worker", &|job: &mut Job| job.mark_completed(now))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(done.status, JobStatus::Success);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires DATABASE_URL"]
    async fn concurrent_claims_never_overlap() {
        let store = store().await;
        let now = Utc::now();
        let mut ours = HashSet::new();
        for _ in 0..50 {
            ours.insert(store.enqueue(request(unique_user()), now).await.unwrap().id);
        }

        let mut handles = Vec::new();
        for worker in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .claim_due(&format!("pg-worker-{worker}"), 25, now)
                    .await
                    .unwrap()
            }));
        }

        let mut seen = HashSet::new();
        for handle in handles {
            for job in handle.await.unwrap() {
                assert!(seen.insert(job.id), "job {} claimed twice", job.id);
            }
        }
        assert!(ours.iter().any(|id| seen.contains(id)));
    }
}
