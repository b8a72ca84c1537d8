//! PostgreSQL-backed job store.
//!
//! Jobs live in `streamload_jobs` (see `migrations/`). Every transition is a
//! single conditional `UPDATE … WHERE state = …`, so concurrent callers never
//! observe a half-applied change. Transitions on a leased job also match
//! `retry_count`, which fences off holders whose lease expired and was
//! handed out again. Leasing uses `FOR UPDATE SKIP LOCKED`, which
//! lets several workers poll the same queue without handing one job to two of them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, error, warn};
use uuid::Uuid;

use streamload_core::{Job, JobId, JobPayload, JobState};

use crate::error::QueueError;
use crate::store::{JobStore, JobStoreOptions, LEASE_EXPIRED};

// ── Row mapping ──────────────────────────────────────────────────────

/// Row from the `streamload_jobs` table.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue_name: String,
    payload: serde_json::Value,
    state: String,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    retry_count: i32,
    last_error: Option<String>,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| QueueError::Corrupt { id, reason };
        let state = row.state.parse::<JobState>().map_err(|e| corrupt(e.to_string()))?;
        let payload: JobPayload =
            serde_json::from_value(row.payload).map_err(|e| corrupt(e.to_string()))?;
        Ok(Job {
            id: JobId(id),
            queue_name: row.queue_name,
            payload,
            state,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            retry_count: row.retry_count.max(0) as u32,
            last_error: row.last_error,
        })
    }
}

// ── Store ────────────────────────────────────────────────────────────

/// Job store over a PostgreSQL pool.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    options: JobStoreOptions,
}

impl PgJobStore {
    pub fn new(pool: PgPool, options: JobStoreOptions) -> Self {
        Self { pool, options }
    }

    /// Apply the embedded migrations that create `streamload_jobs`.
    pub async fn migrate(&self) -> Result<(), QueueError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Build the error for a lease-holder transition whose `UPDATE` matched no row.
    async fn lease_error(&self, id: JobId, attempt: u32) -> QueueError {
        match self.get(id).await {
            Ok(Some(job)) if job.state == JobState::Active => QueueError::LeaseLost { id, attempt },
            Ok(Some(job)) => QueueError::NotActive { id, state: job.state },
            Ok(None) => QueueError::NotFound(id),
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, queue_name: &str, payload: JobPayload) -> Result<JobId, QueueError> {
        payload.validate()?;
        let id = JobId::new();
        sqlx::query(
            "INSERT INTO streamload_jobs (id, queue_name, payload)
             VALUES ($1, $2, $3)",
        )
        .bind(id.as_uuid())
        .bind(queue_name)
        .bind(Json(&payload))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!(queue = %queue_name, error = %e, "failed to enqueue job");
            QueueError::Database(e)
        })?;

        debug!(job_id = %id, queue = %queue_name, "job enqueued");
        Ok(id)
    }

    async fn lease(&self, queue_name: &str) -> Result<Option<Job>, QueueError> {
        self.expire_leases(queue_name).await?;

        let row = sqlx::query_as::<_, JobRow>(
            "UPDATE streamload_jobs
             SET state = 'active', started_at = now()
             WHERE id = (
                 SELECT id FROM streamload_jobs
                 WHERE queue_name = $1 AND state = 'created'
                 ORDER BY seq
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             )
             RETURNING id, queue_name, payload, state, created_at,
                       started_at, completed_at, retry_count, last_error",
        )
        .bind(queue_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn complete(&self, id: JobId, attempt: u32) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE streamload_jobs
             SET state = 'completed', completed_at = now()
             WHERE id = $1 AND state = 'active' AND retry_count = $2",
        )
        .bind(id.as_uuid())
        .bind(attempt as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_error(id, attempt).await);
        }
        Ok(())
    }

    async fn fail(&self, id: JobId, attempt: u32, reason: &str) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE streamload_jobs
             SET state = 'failed', completed_at = now(), last_error = $3
             WHERE id = $1 AND state = 'active' AND retry_count = $2",
        )
        .bind(id.as_uuid())
        .bind(attempt as i32)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_error(id, attempt).await);
        }
        Ok(())
    }

    async fn renew(&self, id: JobId, attempt: u32) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE streamload_jobs
             SET started_at = now()
             WHERE id = $1 AND state = 'active' AND retry_count = $2",
        )
        .bind(id.as_uuid())
        .bind(attempt as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(self.lease_error(id, attempt).await);
        }
        Ok(())
    }

    async fn retry(&self, id: JobId, attempt: u32, reason: &str) -> Result<JobState, QueueError> {
        // SET expressions all see the pre-update row.
        let state = sqlx::query_scalar::<_, String>(
            "UPDATE streamload_jobs SET
                state        = CASE WHEN retry_count >= $3 THEN 'failed' ELSE 'created' END,
                retry_count  = CASE WHEN retry_count >= $3 THEN retry_count ELSE retry_count + 1 END,
                started_at   = CASE WHEN retry_count >= $3 THEN started_at ELSE NULL END,
                completed_at = CASE WHEN retry_count >= $3 THEN now() ELSE NULL END,
                last_error   = $2
             WHERE id = $1 AND state = 'active' AND retry_count = $4
             RETURNING state",
        )
        .bind(id.as_uuid())
        .bind(reason)
        .bind(self.options.retry_limit as i32)
        .bind(attempt as i32)
        .fetch_optional(&self.pool)
        .await?;

        match state {
            Some(state) => state.parse::<JobState>().map_err(|e| QueueError::Corrupt {
                id: id.as_uuid(),
                reason: e.to_string(),
            }),
            None => Err(self.lease_error(id, attempt).await),
        }
    }

    async fn cancel(&self, id: JobId) -> Result<(), QueueError> {
        let result = sqlx::query(
            "UPDATE streamload_jobs
             SET state = 'cancelled', completed_at = now()
             WHERE id = $1 AND state IN ('created', 'active')",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(match self.state(id).await {
                Ok(Some(state)) => QueueError::NotCancellable { id, state },
                Ok(None) => QueueError::NotFound(id),
                Err(e) => e,
            });
        }
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(
            "SELECT id, queue_name, payload, state, created_at,
                    started_at, completed_at, retry_count, last_error
             FROM streamload_jobs
             WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Job::try_from).transpose()
    }

    async fn state(&self, id: JobId) -> Result<Option<JobState>, QueueError> {
        let state = sqlx::query_scalar::<_, String>(
            "SELECT state FROM streamload_jobs WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        state
            .map(|s| {
                s.parse::<JobState>().map_err(|e| QueueError::Corrupt {
                    id: id.as_uuid(),
                    reason: e.to_string(),
                })
            })
            .transpose()
    }

    async fn expire_leases(&self, queue_name: &str) -> Result<u64, QueueError> {
        let result = sqlx::query(
            "UPDATE streamload_jobs SET
                state        = CASE WHEN retry_count >= $2 THEN 'failed' ELSE 'created' END,
                retry_count  = CASE WHEN retry_count >= $2 THEN retry_count ELSE retry_count + 1 END,
                started_at   = CASE WHEN retry_count >= $2 THEN started_at ELSE NULL END,
                completed_at = CASE WHEN retry_count >= $2 THEN now() ELSE NULL END,
                last_error   = $3
             WHERE queue_name = $4
               AND state = 'active'
               AND started_at <= now() - make_interval(secs => $1)",
        )
        .bind(self.options.lease_timeout.as_secs_f64())
        .bind(self.options.retry_limit as i32)
        .bind(LEASE_EXPIRED)
        .bind(queue_name)
        .execute(&self.pool)
        .await?;

        let reclaimed = result.rows_affected();
        if reclaimed > 0 {
            warn!(queue = %queue_name, reclaimed = reclaimed, "reclaimed expired job leases");
        }
        Ok(reclaimed)
    }
}
