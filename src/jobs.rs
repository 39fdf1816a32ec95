//! Durable at-least-once task queue on the `jobs` table.
//!
//! A reserved job stays `processing` until it is acked, retried or failed.
//! If its worker dies, the lease runs out and the job is reserved again,
//! bounded by `max_attempts`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::task;
use uuid::Uuid;

use crate::db::PgPool;
use crate::models::{Job, NewJob};
use crate::schema::jobs;

pub const STATUS_QUEUED: &str = "queued";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_SUCCEEDED: &str = "succeeded";
pub const STATUS_FAILED: &str = "failed";

pub const JOB_INGEST_DOCUMENT: &str = "ingest-document";

/// Redelivery bound for a single task.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 3;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("invalid task payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("queue task aborted: {0}")]
    Join(#[from] task::JoinError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// The only message kind on the wire: a reference to one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionTask {
    pub document_id: Uuid,
}

/// A task handed to a consumer, to be settled with ack or retry.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub job_id: Uuid,
    pub task: IngestionTask,
    /// 1 on first delivery.
    pub attempt: i32,
}

#[async_trait]
pub trait TaskQueue: Send + Sync + 'static {
    async fn enqueue(&self, task: IngestionTask) -> QueueResult<()>;

    /// Next task whose turn has come, if any.
    async fn consume(&self) -> QueueResult<Option<Delivery>>;

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Redelivers after `delay` unless the attempt budget is spent, in which
    /// case the task is failed.
    async fn retry(&self, delivery: &Delivery, delay: Duration, error: &str) -> QueueResult<()>;
}

pub struct PgTaskQueue {
    pool: PgPool,
    max_attempts: i32,
    lease: Duration,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool, max_attempts: i32, lease: Duration) -> Self {
        Self {
            pool,
            max_attempts: max_attempts.max(1),
            lease,
        }
    }

    async fn with_conn<T, F>(&self, op: F) -> QueueResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> QueueResult<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            op(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, task: IngestionTask) -> QueueResult<()> {
        let payload = serde_json::to_value(task)?;
        self.with_conn(move |conn| {
            enqueue_job(conn, JOB_INGEST_DOCUMENT, payload, None)?;
            Ok(())
        })
        .await
    }

    async fn consume(&self) -> QueueResult<Option<Delivery>> {
        let max_attempts = self.max_attempts;
        let lease = self.lease;
        loop {
            let reserved = self
                .with_conn(move |conn| {
                    expire_abandoned_jobs(conn, lease, max_attempts)?;
                    reserve_job(conn, &[JOB_INGEST_DOCUMENT], lease, max_attempts)
                })
                .await?;
            let Some(job) = reserved else {
                return Ok(None);
            };

            match serde_json::from_value::<IngestionTask>(job.payload.clone()) {
                Ok(task) => {
                    return Ok(Some(Delivery {
                        job_id: job.id,
                        task,
                        attempt: job.attempts,
                    }))
                }
                Err(err) => {
                    // Unreadable payloads can never succeed.
                    tracing::error!(job_id = %job.id, error = %err, "discarding malformed job payload");
                    let message = format!("invalid payload: {err}");
                    self.with_conn(move |conn| mark_job_failed(conn, job.id, &message))
                        .await?;
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let job_id = delivery.job_id;
        self.with_conn(move |conn| mark_job_succeeded(conn, job_id))
            .await
    }

    async fn retry(&self, delivery: &Delivery, delay: Duration, error: &str) -> QueueResult<()> {
        let job_id = delivery.job_id;
        let error = error.to_string();
        if delivery.attempt >= self.max_attempts {
            let message = format!("giving up after {} attempts: {error}", delivery.attempt);
            return self
                .with_conn(move |conn| mark_job_failed(conn, job_id, &message))
                .await;
        }
        self.with_conn(move |conn| retry_job_after(conn, job_id, delay, &error))
            .await
    }
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn lease_cutoff(lease: Duration) -> NaiveDateTime {
    let lease = ChronoDuration::from_std(lease).unwrap_or_else(|_| ChronoDuration::minutes(15));
    now() - lease
}

pub fn enqueue_job(
    conn: &mut PgConnection,
    job_type: &str,
    payload: Value,
    run_after: Option<NaiveDateTime>,
) -> QueueResult<Job> {
    let new_job = NewJob {
        id: Uuid::new_v4(),
        job_type: job_type.to_string(),
        payload,
        status: STATUS_QUEUED.to_string(),
        run_after: run_after.unwrap_or_else(now),
    };

    diesel::insert_into(jobs::table)
        .values(&new_job)
        .execute(conn)?;

    let job = jobs::table.find(new_job.id).first(conn)?;
    Ok(job)
}

/// Claims the oldest due job, or a `processing` job whose lease ran out
/// while it still has attempts left.
pub fn reserve_job(
    conn: &mut PgConnection,
    job_types: &[&str],
    lease: Duration,
    max_attempts: i32,
) -> QueueResult<Option<Job>> {
    let now = now();
    let cutoff = lease_cutoff(lease);

    conn.transaction(|conn| {
        let job_opt = jobs::table
            .filter(jobs::job_type.eq_any(job_types))
            .filter(
                jobs::status
                    .eq(STATUS_QUEUED)
                    .and(jobs::run_after.le(now))
                    .or(jobs::status
                        .eq(STATUS_PROCESSING)
                        .and(jobs::updated_at.lt(cutoff))
                        .and(jobs::attempts.lt(max_attempts))),
            )
            .order(jobs::run_after.asc())
            .for_update()
            .skip_locked()
            .first::<Job>(conn)
            .optional()?;

        if let Some(job) = job_opt {
            if job.status == STATUS_PROCESSING {
                tracing::warn!(job_id = %job.id, attempts = job.attempts, "reclaiming job with expired lease");
            }
            diesel::update(jobs::table.find(job.id))
                .set((
                    jobs::status.eq(STATUS_PROCESSING),
                    jobs::attempts.eq(job.attempts + 1),
                    jobs::updated_at.eq(now),
                ))
                .execute(conn)?;

            let refreshed = jobs::table.find(job.id).first(conn)?;
            Ok::<Option<Job>, diesel::result::Error>(Some(refreshed))
        } else {
            Ok::<Option<Job>, diesel::result::Error>(None)
        }
    })
    .map_err(QueueError::from)
}

/// Fails jobs whose lease ran out after their last permitted attempt.
pub fn expire_abandoned_jobs(
    conn: &mut PgConnection,
    lease: Duration,
    max_attempts: i32,
) -> QueueResult<usize> {
    let expired = diesel::update(
        jobs::table
            .filter(jobs::status.eq(STATUS_PROCESSING))
            .filter(jobs::updated_at.lt(lease_cutoff(lease)))
            .filter(jobs::attempts.ge(max_attempts)),
    )
    .set((
        jobs::status.eq(STATUS_FAILED),
        jobs::last_error.eq(Some(format!(
            "lease expired after {max_attempts} attempts"
        ))),
        jobs::updated_at.eq(now()),
    ))
    .execute(conn)?;
    if expired > 0 {
        tracing::warn!(count = expired, "failed jobs abandoned past their attempt budget");
    }
    Ok(expired)
}

pub fn mark_job_succeeded(conn: &mut PgConnection, job_id: Uuid) -> QueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_SUCCEEDED),
            jobs::last_error.eq::<Option<String>>(None),
            jobs::updated_at.eq(now()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn retry_job_after(
    conn: &mut PgConnection,
    job_id: Uuid,
    delay: Duration,
    error_message: &str,
) -> QueueResult<()> {
    let next_run = Utc::now()
        + ChronoDuration::from_std(delay).unwrap_or_else(|_| ChronoDuration::seconds(30));

    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_QUEUED),
            jobs::run_after.eq(next_run.naive_utc()),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(now()),
        ))
        .execute(conn)?;
    Ok(())
}

pub fn mark_job_failed(
    conn: &mut PgConnection,
    job_id: Uuid,
    error_message: &str,
) -> QueueResult<()> {
    diesel::update(jobs::table.find(job_id))
        .set((
            jobs::status.eq(STATUS_FAILED),
            jobs::last_error.eq(Some(error_message.to_string())),
            jobs::updated_at.eq(now()),
        ))
        .execute(conn)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_payload_carries_only_the_document_id() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(IngestionTask { document_id: id }).unwrap();
        assert_eq!(value, serde_json::json!({ "document_id": id }));

        let parsed: IngestionTask = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.document_id, id);
    }

    #[test]
    fn payload_without_document_id_is_rejected() {
        let parsed = serde_json::from_value::<IngestionTask>(serde_json::json!({ "id": 1 }));
        assert!(parsed.is_err());
    }

    #[test]
    fn lease_cutoff_is_in_the_past() {
        let cutoff = lease_cutoff(Duration::from_secs(60));
        assert!(cutoff < now());
    }
}
