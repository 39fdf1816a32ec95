use std::{sync::Arc, time::Duration};

use chrono::{Duration as ChronoDuration, Utc};
use tokio::{task, time::Instant, time::sleep};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    jobs::{IngestionTask, QueueError},
    registry,
    state::AppState,
};

pub mod ingest;

/// How long a `queued` document may sit without a task before it is re-enqueued.
pub const STRANDED_GRACE: Duration = Duration::from_secs(300);

const STRANDED_BATCH: i64 = 100;

#[derive(Debug)]
pub enum JobExecution {
    Success,
    Retry { delay: Duration, error: String },
}

/// One consumer loop. A worker process runs several of these side by side.
pub struct Worker {
    state: Arc<AppState>,
    processed_by: String,
    poll_interval: Duration,
    stranded_sweep: Option<Duration>,
}

impl Worker {
    pub fn new(state: Arc<AppState>, processed_by: String, poll_interval: Duration) -> Self {
        Self {
            state,
            processed_by,
            poll_interval,
            stranded_sweep: None,
        }
    }

    /// Also re-enqueue stranded documents every `interval`. One loop per
    /// process is enough.
    pub fn with_stranded_sweep(mut self, interval: Duration) -> Self {
        self.stranded_sweep = Some(interval);
        self
    }

    pub async fn run(&self) {
        info!(processed_by = %self.processed_by, "worker started");
        let mut next_sweep = Instant::now();
        loop {
            if let Some(interval) = self.stranded_sweep {
                if Instant::now() >= next_sweep {
                    if let Err(err) = self.recover_stranded(STRANDED_GRACE).await {
                        error!(error = %err, "stranded document sweep failed");
                    }
                    next_sweep = Instant::now() + interval;
                }
            }

            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(error = %err, processed_by = %self.processed_by, "worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Handles at most one task. Returns whether a task was consumed.
    pub async fn tick(&self) -> Result<bool, QueueError> {
        let Some(delivery) = self.state.queue.consume().await? else {
            return Ok(false);
        };
        let document_id = delivery.task.document_id;

        match ingest::handle(self.state.clone(), delivery.task, &self.processed_by).await {
            JobExecution::Success => {
                self.state.queue.ack(&delivery).await?;
                info!(job_id = %delivery.job_id, %document_id, attempt = delivery.attempt, "task settled");
            }
            JobExecution::Retry { delay, error } => {
                warn!(job_id = %delivery.job_id, %document_id, attempt = delivery.attempt, %error, "task will retry");
                self.state.queue.retry(&delivery, delay, &error).await?;
            }
        }
        Ok(true)
    }

    /// Enqueues a fresh task for every `queued` document older than `grace`
    /// that has none. Returns how many were re-enqueued.
    pub async fn recover_stranded(&self, grace: Duration) -> Result<usize, QueueError> {
        let cutoff = Utc::now().naive_utc()
            - ChronoDuration::from_std(grace).unwrap_or_else(|_| ChronoDuration::minutes(5));
        let state = self.state.clone();
        let stranded = task::spawn_blocking(move || -> Result<Vec<Uuid>, QueueError> {
            let mut conn = state.pool.get()?;
            Ok(registry::stranded_documents(&mut conn, cutoff, STRANDED_BATCH)?)
        })
        .await??;

        for document_id in &stranded {
            warn!(%document_id, "re-enqueuing stranded document");
            self.state
                .queue
                .enqueue(IngestionTask {
                    document_id: *document_id,
                })
                .await?;
        }
        Ok(stranded.len())
    }
}
