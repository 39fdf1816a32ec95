//! Processes one ingestion task: claim, extract, persist, finish.
//!
//! Anything wrong with the document itself ends in a terminal `failed`
//! status and a settled task. Only infrastructure trouble that prevents even
//! recording the failure goes back to the queue for redelivery.

use std::{path::Path, sync::Arc, time::Duration};

use diesel::pg::PgConnection;
use thiserror::Error;
use tokio::task;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::JobExecution;
use crate::{
    chunks::ChunkError,
    extract::{self, ExtractError},
    jobs::IngestionTask,
    models::DocumentStatus,
    registry::{self, ClaimOutcome},
    state::AppState,
};

const RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Ready { chunks: usize },
    Failed { error: String },
    /// Not `queued` when delivered; the extractor was not run.
    Skipped(DocumentStatus),
    /// Deleted before or during processing.
    Missing,
}

#[derive(Debug, Error)]
enum DocumentFailure {
    #[error(transparent)]
    Extract(#[from] ExtractError),
    #[error("invalid chunk set: {0}")]
    Chunks(ChunkError),
    #[error("database error during ingestion: {0}")]
    Database(String),
}

impl DocumentFailure {
    fn kind(&self) -> &'static str {
        match self {
            DocumentFailure::Extract(err) => err.kind(),
            DocumentFailure::Chunks(_) => "chunks",
            DocumentFailure::Database(_) => "database",
        }
    }
}

impl From<ChunkError> for DocumentFailure {
    fn from(value: ChunkError) -> Self {
        match value {
            ChunkError::Database(err) => DocumentFailure::Database(err.to_string()),
            other => DocumentFailure::Chunks(other),
        }
    }
}

pub async fn handle(state: Arc<AppState>, task: IngestionTask, processed_by: &str) -> JobExecution {
    match process_document(&state, task.document_id, processed_by).await {
        Ok(_) => JobExecution::Success,
        Err(err) => {
            warn!(document_id = %task.document_id, error = %err, "ingestion will retry");
            JobExecution::Retry {
                delay: RETRY_DELAY,
                error: err,
            }
        }
    }
}

/// `Err` only for infrastructure failures; the task should be redelivered.
pub async fn process_document(
    state: &AppState,
    document_id: Uuid,
    processed_by: &str,
) -> Result<IngestOutcome, String> {
    let tag = processed_by.to_string();
    let claim = with_conn(state, move |conn| {
        registry::claim_for_processing(conn, document_id, &tag).map_err(|err| format!("{err:?}"))
    })
    .await?;

    let document = match claim {
        ClaimOutcome::Claimed(document) => document,
        ClaimOutcome::Missing => {
            info!(%document_id, "document no longer exists; dropping task");
            return Ok(IngestOutcome::Missing);
        }
        ClaimOutcome::Skipped(status) => {
            if status.skips_delivery() {
                info!(%document_id, %status, "document already handled; dropping duplicate task");
            } else {
                info!(%document_id, %status, "document needs an explicit re-drive; dropping task");
            }
            return Ok(IngestOutcome::Skipped(status));
        }
    };

    info!(
        %document_id,
        mime = %document.mime,
        path = %document.path,
        processed_by,
        "ingestion started"
    );

    match ingest_claimed(state, document_id, &document.path, &document.mime).await {
        Ok(Some(chunks)) => {
            info!(%document_id, chunks, "document ready");
            Ok(IngestOutcome::Ready { chunks })
        }
        Ok(None) => {
            info!(%document_id, "document removed during ingestion");
            Ok(IngestOutcome::Missing)
        }
        Err(failure) => {
            let message = failure.to_string();
            warn!(%document_id, kind = failure.kind(), error = %message, "ingestion failed");
            let recorded = message.clone();
            let marked = with_conn(state, move |conn| {
                registry::mark_failed(conn, document_id, &recorded).map_err(|err| format!("{err:?}"))
            })
            .await;
            match marked {
                Ok(true) => Ok(IngestOutcome::Failed { error: message }),
                Ok(false) => Ok(IngestOutcome::Missing),
                Err(err) => {
                    error!(%document_id, error = %err, "could not record ingestion failure");
                    Err(err)
                }
            }
        }
    }
}

/// Extracts and persists a claimed document. `Ok(None)` when the document
/// disappeared or left `processing` underneath us.
async fn ingest_claimed(
    state: &AppState,
    document_id: Uuid,
    path: &str,
    mime: &str,
) -> Result<Option<usize>, DocumentFailure> {
    let options = state.config.extract_options();
    let extracted = extract::extract(Path::new(path), mime, &options).await?;

    let metadata = extracted.metadata;
    let recorded = with_conn(state, move |conn| {
        registry::record_metadata(conn, document_id, &metadata).map_err(|err| format!("{err:?}"))
    })
    .await
    .map_err(DocumentFailure::Database)?;
    if !recorded {
        return Ok(None);
    }

    let drafts = extracted.chunks;
    let completed = with_conn(state, move |conn| {
        Ok(registry::complete(conn, document_id, drafts))
    })
    .await
    .map_err(DocumentFailure::Database)?;
    Ok(completed?)
}

async fn with_conn<T, F>(state: &AppState, op: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce(&mut PgConnection) -> Result<T, String> + Send + 'static,
{
    let state = state.clone();
    task::spawn_blocking(move || {
        let mut conn = state.db().map_err(|err| err.message().to_string())?;
        op(&mut conn)
    })
    .await
    .map_err(|err| format!("worker panicked: {err}"))?
}
