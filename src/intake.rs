//! Upload intake: digest, store, register and enqueue as one logical step.
//!
//! A `queued` document always has a task behind it. When the enqueue fails
//! the document is marked `failed` with the reason before the error is
//! returned; when registration fails the stored bytes are removed again.

use axum::body::Bytes;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::AppError;
use crate::jobs::IngestionTask;
use crate::models::{Document, DocumentStatus, NewDocument};
use crate::registry;
use crate::state::AppState;
use crate::storage::{self, StorageError};

/// Fallback when the client sends no usable content type.
pub const DEFAULT_MIME: &str = "application/octet-stream";

const MAX_ORIGINAL_NAME_CHARS: usize = 255;
const MAX_MIME_CHARS: usize = 100;

#[derive(Debug, Clone)]
pub struct Upload {
    pub user_id: Uuid,
    pub original_name: String,
    pub mime: String,
    pub bytes: Bytes,
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("failed to store upload: {0}")]
    Storage(#[from] StorageError),
    #[error("failed to register document: {0}")]
    Registry(String),
    #[error("document {document_id} could not be queued: {reason}")]
    Enqueue { document_id: Uuid, reason: String },
}

impl From<IntakeError> for AppError {
    fn from(value: IntakeError) -> Self {
        match value {
            IntakeError::Enqueue { .. } => AppError::service_unavailable(value.to_string()),
            other => AppError::internal(other),
        }
    }
}

/// Resolves the MIME type recorded for an upload: the declared one when
/// present, else a guess from the file name.
pub fn resolve_mime(declared: Option<&str>, original_name: &str) -> String {
    let declared = declared.map(str::trim).filter(|value| !value.is_empty());
    let mime = match declared {
        Some(value) if value != DEFAULT_MIME => value.to_string(),
        _ => mime_guess::from_path(original_name)
            .first_raw()
            .unwrap_or(DEFAULT_MIME)
            .to_string(),
    };
    mime.chars().take(MAX_MIME_CHARS).collect()
}

pub async fn ingest_upload(state: &AppState, upload: Upload) -> Result<Document, IntakeError> {
    let original_name: String = upload
        .original_name
        .trim()
        .chars()
        .take(MAX_ORIGINAL_NAME_CHARS)
        .collect();
    let sha256 = storage::digest(&upload.bytes);
    let stored = state.storage.store(&original_name, &upload.bytes).await?;

    let new_document = NewDocument {
        id: Uuid::new_v4(),
        user_id: upload.user_id,
        original_name,
        stored_name: stored.stored_name.clone(),
        mime: upload.mime,
        size_bytes: upload.bytes.len() as i64,
        sha256,
        path: stored.path.clone(),
        status: DocumentStatus::Queued.to_string(),
        progress_percent: 0,
    };

    let created = state
        .db()
        .map_err(|err| err.message().to_string())
        .and_then(|mut conn| {
            registry::create_document(&mut conn, &new_document).map_err(|err| err.to_string())
        });
    let document = match created {
        Ok(document) => document,
        Err(reason) => {
            if let Err(cleanup) = state.storage.remove(&stored.path).await {
                warn!(path = %stored.path, error = %cleanup, "failed to remove orphaned upload");
            }
            return Err(IntakeError::Registry(reason));
        }
    };

    enqueue_or_fail(state, document).await
}

/// Re-drives a `failed` document. `Ok(None)` means it was not `failed`.
pub async fn redrive_document(
    state: &AppState,
    document_id: Uuid,
) -> Result<Option<Document>, IntakeError> {
    let requeued = state
        .db()
        .map_err(|err| IntakeError::Registry(err.message().to_string()))
        .and_then(|mut conn| {
            registry::requeue_failed(&mut conn, document_id)
                .map_err(|err| IntakeError::Registry(err.to_string()))
        })?;
    match requeued {
        Some(document) => enqueue_or_fail(state, document).await.map(Some),
        None => Ok(None),
    }
}

async fn enqueue_or_fail(state: &AppState, document: Document) -> Result<Document, IntakeError> {
    let document_id = document.id;
    if let Err(err) = state.queue.enqueue(IngestionTask { document_id }).await {
        let reason = err.to_string();
        let message = format!("failed to enqueue ingestion task: {reason}");
        error!(%document_id, error = %reason, "enqueue failed; marking document failed");
        match state.db() {
            Ok(mut conn) => {
                if let Err(mark_err) = registry::mark_failed(&mut conn, document_id, &message) {
                    error!(%document_id, error = %mark_err, "failed to record enqueue failure; document left stranded in queued");
                }
            }
            Err(pool_err) => {
                error!(%document_id, error = %pool_err.message(), "failed to record enqueue failure")
            }
        }
        return Err(IntakeError::Enqueue {
            document_id,
            reason,
        });
    }

    info!(
        %document_id,
        original_name = %document.original_name,
        mime = %document.mime,
        size_bytes = document.size_bytes,
        "document queued for ingestion"
    );
    Ok(document)
}
