use axum::extract::{Json, Multipart, Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::chunks::list_chunks;
use crate::error::{AppError, AppResult};
use crate::intake::{self, Upload};
use crate::models::{Document, DocumentChunk};
use crate::registry::{self, StatusCounts};
use crate::state::AppState;

#[derive(Serialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub user_id: Uuid,
    pub original_name: String,
    pub stored_name: String,
    pub mime: String,
    pub size_bytes: i64,
    pub sha256: String,
    pub status: String,
    pub error: Option<String>,
    pub progress_percent: i32,
    pub processed_by: Option<String>,
    pub page_count: Option<i32>,
    pub title: Option<String>,
    pub author: Option<String>,
    pub language: Option<String>,
    pub created_at: String,
    pub ingested_at: Option<String>,
    pub updated_at: String,
}

#[derive(Serialize)]
pub struct ChunkResponse {
    pub seq: i32,
    pub text: String,
    pub page_from: Option<i32>,
    pub page_to: Option<i32>,
}

#[derive(Serialize)]
pub struct DocumentDetailResponse {
    pub document: DocumentResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunks: Option<Vec<ChunkResponse>>,
}

#[derive(Serialize)]
pub struct ChunkListResponse {
    pub document_id: Uuid,
    pub chunks: Vec<ChunkResponse>,
}

pub async fn upload_document(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<(StatusCode, Json<DocumentDetailResponse>)> {
    let mut file: Option<(Option<String>, Option<String>, axum::body::Bytes)> = None;
    let mut user_id: Option<Uuid> = None;

    while let Some(field) = multipart.next_field().await.map_err(|err| {
        let msg = format!("invalid multipart data: {err}");
        error!(error = %err, "invalid multipart data");
        AppError::bad_request(msg)
    })? {
        let name = field.name().map(|n| n.to_string());
        match name.as_deref() {
            Some("file") => {
                let file_name = field.file_name().map(|n| n.to_string());
                let content_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await.map_err(|err| {
                    let msg = format!("failed to read file bytes: {err}");
                    error!(error = %err, "failed to read file bytes");
                    AppError::bad_request(msg)
                })?;
                file = Some((file_name, content_type, data));
            }
            Some("user_id") => {
                let value = field.text().await.map_err(|err| {
                    let msg = format!("invalid user id: {err}");
                    error!(error = %err, "invalid user id");
                    AppError::bad_request(msg)
                })?;
                let parsed = Uuid::parse_str(value.trim())
                    .map_err(|_| AppError::bad_request("user_id must be a valid UUID"))?;
                user_id = Some(parsed);
            }
            _ => {}
        }
    }

    let user_id = user_id.ok_or_else(|| {
        error!("upload rejected: missing user_id field");
        AppError::bad_request("user_id field is required")
    })?;
    let (file_name, content_type, bytes) = file.ok_or_else(|| {
        error!("upload rejected: missing file field");
        AppError::bad_request("file field is required")
    })?;
    if bytes.is_empty() {
        error!("upload rejected: empty file payload");
        return Err(AppError::bad_request("file field must not be empty"));
    }
    let original_name = file_name
        .filter(|name| !name.trim().is_empty())
        .ok_or_else(|| {
            error!("upload rejected: missing original filename");
            AppError::bad_request("filename is required")
        })?;

    let upload = Upload {
        user_id,
        mime: intake::resolve_mime(content_type.as_deref(), &original_name),
        original_name,
        bytes,
    };
    let document = match intake::ingest_upload(&state, upload).await {
        Ok(document) => document,
        Err(err) => {
            error!(error = %err, "document upload failed");
            return Err(err.into());
        }
    };

    Ok((
        StatusCode::CREATED,
        Json(DocumentDetailResponse {
            document: to_document_response(document),
            chunks: None,
        }),
    ))
}

pub async fn get_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<DocumentDetailResponse>> {
    let mut conn = state.db()?;
    let document = registry::get_document(&mut conn, document_id)?;
    let chunks = list_chunks(&mut conn, document_id)?;

    Ok(Json(DocumentDetailResponse {
        document: to_document_response(document),
        chunks: Some(chunks.into_iter().map(to_chunk_response).collect()),
    }))
}

pub async fn list_document_chunks(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<Json<ChunkListResponse>> {
    let mut conn = state.db()?;
    let chunks = list_chunks(&mut conn, document_id)?;

    Ok(Json(ChunkListResponse {
        document_id,
        chunks: chunks.into_iter().map(to_chunk_response).collect(),
    }))
}

pub async fn delete_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let mut conn = state.db()?;
    let deleted = registry::delete_document(&mut conn, document_id)?.ok_or_else(AppError::not_found)?;
    drop(conn);

    if let Err(err) = state.storage.remove(&deleted.path).await {
        warn!(%document_id, error = %err, "failed to remove stored upload");
    }
    info!(%document_id, status = %deleted.status, "document deleted");
    Ok(StatusCode::NO_CONTENT)
}

pub async fn redrive_document(
    State(state): State<AppState>,
    Path(document_id): Path<Uuid>,
) -> AppResult<(StatusCode, Json<DocumentDetailResponse>)> {
    match intake::redrive_document(&state, document_id).await? {
        Some(document) => {
            info!(%document_id, "failed document re-driven");
            Ok((
                StatusCode::ACCEPTED,
                Json(DocumentDetailResponse {
                    document: to_document_response(document),
                    chunks: None,
                }),
            ))
        }
        None => {
            let mut conn = state.db()?;
            let document = registry::get_document(&mut conn, document_id)?;
            Err(AppError::conflict(format!(
                "document is {}; only failed documents can be re-driven",
                document.status
            )))
        }
    }
}

pub async fn document_stats(State(state): State<AppState>) -> AppResult<Json<StatusCounts>> {
    let mut conn = state.db()?;
    Ok(Json(registry::status_counts(&mut conn)?))
}

fn to_document_response(doc: Document) -> DocumentResponse {
    DocumentResponse {
        id: doc.id,
        user_id: doc.user_id,
        original_name: doc.original_name,
        stored_name: doc.stored_name,
        mime: doc.mime,
        size_bytes: doc.size_bytes,
        sha256: doc.sha256,
        status: doc.status,
        error: doc.error,
        progress_percent: doc.progress_percent,
        processed_by: doc.processed_by,
        page_count: doc.page_count,
        title: doc.title,
        author: doc.author,
        language: doc.language,
        created_at: to_iso(doc.created_at),
        ingested_at: doc.ingested_at.map(to_iso),
        updated_at: to_iso(doc.updated_at),
    }
}

fn to_chunk_response(chunk: DocumentChunk) -> ChunkResponse {
    ChunkResponse {
        seq: chunk.seq,
        text: chunk.text,
        page_from: chunk.page_from,
        page_to: chunk.page_to,
    }
}

pub(crate) fn to_iso(dt: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc).to_rfc3339()
}
