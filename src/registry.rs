//! Document registry: the single source of truth for document status.
//!
//! Every status write is a conditional UPDATE guarded on the statuses that
//! may legally precede the target, so concurrent deliveries of the same task
//! cannot both win a transition.

use chrono::{NaiveDateTime, Utc};
use diesel::dsl::count_star;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_query;
use diesel::sql_types::{BigInt, Text, Timestamptz, Uuid as SqlUuid};
use serde::Serialize;
use uuid::Uuid;

use crate::chunks::{replace_chunks, ChunkDraft, ChunkError};
use crate::extract::DocumentMetadata;
use crate::jobs::{JOB_INGEST_DOCUMENT, STATUS_PROCESSING, STATUS_QUEUED};
use crate::models::{Document, DocumentStatus, NewDocument};
use crate::schema::documents;

/// Progress reported once metadata is persisted and chunks are being written.
pub const PROGRESS_METADATA_RECORDED: i32 = 80;
pub const PROGRESS_COMPLETE: i32 = 100;

/// Longest error message kept on a failed document.
pub const MAX_ERROR_CHARS: usize = 2000;

#[derive(Debug)]
pub enum ClaimOutcome {
    /// The document moved `queued -> processing` for this caller.
    Claimed(Document),
    /// Deleted or never existed.
    Missing,
    /// Already past `queued`; nothing to do for this delivery.
    Skipped(DocumentStatus),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub queued: i64,
    pub processing: i64,
    pub ready: i64,
    pub failed: i64,
    pub total: i64,
    /// `queued` documents with no live task behind them.
    pub stranded: i64,
}

fn now() -> NaiveDateTime {
    Utc::now().naive_utc()
}

fn predecessor_names(target: DocumentStatus) -> Vec<&'static str> {
    DocumentStatus::predecessors(target)
        .into_iter()
        .map(DocumentStatus::as_str)
        .collect()
}

fn parse_status(raw: &str) -> QueryResult<DocumentStatus> {
    raw.parse()
        .map_err(|err: String| diesel::result::Error::DeserializationError(err.into()))
}

fn clip_error(message: &str) -> String {
    message.chars().take(MAX_ERROR_CHARS).collect()
}

pub fn create_document(conn: &mut PgConnection, new_document: &NewDocument) -> QueryResult<Document> {
    diesel::insert_into(documents::table)
        .values(new_document)
        .returning(Document::as_returning())
        .get_result(conn)
}

pub fn get_document(conn: &mut PgConnection, document_id: Uuid) -> QueryResult<Document> {
    documents::table
        .find(document_id)
        .select(Document::as_select())
        .first(conn)
}

/// Atomically moves a `queued` document to `processing`, resetting progress
/// and stamping `processed_by`. Any other status is reported, not changed.
pub fn claim_for_processing(
    conn: &mut PgConnection,
    document_id: Uuid,
    processed_by: &str,
) -> QueryResult<ClaimOutcome> {
    let claimed = diesel::update(
        documents::table
            .filter(documents::id.eq(document_id))
            .filter(documents::status.eq_any(predecessor_names(DocumentStatus::Processing))),
    )
    .set((
        documents::status.eq(DocumentStatus::Processing.as_str()),
        documents::progress_percent.eq(0),
        documents::processed_by.eq(Some(processed_by)),
        documents::error.eq::<Option<String>>(None),
        documents::updated_at.eq(now()),
    ))
    .returning(Document::as_returning())
    .get_result(conn)
    .optional()?;

    if let Some(document) = claimed {
        return Ok(ClaimOutcome::Claimed(document));
    }

    let current = documents::table
        .find(document_id)
        .select(documents::status)
        .first::<String>(conn)
        .optional()?;
    match current {
        None => Ok(ClaimOutcome::Missing),
        Some(status) => Ok(ClaimOutcome::Skipped(parse_status(&status)?)),
    }
}

/// Stores extracted metadata on a `processing` document. Returns false when
/// the document is gone or no longer `processing`.
pub fn record_metadata(
    conn: &mut PgConnection,
    document_id: Uuid,
    metadata: &DocumentMetadata,
) -> QueryResult<bool> {
    let updated = diesel::update(
        documents::table
            .filter(documents::id.eq(document_id))
            .filter(documents::status.eq(DocumentStatus::Processing.as_str())),
    )
    .set((
        documents::page_count.eq(metadata.page_count),
        documents::title.eq(metadata.title.as_deref()),
        documents::author.eq(metadata.author.as_deref()),
        documents::language.eq(metadata.language.as_deref()),
        documents::progress_percent.eq(PROGRESS_METADATA_RECORDED),
        documents::updated_at.eq(now()),
    ))
    .execute(conn)?;
    Ok(updated == 1)
}

/// Writes the chunk set and flips the document to `ready` in one transaction.
/// Returns the number of chunks written, or `None` when the document was not
/// `processing` (nothing is written in that case).
pub fn complete(
    conn: &mut PgConnection,
    document_id: Uuid,
    drafts: Vec<ChunkDraft>,
) -> Result<Option<usize>, ChunkError> {
    conn.transaction::<_, ChunkError, _>(|conn| {
        let timestamp = now();
        let updated = diesel::update(
            documents::table
                .filter(documents::id.eq(document_id))
                .filter(documents::status.eq_any(predecessor_names(DocumentStatus::Ready))),
        )
        .set((
            documents::status.eq(DocumentStatus::Ready.as_str()),
            documents::progress_percent.eq(PROGRESS_COMPLETE),
            documents::error.eq::<Option<String>>(None),
            documents::ingested_at.eq(Some(timestamp)),
            documents::updated_at.eq(timestamp),
        ))
        .execute(conn)?;
        if updated == 0 {
            return Ok(None);
        }

        let written = replace_chunks(conn, document_id, drafts)?;
        Ok(Some(written))
    })
}

/// Moves a `queued` or `processing` document to `failed`. Returns false when
/// there was nothing to fail.
pub fn mark_failed(conn: &mut PgConnection, document_id: Uuid, message: &str) -> QueryResult<bool> {
    let updated = diesel::update(
        documents::table
            .filter(documents::id.eq(document_id))
            .filter(documents::status.eq_any(predecessor_names(DocumentStatus::Failed))),
    )
    .set((
        documents::status.eq(DocumentStatus::Failed.as_str()),
        documents::error.eq(Some(clip_error(message))),
        documents::updated_at.eq(now()),
    ))
    .execute(conn)?;
    Ok(updated == 1)
}

/// Administrative re-drive: resets a `failed` document to `queued` so a new
/// task can process it from scratch. Returns `None` unless it was `failed`.
pub fn requeue_failed(conn: &mut PgConnection, document_id: Uuid) -> QueryResult<Option<Document>> {
    diesel::update(
        documents::table
            .filter(documents::id.eq(document_id))
            .filter(documents::status.eq(DocumentStatus::Failed.as_str())),
    )
    .set((
        documents::status.eq(DocumentStatus::Queued.as_str()),
        documents::error.eq::<Option<String>>(None),
        documents::progress_percent.eq(0),
        documents::processed_by.eq::<Option<String>>(None),
        documents::updated_at.eq(now()),
    ))
    .returning(Document::as_returning())
    .get_result(conn)
    .optional()
}

/// Deletes the row; chunks go with it through the foreign key cascade.
pub fn delete_document(conn: &mut PgConnection, document_id: Uuid) -> QueryResult<Option<Document>> {
    diesel::delete(documents::table.filter(documents::id.eq(document_id)))
        .returning(Document::as_returning())
        .get_result(conn)
        .optional()
}

pub fn status_counts(conn: &mut PgConnection) -> QueryResult<StatusCounts> {
    let rows = documents::table
        .group_by(documents::status)
        .select((documents::status, count_star()))
        .load::<(String, i64)>(conn)?;

    let mut counts = StatusCounts::default();
    for (status, count) in rows {
        match parse_status(&status)? {
            DocumentStatus::Queued => counts.queued = count,
            DocumentStatus::Processing => counts.processing = count,
            DocumentStatus::Ready => counts.ready = count,
            DocumentStatus::Failed => counts.failed = count,
        }
        counts.total += count;
    }
    counts.stranded = count_stranded(conn)?;
    Ok(counts)
}

const STRANDED_FILTER: &str = "d.status = 'queued' \
     AND NOT EXISTS (SELECT 1 FROM jobs j \
         WHERE j.job_type = $1 \
         AND j.status IN ($2, $3) \
         AND j.payload->>'document_id' = d.id::text)";

#[derive(QueryableByName)]
struct StrandedCount {
    #[diesel(sql_type = BigInt)]
    count: i64,
}

#[derive(QueryableByName)]
struct StrandedDocument {
    #[diesel(sql_type = SqlUuid)]
    id: Uuid,
}

fn count_stranded(conn: &mut PgConnection) -> QueryResult<i64> {
    let row = sql_query(format!(
        "SELECT COUNT(*) AS count FROM documents d WHERE {STRANDED_FILTER}"
    ))
    .bind::<Text, _>(JOB_INGEST_DOCUMENT)
    .bind::<Text, _>(STATUS_QUEUED)
    .bind::<Text, _>(STATUS_PROCESSING)
    .get_result::<StrandedCount>(conn)?;
    Ok(row.count)
}

/// `queued` documents untouched since `cutoff` that no queued or running task
/// refers to, oldest first. These are left behind when both the enqueue and
/// the follow-up `failed` write were lost.
pub fn stranded_documents(
    conn: &mut PgConnection,
    cutoff: NaiveDateTime,
    limit: i64,
) -> QueryResult<Vec<Uuid>> {
    let rows = sql_query(format!(
        "SELECT d.id FROM documents d WHERE {STRANDED_FILTER} \
         AND d.updated_at < $4 ORDER BY d.created_at LIMIT $5"
    ))
    .bind::<Text, _>(JOB_INGEST_DOCUMENT)
    .bind::<Text, _>(STATUS_QUEUED)
    .bind::<Text, _>(STATUS_PROCESSING)
    .bind::<Timestamptz, _>(cutoff)
    .bind::<BigInt, _>(limit)
    .load::<StrandedDocument>(conn)?;
    Ok(rows.into_iter().map(|row| row.id).collect())
}
